#![cfg_attr(not(test), no_std)]
#![warn(missing_docs)]
#![doc = include_str!("../README.md")]

mod fmt;

pub mod flash;
pub mod idle;
pub mod regs;
pub mod serial;
pub mod sysid;
pub mod wait;

pub use flash::{FLASH_BASE, Flash, FlashStatus};
pub use idle::{ContextHook, FnHook, IdleHook, NoHook, SpinBudget};
pub use serial::{Cancelled, LineErrors, Parity, Port, PortState, Serial};
pub use sysid::SystemId;
pub use wait::TimedOut;
