//! Register model for the STM32F0 USART and FLASH interface blocks.
//!
//! The drivers only ever talk to hardware through [`UsartRegisters`] and
//! [`FlashRegisters`]. On target these are implemented by [`UsartBlock`] and
//! [`FlashBlock`], thin handles that perform volatile accesses at the fixed
//! peripheral base addresses. Each block can be taken once per program run.

use core::cell::Cell;
use core::ptr::{with_exposed_provenance, with_exposed_provenance_mut};

use critical_section::Mutex;

use crate::serial::Port;

pub(crate) const USART1_BASE: usize = 0x4001_3800;
pub(crate) const USART2_BASE: usize = 0x4000_4400;
pub(crate) const FLASH_R_BASE: usize = 0x4002_2000;

/// USART registers, as laid out on the STM32F0.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum UsartReg {
    /// Control register 1.
    Cr1,
    /// Control register 2.
    Cr2,
    /// Control register 3.
    Cr3,
    /// Baud rate register.
    Brr,
    /// Guard time and prescaler register.
    Gtpr,
    /// Receiver timeout register.
    Rtor,
    /// Request register.
    Rqr,
    /// Interrupt and status register.
    Isr,
    /// Interrupt flag clear register.
    Icr,
    /// Receive data register.
    Rdr,
    /// Transmit data register.
    Tdr,
}

impl UsartReg {
    /// Byte offset from the block base.
    pub const fn offset(self) -> usize {
        match self {
            UsartReg::Cr1 => 0x00,
            UsartReg::Cr2 => 0x04,
            UsartReg::Cr3 => 0x08,
            UsartReg::Brr => 0x0C,
            UsartReg::Gtpr => 0x10,
            UsartReg::Rtor => 0x14,
            UsartReg::Rqr => 0x18,
            UsartReg::Isr => 0x1C,
            UsartReg::Icr => 0x20,
            UsartReg::Rdr => 0x24,
            UsartReg::Tdr => 0x28,
        }
    }
}

/// FLASH interface registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum FlashReg {
    /// Access control register.
    Acr,
    /// Key register.
    Keyr,
    /// Option byte key register.
    Optkeyr,
    /// Status register.
    Sr,
    /// Control register.
    Cr,
    /// Address register.
    Ar,
    /// Option byte register.
    Obr,
    /// Write protection register.
    Wrpr,
}

impl FlashReg {
    /// Byte offset from the block base.
    pub const fn offset(self) -> usize {
        match self {
            FlashReg::Acr => 0x00,
            FlashReg::Keyr => 0x04,
            FlashReg::Optkeyr => 0x08,
            FlashReg::Sr => 0x0C,
            FlashReg::Cr => 0x10,
            FlashReg::Ar => 0x14,
            FlashReg::Obr => 0x1C,
            FlashReg::Wrpr => 0x20,
        }
    }
}

/// USART CR1 bits.
pub mod cr1 {
    /// USART enable.
    pub const UE: u32 = 1 << 0;
    /// Receiver enable.
    pub const RE: u32 = 1 << 2;
    /// Transmitter enable.
    pub const TE: u32 = 1 << 3;
    /// Parity selection, set for odd parity.
    pub const PS: u32 = 1 << 9;
    /// Parity control enable.
    pub const PCE: u32 = 1 << 10;
    /// Word length, set for 9-bit frames.
    pub const M: u32 = 1 << 12;
    /// Oversampling by 8.
    pub const OVER8: u32 = 1 << 15;
}

/// USART ISR bits.
pub mod isr {
    /// Parity error.
    pub const PE: u32 = 1 << 0;
    /// Framing error.
    pub const FE: u32 = 1 << 1;
    /// Noise detected.
    pub const NF: u32 = 1 << 2;
    /// Overrun error.
    pub const ORE: u32 = 1 << 3;
    /// Read data register not empty.
    pub const RXNE: u32 = 1 << 5;
    /// Transmission complete.
    pub const TC: u32 = 1 << 6;
    /// Transmit data register empty.
    pub const TXE: u32 = 1 << 7;
}

/// FLASH SR bits.
pub mod sr {
    /// Busy.
    pub const BSY: u32 = 1 << 0;
    /// Programming error, the target was not erased.
    pub const PGERR: u32 = 1 << 2;
    /// Write protection error.
    pub const WRPRTERR: u32 = 1 << 4;
    /// End of operation.
    pub const EOP: u32 = 1 << 5;
}

/// FLASH CR bits.
pub mod cr {
    /// Programming.
    pub const PG: u32 = 1 << 0;
    /// Page erase.
    pub const PER: u32 = 1 << 1;
    /// Mass erase.
    pub const MER: u32 = 1 << 2;
    /// Start erase.
    pub const STRT: u32 = 1 << 6;
    /// Lock. Only cleared by the key sequence.
    pub const LOCK: u32 = 1 << 7;
}

/// First FPEC unlock key.
pub const KEY1: u32 = 0x4567_0123;
/// Second FPEC unlock key.
pub const KEY2: u32 = 0xCDEF_89AB;

/// Access to one USART register block.
pub trait UsartRegisters {
    /// Read a register.
    fn read(&self, reg: UsartReg) -> u32;

    /// Write a register.
    fn write(&self, reg: UsartReg, value: u32);

    /// Read-modify-write a register.
    fn modify(&self, reg: UsartReg, f: impl FnOnce(u32) -> u32) {
        let v = self.read(reg);
        self.write(reg, f(v));
    }
}

/// Access to the FLASH interface registers and the flash array itself.
pub trait FlashRegisters {
    /// Read a register.
    fn read(&self, reg: FlashReg) -> u32;

    /// Write a register.
    fn write(&self, reg: FlashReg, value: u32);

    /// Read-modify-write a register.
    fn modify(&self, reg: FlashReg, f: impl FnOnce(u32) -> u32) {
        let v = self.read(reg);
        self.write(reg, f(v));
    }

    /// Store a half-word into the flash array.
    ///
    /// # Safety
    ///
    /// `address` must be a half-word aligned location inside the flash array.
    unsafe fn store(&self, address: usize, value: u16);

    /// Load a half-word from the flash array.
    ///
    /// # Safety
    ///
    /// `address` must be a half-word aligned location inside the flash array.
    unsafe fn load(&self, address: usize) -> u16;
}

/// Handle to a USART register block in the peripheral address space.
#[derive(Debug)]
pub struct UsartBlock {
    base: usize,
}

impl UsartBlock {
    /// Create a handle for `port` without checking whether one already exists.
    ///
    /// # Safety
    ///
    /// Two live handles for the same port let two drivers race on the same
    /// registers. The caller must make sure that does not happen.
    pub unsafe fn steal(port: Port) -> Self {
        UsartBlock { base: port.base() }
    }
}

impl UsartRegisters for UsartBlock {
    #[inline]
    fn read(&self, reg: UsartReg) -> u32 {
        let p = with_exposed_provenance::<u32>(self.base + reg.offset());
        // SAFETY: `base` is one of the USART block addresses and the offset
        // stays inside the block.
        unsafe { p.read_volatile() }
    }

    #[inline]
    fn write(&self, reg: UsartReg, value: u32) {
        let p = with_exposed_provenance_mut::<u32>(self.base + reg.offset());
        // SAFETY: As for `read`.
        unsafe { p.write_volatile(value) }
    }
}

/// Handle to the FLASH interface registers.
#[derive(Debug)]
pub struct FlashBlock {
    base: usize,
}

impl FlashBlock {
    /// Take the FLASH interface. Returns `None` if it was already taken.
    pub fn take() -> Option<Self> {
        if claim(FLASH_BIT) {
            // SAFETY: The claim above guarantees this is the only handle.
            Some(unsafe { Self::steal() })
        } else {
            warn!("flash interface already taken");
            None
        }
    }

    /// Create a handle without checking whether one already exists.
    ///
    /// # Safety
    ///
    /// Two live handles let two writers interleave unlock and program
    /// sequences. The caller must make sure that does not happen.
    pub unsafe fn steal() -> Self {
        FlashBlock { base: FLASH_R_BASE }
    }
}

impl FlashRegisters for FlashBlock {
    #[inline]
    fn read(&self, reg: FlashReg) -> u32 {
        let p = with_exposed_provenance::<u32>(self.base + reg.offset());
        // SAFETY: `base` is the FLASH interface address and the offset stays
        // inside the block.
        unsafe { p.read_volatile() }
    }

    #[inline]
    fn write(&self, reg: FlashReg, value: u32) {
        let p = with_exposed_provenance_mut::<u32>(self.base + reg.offset());
        // SAFETY: As for `read`.
        unsafe { p.write_volatile(value) }
    }

    #[inline]
    unsafe fn store(&self, address: usize, value: u16) {
        let p = with_exposed_provenance_mut::<u16>(address);
        // SAFETY: The caller guarantees `address` is aligned and in flash.
        unsafe { p.write_volatile(value) }
    }

    #[inline]
    unsafe fn load(&self, address: usize) -> u16 {
        let p = with_exposed_provenance::<u16>(address);
        // SAFETY: The caller guarantees `address` is aligned and in flash.
        unsafe { p.read_volatile() }
    }
}

pub(crate) const FLASH_BIT: u8 = 1 << 2;

/// One bit per block that has been handed out.
static TAKEN: Mutex<Cell<u8>> = Mutex::new(Cell::new(0));

/// Mark `bit` as taken. Returns `false` if it already was.
pub(crate) fn claim(bit: u8) -> bool {
    critical_section::with(|cs| {
        let taken = TAKEN.borrow(cs);
        let was = taken.get();
        taken.set(was | bit);
        was & bit == 0
    })
}
