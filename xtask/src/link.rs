//! Serial link to the board.
//!
//! The adapter's RTS line drives NRST and DTR drives BOOT0. A break holds
//! the board's RX low while it comes out of reset.

use std::thread::sleep;
use std::time::Duration;

use anyhow::{Context, Result};
use serialport::{ClearBuffer, DataBits, FlowControl, Parity, SerialPort, StopBits};

/// Rate the bootloader and the firmware both use.
pub const DEFAULT_BAUD: u32 = 57_600;

const TIMEOUT: Duration = Duration::from_secs(2);

/// Which program the board should run after [`reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Boot {
    /// The ROM bootloader.
    Bootloader,
    /// The application in main flash.
    Application,
}

/// Open `path` at 8E1, the framing the bootloader requires.
pub fn open(path: &str, baud: u32) -> Result<Box<dyn SerialPort>> {
    serialport::new(path, baud)
        .data_bits(DataBits::Eight)
        .parity(Parity::Even)
        .stop_bits(StopBits::One)
        .flow_control(FlowControl::None)
        .timeout(TIMEOUT)
        .open()
        .with_context(|| format!("Failed to open {path}"))
}

/// Reset the board into `boot`, then drop whatever it sent meanwhile.
pub fn reset(port: &mut dyn SerialPort, boot: Boot) -> Result<()> {
    let ms = |n| sleep(Duration::from_millis(n));

    match boot {
        Boot::Bootloader => {
            port.set_break()?;
            ms(200);
            port.write_request_to_send(true)?;
            port.write_data_terminal_ready(true)?;
            ms(50);
            port.clear_break()?;
            ms(50);
            port.write_request_to_send(false)?;
            ms(50);
            port.write_data_terminal_ready(false)?;
        }
        Boot::Application => {
            port.write_request_to_send(false)?;
            port.write_data_terminal_ready(false)?;
            port.clear_break()?;
            port.write_request_to_send(true)?;
            ms(50);
            port.write_request_to_send(false)?;
            ms(50);
            port.set_break()?;
            ms(200);
            port.clear_break()?;
        }
    }

    port.clear(ClearBuffer::Input)
        .context("Failed to flush serial input")
}
