//! Prints the device identification over USART2, then numbers lines: each
//! `Line nnnnnnnn` waits for a carriage return or line feed before the next.

#![no_std]
#![no_main]

mod board;
#[cfg(feature = "boot-log")]
mod boot_log;
mod heartbeat;

use core::fmt::{self, Write};

use cortex_m_rt::entry;
use defmt_rtt as _;
use panic_probe as _;
use stm32f0_serial::regs::{FlashBlock, UsartRegisters};
use stm32f0_serial::{IdleHook, Parity, Port, Serial, SystemId};

use crate::heartbeat::Heartbeat;

const SYSCLK_HZ: u32 = 48_000_000;
const BAUD: u32 = 57_600;
/// Pause between lines, in core cycles.
const LINE_DELAY: u32 = 5;

fn print_cpu_info<R: UsartRegisters, H: IdleHook>(serial: &mut Serial<R, H>) -> fmt::Result {
    let id = SystemId::read();
    defmt::info!("{}", id);

    for (i, word) in id.uid.iter().enumerate() {
        write!(serial, "UID {i:x}: {word:08x}\r\n")?;
    }
    write!(serial, "MEMSIZE {:04x}\r\n", id.flash_kib)
}

fn wait_for_line_end<R: UsartRegisters, H: IdleHook>(serial: &mut Serial<R, H>) {
    loop {
        match serial.read_byte() {
            Ok(b'\r' | b'\n') => break,
            Ok(_) => {}
            Err(_) => defmt::warn!("read cancelled"),
        }
    }

    let errors = serial.line_errors();
    if errors.any() {
        defmt::warn!("line errors: {}", errors);
        serial.clear_line_errors(errors);
    }
}

#[entry]
fn main() -> ! {
    let Some(flash_regs) = FlashBlock::take() else {
        panic!("flash interface already taken");
    };
    board::init_clocks(&flash_regs);
    let leds = board::init_pins();

    #[cfg(feature = "boot-log")]
    {
        let mut flash = stm32f0_serial::Flash::new(flash_regs);
        match boot_log::record(&mut flash) {
            Some(slot) => defmt::info!("boot {}", slot),
            None => defmt::warn!("boot log full"),
        }
    }

    let Some(usart) = Port::Usart2.take() else {
        panic!("USART2 already taken");
    };
    let mut serial = Serial::new(usart, Heartbeat::new(leds));
    serial.reset();
    let divisor = serial.set_rate(SYSCLK_HZ, BAUD);
    serial.set_parity(Parity::Even);
    serial.start();
    defmt::info!("USART2 at {} Bd, divisor {}", BAUD, divisor);

    if serial.write_str("\r\nHello, world!\r\n").is_err() || print_cpu_info(&mut serial).is_err() {
        defmt::warn!("banner cancelled");
    }

    let mut line: u32 = 0;
    loop {
        cortex_m::asm::delay(LINE_DELAY);
        line = line.wrapping_add(1);

        if write!(serial, "Line {line:08x}  ").is_err() {
            defmt::warn!("line {} cancelled", line);
        }
        wait_for_line_end(&mut serial);
        if serial.write_all(b"\r\n").is_err() {
            defmt::warn!("line end cancelled");
        }
    }
}
