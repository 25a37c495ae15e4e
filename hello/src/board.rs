//! Clock tree and pin setup for the demo board.
//!
//! USART2 sits on PA14 (TX) and PA15 (RX), alternate function 1. Two LEDs
//! hang off PA9 and PA10.

use core::ptr::{with_exposed_provenance, with_exposed_provenance_mut};

use stm32f0_serial::regs::{FlashReg, FlashRegisters};

const RCC: usize = 0x4002_1000;
const GPIOA: usize = 0x4800_0000;

mod rcc {
    pub const CR: usize = 0x00;
    pub const CFGR: usize = 0x04;
    pub const AHBENR: usize = 0x14;
    pub const APB1ENR: usize = 0x1C;

    pub const CR_HSION: u32 = 1 << 0;
    pub const CR_HSIRDY: u32 = 1 << 1;
    pub const CR_PLLON: u32 = 1 << 24;
    pub const CR_PLLRDY: u32 = 1 << 25;

    pub const CFGR_SW_MASK: u32 = 0b11;
    pub const CFGR_SW_PLL: u32 = 0b10;
    pub const CFGR_SWS_MASK: u32 = 0b11 << 2;
    pub const CFGR_SWS_PLL: u32 = 0b10 << 2;
    /// Clear for HSI/2 as the PLL input.
    pub const CFGR_PLLSRC: u32 = 1 << 16;
    pub const CFGR_PLLMUL_MASK: u32 = 0b1111 << 18;
    /// PLLMUL value for x12.
    pub const CFGR_PLLMUL12: u32 = 0b1010 << 18;

    pub const AHBENR_IOPAEN: u32 = 1 << 17;
    pub const AHBENR_IOPBEN: u32 = 1 << 18;
    pub const APB1ENR_USART2EN: u32 = 1 << 17;
}

mod gpio {
    pub const MODER: usize = 0x00;
    pub const OTYPER: usize = 0x04;
    pub const OSPEEDR: usize = 0x08;
    pub const BSRR: usize = 0x18;
    pub const AFRH: usize = 0x24;

    pub const MODE_OUTPUT: u32 = 0b01;
    pub const MODE_ALTERNATE: u32 = 0b10;
    pub const SPEED_HIGH: u32 = 0b11;
}

const ACR_LATENCY_MASK: u32 = 0b111;
const ACR_PRFTBE: u32 = 1 << 4;

fn read(addr: usize) -> u32 {
    // SAFETY: Only called with RCC and GPIOA register addresses.
    unsafe { with_exposed_provenance::<u32>(addr).read_volatile() }
}

fn write(addr: usize, value: u32) {
    // SAFETY: Only called with RCC and GPIOA register addresses.
    unsafe { with_exposed_provenance_mut::<u32>(addr).write_volatile(value) }
}

fn modify(addr: usize, f: impl FnOnce(u32) -> u32) {
    write(addr, f(read(addr)));
}

/// Run the core at 48 MHz from HSI/2 x 12.
pub fn init_clocks(flash: &impl FlashRegisters) {
    modify(RCC + rcc::CR, |v| v | rcc::CR_HSION);
    while read(RCC + rcc::CR) & rcc::CR_HSIRDY == 0 {}

    // 48 MHz needs one wait state.
    flash.modify(FlashReg::Acr, |v| (v & !ACR_LATENCY_MASK) | 1 | ACR_PRFTBE);

    modify(RCC + rcc::CFGR, |v| {
        (v & !(rcc::CFGR_PLLSRC | rcc::CFGR_PLLMUL_MASK)) | rcc::CFGR_PLLMUL12
    });
    modify(RCC + rcc::CR, |v| v | rcc::CR_PLLON);
    while read(RCC + rcc::CR) & rcc::CR_PLLRDY == 0 {}

    modify(RCC + rcc::CFGR, |v| (v & !rcc::CFGR_SW_MASK) | rcc::CFGR_SW_PLL);
    while read(RCC + rcc::CFGR) & rcc::CFGR_SWS_MASK != rcc::CFGR_SWS_PLL {}
}

fn set_mode(pin: u32, mode: u32) {
    modify(GPIOA + gpio::MODER, |v| (v & !(0b11 << (2 * pin))) | (mode << (2 * pin)));
}

fn set_alternate(pin: u32, af: u32) {
    debug_assert!(pin >= 8);
    let shift = 4 * (pin - 8);
    modify(GPIOA + gpio::AFRH, |v| (v & !(0b1111 << shift)) | (af << shift));
}

/// Enable the GPIO and USART2 clocks and route the pins. The LEDs are only
/// usable once their pins are outputs, so they are handed out here.
pub fn init_pins() -> Leds {
    modify(RCC + rcc::AHBENR, |v| v | rcc::AHBENR_IOPAEN | rcc::AHBENR_IOPBEN);

    set_mode(Leds::PIN_A, gpio::MODE_OUTPUT);
    set_mode(Leds::PIN_B, gpio::MODE_OUTPUT);
    write(GPIOA + gpio::OTYPER, 0);
    write(GPIOA + gpio::OSPEEDR, gpio::SPEED_HIGH << (2 * 14));

    modify(RCC + rcc::APB1ENR, |v| v | rcc::APB1ENR_USART2EN);

    for pin in [14, 15] {
        set_alternate(pin, 1);
        set_mode(pin, gpio::MODE_ALTERNATE);
    }

    Leds(())
}

/// The two heartbeat LEDs, driven in opposite phase.
pub struct Leds(());

impl Leds {
    const PIN_A: u32 = 9;
    const PIN_B: u32 = 10;

    /// Light one LED or the other.
    pub fn show(&mut self, phase: bool) {
        let (on, off) = if phase {
            (Self::PIN_A, Self::PIN_B)
        } else {
            (Self::PIN_B, Self::PIN_A)
        };
        // Low half sets, high half resets.
        write(GPIOA + gpio::BSRR, (1 << on) | (1 << (off + 16)));
    }
}
