//! Idle hook that keeps the LEDs blinking while the console waits.

use core::ops::ControlFlow;

use stm32f0_serial::IdleHook;

use crate::board::Leds;

/// Polls between LED swaps.
const PERIOD: u32 = 0x4_0000;

/// Blinks the LEDs while the serial driver waits. Never cancels.
pub struct Heartbeat {
    leds: Leds,
    polls: u32,
}

impl Heartbeat {
    pub fn new(leds: Leds) -> Self {
        Heartbeat { leds, polls: 0 }
    }
}

impl IdleHook for Heartbeat {
    fn on_idle(&mut self) -> ControlFlow<()> {
        self.polls = self.polls.wrapping_add(1);
        if self.polls % PERIOD == 0 {
            self.leds.show(self.polls & PERIOD != 0);
        }
        ControlFlow::Continue(())
    }
}
