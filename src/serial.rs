//! Blocking, polled USART driver.
//!
//! Every blocking wait polls the driver's [`IdleHook`], which can cancel the
//! wait. The one exception is the drain at the end of [`Serial::write_all`]:
//! once the last byte has been accepted by the transmitter the driver waits
//! for it unconditionally.

use core::fmt;

use crate::idle::IdleHook;
use crate::regs::{USART1_BASE, USART2_BASE, UsartBlock, UsartReg, UsartRegisters, claim, cr1, isr};
use crate::wait::{spin_until, spin_until_or_cancel};

/// The idle hook cancelled a blocking operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct Cancelled;

/// One of the two USART instances.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Port {
    /// USART1.
    Usart1,
    /// USART2.
    Usart2,
}

impl Port {
    /// Map a numeric port selector to an instance.
    ///
    /// `1` selects USART1. Every other value, including `0` and anything
    /// above `2`, selects USART2.
    pub const fn from_selector(selector: u16) -> Self {
        match selector {
            1 => Port::Usart1,
            _ => Port::Usart2,
        }
    }

    pub(crate) const fn base(self) -> usize {
        match self {
            Port::Usart1 => USART1_BASE,
            Port::Usart2 => USART2_BASE,
        }
    }

    const fn taken_bit(self) -> u8 {
        match self {
            Port::Usart1 => 1 << 0,
            Port::Usart2 => 1 << 1,
        }
    }

    /// Take the register block of this port. Returns `None` if it was
    /// already taken.
    pub fn take(self) -> Option<UsartBlock> {
        if claim(self.taken_bit()) {
            // SAFETY: The claim above guarantees this is the only handle.
            Some(unsafe { UsartBlock::steal(self) })
        } else {
            warn!("{} already taken", self);
            None
        }
    }
}

/// Parity mode. Enabling parity also widens the frame to 9 bits, so the
/// parity bit comes on top of 8 data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u32)]
pub enum Parity {
    /// No parity, 8-bit frames.
    None = 0,
    /// Even parity, 9-bit frames.
    Even = 1,
    /// Odd parity, 9-bit frames.
    Odd = 2,
}

impl Parity {
    /// Decode the numeric parity selector. Unknown values give `None`.
    pub const fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            0 => Some(Parity::None),
            1 => Some(Parity::Even),
            2 => Some(Parity::Odd),
            _ => None,
        }
    }
}

/// Configuration state of a port as read back from its registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum PortState {
    /// No baud divisor has been written since the last reset.
    Unconfigured,
    /// A divisor is set but the port is not running.
    Configured,
    /// The port and both directions are enabled.
    Active,
}

/// Receive line error flags latched by the hardware.
///
/// [`Serial::read_byte`] does not look at these. Callers that care poll
/// [`Serial::line_errors`] and acknowledge with [`Serial::clear_line_errors`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LineErrors {
    /// Parity mismatch.
    pub parity: bool,
    /// Stop bit missing.
    pub framing: bool,
    /// Noise detected on a sample.
    pub noise: bool,
    /// A byte arrived before the previous one was read.
    pub overrun: bool,
}

impl LineErrors {
    const MASK: u32 = isr::PE | isr::FE | isr::NF | isr::ORE;

    fn from_isr(v: u32) -> Self {
        LineErrors {
            parity: v & isr::PE != 0,
            framing: v & isr::FE != 0,
            noise: v & isr::NF != 0,
            overrun: v & isr::ORE != 0,
        }
    }

    /// Same bit positions in ISR and ICR.
    fn bits(self) -> u32 {
        let mut v = 0;
        if self.parity {
            v |= isr::PE;
        }
        if self.framing {
            v |= isr::FE;
        }
        if self.noise {
            v |= isr::NF;
        }
        if self.overrun {
            v |= isr::ORE;
        }
        v
    }

    /// Any flag set.
    pub fn any(self) -> bool {
        self.bits() != 0
    }
}

/// A polled USART driver with an injected idle hook.
pub struct Serial<R, H> {
    regs: R,
    hook: H,
}

impl<R: UsartRegisters, H: IdleHook> Serial<R, H> {
    /// Wrap a register block. The hardware is left untouched.
    pub fn new(regs: R, hook: H) -> Self {
        Serial { regs, hook }
    }

    /// Put every control, rate and status register back to zero.
    ///
    /// The port is disabled afterwards and stays unusable until it is
    /// configured and started again.
    pub fn reset(&mut self) {
        for reg in [
            UsartReg::Cr1,
            UsartReg::Cr2,
            UsartReg::Cr3,
            UsartReg::Brr,
            UsartReg::Gtpr,
            UsartReg::Rtor,
            UsartReg::Rqr,
            UsartReg::Icr,
        ] {
            self.regs.write(reg, 0);
        }
        trace!("usart reset");
    }

    /// Program the baud divisor for `baud` given a kernel clock of
    /// `clock_hz`, using 16x oversampling. Returns the divisor.
    ///
    /// The division truncates. `baud` must be non-zero and no larger than
    /// `clock_hz`; a zero divisor leaves the hardware in an undefined state.
    pub fn set_rate(&mut self, clock_hz: u32, baud: u32) -> u32 {
        debug_assert!(baud != 0 && baud <= clock_hz, "baud rate out of range");
        let divisor = clock_hz / baud;

        self.regs.modify(UsartReg::Cr1, |v| v & !cr1::OVER8);
        self.regs.write(UsartReg::Brr, divisor);

        debug!("usart divisor {} ({} Hz / {} Bd)", divisor, clock_hz, baud);
        divisor
    }

    /// Select the parity mode. Disables the port first.
    ///
    /// Call this before [`start`](Self::start); changing framing on a
    /// running port is not supported by the hardware.
    pub fn set_parity(&mut self, parity: Parity) {
        debug_assert!(self.state() != PortState::Active, "parity changed on a running port");
        self.regs.modify(UsartReg::Cr1, |v| v & !cr1::UE);

        self.regs.modify(UsartReg::Cr1, |v| match parity {
            Parity::None => v & !(cr1::PCE | cr1::M),
            Parity::Even => (v | cr1::PCE | cr1::M) & !cr1::PS,
            Parity::Odd => v | cr1::PCE | cr1::M | cr1::PS,
        });
        trace!("usart parity {}", parity);
    }

    /// Enable the port, then the transmitter and receiver.
    pub fn start(&mut self) {
        self.regs.modify(UsartReg::Cr1, |v| v | cr1::UE);
        self.regs.modify(UsartReg::Cr1, |v| v | cr1::TE | cr1::RE);
    }

    /// Current configuration state, derived from the registers.
    pub fn state(&self) -> PortState {
        let cr1 = self.regs.read(UsartReg::Cr1);
        let running = cr1::UE | cr1::TE | cr1::RE;
        if cr1 & running == running {
            PortState::Active
        } else if self.regs.read(UsartReg::Brr) == 0 {
            PortState::Unconfigured
        } else {
            PortState::Configured
        }
    }

    fn tx_empty(&self) -> bool {
        self.regs.read(UsartReg::Isr) & isr::TXE != 0
    }

    fn rx_ready(&self) -> bool {
        self.regs.read(UsartReg::Isr) & isr::RXNE != 0
    }

    /// Transmit `bytes` in order and wait until the last one has left the
    /// data register.
    ///
    /// The hook is polled while waiting for room for each byte. If it
    /// cancels, the rest of `bytes` is never written and `Err(Cancelled)` is
    /// returned; a byte already handed to the hardware still goes out. The
    /// final wait after the last byte is not cancellable.
    pub fn write_all(&mut self, bytes: &[u8]) -> Result<(), Cancelled> {
        for (sent, &byte) in bytes.iter().enumerate() {
            let Serial { regs, hook } = self;
            if let Err(e) = spin_until_or_cancel(|| regs.read(UsartReg::Isr) & isr::TXE != 0, hook) {
                warn!("usart write cancelled after {} of {} bytes", sent, bytes.len());
                return Err(e);
            }
            self.regs.write(UsartReg::Tdr, u32::from(byte));
        }

        spin_until(|| self.tx_empty());
        Ok(())
    }

    /// Wait for a received byte, polling the hook meanwhile.
    ///
    /// On cancellation the data register is not read, so a byte that
    /// arrives later is still there for the next call.
    pub fn read_byte(&mut self) -> Result<u8, Cancelled> {
        let Serial { regs, hook } = self;
        if let Err(e) = spin_until_or_cancel(|| regs.read(UsartReg::Isr) & isr::RXNE != 0, hook) {
            warn!("usart read cancelled");
            return Err(e);
        }
        Ok((self.regs.read(UsartReg::Rdr) & 0xFF) as u8)
    }

    /// A received byte is waiting in the data register.
    pub fn is_rx_ready(&self) -> bool {
        self.rx_ready()
    }

    /// Line errors the hardware has latched since they were last cleared.
    pub fn line_errors(&self) -> LineErrors {
        LineErrors::from_isr(self.regs.read(UsartReg::Isr) & LineErrors::MASK)
    }

    /// Acknowledge the given line errors.
    pub fn clear_line_errors(&mut self, errors: LineErrors) {
        self.regs.write(UsartReg::Icr, errors.bits());
    }

    /// Install a new idle hook and hand back the previous one.
    pub fn replace_idle_hook(&mut self, hook: H) -> H {
        core::mem::replace(&mut self.hook, hook)
    }

    /// The installed idle hook.
    pub fn idle_hook_mut(&mut self) -> &mut H {
        &mut self.hook
    }

    /// Release the register block and the hook.
    pub fn free(self) -> (R, H) {
        (self.regs, self.hook)
    }
}

impl<R: UsartRegisters, H: IdleHook> fmt::Write for Serial<R, H> {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.write_all(s.as_bytes()).map_err(|_| fmt::Error)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::idle::{FnHook, NoHook, SpinBudget};
    use crate::regs::fake::FakeUsart;
    use core::fmt::Write as _;
    use core::ops::ControlFlow;
    use std::cell::Cell;

    fn serial() -> Serial<FakeUsart, NoHook> {
        Serial::new(FakeUsart::new(), NoHook)
    }

    /// A hook that cancels on poll number `n` (1-based) and counts polls.
    fn cancel_on(n: u32, polls: &Cell<u32>) -> FnHook<impl FnMut() -> ControlFlow<()> + '_> {
        FnHook(move || {
            polls.set(polls.get() + 1);
            if polls.get() >= n {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        })
    }

    #[test]
    fn selector_aliases_unknown_values_to_usart2() {
        assert_eq!(Port::from_selector(1), Port::Usart1);
        assert_eq!(Port::from_selector(2), Port::Usart2);
        assert_eq!(Port::from_selector(0), Port::Usart2);
        assert_eq!(Port::from_selector(3), Port::Usart2);
        assert_eq!(Port::from_selector(u16::MAX), Port::Usart2);
    }

    #[test]
    fn parity_raw_values() {
        assert_eq!(Parity::from_raw(0), Some(Parity::None));
        assert_eq!(Parity::from_raw(1), Some(Parity::Even));
        assert_eq!(Parity::from_raw(2), Some(Parity::Odd));
        assert_eq!(Parity::from_raw(3), None);
        assert_eq!(Parity::Odd as u32, 2);
    }

    #[test]
    fn reset_clears_every_register_in_order() {
        let mut s = serial();
        s.regs.preset(UsartReg::Cr1, 0xFFFF);
        s.regs.preset(UsartReg::Brr, 833);
        s.reset();

        let writes = s.regs.writes.borrow().clone();
        assert_eq!(
            writes,
            [
                (UsartReg::Cr1, 0),
                (UsartReg::Cr2, 0),
                (UsartReg::Cr3, 0),
                (UsartReg::Brr, 0),
                (UsartReg::Gtpr, 0),
                (UsartReg::Rtor, 0),
                (UsartReg::Rqr, 0),
                (UsartReg::Icr, 0),
            ]
        );
        assert_eq!(s.state(), PortState::Unconfigured);
    }

    #[test]
    fn rate_is_truncated_quotient() {
        let cases = [
            (48_000_000, 57_600, 833),
            (48_000_000, 115_200, 416),
            (8_000_000, 9_600, 833),
            (48_000_000, 48_000_000, 1),
            (7, 2, 3),
            (u32::MAX, 1, u32::MAX),
        ];
        for (clock, baud, expected) in cases {
            let mut s = serial();
            s.regs.preset(UsartReg::Cr1, cr1::OVER8 | cr1::TE);
            assert_eq!(s.set_rate(clock, baud), expected);
            assert_eq!(s.regs.get(UsartReg::Brr), expected);
            assert_eq!(s.regs.get(UsartReg::Cr1), cr1::TE);
        }
    }

    #[test]
    fn parity_enable_and_frame_width_move_together() {
        let both = cr1::PCE | cr1::M;
        for prior in [0, both, cr1::PCE, cr1::M, cr1::PS | cr1::M, cr1::UE | cr1::PS] {
            let mut s = serial();

            s.regs.preset(UsartReg::Cr1, prior);
            s.set_parity(Parity::Even);
            let v = s.regs.get(UsartReg::Cr1);
            assert_eq!(v & both, both);
            assert_eq!(v & (cr1::PS | cr1::UE), 0);

            s.regs.preset(UsartReg::Cr1, prior);
            s.set_parity(Parity::Odd);
            let v = s.regs.get(UsartReg::Cr1);
            assert_eq!(v & both, both);
            assert_eq!(v & cr1::PS, cr1::PS);
            assert_eq!(v & cr1::UE, 0);

            s.regs.preset(UsartReg::Cr1, prior);
            s.set_parity(Parity::None);
            let v = s.regs.get(UsartReg::Cr1);
            assert_eq!(v & both, 0);
            assert_eq!(v & cr1::UE, 0);
        }
    }

    #[test]
    fn parity_leaves_unrelated_bits_alone() {
        let mut s = serial();
        s.regs.preset(UsartReg::Cr1, cr1::TE | cr1::RE | cr1::OVER8);
        s.set_parity(Parity::Even);
        assert_eq!(
            s.regs.get(UsartReg::Cr1),
            cr1::TE | cr1::RE | cr1::OVER8 | cr1::PCE | cr1::M
        );
    }

    #[test]
    fn start_is_idempotent() {
        let mut s = serial();
        s.set_rate(48_000_000, 57_600);
        s.set_parity(Parity::Even);
        assert_eq!(s.state(), PortState::Configured);

        s.start();
        let once = s.regs.get(UsartReg::Cr1);
        s.start();
        assert_eq!(s.regs.get(UsartReg::Cr1), once);
        assert_eq!(once, cr1::UE | cr1::TE | cr1::RE | cr1::PCE | cr1::M);
        assert_eq!(s.state(), PortState::Active);
    }

    #[test]
    fn start_enables_port_before_directions() {
        let mut s = serial();
        s.start();
        let writes = s.regs.writes.borrow().clone();
        assert_eq!(
            writes,
            [
                (UsartReg::Cr1, cr1::UE),
                (UsartReg::Cr1, cr1::UE | cr1::TE | cr1::RE),
            ]
        );
    }

    #[test]
    fn write_sends_bytes_in_order() {
        let mut s = serial();
        s.regs.tx_latency.set(3);
        assert_eq!(s.write_all(b"Hello, world!\r\n"), Ok(()));
        assert_eq!(&s.regs.sent.borrow()[..], b"Hello, world!\r\n");
    }

    #[test]
    fn write_cancel_leaves_suffix_unsent() {
        let polls = Cell::new(0);
        let mut s = Serial::new(FakeUsart::new(), cancel_on(3, &polls));
        s.regs.tx_latency.set(2);

        // 'a' goes out at once, 'b' after two polls, the wait for 'c'
        // reaches the third poll.
        assert_eq!(s.write_all(b"abcdef"), Err(Cancelled));
        assert_eq!(&s.regs.sent.borrow()[..], b"ab");
        assert_eq!(polls.get(), 3);
    }

    #[test]
    fn write_cancelled_before_first_byte_sends_nothing() {
        let polls = Cell::new(0);
        let mut s = Serial::new(FakeUsart::new(), cancel_on(1, &polls));
        // Transmitter still busy with something from before.
        s.regs.tx_latency.set(5);
        s.regs.write(UsartReg::Tdr, u32::from(b'x'));
        s.regs.sent.borrow_mut().clear();

        assert_eq!(s.write_all(b"abc"), Err(Cancelled));
        assert!(s.regs.sent.borrow().is_empty());
    }

    #[test]
    fn final_drain_ignores_cancellation() {
        let polls = Cell::new(0);
        let mut s = Serial::new(FakeUsart::new(), cancel_on(1, &polls));
        s.regs.tx_latency.set(10);

        assert_eq!(s.write_all(b"z"), Ok(()));
        assert_eq!(&s.regs.sent.borrow()[..], b"z");
        assert_eq!(polls.get(), 0);
        // One read to find room, ten busy reads in the drain, one that
        // finally sees TXE.
        assert_eq!(s.regs.isr_reads.get(), 12);
    }

    #[test]
    fn empty_write_only_drains() {
        let mut s = Serial::new(FakeUsart::new(), SpinBudget::new(0));
        assert_eq!(s.write_all(&[]), Ok(()));
        assert_eq!(s.regs.isr_reads.get(), 1);
        assert!(s.regs.sent.borrow().is_empty());
    }

    #[test]
    fn read_returns_low_byte_in_arrival_order() {
        let mut s = serial();
        s.regs.push_rx(0, 0x41);
        s.regs.push_rx(4, 0x1_42);
        s.regs.push_rx(1, 0xFF0D);

        assert_eq!(s.read_byte(), Ok(0x41));
        assert_eq!(s.read_byte(), Ok(0x42));
        assert_eq!(s.read_byte(), Ok(0x0D));
    }

    #[test]
    fn read_cancel_does_not_consume() {
        let mut s = Serial::new(FakeUsart::new(), SpinBudget::new(2));
        s.regs.push_rx(5, u32::from(b'q'));

        assert_eq!(s.read_byte(), Err(Cancelled));
        assert_eq!(s.regs.rdr_reads.get(), 0);

        s.idle_hook_mut().reset();
        assert_eq!(s.read_byte(), Ok(b'q'));
        assert_eq!(s.regs.rdr_reads.get(), 1);
    }

    #[test]
    fn replacing_the_hook_returns_the_old_one() {
        let mut s = Serial::new(FakeUsart::new(), Some(SpinBudget::new(0)));
        s.regs.push_rx(3, u32::from(b'k'));
        assert_eq!(s.read_byte(), Err(Cancelled));

        let old = s.replace_idle_hook(None);
        assert_eq!(old, Some(SpinBudget::new(0)));
        assert_eq!(s.read_byte(), Ok(b'k'));
    }

    #[test]
    fn line_errors_are_reported_and_cleared() {
        let mut s = serial();
        s.regs.line_errors.set(isr::ORE | isr::FE);
        s.regs.push_rx(0, 0x55);

        let e = s.line_errors();
        assert!(e.any());
        assert!(e.overrun && e.framing);
        assert!(!e.parity && !e.noise);

        // Receiving is unaffected by latched errors.
        assert_eq!(s.read_byte(), Ok(0x55));

        s.clear_line_errors(e);
        assert!(!s.line_errors().any());
    }

    #[test]
    fn formatted_output_goes_to_the_wire() {
        let mut s = serial();
        write!(s, "UID {}: {:08x}\r\n", 2, 0x1234_abcd_u32).unwrap();
        assert_eq!(&s.regs.sent.borrow()[..], b"UID 2: 1234abcd\r\n");
    }

    #[test]
    fn formatted_output_reports_cancellation() {
        let mut s = Serial::new(FakeUsart::new(), SpinBudget::new(0));
        s.regs.tx_latency.set(1);
        assert!(write!(s, "ab").is_err());
        assert_eq!(&s.regs.sent.borrow()[..], b"a");
    }
}
