//! Half-word programming of the on-chip flash.
//!
//! Programming can only clear bits. The target half-word has to be erased
//! (`0xFFFF`) or hold a value the new one narrows; nothing here erases pages
//! or checks the result.

use crate::regs::{FlashReg, FlashRegisters, KEY1, KEY2, cr, sr};
use crate::wait::{TimedOut, spin_until, spin_until_bounded};

/// Start of the main flash array.
pub const FLASH_BASE: usize = 0x0800_0000;

/// Outcome flags of the last flash operation, as latched in SR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FlashStatus {
    /// The last operation completed.
    pub end_of_operation: bool,
    /// A program was attempted on a half-word that was not erased.
    pub programming_error: bool,
    /// A program was attempted on a write-protected page.
    pub write_protect_error: bool,
}

/// Writer for single half-words of flash.
pub struct Flash<R> {
    regs: R,
}

impl<R: FlashRegisters> Flash<R> {
    /// Wrap the FLASH interface registers.
    pub fn new(regs: R) -> Self {
        Flash { regs }
    }

    /// The controller refuses program and erase requests until unlocked.
    pub fn is_locked(&self) -> bool {
        self.regs.read(FlashReg::Cr) & cr::LOCK != 0
    }

    /// An operation is in progress.
    pub fn is_busy(&self) -> bool {
        self.regs.read(FlashReg::Sr) & sr::BSY != 0
    }

    /// Status flags of the last operation.
    pub fn status(&self) -> FlashStatus {
        let v = self.regs.read(FlashReg::Sr);
        FlashStatus {
            end_of_operation: v & sr::EOP != 0,
            programming_error: v & sr::PGERR != 0,
            write_protect_error: v & sr::WRPRTERR != 0,
        }
    }

    fn begin(&mut self, address: usize, value: u16) {
        debug_assert!(address % 2 == 0, "unaligned flash half-word");

        if self.is_locked() {
            self.regs.write(FlashReg::Keyr, KEY1);
            self.regs.write(FlashReg::Keyr, KEY2);
            trace!("flash unlocked");
        }

        self.regs.modify(FlashReg::Cr, |v| v | cr::PG);
        trace!("flash program {=usize:#x} <- {=u16:#x}", address, value);
    }

    fn end(&mut self) {
        self.regs.modify(FlashReg::Cr, |v| v | cr::LOCK);
    }

    /// Program `value` into the half-word at `address` and lock the
    /// controller again.
    ///
    /// Unlocks first if the controller is locked. Waits for the busy flag
    /// without any way out; a controller that never goes idle hangs the
    /// caller. Nothing is read back.
    ///
    /// # Safety
    ///
    /// `address` must be half-word aligned, inside the flash array, and hold
    /// an erased or bit-narrowable value. It must not be part of the code
    /// currently executing.
    pub unsafe fn write_half_word(&mut self, address: usize, value: u16) {
        self.begin(address, value);

        // SAFETY: Upheld by the caller.
        unsafe { self.regs.store(address, value) };
        spin_until(|| !self.is_busy());

        self.end();
    }

    /// Like [`write_half_word`](Self::write_half_word), but gives up waiting
    /// for the busy flag after `max_polls` polls.
    ///
    /// The controller is locked again even on timeout. Whether the half-word
    /// was programmed is then unknown.
    ///
    /// # Safety
    ///
    /// As for [`write_half_word`](Self::write_half_word).
    pub unsafe fn write_half_word_bounded(
        &mut self,
        address: usize,
        value: u16,
        max_polls: u32,
    ) -> Result<(), TimedOut> {
        self.begin(address, value);

        // SAFETY: Upheld by the caller.
        unsafe { self.regs.store(address, value) };
        let r = spin_until_bounded(|| !self.is_busy(), max_polls);
        if r.is_err() {
            warn!("flash still busy after {} polls", max_polls);
        }

        self.end();
        r
    }

    /// Read the half-word at `address`.
    ///
    /// # Safety
    ///
    /// `address` must be half-word aligned and inside the flash array.
    pub unsafe fn read_half_word(&self, address: usize) -> u16 {
        // SAFETY: Upheld by the caller.
        unsafe { self.regs.load(address) }
    }

    /// Release the register block.
    pub fn free(self) -> R {
        self.regs
    }
}
