//! One half-word per boot in the last flash page.
//!
//! Slots start erased. A boot claims the first slot whose top nibble is
//! still set and writes its own index there, so the slot count never
//! reaches into the top nibble. Once every slot is used the log stays full
//! until the page is erased by other means.

use stm32f0_serial::Flash;
use stm32f0_serial::regs::FlashRegisters;

const BOOT_LOG: usize = 0x0800_F000;
const SLOTS: u16 = 256;

/// Claim the next free slot. Returns its index, or `None` if the log is full.
pub fn record<R: FlashRegisters>(flash: &mut Flash<R>) -> Option<u16> {
    for slot in 0..SLOTS {
        let address = BOOT_LOG + 2 * usize::from(slot);
        // SAFETY: The page is excluded from the program image by build.rs.
        let value = unsafe { flash.read_half_word(address) };
        if value & 0xF000 != 0 {
            // SAFETY: As above. A slot with its top bits set was never
            // written, so it is still erased.
            unsafe { flash.write_half_word(address, slot) };
            return Some(slot);
        }
    }
    None
}
