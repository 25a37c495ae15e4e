//! Factory-programmed device identification.

use core::ptr::with_exposed_provenance;

const UID_BASE: usize = 0x1FFF_F7AC;
const FLASH_SIZE: usize = 0x1FFF_F7CC;

/// Identification data from the system memory area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SystemId {
    /// 96-bit unique ID: wafer X/Y, lot and wafer number, lot number.
    pub uid: [u32; 3],
    /// Flash size in KiB.
    pub flash_kib: u16,
}

impl SystemId {
    /// Read the identification registers. Only meaningful on an STM32F0.
    pub fn read() -> Self {
        let mut uid = [0; 3];
        for (i, word) in uid.iter_mut().enumerate() {
            let p = with_exposed_provenance::<u32>(UID_BASE + 4 * i);
            // SAFETY: The unique ID lives at a fixed, always readable address.
            *word = unsafe { p.read_volatile() };
        }

        let p = with_exposed_provenance::<u16>(FLASH_SIZE);
        // SAFETY: As above.
        let flash_kib = unsafe { p.read_volatile() };

        SystemId { uid, flash_kib }
    }
}
