//! Flashing and dumping through the ROM bootloader.

use std::fs;
use std::io::{Read, Write};
use std::path::Path;

use anyhow::{Context, Result, bail, ensure};

use crate::bootloader::{Bootloader, MAX_BLOCK, cmd};
use crate::image::{self, Segment};

/// Synchronise and print what the bootloader reports about itself.
pub fn identify<T: Read + Write>(bl: &mut Bootloader<T>) -> Result<bool> {
    bl.sync()?;

    let info = bl.get()?;
    let commands: Vec<String> = info.commands.iter().map(|c| format!("{c:02x}")).collect();
    println!(
        "Bootloader v{}.{}, commands: {}",
        info.version >> 4,
        info.version & 0xF,
        commands.join(" ")
    );

    let version = bl.get_version()?;
    println!(
        "Version {:#04x}, option bytes: {:02x} {:02x}",
        version.version, version.option_bytes[0], version.option_bytes[1]
    );

    let id = bl.get_id()?;
    println!("Product ID: {id:#06x}");

    Ok(info.supports(cmd::EXTENDED_ERASE))
}

/// Erase everything, then write `blocks`, reading each one back if `verify`.
pub fn program<T: Read + Write>(
    bl: &mut Bootloader<T>,
    blocks: &[Segment],
    extended_erase: bool,
    verify: bool,
) -> Result<()> {
    if extended_erase {
        bl.extended_erase_all()?;
    } else {
        bl.erase_all()?;
    }

    for block in blocks {
        println!("{:08x} {:4}", block.address, block.data.len());
        bl.write_memory(block.address, &block.data)?;

        if verify {
            let back = bl.read_memory(block.address, block.data.len())?;
            if back != block.data {
                bail!("Verify failed at {:#010x}", block.address);
            }
        }
    }

    Ok(())
}

/// Copy `len` bytes of target memory from `address` into `out`.
pub fn dump<T: Read + Write>(
    bl: &mut Bootloader<T>,
    address: u32,
    len: usize,
    out: &mut impl Write,
) -> Result<()> {
    ensure!(len > 0, "Nothing to read");
    let in_range = u32::try_from(len)
        .ok()
        .and_then(|len| address.checked_add(len - 1))
        .is_some();
    ensure!(
        in_range,
        "Reading {len} bytes at {address:#010x} runs past the end of the address space"
    );

    let mut offset: u32 = 0;
    let mut left = len;
    while left > 0 {
        let n = left.min(MAX_BLOCK);
        // In range: the whole span was checked above.
        let at = address + offset;
        let data = bl.read_memory(at, n)?;
        println!("{at:08x} {n:4}");
        out.write_all(&data)?;
        offset += n as u32;
        left -= n;
    }

    Ok(())
}

/// Dump target memory into `path`, as Intel HEX if the name ends in `.hex`
/// or `.ihex` and as a raw binary otherwise.
pub fn dump_to_file<T: Read + Write>(
    bl: &mut Bootloader<T>,
    address: u32,
    len: usize,
    path: &Path,
) -> Result<()> {
    let is_hex = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("hex") || ext.eq_ignore_ascii_case("ihex"));

    let mut data = Vec::with_capacity(len);
    dump(bl, address, len, &mut data)?;

    let contents = if is_hex {
        image::to_hex(address, &data)?.into_bytes()
    } else {
        data
    };
    fs::write(path, contents).with_context(|| format!("Failed to write {}", path.display()))
}
