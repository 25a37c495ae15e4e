//! Firmware images: loading ELF and Intel HEX files, writing Intel HEX, and
//! splitting an image into blocks the bootloader can write.

use std::path::Path;

use anyhow::{Context, Result, bail, ensure};
use goblin::elf::{Elf, program_header::PT_LOAD};
use ihex::Record;

use crate::bootloader::MAX_BLOCK;

/// Bytes per data record when writing Intel HEX.
const HEX_RECORD_LEN: usize = 16;

/// A contiguous run of bytes at a physical address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub address: u32,
    pub data: Vec<u8>,
}

impl Segment {
    /// Address of the last byte, or `None` if the segment is empty or runs
    /// past the end of the address space.
    pub fn last(&self) -> Option<u32> {
        let len = u32::try_from(self.data.len()).ok()?;
        self.address.checked_add(len.checked_sub(1)?)
    }
}

/// Load an image, as Intel HEX if the file name ends in `.hex` or `.ihex`
/// and as ELF otherwise.
pub fn load(path: &Path) -> Result<Vec<Segment>> {
    let is_hex = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("hex") || ext.eq_ignore_ascii_case("ihex"));

    if is_hex {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        hex_segments(&text).with_context(|| format!("Failed to parse {}", path.display()))
    } else {
        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        elf_segments(&bytes).with_context(|| format!("Failed to parse {}", path.display()))
    }
}

/// The loadable contents of an ELF file, placed at their load addresses.
pub fn elf_segments(bytes: &[u8]) -> Result<Vec<Segment>> {
    let elf = Elf::parse(bytes)?;

    let mut segments = Vec::new();
    for ph in &elf.program_headers {
        if ph.p_type != PT_LOAD || ph.p_filesz == 0 {
            continue;
        }
        let data = usize::try_from(ph.p_offset)
            .ok()
            .zip(usize::try_from(ph.p_filesz).ok())
            .and_then(|(start, len)| bytes.get(start..start.checked_add(len)?))
            .context("Program header points past end of file")?;
        let address = u32::try_from(ph.p_paddr).context("Load address above 4 GiB")?;
        segments.push(Segment {
            address,
            data: data.to_vec(),
        });
    }
    segments.sort_by_key(|s| s.address);

    Ok(segments)
}

/// The data records of an Intel HEX file, joined into contiguous segments.
///
/// Extended linear and extended segment address records are honoured. Start
/// address records are ignored.
pub fn hex_segments(text: &str) -> Result<Vec<Segment>> {
    let mut segments: Vec<Segment> = Vec::new();
    let mut base: u32 = 0;

    for record in ihex::Reader::new(text) {
        match record? {
            Record::Data { offset, value } => {
                let address = base
                    .checked_add(u32::from(offset))
                    .context("Data record above 4 GiB")?;
                match segments.last_mut() {
                    Some(seg) if seg.last().and_then(|l| l.checked_add(1)) == Some(address) => {
                        seg.data.extend_from_slice(&value);
                    }
                    _ => segments.push(Segment {
                        address,
                        data: value,
                    }),
                }
            }
            Record::ExtendedLinearAddress(upper) => base = u32::from(upper) << 16,
            Record::ExtendedSegmentAddress(segment) => base = u32::from(segment) << 4,
            Record::EndOfFile => break,
            Record::StartLinearAddress(_) | Record::StartSegmentAddress { .. } => {}
        }
    }

    segments.retain(|s| !s.data.is_empty());
    segments.sort_by_key(|s| s.address);
    Ok(segments)
}

/// Render `data`, starting at `address`, as an Intel HEX file.
pub fn to_hex(address: u32, data: &[u8]) -> Result<String> {
    let fits = u32::try_from(data.len())
        .ok()
        .and_then(|len| address.checked_add(len.saturating_sub(1)))
        .is_some();
    ensure!(
        fits,
        "{} bytes at {address:#010x} run past the end of the address space",
        data.len()
    );

    let mut records = Vec::new();
    let mut upper = None;
    let mut at = address;
    let mut rest = data;

    while !rest.is_empty() {
        let high = (at >> 16) as u16;
        if upper != Some(high) {
            records.push(Record::ExtendedLinearAddress(high));
            upper = Some(high);
        }

        // A record must not cross into the next 64 KiB window.
        let window_left = 0x1_0000 - (at & 0xFFFF) as usize;
        let n = rest.len().min(HEX_RECORD_LEN).min(window_left);
        records.push(Record::Data {
            offset: at as u16,
            value: rest[..n].to_vec(),
        });

        rest = &rest[n..];
        at = at.wrapping_add(n as u32);
    }
    records.push(Record::EndOfFile);

    Ok(ihex::create_object_file_representation(&records)?)
}

/// Split `segments` into word-aligned blocks of at most [`MAX_BLOCK`] bytes.
///
/// Segments that share a word are joined so that no word is written twice.
/// Gaps introduced by alignment are filled with `0xFF`, the erased value,
/// so writing them leaves flash untouched. Overlapping segments and
/// segments running past the end of the address space are rejected.
pub fn blocks(segments: &[Segment]) -> Result<Vec<Segment>> {
    let mut sorted: Vec<&Segment> = segments.iter().filter(|s| !s.data.is_empty()).collect();
    sorted.sort_by_key(|s| s.address);

    let mut runs: Vec<Segment> = Vec::new();
    let mut prev_last: Option<u32> = None;

    for seg in sorted {
        let Some(last) = seg.last() else {
            bail!("Segment at {:#010x} runs past the end of the address space", seg.address);
        };
        if let Some(prev) = prev_last {
            ensure!(
                seg.address > prev,
                "Segment at {:#010x} overlaps the one ending at {prev:#010x}",
                seg.address
            );
        }
        prev_last = Some(last);

        let start = seg.address & !3;
        match runs.last_mut() {
            Some(run) if last_word(run) >= Some(start) => {
                run.data.resize((seg.address - run.address) as usize, 0xFF);
                run.data.extend_from_slice(&seg.data);
            }
            _ => {
                let mut data = vec![0xFF; (seg.address - start) as usize];
                data.extend_from_slice(&seg.data);
                runs.push(Segment {
                    address: start,
                    data,
                });
            }
        }
    }

    let mut out = Vec::new();
    for mut run in runs {
        run.data.resize(run.data.len().next_multiple_of(4), 0xFF);
        if run.last().is_none() {
            bail!("Image at {:#010x} runs past the end of the address space", run.address);
        }

        let mut address = run.address;
        for chunk in run.data.chunks(MAX_BLOCK) {
            out.push(Segment {
                address,
                data: chunk.to_vec(),
            });
            // The run's last address was checked above, so this only
            // wraps after the final chunk.
            address = address.wrapping_add(chunk.len() as u32);
        }
    }

    Ok(out)
}

/// Start of the word holding the last byte of `run`.
fn last_word(run: &Segment) -> Option<u32> {
    run.last().map(|l| l & !3)
}
