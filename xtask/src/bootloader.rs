//! Client for the STM32 ROM bootloader on USART (AN3155).
//!
//! Every command is a byte and its complement, answered with ACK or NACK.
//! Addresses go out big-endian followed by their XOR. Data blocks go out
//! as `N - 1`, the `N` bytes, and the XOR of all of that.

use std::io::{ErrorKind, Read, Write};

use anyhow::{Context, Result, bail, ensure};

pub const ACK: u8 = 0x79;
pub const NACK: u8 = 0x1F;
pub const SYNC: u8 = 0x7F;

/// Largest block a single read or write command moves.
pub const MAX_BLOCK: usize = 256;

pub mod cmd {
    pub const GET: u8 = 0x00;
    pub const GET_VERSION: u8 = 0x01;
    pub const GET_ID: u8 = 0x02;
    pub const READ_MEMORY: u8 = 0x11;
    pub const GO: u8 = 0x21;
    pub const WRITE_MEMORY: u8 = 0x31;
    pub const ERASE: u8 = 0x43;
    pub const EXTENDED_ERASE: u8 = 0x44;
}

/// XOR of `seed` and every byte of `data`.
pub fn checksum(seed: u8, data: &[u8]) -> u8 {
    data.iter().fold(seed, |acc, b| acc ^ b)
}

/// Reply to GET.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    /// Bootloader version, BCD.
    pub version: u8,
    /// Supported command codes.
    pub commands: Vec<u8>,
}

impl Info {
    pub fn supports(&self, command: u8) -> bool {
        self.commands.contains(&command)
    }
}

/// Reply to GET VERSION.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    pub version: u8,
    pub option_bytes: [u8; 2],
}

pub struct Bootloader<T> {
    port: T,
}

impl<T: Read + Write> Bootloader<T> {
    pub fn new(port: T) -> Self {
        Bootloader { port }
    }

    pub fn into_inner(self) -> T {
        self.port
    }

    fn read_byte(&mut self) -> Result<u8> {
        let mut b = [0];
        self.read_exact(&mut b)?;
        Ok(b[0])
    }

    fn read_exact(&mut self, buf: &mut [u8]) -> Result<()> {
        match self.port.read_exact(buf) {
            Ok(()) => Ok(()),
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::UnexpectedEof) => {
                bail!("No response from bootloader")
            }
            Err(e) => Err(e).context("Failed to read from serial port"),
        }
    }

    fn send(&mut self, bytes: &[u8]) -> Result<()> {
        self.port
            .write_all(bytes)
            .and_then(|()| self.port.flush())
            .context("Failed to write to serial port")
    }

    fn send_checked(&mut self, seed: u8, data: &[u8]) -> Result<()> {
        let mut frame = Vec::with_capacity(data.len() + 1);
        frame.extend_from_slice(data);
        frame.push(checksum(seed, data));
        self.send(&frame)
    }

    fn expect_ack(&mut self, what: &str) -> Result<()> {
        match self.read_byte().with_context(|| format!("{what}: waiting for ACK"))? {
            ACK => Ok(()),
            NACK => bail!("{what}: NACK"),
            other => bail!("{what}: expected ACK, got {other:#04x}"),
        }
    }

    fn command(&mut self, code: u8, what: &str) -> Result<()> {
        self.send(&[code, !code])?;
        self.expect_ack(what)
    }

    fn address(&mut self, address: u32, what: &str) -> Result<()> {
        self.send_checked(0x00, &address.to_be_bytes())?;
        self.expect_ack(what)
    }

    /// Let the bootloader detect the baud rate.
    ///
    /// A bootloader that is already synchronised answers NACK, which is
    /// accepted too.
    pub fn sync(&mut self) -> Result<()> {
        self.send(&[SYNC])?;
        match self.read_byte().context("sync")? {
            ACK | NACK => Ok(()),
            other => bail!("sync: expected ACK, got {other:#04x}"),
        }
    }

    pub fn get(&mut self) -> Result<Info> {
        self.command(cmd::GET, "GET")?;
        let n = usize::from(self.read_byte()?) + 1;
        let mut data = vec![0; n];
        self.read_exact(&mut data)?;
        self.expect_ack("GET")?;

        Ok(Info {
            version: data[0],
            commands: data[1..].to_vec(),
        })
    }

    pub fn get_version(&mut self) -> Result<Version> {
        self.command(cmd::GET_VERSION, "GET VERSION")?;
        let mut data = [0; 3];
        self.read_exact(&mut data)?;
        self.expect_ack("GET VERSION")?;

        Ok(Version {
            version: data[0],
            option_bytes: [data[1], data[2]],
        })
    }

    /// Product ID.
    pub fn get_id(&mut self) -> Result<u16> {
        self.command(cmd::GET_ID, "GET ID")?;
        let n = usize::from(self.read_byte()?) + 1;
        let mut data = vec![0; n];
        self.read_exact(&mut data)?;
        self.expect_ack("GET ID")?;

        ensure!(n == 2, "GET ID: unexpected {n}-byte product ID");
        Ok(u16::from_be_bytes([data[0], data[1]]))
    }

    pub fn read_memory(&mut self, address: u32, len: usize) -> Result<Vec<u8>> {
        ensure!((1..=MAX_BLOCK).contains(&len), "read of {len} bytes");
        self.command(cmd::READ_MEMORY, "READ MEMORY")?;
        self.address(address, "READ MEMORY address")?;

        let n = (len - 1) as u8;
        self.send(&[n, !n])?;
        self.expect_ack("READ MEMORY length")?;

        let mut data = vec![0; len];
        self.read_exact(&mut data)?;
        Ok(data)
    }

    pub fn write_memory(&mut self, address: u32, data: &[u8]) -> Result<()> {
        ensure!(
            (1..=MAX_BLOCK).contains(&data.len()),
            "write of {} bytes",
            data.len()
        );
        self.command(cmd::WRITE_MEMORY, "WRITE MEMORY")?;
        self.address(address, "WRITE MEMORY address")?;

        let mut block = Vec::with_capacity(data.len() + 1);
        block.push((data.len() - 1) as u8);
        block.extend_from_slice(data);
        self.send_checked(0x00, &block)?;
        self.expect_ack("WRITE MEMORY data")
    }

    /// Erase all of flash with the legacy ERASE command.
    pub fn erase_all(&mut self) -> Result<()> {
        self.command(cmd::ERASE, "ERASE")?;
        self.send_checked(0xFF, &[0xFF])?;
        self.expect_ack("ERASE global")
    }

    /// Erase all of flash with EXTENDED ERASE.
    pub fn extended_erase_all(&mut self) -> Result<()> {
        self.command(cmd::EXTENDED_ERASE, "EXTENDED ERASE")?;
        self.send_checked(0x00, &0xFFFFu16.to_be_bytes())?;
        self.expect_ack("EXTENDED ERASE global")
    }

    /// Jump to the application at `address`.
    pub fn go(&mut self, address: u32) -> Result<()> {
        self.command(cmd::GO, "GO")?;
        self.address(address, "GO address")
    }
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use std::collections::VecDeque;
    use std::io;

    /// A port that replays canned device output and records what is sent.
    #[derive(Default)]
    pub struct FakePort {
        pub rx: VecDeque<u8>,
        pub tx: Vec<u8>,
    }

    impl FakePort {
        pub fn replying(bytes: &[u8]) -> Self {
            FakePort {
                rx: bytes.iter().copied().collect(),
                tx: Vec::new(),
            }
        }
    }

    impl Read for FakePort {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.rx.is_empty() {
                return Err(io::Error::new(ErrorKind::TimedOut, "timed out"));
            }
            let n = buf.len().min(self.rx.len());
            for (dst, src) in buf.iter_mut().zip(self.rx.drain(..n)) {
                *dst = src;
            }
            Ok(n)
        }
    }

    impl Write for FakePort {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn checksum_is_xor() {
        assert_eq!(checksum(0xFF, &[cmd::GET]), 0xFF);
        assert_eq!(checksum(0x00, &[0x08, 0x00, 0x00, 0x00]), 0x08);
        assert_eq!(checksum(0x00, &[0x12, 0x34, 0x56, 0x78]), 0x08);
        assert_eq!(checksum(0x00, &[]), 0x00);
    }

    #[test]
    fn sync_accepts_ack_or_nack() {
        let mut bl = Bootloader::new(FakePort::replying(&[ACK]));
        bl.sync().unwrap();
        assert_eq!(bl.into_inner().tx, [SYNC]);

        let mut bl = Bootloader::new(FakePort::replying(&[NACK]));
        bl.sync().unwrap();

        let mut bl = Bootloader::new(FakePort::replying(&[0x00]));
        assert!(bl.sync().is_err());
    }

    #[test]
    fn get_parses_version_and_commands() {
        let reply = [ACK, 3, 0x31, 0x00, 0x01, 0x44, ACK];
        let mut bl = Bootloader::new(FakePort::replying(&reply));
        let info = bl.get().unwrap();

        assert_eq!(info.version, 0x31);
        assert_eq!(info.commands, [0x00, 0x01, 0x44]);
        assert!(info.supports(cmd::EXTENDED_ERASE));
        assert!(!info.supports(cmd::ERASE));
        assert_eq!(bl.into_inner().tx, [cmd::GET, 0xFF]);
    }

    #[test]
    fn get_version_reads_option_bytes() {
        let reply = [ACK, 0x31, 0x00, 0x00, ACK];
        let mut bl = Bootloader::new(FakePort::replying(&reply));
        let v = bl.get_version().unwrap();
        assert_eq!(v.version, 0x31);
        assert_eq!(v.option_bytes, [0, 0]);
        assert_eq!(bl.into_inner().tx, [cmd::GET_VERSION, 0xFE]);
    }

    #[test]
    fn get_id_is_big_endian() {
        let reply = [ACK, 1, 0x04, 0x40, ACK];
        let mut bl = Bootloader::new(FakePort::replying(&reply));
        assert_eq!(bl.get_id().unwrap(), 0x0440);
    }

    #[test]
    fn write_memory_frames() {
        let mut bl = Bootloader::new(FakePort::replying(&[ACK, ACK, ACK]));
        bl.write_memory(0x0800_0100, &[0xAA, 0xBB, 0xCC, 0xDD]).unwrap();

        let tx = bl.into_inner().tx;
        assert_eq!(
            tx,
            [
                cmd::WRITE_MEMORY,
                0xCE,
                0x08,
                0x00,
                0x01,
                0x00,
                0x09,
                0x03,
                0xAA,
                0xBB,
                0xCC,
                0xDD,
                0x03 ^ 0xAA ^ 0xBB ^ 0xCC ^ 0xDD,
            ]
        );
    }

    #[test]
    fn write_memory_reports_nack_on_data() {
        let mut bl = Bootloader::new(FakePort::replying(&[ACK, ACK, NACK]));
        let err = bl.write_memory(0x0800_0000, &[0; 4]).unwrap_err();
        assert!(err.to_string().contains("NACK"));
    }

    #[test]
    fn oversized_blocks_are_refused_before_sending() {
        let mut bl = Bootloader::new(FakePort::default());
        assert!(bl.write_memory(0x0800_0000, &[0; MAX_BLOCK + 1]).is_err());
        assert!(bl.write_memory(0x0800_0000, &[]).is_err());
        assert!(bl.read_memory(0x0800_0000, 0).is_err());
        assert!(bl.into_inner().tx.is_empty());
    }

    #[test]
    fn read_memory_frames_and_returns_data() {
        let mut reply = vec![ACK, ACK, ACK];
        reply.extend(0..=255u8);
        let mut bl = Bootloader::new(FakePort::replying(&reply));
        let data = bl.read_memory(0x0800_0000, 256).unwrap();

        assert_eq!(data.len(), 256);
        assert_eq!(data[255], 255);
        assert_eq!(
            bl.into_inner().tx,
            [cmd::READ_MEMORY, 0xEE, 0x08, 0x00, 0x00, 0x00, 0x08, 0xFF, 0x00]
        );
    }

    #[test]
    fn erase_variants_send_global_codes() {
        let mut bl = Bootloader::new(FakePort::replying(&[ACK, ACK]));
        bl.extended_erase_all().unwrap();
        assert_eq!(bl.into_inner().tx, [cmd::EXTENDED_ERASE, 0xBB, 0xFF, 0xFF, 0x00]);

        let mut bl = Bootloader::new(FakePort::replying(&[ACK, ACK]));
        bl.erase_all().unwrap();
        assert_eq!(bl.into_inner().tx, [cmd::ERASE, 0xBC, 0xFF, 0x00]);
    }

    #[test]
    fn go_sends_address() {
        let mut bl = Bootloader::new(FakePort::replying(&[ACK, ACK]));
        bl.go(0x0800_0000).unwrap();
        assert_eq!(
            bl.into_inner().tx,
            [cmd::GO, 0xDE, 0x08, 0x00, 0x00, 0x00, 0x08]
        );
    }

    #[test]
    fn silence_is_an_error() {
        let mut bl = Bootloader::new(FakePort::default());
        let err = bl.get().unwrap_err();
        assert!(format!("{err:#}").contains("No response"));
    }
}
