//! Terminal for the firmware's console.

use std::io::{self, BufRead, ErrorKind, Read, Write};
use std::thread;

use anyhow::{Context, Result, anyhow};
use serialport::SerialPort;

/// Send stdin to the board line by line and print everything it sends.
///
/// Lines go out terminated by a carriage return, which the firmware treats
/// as the end of a line. Runs until stdin or the port closes.
pub fn run(port: Box<dyn SerialPort>) -> Result<()> {
    let tx = port.try_clone().context("Failed to clone serial port")?;
    console(port, tx, io::BufReader::new(io::stdin()), io::stdout().lock())
}

fn forward_lines(input: impl BufRead, mut tx: impl Write) -> io::Result<()> {
    for line in input.lines() {
        let line = line?;
        tx.write_all(line.as_bytes())?;
        tx.write_all(b"\r")?;
        tx.flush()?;
    }
    Ok(())
}

/// Copy `rx` to `output` while a thread feeds `input` to `tx`.
///
/// Returns once `rx` reports end of file, or once the input side is done
/// and `rx` has gone quiet. An error on either side ends the session.
fn console<I, T>(mut rx: impl Read, tx: T, input: I, mut output: impl Write) -> Result<()>
where
    I: BufRead + Send + 'static,
    T: Write + Send + 'static,
{
    let sender = thread::spawn(move || forward_lines(input, tx));

    let mut buf = [0; 256];
    loop {
        match rx.read(&mut buf) {
            Ok(0) => return Ok(()),
            Ok(n) => {
                output.write_all(&buf[..n])?;
                output.flush()?;
            }
            Err(e) if e.kind() == ErrorKind::TimedOut => {
                if sender.is_finished() {
                    return match sender.join() {
                        Ok(r) => r.context("Failed to forward input"),
                        Err(_) => Err(anyhow!("Input thread panicked")),
                    };
                }
            }
            Err(e) => return Err(e).context("Failed to read from serial port"),
        }
    }
}
