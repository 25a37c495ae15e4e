mod bootloader;
mod build;
mod image;
mod link;
mod monitor;
mod program;

use std::path::PathBuf;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

use crate::bootloader::Bootloader;
use crate::build::build_firmware;
use crate::link::{Boot, DEFAULT_BAUD};

#[derive(Parser)]
#[command(name = "xtask", about = "Build and flash tasks for the STM32F0 serial demo")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the firmware
    Build {
        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Record each boot in the last flash page
        #[arg(long)]
        boot_log: bool,
    },

    /// Write the firmware through the ROM bootloader
    Flash {
        /// Serial port the board is attached to
        port: String,

        #[arg(long, default_value_t = DEFAULT_BAUD)]
        baud: u32,

        /// Build in release mode
        #[arg(long)]
        release: bool,

        /// Build the firmware with the boot log
        #[arg(long, conflicts_with = "image")]
        boot_log: bool,

        /// Flash this ELF or Intel HEX (`.hex`) file instead of building the
        /// firmware
        #[arg(long, visible_alias = "elf")]
        image: Option<PathBuf>,

        /// Skip reading each block back
        #[arg(long)]
        no_verify: bool,

        /// Start the application with the bootloader's GO command instead
        /// of resetting the board
        #[arg(long)]
        go: bool,
    },

    /// Read target memory into a file
    Read {
        /// Serial port the board is attached to
        port: String,

        /// Output file, written as Intel HEX if it ends in `.hex` and as raw
        /// binary otherwise
        out: PathBuf,

        #[arg(long, default_value_t = DEFAULT_BAUD)]
        baud: u32,

        /// Start address
        #[arg(long, default_value = "0x08000000", value_parser = parse_address)]
        addr: u32,

        /// Number of KiB to read
        #[arg(long, default_value_t = 1)]
        kib: usize,
    },

    /// Talk to the running firmware
    Monitor {
        /// Serial port the board is attached to
        port: String,

        #[arg(long, default_value_t = DEFAULT_BAUD)]
        baud: u32,
    },
}

fn parse_address(s: &str) -> Result<u32, String> {
    let r = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(&hex.replace('_', ""), 16),
        None => s.parse(),
    };
    r.map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { release, boot_log } => {
            let elf = build_firmware(release, boot_log)?;
            println!("{}", elf.display());
        }

        Commands::Flash {
            port,
            baud,
            release,
            boot_log,
            image: image_path,
            no_verify,
            go,
        } => {
            let path = match image_path {
                Some(path) => path,
                None => {
                    println!("Building firmware...");
                    build_firmware(release, boot_log)?
                }
            };
            let blocks = image::blocks(&image::load(&path)?)
                .with_context(|| format!("Failed to lay out {}", path.display()))?;
            let (Some(first), Some(last)) = (blocks.first(), blocks.last()) else {
                bail!("{} has nothing to load", path.display());
            };
            if let Some(end) = last.last() {
                println!("Image {:#010x}..={end:#010x}", first.address);
            }

            let mut serial = link::open(&port, baud)?;
            link::reset(&mut *serial, Boot::Bootloader)?;

            let mut bl = Bootloader::new(serial);
            let extended = program::identify(&mut bl)?;
            program::program(&mut bl, &blocks, extended, !no_verify)?;

            if go {
                bl.go(first.address)?;
            } else {
                let mut serial = bl.into_inner();
                link::reset(&mut *serial, Boot::Application)?;
            }
            println!("Done");
        }

        Commands::Read {
            port,
            out,
            baud,
            addr,
            kib,
        } => {
            let mut serial = link::open(&port, baud)?;
            link::reset(&mut *serial, Boot::Bootloader)?;

            let mut bl = Bootloader::new(serial);
            program::identify(&mut bl)?;

            let len = kib.checked_mul(1024).context("Read length too large")?;
            program::dump_to_file(&mut bl, addr, len, &out)?;

            let mut serial = bl.into_inner();
            link::reset(&mut *serial, Boot::Application)?;
        }

        Commands::Monitor { port, baud } => {
            let serial = link::open(&port, baud)?;
            monitor::run(serial)?;
        }
    }

    Ok(())
}
