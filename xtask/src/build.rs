//! Build utilities for the firmware.

use std::path::PathBuf;
use std::process::Command;

use anyhow::{Context, Result, bail};

/// Target triple of the STM32F0 (Cortex-M0).
pub const TARGET: &str = "thumbv6m-none-eabi";

/// Get the project root directory.
pub fn project_root() -> PathBuf {
    let manifest_dir = std::env::var("CARGO_MANIFEST_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| std::env::current_dir().unwrap());

    // If we're in xtask/, go up one level.
    if manifest_dir.ends_with("xtask") {
        manifest_dir.parent().unwrap().to_path_buf()
    } else {
        manifest_dir
    }
}

/// Build the `hello` firmware and return the path to the ELF.
pub fn build_firmware(release: bool, boot_log: bool) -> Result<PathBuf> {
    let root = project_root();

    let mut cmd = Command::new("cargo");
    cmd.current_dir(root.join("hello"))
        .env("DEFMT_LOG", "debug")
        .arg("build")
        .arg("--target")
        .arg(TARGET);

    if release {
        cmd.arg("--release");
    }
    if boot_log {
        cmd.arg("--features").arg("boot-log");
    }

    let status = cmd.status().context("Failed to run cargo build")?;

    if !status.success() {
        bail!("cargo build failed");
    }

    let profile = if release { "release" } else { "debug" };
    Ok(root.join("target").join(TARGET).join(profile).join("hello"))
}
