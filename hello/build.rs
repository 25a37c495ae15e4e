use std::env;
use std::fs;
use std::path::PathBuf;

/// STM32F051x8.
const FLASH_KIB: u32 = 64;
const RAM_KIB: u32 = 8;
/// Page reserved at the top of flash when the boot log is enabled.
const BOOT_LOG_KIB: u32 = 4;

fn main() {
    let out_dir = PathBuf::from(env::var("OUT_DIR").unwrap());

    let flash_kib = if env::var_os("CARGO_FEATURE_BOOT_LOG").is_some() {
        FLASH_KIB - BOOT_LOG_KIB
    } else {
        FLASH_KIB
    };

    let memory = format!(
        "MEMORY\n{{\n  FLASH : ORIGIN = 0x08000000, LENGTH = {flash_kib}K\n  RAM   : ORIGIN = 0x20000000, LENGTH = {RAM_KIB}K\n}}\n"
    );
    fs::write(out_dir.join("memory.x"), memory).unwrap();

    // cortex-m-rt's link.x includes memory.x from the search path.
    println!("cargo:rustc-link-search={}", out_dir.display());
    println!("cargo:rustc-link-arg=-Tlink.x");
    println!("cargo:rustc-link-arg=-Tdefmt.x");
    println!("cargo:rerun-if-changed=build.rs");
}
