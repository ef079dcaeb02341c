// CLI surface, via `clap`'s derive API. Parsed once at startup into a
// `Config`, then handed to `vm::Vm::new` for BIOS/disk loading -- kept
// separate from `main.rs` so the parsing and validation logic can be unit
// tested without touching `std::env::args`.

use std::path::PathBuf;

use clap::Parser;

use crate::error::ConfigError;

#[derive(Debug, Parser)]
#[command(name = "em8086", version, about = "IBM PC/XT 8086 architecture emulator")]
pub struct Cli {
    /// Floppy disk image, attached as drive A:.
    #[arg(short = 'a', long = "floppy", value_name = "IMAGE")]
    pub floppy: Option<PathBuf>,

    /// Hard disk image, attached as drive C:.
    #[arg(short = 'c', long = "harddisk", value_name = "IMAGE")]
    pub harddisk: Option<PathBuf>,

    /// Boot from the hard disk instead of the floppy.
    #[arg(long = "hdboot")]
    pub hdboot: bool,

    /// Disable the speaker/audio mixer entirely.
    #[arg(long = "noaudio")]
    pub noaudio: bool,

    /// BIOS image to load at F000:0100.
    #[arg(long = "bios", value_name = "IMAGE", required = true)]
    pub bios: PathBuf,

    /// Target instruction throughput, in millions of instructions per
    /// second; used to pace the step loop against wall-clock time.
    #[arg(long = "mips", value_name = "RATE", default_value_t = 4.77)]
    pub mips: f64,

    /// Print a debug register/flag dump after every instruction.
    #[arg(short = 'm', long = "monitor")]
    pub monitor: bool,
}

/// The validated configuration the VM is built from.
#[derive(Debug)]
pub struct Config {
    pub floppy: Option<PathBuf>,
    pub harddisk: Option<PathBuf>,
    pub hdboot: bool,
    pub noaudio: bool,
    pub bios: PathBuf,
    pub mips: f64,
    pub monitor: bool,
}

impl Config {
    pub fn from_cli(cli: Cli) -> Result<Config, ConfigError> {
        if cli.hdboot && cli.harddisk.is_none() {
            return Err(ConfigError::HdBootWithoutDisk);
        }
        Ok(Config {
            floppy: cli.floppy,
            harddisk: cli.harddisk,
            hdboot: cli.hdboot,
            noaudio: cli.noaudio,
            bios: cli.bios,
            mips: cli.mips,
            monitor: cli.monitor,
        })
    }

    /// DL value the boot loader expects to see: 0x80 for the hard disk,
    /// 0x00 for the floppy.
    pub fn boot_drive_dl(&self) -> u8 {
        if self.hdboot { 0x80 } else { 0x00 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(hdboot: bool, harddisk: Option<&str>) -> Cli {
        Cli {
            floppy: None,
            harddisk: harddisk.map(PathBuf::from),
            hdboot,
            noaudio: false,
            bios: PathBuf::from("bios.bin"),
            mips: 4.77,
            monitor: false,
        }
    }

    #[test]
    fn hdboot_without_harddisk_is_rejected() {
        let err = Config::from_cli(cli(true, None)).unwrap_err();
        assert!(matches!(err, ConfigError::HdBootWithoutDisk));
    }

    #[test]
    fn hdboot_with_harddisk_selects_dl_0x80() {
        let config = Config::from_cli(cli(true, Some("hd.img"))).unwrap();
        assert_eq!(config.boot_drive_dl(), 0x80);
    }

    #[test]
    fn floppy_boot_selects_dl_0x00() {
        let config = Config::from_cli(cli(false, None)).unwrap();
        assert_eq!(config.boot_drive_dl(), 0x00);
    }
}
