// Library root: an IBM PC/XT 8086 architecture emulator core. The crate
// splits into the instruction engine (`memory`, `decode`, `flags`, `cpu`,
// `interrupts`, `ports`, `hostops`), the BIOS-image loader (`bios`), the
// peripheral cadences (`video`, `tick`, `audio`), and the host-facing
// collaborator traits (`devices`) that keep the core from touching a
// window, a clock, or a disk file directly. `config` and `vm` tie these
// together into the binary's own step loop.

pub mod audio;
pub mod bios;
pub mod config;
pub mod cpu;
pub mod decode;
pub mod devices;
pub mod error;
pub mod flags;
pub mod hostops;
pub mod interrupts;
pub mod memory;
pub mod ports;
pub mod tick;
pub mod video;
pub mod vm;

pub use cpu::Cpu;
