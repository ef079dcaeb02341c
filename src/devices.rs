// Host collaborator traits. The core never talks to a window, a clock, or
// a disk file directly -- it calls through one of these, exactly as the
// teacher's `Device` trait kept the bus from knowing what a `Monitor` or a
// `Floppy` actually was. Each trait here is narrow and synchronous: the
// concurrency model forbids the core from blocking on I/O, so every
// implementation is expected to return promptly (a host reading a real
// floppy file does so with a plain `std::fs::File`, no async).

use std::io;

/// What kind of picture the video refresher is about to start producing;
/// passed to `Video::initialize` on every mode change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoKind {
    Text,
    Cga,
    Hercules,
}

/// A keystroke handed back by the host, or the "nothing happened" case.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    Key { scancode: u8, ascii: u8 },
    None,
}

/// The host windowing/keyboard collaborator. `getkey` is polled once per
/// 100 Hz tick; `initialize` fires only on a mode change; `backbuffer` and
/// `textmode` are called from the 60 Hz video refresher.
pub trait Video {
    fn getkey(&mut self) -> KeyEvent;
    fn initialize(&mut self, kind: VideoKind, width: usize, height: usize);
    /// A writable pixel buffer, one `u32` (0x00RRGGBB) per pixel, sized
    /// `width * height` from the most recent `initialize` call.
    fn backbuffer(&mut self) -> &mut [u32];
    /// Text-mode refresh: `vram` is the 80x25*2-byte CGA text buffer,
    /// `font` the 8x16 glyph bitmap referenced from the BIOS header.
    fn textmode(&mut self, vram: &[u8], font: &[u8], cursor_visible: bool, cx: u8, cy: u8);
}

/// Calendar fields the RTC host-opcode copies into guest memory. Field
/// widths match what the BIOS-side consumer of the 36-byte structure
/// expects; the exact layout is implementation-internal to the guest,
/// this struct only needs to carry the values.
#[derive(Debug, Clone, Copy)]
pub struct Calendar {
    pub second: u8,
    pub minute: u8,
    pub hour: u8,
    pub day: u8,
    pub month: u8,
    pub year: u16,
    pub weekday: u8,
}

pub trait Clock {
    fn localtime(&self) -> Calendar;
    /// Milliseconds within the current second, 0..999.
    fn millitm(&self) -> u16;
}

/// `whence` values for `Disk::seek`, matching the libc convention the
/// reference host-opcode protocol was built against.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekFrom {
    Start,
    Current,
    End,
}

/// A host-owned disk image. The core holds a borrowed trait object and
/// must never close it; up to two are attached (index 0 = hard disk,
/// index 1 = floppy).
pub trait Disk {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn seek(&mut self, offset: i64, whence: SeekFrom) -> io::Result<u64>;
    /// Whether this handle should be the boot device (DL value at entry).
    fn is_boot_device(&self) -> bool;
}

/// Direction of a port access, passed to `PortFilter::filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortDirection {
    In,
    Out,
}

/// Extension point for ports the core's own synthesized behavior doesn't
/// cover (COM ports beyond the built-in serial handles, mouse, joystick,
/// custom hardware). Consulted after synthesized IN/OUT handling.
pub trait PortFilter {
    fn filter(&mut self, addr: u16, dir: PortDirection) -> bool;
    fn port_in(&mut self, addr: u16) -> u8;
    fn port_out(&mut self, addr: u16, value: u8);
}

/// Modem/line status pair returned by `Serial::status` and the AH=1
/// host-opcode sub-operation.
#[derive(Debug, Clone, Copy, Default)]
pub struct SerialStatus {
    pub modem: u8,
    pub line: u8,
}

pub trait Serial {
    fn init(&mut self, config: u8);
    fn status(&mut self) -> SerialStatus;
    fn send(&mut self, byte: u8);
    fn receive(&mut self) -> u8;
}

/// The speaker output sink. `pause` mirrors the host audio API's own
/// pause/resume call (1 = pause, 0 = resume); `silence_byte` is the value
/// the audio mixer writes into the callback buffer when the speaker is
/// disabled.
pub trait Audio {
    fn pause(&mut self, pause: bool);
    fn silence_byte(&self) -> u8;
}

/// Bundles every host collaborator the VM needs. Disks are optional
/// (attach none, one, or both); everything else is mandatory because the
/// core calls into it unconditionally during `step`.
pub struct Host<'a> {
    pub video: &'a mut dyn Video,
    pub clock: &'a dyn Clock,
    pub disks: [Option<&'a mut dyn Disk>; 2],
    pub port_filter: &'a mut dyn PortFilter,
    pub serial: [&'a mut dyn Serial; 4],
    pub audio: &'a mut dyn Audio,
}

pub const DISK_HDD: usize = 0;
pub const DISK_FLOPPY: usize = 1;
