// Reference host binary: wires a `minifb` window for video/keyboard, a
// `rodio` sink for the speaker, plain files for disk images, and an
// optional termion-based register monitor, then drives `vm::Vm`'s step
// loop. Grounded on the teacher's `Emulator::run` loop (`main.rs`) and its
// `Monitor`/`Debugger` devices, generalized from a fixed hardcoded program
// load to the configured BIOS/disk/monitor surface in `config.rs`.

use std::fs::File;
use std::io::{self, Read, Seek, Write};

use clap::Parser;
use minifb::{Key, Window, WindowOptions};
use termion::{clear, cursor};
use tracing_subscriber::EnvFilter;

use em8086::config::{Cli, Config};
use em8086::devices::{
    Calendar, Clock, Disk, Host, KeyEvent, PortDirection, PortFilter, SeekFrom, Serial, SerialStatus, Video,
    VideoKind,
};
use em8086::vm::Vm;

struct WindowVideo {
    window: Option<Window>,
    buffer: Vec<u32>,
    width: usize,
    height: usize,
}

impl WindowVideo {
    fn new() -> Self {
        WindowVideo { window: None, buffer: Vec::new(), width: 0, height: 0 }
    }
}

impl Video for WindowVideo {
    fn getkey(&mut self) -> KeyEvent {
        let Some(window) = self.window.as_ref() else { return KeyEvent::None };
        match window.get_keys_pressed(minifb::KeyRepeat::No).first() {
            Some(key) => KeyEvent::Key { scancode: minifb_scancode(*key), ascii: minifb_ascii(*key) },
            None => KeyEvent::None,
        }
    }

    fn initialize(&mut self, kind: VideoKind, width: usize, height: usize) {
        let title = match kind {
            VideoKind::Text => "em8086 - text mode",
            VideoKind::Cga => "em8086 - CGA",
            VideoKind::Hercules => "em8086 - Hercules",
        };
        self.window =
            Window::new(title, width, height, WindowOptions::default()).ok();
        self.width = width;
        self.height = height;
        self.buffer = vec![0u32; width * height];
    }

    fn backbuffer(&mut self) -> &mut [u32] {
        &mut self.buffer
    }

    fn textmode(&mut self, vram: &[u8], font: &[u8], cursor_visible: bool, cx: u8, cy: u8) {
        let _ = (cursor_visible, cx, cy);
        if font.is_empty() {
            return;
        }
        const CHAR_W: usize = 8;
        const CHAR_H: usize = 16;
        for row in 0..25 {
            for col in 0..80 {
                let cell = (row * 80 + col) * 2;
                if cell + 1 >= vram.len() {
                    continue;
                }
                let glyph = vram[cell] as usize;
                let glyph_bitmap = &font[glyph * CHAR_H..(glyph + 1) * CHAR_H];
                for gy in 0..CHAR_H {
                    let bits = glyph_bitmap[gy];
                    for gx in 0..CHAR_W {
                        let on = bits & (0x80 >> gx) != 0;
                        let px = col * CHAR_W + gx;
                        let py = row * CHAR_H + gy;
                        if px < self.width && py < self.height {
                            self.buffer[py * self.width + px] = if on { 0xFFFFFF } else { 0x000000 };
                        }
                    }
                }
            }
        }
        if let Some(window) = self.window.as_mut() {
            let _ = window.update_with_buffer(&self.buffer, self.width, self.height);
        }
    }
}

/// Best-effort PC keyboard scancode for the subset of keys minifb reports;
/// a real XT keyboard controller table is much larger, this covers the
/// keys guest BIOS code typically polls for.
fn minifb_scancode(key: Key) -> u8 {
    match key {
        Key::Escape => 0x01,
        Key::Enter => 0x1C,
        Key::Backspace => 0x0E,
        Key::Space => 0x39,
        Key::Up => 0x48,
        Key::Down => 0x50,
        Key::Left => 0x4B,
        Key::Right => 0x4D,
        _ => 0x00,
    }
}

fn minifb_ascii(key: Key) -> u8 {
    match key {
        Key::Enter => b'\r',
        Key::Backspace => 0x08,
        Key::Space => b' ',
        Key::A => b'a',
        Key::Z => b'z',
        _ => 0,
    }
}

struct SystemClock;

impl Clock for SystemClock {
    fn localtime(&self) -> Calendar {
        use chrono::{Datelike, Timelike};
        let now = chrono::Local::now();
        Calendar {
            second: now.second() as u8,
            minute: now.minute() as u8,
            hour: now.hour() as u8,
            day: now.day() as u8,
            month: now.month() as u8,
            year: now.year() as u16,
            weekday: now.weekday().num_days_from_sunday() as u8,
        }
    }

    fn millitm(&self) -> u16 {
        (chrono::Local::now().timestamp_subsec_millis() % 1000) as u16
    }
}

struct FileDisk {
    file: File,
    boot: bool,
}

impl Disk for FileDisk {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.file.write(buf)
    }

    fn seek(&mut self, offset: i64, whence: SeekFrom) -> io::Result<u64> {
        let pos = match whence {
            SeekFrom::Start => io::SeekFrom::Start(offset as u64),
            SeekFrom::Current => io::SeekFrom::Current(offset),
            SeekFrom::End => io::SeekFrom::End(offset),
        };
        self.file.seek(pos)
    }

    fn is_boot_device(&self) -> bool {
        self.boot
    }
}

struct NullPortFilter;

impl PortFilter for NullPortFilter {
    fn filter(&mut self, _addr: u16, _dir: PortDirection) -> bool {
        false
    }
    fn port_in(&mut self, _addr: u16) -> u8 {
        0xFF
    }
    fn port_out(&mut self, _addr: u16, _value: u8) {}
}

struct NullSerial;

impl Serial for NullSerial {
    fn init(&mut self, _config: u8) {}
    fn status(&mut self) -> SerialStatus {
        SerialStatus::default()
    }
    fn send(&mut self, _byte: u8) {}
    fn receive(&mut self) -> u8 {
        0
    }
}

struct RodioAudio {
    sink: Option<rodio::Sink>,
    _stream: Option<rodio::OutputStream>,
}

impl RodioAudio {
    fn new() -> Self {
        match rodio::OutputStream::try_default() {
            Ok((stream, handle)) => {
                let sink = rodio::Sink::try_new(&handle).ok();
                RodioAudio { sink, _stream: Some(stream) }
            }
            Err(_) => RodioAudio { sink: None, _stream: None },
        }
    }

    fn push(&mut self, samples: &[u8]) {
        if let Some(sink) = &self.sink {
            let floats: Vec<f32> = samples.iter().map(|&b| (b as f32 - 128.0) / 128.0).collect();
            let source = rodio::buffer::SamplesBuffer::new(1, 44_100, floats);
            sink.append(source);
        }
    }
}

impl em8086::devices::Audio for RodioAudio {
    fn pause(&mut self, pause: bool) {
        if let Some(sink) = &self.sink {
            if pause {
                sink.pause();
            } else {
                sink.play();
            }
        }
    }

    fn silence_byte(&self) -> u8 {
        0x80
    }
}

fn print_monitor(vm: &Vm) {
    use em8086::memory::{Flag, Reg16};
    print!(
        "{clear}{home}AX={ax:04x} BX={bx:04x} CX={cx:04x} DX={dx:04x} SI={si:04x} DI={di:04x}\r\n\
         CS={cs:04x} IP={ip:04x} SS={ss:04x} SP={sp:04x} DS={ds:04x} ES={es:04x}\r\n\
         CF={cf} ZF={zf} SF={sf} OF={of} IF={iff} DF={df}\r\n",
        clear = clear::All,
        home = cursor::Goto(1, 1),
        ax = vm.cpu.mem.reg16(Reg16::Ax),
        bx = vm.cpu.mem.reg16(Reg16::Bx),
        cx = vm.cpu.mem.reg16(Reg16::Cx),
        dx = vm.cpu.mem.reg16(Reg16::Dx),
        si = vm.cpu.mem.reg16(Reg16::Si),
        di = vm.cpu.mem.reg16(Reg16::Di),
        cs = vm.cpu.mem.reg16(Reg16::Cs),
        ip = vm.cpu.ip,
        ss = vm.cpu.mem.reg16(Reg16::Ss),
        sp = vm.cpu.mem.reg16(Reg16::Sp),
        ds = vm.cpu.mem.reg16(Reg16::Ds),
        es = vm.cpu.mem.reg16(Reg16::Es),
        cf = vm.cpu.mem.flag(Flag::Cf) as u8,
        zf = vm.cpu.mem.flag(Flag::Zf) as u8,
        sf = vm.cpu.mem.flag(Flag::Sf) as u8,
        of = vm.cpu.mem.flag(Flag::Of) as u8,
        iff = vm.cpu.mem.flag(Flag::If) as u8,
        df = vm.cpu.mem.flag(Flag::Df) as u8,
    );
    let _ = io::stdout().flush();
}

fn main() {
    tracing_subscriber::fmt().with_env_filter(EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    let config = match Config::from_cli(cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("em8086: {err}");
            std::process::exit(1);
        }
    };

    let mut vm = match Vm::new(&config) {
        Ok(vm) => vm,
        Err(err) => {
            eprintln!("em8086: {err}");
            std::process::exit(1);
        }
    };

    let floppy = config
        .floppy
        .as_ref()
        .map(|path| Vm::open_disk_image(path))
        .transpose()
        .unwrap_or_else(|err| {
            eprintln!("em8086: {err}");
            std::process::exit(1);
        })
        .map(|file| FileDisk { file, boot: !config.hdboot });

    let harddisk = config
        .harddisk
        .as_ref()
        .map(|path| Vm::open_disk_image(path))
        .transpose()
        .unwrap_or_else(|err| {
            eprintln!("em8086: {err}");
            std::process::exit(1);
        })
        .map(|file| FileDisk { file, boot: config.hdboot });

    let mut video = WindowVideo::new();
    let clock = SystemClock;
    let mut port_filter = NullPortFilter;
    let mut serial = [NullSerial, NullSerial, NullSerial, NullSerial];
    let mut audio = RodioAudio::new();

    let mut floppy_disk = floppy;
    let mut harddisk_disk = harddisk;

    loop {
        let running = {
            let [s0, s1, s2, s3] = &mut serial;
            let mut host = Host {
                video: &mut video,
                clock: &clock,
                disks: [
                    harddisk_disk.as_mut().map(|d| d as &mut dyn Disk),
                    floppy_disk.as_mut().map(|d| d as &mut dyn Disk),
                ],
                port_filter: &mut port_filter,
                serial: [s0, s1, s2, s3],
                audio: &mut audio,
            };
            vm.step(&mut host)
        };
        if !running {
            break;
        }

        if config.monitor {
            print_monitor(&vm);
        }

        if !config.noaudio {
            let mut buffer = [0u8; 256];
            {
                let [s0, s1, s2, s3] = &mut serial;
                let mut host = Host {
                    video: &mut video,
                    clock: &clock,
                    disks: [
                        harddisk_disk.as_mut().map(|d| d as &mut dyn Disk),
                        floppy_disk.as_mut().map(|d| d as &mut dyn Disk),
                    ],
                    port_filter: &mut port_filter,
                    serial: [s0, s1, s2, s3],
                    audio: &mut audio,
                };
                vm.fill_audio(&mut buffer, 44_100, &mut host);
            }
            audio.push(&buffer);
        }

        if let Some(window) = video.window.as_ref() {
            if window.is_key_down(Key::Escape) {
                break;
            }
        }
    }
}
