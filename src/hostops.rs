// Host-service opcodes: semantic form 48, raw opcode 0F followed by a
// one-byte subcode. This is the only path from guest BIOS code to host
// capabilities (disk, clock, serial, terminal), so it is kept in its own
// module rather than folded into the main dispatch in `cpu.rs`.

use crate::devices::{Host, SeekFrom};
use crate::memory::{linear, Reg16, Reg8};
use crate::Cpu;

pub const SUBCODE_PUTCHAR: u8 = 0;
pub const SUBCODE_GET_RTC: u8 = 1;
pub const SUBCODE_DISK_READ: u8 = 2;
pub const SUBCODE_DISK_WRITE: u8 = 3;
pub const SUBCODE_SERIAL: u8 = 4;
pub const SUBCODE_DEBUG: u8 = 5;

impl Cpu {
    /// Executes one host-service opcode. `subcode` is the byte
    /// immediately following `0F` in the instruction stream; the caller
    /// (the main fetch loop) has already advanced IP past both bytes.
    pub fn exec_host_opcode(&mut self, subcode: u8, host: &mut Host) {
        match subcode {
            SUBCODE_PUTCHAR => self.host_putchar(),
            SUBCODE_GET_RTC => self.host_get_rtc(host),
            SUBCODE_DISK_READ => self.host_disk_transfer(host, false),
            SUBCODE_DISK_WRITE => self.host_disk_transfer(host, true),
            SUBCODE_SERIAL => self.host_serial(host),
            SUBCODE_DEBUG => self.host_debug(),
            _ => {
                tracing::warn!(subcode, "unknown host-service subcode, ignored");
            }
        }
    }

    fn host_putchar(&mut self) {
        let al = self.mem.reg8(Reg8::Al);
        print!("{}", al as char);
    }

    fn host_get_rtc(&mut self, host: &mut Host) {
        let calendar = host.clock.localtime();
        let millis = host.clock.millitm();
        let es = self.mem.reg16(Reg16::Es);
        let bx = self.mem.reg16(Reg16::Bx);
        let base = linear(es, bx);

        // 36-byte calendar struct; layout is internal to this emulator's
        // BIOS, only the fields the spec names are populated meaningfully.
        self.mem.write_u8(base, calendar.second);
        self.mem.write_u8(base + 1, calendar.minute);
        self.mem.write_u8(base + 2, calendar.hour);
        self.mem.write_u8(base + 3, calendar.day);
        self.mem.write_u8(base + 4, calendar.month);
        self.mem.write_u16(base + 5, calendar.year);
        self.mem.write_u8(base + 7, calendar.weekday);
        self.mem.write_u16(base + 36, millis);
    }

    fn host_disk_transfer(&mut self, host: &mut Host, write: bool) {
        let dl = self.mem.reg8(Reg8::Dl);
        let index = if dl == 0 { crate::devices::DISK_HDD } else { crate::devices::DISK_FLOPPY };
        let bp = self.mem.reg16(Reg16::Bp);
        let ax = self.mem.reg16(Reg16::Ax);
        let es = self.mem.reg16(Reg16::Es);
        let bx = self.mem.reg16(Reg16::Bx);
        let addr = linear(es, bx);

        let transferred = (|| -> Option<usize> {
            let disk = host.disks[index].as_mut()?;
            disk.seek((bp as i64) * 512, SeekFrom::Start).ok()?;
            if write {
                let data = self.mem.read_block(addr, ax as usize);
                disk.write(&data).ok()
            } else {
                let mut buf = vec![0u8; ax as usize];
                let n = disk.read(&mut buf).ok()?;
                self.mem.write_block(addr, &buf[..n]);
                Some(n)
            }
        })();

        self.mem.set_reg8(Reg8::Al, transferred.unwrap_or(0) as u8);
    }

    fn host_serial(&mut self, host: &mut Host) {
        let dx = self.mem.reg16(Reg16::Dx) as usize & 0x3;
        let ah = self.mem.reg8(Reg8::Ah);
        let port = &mut *host.serial[dx];
        match ah {
            0 => {
                let al = self.mem.reg8(Reg8::Al);
                port.init(al);
            }
            1 => {
                let status = port.status();
                self.mem.set_reg8(Reg8::Al, status.modem);
                self.mem.set_reg8(Reg8::Ah, status.line);
            }
            2 => {
                let al = self.mem.reg8(Reg8::Al);
                port.send(al);
            }
            3 => {
                let byte = port.receive();
                self.mem.set_reg8(Reg8::Al, byte);
            }
            _ => {}
        }
    }

    fn host_debug(&mut self) {
        tracing::info!(
            ax = self.mem.reg16(Reg16::Ax),
            bx = self.mem.reg16(Reg16::Bx),
            cx = self.mem.reg16(Reg16::Cx),
            dx = self.mem.reg16(Reg16::Dx),
            "guest debug dump"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeTables;
    use crate::devices::{
        Calendar, Clock, Disk, KeyEvent, PortDirection, PortFilter, Serial, SerialStatus, Video, VideoKind,
    };
    use std::io;

    struct NullVideo;
    impl Video for NullVideo {
        fn getkey(&mut self) -> KeyEvent {
            KeyEvent::None
        }
        fn initialize(&mut self, _kind: VideoKind, _width: usize, _height: usize) {}
        fn backbuffer(&mut self) -> &mut [u32] {
            &mut []
        }
        fn textmode(&mut self, _vram: &[u8], _font: &[u8], _cursor_visible: bool, _cx: u8, _cy: u8) {}
    }

    struct FixedClock(Calendar);
    impl Clock for FixedClock {
        fn localtime(&self) -> Calendar {
            self.0
        }
        fn millitm(&self) -> u16 {
            500
        }
    }

    struct NullFilter;
    impl PortFilter for NullFilter {
        fn filter(&mut self, _addr: u16, _dir: PortDirection) -> bool {
            false
        }
        fn port_in(&mut self, _addr: u16) -> u8 {
            0
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

    struct NullAudio;
    impl crate::devices::Audio for NullAudio {
        fn pause(&mut self, _pause: bool) {}
        fn silence_byte(&self) -> u8 {
            0x80
        }
    }

    struct MemDisk {
        data: Vec<u8>,
        pos: usize,
        boot: bool,
    }

    impl Disk for MemDisk {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = buf.len().min(self.data.len().saturating_sub(self.pos));
            buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
            self.pos += n;
            Ok(n)
        }
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.pos + buf.len() > self.data.len() {
                self.data.resize(self.pos + buf.len(), 0);
            }
            self.data[self.pos..self.pos + buf.len()].copy_from_slice(buf);
            self.pos += buf.len();
            Ok(buf.len())
        }
        fn seek(&mut self, offset: i64, _whence: SeekFrom) -> io::Result<u64> {
            self.pos = offset as usize;
            Ok(self.pos as u64)
        }
        fn is_boot_device(&self) -> bool {
            self.boot
        }
    }

    fn new_cpu() -> Cpu {
        Cpu::new(DecodeTables::canonical())
    }

    #[test]
    fn get_rtc_writes_calendar_and_millis_at_es_bx() {
        let mut cpu = new_cpu();
        cpu.mem.set_reg16(Reg16::Es, 0);
        cpu.mem.set_reg16(Reg16::Bx, 0x2000);

        let mut video = NullVideo;
        let clock = FixedClock(Calendar { second: 30, minute: 15, hour: 9, day: 4, month: 7, year: 2026, weekday: 6 });
        let mut filter = NullFilter;
        let mut serial = [NullSerial, NullSerial, NullSerial, NullSerial];
        let mut audio = NullAudio;
        let [s0, s1, s2, s3] = &mut serial;
        let mut host =
            Host { video: &mut video, clock: &clock, disks: [None, None], port_filter: &mut filter, serial: [s0, s1, s2, s3], audio: &mut audio };

        cpu.exec_host_opcode(SUBCODE_GET_RTC, &mut host);

        assert_eq!(cpu.mem.read_u8(0x2000), 30);
        assert_eq!(cpu.mem.read_u8(0x2001), 15);
        assert_eq!(cpu.mem.read_u8(0x2002), 9);
        assert_eq!(cpu.mem.read_u16(0x2000 + 5), 2026);
        assert_eq!(cpu.mem.read_u16(0x2000 + 36), 500);
    }

    #[test]
    fn disk_read_transfers_bytes_and_reports_count_in_al() {
        let mut cpu = new_cpu();
        cpu.mem.set_reg8(Reg8::Dl, 1); // floppy
        cpu.mem.set_reg16(Reg16::Bp, 0); // sector 0
        cpu.mem.set_reg16(Reg16::Ax, 4); // byte count
        cpu.mem.set_reg16(Reg16::Es, 0);
        cpu.mem.set_reg16(Reg16::Bx, 0x3000);

        let mut video = NullVideo;
        let clock = FixedClock(Calendar { second: 0, minute: 0, hour: 0, day: 1, month: 1, year: 1980, weekday: 0 });
        let mut filter = NullFilter;
        let mut serial = [NullSerial, NullSerial, NullSerial, NullSerial];
        let mut audio = NullAudio;
        let mut floppy = MemDisk { data: vec![0xAA, 0xBB, 0xCC, 0xDD], pos: 0, boot: true };
        let [s0, s1, s2, s3] = &mut serial;
        let mut host = Host {
            video: &mut video,
            clock: &clock,
            disks: [None, Some(&mut floppy as &mut dyn Disk)],
            port_filter: &mut filter,
            serial: [s0, s1, s2, s3],
            audio: &mut audio,
        };

        cpu.exec_host_opcode(SUBCODE_DISK_READ, &mut host);

        assert_eq!(cpu.mem.reg8(Reg8::Al), 4);
        assert_eq!(cpu.mem.read_block(0x3000, 4), vec![0xAA, 0xBB, 0xCC, 0xDD]);
    }
}
