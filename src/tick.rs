// 100 Hz timer/keyboard tick: delivers INT 8 on every tick (when IF is set
// and no prefix is mid-flight) and polls the host for a keystroke,
// delivering INT 9 when one arrives. Grounded on the teacher's
// `serve_interrupt_requests` cadence in `processor.rs`, split out of
// `cpu.rs` because it runs on a fixed wall-clock cadence rather than being
// driven by instruction dispatch.

use crate::devices::{Host, KeyEvent};
use crate::interrupts::{VEC_KEYBOARD, VEC_TIMER};
use crate::memory::Flag;
use crate::Cpu;

pub const MEM_KEYBOARD_SCANCODE: usize = 0x4A6;
pub const MEM_KEYBOARD_ASCII: usize = 0x4A7;

/// Runs one 100 Hz tick's worth of work: timer IRQ, then keyboard poll.
/// A prefix in flight (segment override or REP) must see its following
/// instruction uninterrupted, so the timer IRQ is withheld for that one
/// step -- mirroring real hardware, which only samples INTR between
/// instructions, never mid-prefix-chain.
pub fn run_tick(cpu: &mut Cpu, host: &mut Host) {
    if cpu.interrupts_deliverable() {
        cpu.deliver_interrupt(VEC_TIMER);
    }

    match host.video.getkey() {
        KeyEvent::Key { scancode, ascii } => {
            cpu.mem.write_u8(MEM_KEYBOARD_SCANCODE, scancode);
            cpu.mem.write_u8(MEM_KEYBOARD_ASCII, ascii);
            if cpu.interrupts_deliverable() {
                cpu.deliver_interrupt(VEC_KEYBOARD);
            }
        }
        KeyEvent::None => {}
    }
}

impl Cpu {
    /// Whether an asynchronous interrupt (timer, keyboard) may be
    /// delivered right now: IF must be set, and no segment-override/REP
    /// prefix may be waiting on its following instruction.
    pub fn interrupts_deliverable(&self) -> bool {
        self.mem.flag(Flag::If) && !self.prefix_pending()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decode::DecodeTables;
    use crate::devices::{Audio, Calendar, Clock, Disk, PortDirection, PortFilter, Serial, SerialStatus, Video, VideoKind};

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

    struct NullClock;
    impl Clock for NullClock {
        fn localtime(&self) -> Calendar {
            Calendar { second: 0, minute: 0, hour: 0, day: 1, month: 1, year: 1980, weekday: 0 }
        }
        fn millitm(&self) -> u16 {
            0
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
    impl Audio for NullAudio {
        fn pause(&mut self, _pause: bool) {}
        fn silence_byte(&self) -> u8 {
            0x80
        }
    }

    fn make_host<'a>(
        video: &'a mut NullVideo,
        clock: &'a NullClock,
        filter: &'a mut NullFilter,
        serial: &'a mut [NullSerial; 4],
        audio: &'a mut NullAudio,
    ) -> Host<'a> {
        let [s0, s1, s2, s3] = serial;
        Host {
            video,
            clock,
            disks: [None, None],
            port_filter: filter,
            serial: [s0, s1, s2, s3],
            audio,
        }
    }

    #[test]
    fn timer_interrupt_withheld_when_interrupts_disabled() {
        let mut cpu = Cpu::new(DecodeTables::canonical());
        cpu.mem.set_flag(Flag::If, false);
        assert!(!cpu.interrupts_deliverable());
    }

    #[test]
    fn timer_interrupt_delivered_clears_tf_and_if() {
        let mut cpu = Cpu::new(DecodeTables::canonical());
        cpu.mem.set_flag(Flag::If, true);
        cpu.mem.set_flag(Flag::Tf, true);
        cpu.mem.write_u16(VEC_TIMER as usize * 4, 0x1234);
        cpu.mem.write_u16(VEC_TIMER as usize * 4 + 2, 0xABCD);

        let mut video = NullVideo;
        let clock = NullClock;
        let mut filter = NullFilter;
        let mut serial = [NullSerial, NullSerial, NullSerial, NullSerial];
        let mut audio = NullAudio;
        let mut host = make_host(&mut video, &clock, &mut filter, &mut serial, &mut audio);

        run_tick(&mut cpu, &mut host);

        assert!(!cpu.mem.flag(Flag::Tf));
        assert!(!cpu.mem.flag(Flag::If));
    }
}
