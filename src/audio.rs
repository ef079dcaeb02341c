// Square-wave audio mixer: fills a host-supplied sample buffer from the PIT
// channel-2 divisor mirrored at memory word 0x4AA, silencing output when
// the speaker gate (port 0x61, bits 0-1) isn't fully engaged. Grounded on
// the teacher's `Timer` PIT-mode state machine (`devices.rs`) for the
// divisor/channel concept, and wired through the `Audio` host trait
// instead of a direct synthesis crate so the core stays host-agnostic
// (see DESIGN.md for why this samples the divisor formula directly
// rather than going through `basic_waves`).

use crate::devices::{Audio, Host};
use crate::memory::Memory;
use crate::ports::Ports;

/// Memory word mirroring the PIT channel-2 reload value, per the audio
/// mixer's documented data source -- the concurrency model allows the
/// audio callback to read this and port 0x61 without synchronizing with
/// the main instruction loop, since both are written monotonically by the
/// core and read-only from the audio thread's perspective.
pub const MEM_PIT2_DIVISOR: usize = 0x4AA;

/// PIT input clock, the reference crystal driving all three channels on a
/// real PC/XT.
const PIT_CLOCK_HZ: u32 = 1_193_182;

pub struct SquareWaveMixer {
    counter: u32,
}

impl SquareWaveMixer {
    pub fn new() -> Self {
        SquareWaveMixer { counter: 0 }
    }

    /// Writes one tick's worth of samples into `buffer`. Each sample is an
    /// 8-bit unsigned PCM value; `sample_rate` is the host's playback rate.
    pub fn fill(&mut self, buffer: &mut [u8], sample_rate: u32, mem: &Memory, ports: &Ports, host: &mut Host) {
        if !ports.speaker_engaged() {
            let silence = host.audio.silence_byte();
            buffer.fill(silence);
            return;
        }

        let divisor = mem.read_u16(MEM_PIT2_DIVISOR).max(1) as u32;
        let period_samples = (sample_rate * divisor / PIT_CLOCK_HZ).max(1);

        for sample in buffer.iter_mut() {
            let phase = (self.counter * 54 / period_samples) & 1;
            *sample = if phase != 0 { 0xE0 } else { 0x20 };
            self.counter = self.counter.wrapping_add(1);
        }
    }
}

impl Default for SquareWaveMixer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{
        Audio, Calendar, Clock, KeyEvent, PortDirection, PortFilter, Serial, SerialStatus, Video, VideoKind,
    };

    struct FixedAudio;
    impl Audio for FixedAudio {
        fn pause(&mut self, _pause: bool) {}
        fn silence_byte(&self) -> u8 {
            0x80
        }
    }

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

    #[test]
    fn silence_byte_used_when_speaker_not_engaged() {
        let mem = Memory::new();
        let ports = Ports::new();
        let mut mixer = SquareWaveMixer::new();
        let mut audio = FixedAudio;
        let mut buffer = [0u8; 16];

        let mut video = NullVideo;
        let clock = NullClock;
        let mut filter = NullFilter;
        let mut serial = [NullSerial, NullSerial, NullSerial, NullSerial];
        let [s0, s1, s2, s3] = &mut serial;
        let mut host = Host {
            video: &mut video,
            clock: &clock,
            disks: [None, None],
            port_filter: &mut filter,
            serial: [s0, s1, s2, s3],
            audio: &mut audio,
        };

        mixer.fill(&mut buffer, 44_100, &mem, &ports, &mut host);
        assert!(buffer.iter().all(|&b| b == 0x80));
    }
}
