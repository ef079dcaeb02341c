// 64K I/O port space, with the small set of addresses that carry
// side-effects on write or synthesize a value on read. Generalizes the
// teacher's `Timer` device (`ControlMode`, divisor-driven countdown) from
// a single memory-mapped peripheral into the PIT/CRTC/speaker register
// set a real PC/XT exposes over `IN`/`OUT`.

pub const PORT_PIC_EOI: u16 = 0x20;
pub const PORT_PIT_CH0: u16 = 0x40;
pub const PORT_PIT_CH2: u16 = 0x42;
pub const PORT_PIT_COMMAND: u16 = 0x43;
pub const PORT_KEYBOARD_DATA: u16 = 0x60;
pub const PORT_SPEAKER_CONTROL: u16 = 0x61;
pub const PORT_KEYBOARD_STATUS: u16 = 0x64;
pub const PORT_HERC_CRTC_INDEX: u16 = 0x3B4;
pub const PORT_HERC_CRTC_DATA: u16 = 0x3B5;
pub const PORT_HERC_MODE: u16 = 0x3B8;
pub const PORT_CGA_CRTC_INDEX: u16 = 0x3D4;
pub const PORT_CGA_CRTC_DATA: u16 = 0x3D5;
pub const PORT_CGA_STATUS: u16 = 0x3DA;

/// PIT command byte (port 0x43) fields that matter to the speaker and
/// CRTC-driven cursor queries; holds just enough state to reproduce the
/// synthesized IN behaviors the spec calls for.
#[derive(Debug, Default)]
pub struct PitChannel {
    /// Pending low/high byte write sequence for a 16-bit reload value.
    pub latch: Option<u8>,
    pub divisor: u16,
    /// Free-running counter, decremented on each synthesized IN.
    pub counter: u16,
}

impl PitChannel {
    fn write_byte(&mut self, byte: u8) {
        match self.latch.take() {
            None => self.latch = Some(byte),
            Some(lo) => {
                self.divisor = (lo as u16) | ((byte as u16) << 8);
                self.counter = self.divisor;
            }
        }
    }

    fn read_and_decrement(&mut self) -> u8 {
        let out = (self.counter & 0xff) as u8;
        self.counter = self.counter.wrapping_sub(1);
        out
    }
}

/// The subset of port-mapped state the core maintains directly (PIT
/// channels, speaker gate, CGA status toggle, CRTC index/cursor
/// registers). Anything not listed here falls through to the raw 64K
/// array, and ultimately to the host port filter.
#[derive(Default)]
pub struct Ports {
    raw: Vec<u8>,
    pub pit0: PitChannel,
    pub pit2: PitChannel,
    pit_command: u8,
    pub speaker_enable: u8,
    cga_status_toggle: bool,
    herc_crtc_index: u8,
    cga_crtc_index: u8,
    pub cursor_start_offset: u16,
}

impl Ports {
    pub fn new() -> Self {
        Ports { raw: vec![0u8; 0x10000], ..Default::default() }
    }

    /// Synthesized read. Returns `None` when the address has no special
    /// behavior, meaning the caller should fall through to the raw array
    /// and then the host port filter.
    pub fn synthesized_in(&mut self, addr: u16) -> Option<u8> {
        match addr {
            PORT_PIC_EOI => Some(0),
            PORT_PIT_CH2 => Some(self.pit2.read_and_decrement()),
            PORT_CGA_STATUS => {
                self.cga_status_toggle = !self.cga_status_toggle;
                let mut value = 0u8;
                if self.cga_status_toggle {
                    value |= 0b0000_1001; // bits 3 and 0: vsync/display-disabled toggle
                }
                Some(value)
            }
            PORT_CGA_CRTC_DATA if self.cga_crtc_index == 14 || self.cga_crtc_index == 15 => {
                let shift = if self.cga_crtc_index == 14 { 8 } else { 0 };
                Some(((self.cursor_start_offset >> shift) & 0xff) as u8)
            }
            _ => None,
        }
    }

    /// Synthesized write. Returns `true` if the address was handled here
    /// (no further action needed beyond storing into the raw array for
    /// round-trip reads of unsynthesized bits).
    pub fn synthesized_out(&mut self, addr: u16, value: u8) -> bool {
        match addr {
            PORT_PIT_COMMAND => {
                self.pit_command = value;
                let channel = (value >> 6) & 0b11;
                match channel {
                    0 => self.pit0.latch = None,
                    2 => self.pit2.latch = None,
                    _ => {}
                }
                true
            }
            PORT_PIT_CH0 => {
                self.pit0.write_byte(value);
                true
            }
            PORT_PIT_CH2 => {
                self.pit2.write_byte(value);
                true
            }
            PORT_SPEAKER_CONTROL => {
                self.speaker_enable = value & 0b11;
                true
            }
            PORT_CGA_CRTC_INDEX => {
                self.cga_crtc_index = value;
                true
            }
            PORT_CGA_CRTC_DATA => {
                match self.cga_crtc_index {
                    14 => {
                        self.cursor_start_offset =
                            (self.cursor_start_offset & 0x00ff) | ((value as u16) << 8)
                    }
                    15 => self.cursor_start_offset = (self.cursor_start_offset & 0xff00) | value as u16,
                    12 | 13 => {} // start-address registers; raw array keeps the byte
                    _ => {}
                }
                false
            }
            PORT_HERC_CRTC_INDEX => {
                self.herc_crtc_index = value;
                false
            }
            PORT_HERC_CRTC_DATA if self.herc_crtc_index == 1 || self.herc_crtc_index == 6 => {
                false // horizontal/vertical resolution programming; tracked via raw array
            }
            _ => false,
        }
    }

    pub fn raw_in(&self, addr: u16) -> u8 {
        self.raw[addr as usize]
    }

    pub fn raw_out(&mut self, addr: u16, value: u8) {
        self.raw[addr as usize] = value;
    }

    pub fn speaker_engaged(&self) -> bool {
        self.speaker_enable == 0b11
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pic_eoi_reads_zero() {
        let mut ports = Ports::new();
        assert_eq!(ports.synthesized_in(PORT_PIC_EOI), Some(0));
    }

    #[test]
    fn pit_channel_2_latches_lo_hi_divisor() {
        let mut ports = Ports::new();
        ports.synthesized_out(PORT_PIT_COMMAND, 0xB6);
        ports.synthesized_out(PORT_PIT_CH2, 0x34);
        ports.synthesized_out(PORT_PIT_CH2, 0x12);
        assert_eq!(ports.pit2.divisor, 0x1234);
    }

    #[test]
    fn speaker_engaged_requires_both_low_bits() {
        let mut ports = Ports::new();
        ports.synthesized_out(PORT_SPEAKER_CONTROL, 0b01);
        assert!(!ports.speaker_engaged());
        ports.synthesized_out(PORT_SPEAKER_CONTROL, 0b11);
        assert!(ports.speaker_engaged());
    }

    #[test]
    fn cga_status_toggles_each_read() {
        let mut ports = Ports::new();
        let a = ports.synthesized_in(PORT_CGA_STATUS).unwrap();
        let b = ports.synthesized_in(PORT_CGA_STATUS).unwrap();
        assert_ne!(a, b);
    }
}
