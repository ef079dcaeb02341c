// BIOS image loading: copies the image into guest memory at F000:0100 and
// parses the 20 little-endian table offsets from its header, per §6's
// "BIOS image format". Kept as a standalone module (rather than a method
// on `Cpu`) because it's pure data transformation with no CPU state
// involved until the very last step.

use crate::decode::{DecodeTables, NUM_TABLES, TABLE_BYTES};
use crate::error::BiosLoadError;
use crate::memory::{Memory, BIOS_LOAD_OFFSET};

/// Offset of the 20-entry table-offset header, relative to the BIOS
/// image's own start (not the load address).
pub const TABLE_HEADER_OFFSET: usize = 0x81;

/// The loaded BIOS: its decode tables plus a pointer to the font bitmap
/// referenced from the image's second word, used by the video refresher
/// in text mode.
pub struct LoadedBios {
    pub tables: DecodeTables,
    pub font: Vec<u8>,
}

/// Copies `image` into `mem` at the BIOS load address and parses its
/// decode-table header. The input buffer is not retained; per the
/// concurrency model's shared-resource policy, the host may free it
/// immediately after this call returns.
pub fn load_bios(mem: &mut Memory, image: &[u8]) -> Result<LoadedBios, BiosLoadError> {
    if image.len() < TABLE_HEADER_OFFSET + NUM_TABLES * 2 {
        return Err(BiosLoadError::TooSmall { len: image.len() });
    }
    if image.len() > 0x10000 {
        return Err(BiosLoadError::TooLarge { len: image.len() });
    }

    mem.write_block(BIOS_LOAD_OFFSET + (crate::memory::BIOS_ENTRY_CS as usize) * 16, image);

    let mut slices = [[0u8; TABLE_BYTES]; NUM_TABLES];
    for (index, slot) in slices.iter_mut().enumerate() {
        let header_entry = TABLE_HEADER_OFFSET + index * 2;
        let offset = u16::from_le_bytes([image[header_entry], image[header_entry + 1]]) as usize;
        if offset + TABLE_BYTES > image.len() {
            return Err(BiosLoadError::TableOutOfBounds { index, offset });
        }
        slot.copy_from_slice(&image[offset..offset + TABLE_BYTES]);
    }

    let font_ptr = u16::from_le_bytes([image[2], image[3]]) as usize;
    let font = if font_ptr + 4096 <= image.len() {
        image[font_ptr..font_ptr + 4096].to_vec()
    } else {
        Vec::new()
    };

    Ok(LoadedBios { tables: DecodeTables::from_slices(slices), font })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_image() -> Vec<u8> {
        let mut image = vec![0u8; 0x81 + 20 * 2 + 256 * 20];
        // font pointer (word at offset 2) points past the header.
        let tables_start = 0x81 + 20 * 2;
        image[2..4].copy_from_slice(&(tables_start as u16).to_le_bytes());
        for i in 0..20u16 {
            let offset = tables_start as u16 + i * 256;
            let entry = 0x81 + (i as usize) * 2;
            image[entry..entry + 2].copy_from_slice(&offset.to_le_bytes());
        }
        image
    }

    #[test]
    fn loads_tables_at_declared_offsets() {
        let image = minimal_image();
        let mut mem = Memory::new();
        let loaded = load_bios(&mut mem, &image).expect("valid image");
        assert_eq!(loaded.tables.table(0).len(), 256);
    }

    #[test]
    fn rejects_image_too_small_for_header() {
        let mut mem = Memory::new();
        let err = load_bios(&mut mem, &[0u8; 10]).unwrap_err();
        assert!(matches!(err, BiosLoadError::TooSmall { .. }));
    }

    #[test]
    fn copies_image_bytes_to_entry_point() {
        let mut image = minimal_image();
        image[0] = 0xF4; // HLT, a recognizable marker byte
        let mut mem = Memory::new();
        load_bios(&mut mem, &image).expect("valid image");
        let entry = crate::memory::linear(crate::memory::BIOS_ENTRY_CS, crate::memory::BIOS_ENTRY_IP);
        assert_eq!(mem.read_u8(entry), 0xF4);
    }
}
