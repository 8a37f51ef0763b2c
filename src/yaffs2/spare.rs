// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! NAND spare-area tag decoding and layout auto-detection (C10).
//!
//! The spare area has no fixed format across YAFFS2 deployments: the four
//! tag fields (sequence number, object id, chunk id, byte count) live at
//! an offset that depends on the out-of-band layout the NAND controller
//! and MTD driver agreed on. [`detect_layout`] recovers that offset by
//! reading a handful of blocks and scoring every 16-byte-aligned candidate
//! window against properties the tags must hold (non-zero, non-0xff,
//! constant per block, not a single repeated byte).

use crate::endian::LittleEndian as LE;
use crate::error::{Error, Result};
use crate::image::ImageReader;

pub const SPARE_FLAGS_IS_HEADER: u32 = 0x8000_0000;
pub const SPARE_PARENT_ID_MASK: u32 = 0x0FFF_FFFF;
pub const SPARE_OBJECT_TYPE_SHIFT: u32 = 28;
pub const SPARE_OBJECT_TYPE_MASK: u32 = 0xF000_0000;

pub const MAX_OBJECT_ID: u32 = 0x0003_FFFF;
pub const LOWEST_SEQUENCE_NUMBER: u32 = 0x0000_1000;
pub const HIGHEST_SEQUENCE_NUMBER: u32 = 0xEFFF_FF00;

const BLOCKS_TO_TEST: usize = 10;
const CHUNKS_TO_TEST: usize = 10;
const MIN_CHUNKS_READ: usize = 10;

#[derive(Clone, Copy, Debug)]
pub struct SpareLayout {
    pub seq_offset: usize,
    pub obj_id_offset: usize,
    pub chunk_id_offset: usize,
    /// Byte count field, `chunk_id_offset + 4`. No decoder in this driver
    /// consults it yet (the on-disk reconstruction goes entirely by
    /// chunk id), but auto-detection still records it so the offset is
    /// available if a future reader needs it.
    pub nbytes_offset: usize,
}

impl SpareLayout {
    pub fn default_guess() -> SpareLayout {
        SpareLayout { seq_offset: 0, obj_id_offset: 4, chunk_id_offset: 8, nbytes_offset: 12 }
    }

    fn fits(&self, spare_size: u32) -> bool {
        let need = self.seq_offset.max(self.obj_id_offset).max(self.chunk_id_offset) + 4;
        need <= spare_size as usize
    }
}

/// Raw tag fields pulled from one chunk's spare area, with the YAFFS2
/// header-chunk packing (object id/chunk id double as parent id/object
/// type when the high bit of `chunk_id` is set) already unpacked.
#[derive(Clone, Copy, Debug)]
pub struct SpareTags {
    pub seq_number: u32,
    pub object_id: u32,
    pub chunk_id: u32,
    pub is_header: bool,
    pub parent_id: u32,
}

pub fn read_spare_tags(image: &dyn ImageReader, layout: &SpareLayout, spare_offset: u64, spare_size: u32) -> Result<SpareTags> {
    if spare_size < 16 || !layout.fits(spare_size) {
        return Err(Error::Arg);
    }
    let mut buf = vec![0u8; spare_size as usize];
    image.read_exact_at(spare_offset, &mut buf)?;

    let seq_number = LE::read_u32(&buf[layout.seq_offset..]);
    let raw_obj_id = LE::read_u32(&buf[layout.obj_id_offset..]);
    let raw_chunk_id = LE::read_u32(&buf[layout.chunk_id_offset..]);

    if raw_chunk_id & SPARE_FLAGS_IS_HEADER != 0 {
        Ok(SpareTags {
            seq_number,
            object_id: raw_obj_id & !SPARE_OBJECT_TYPE_MASK,
            chunk_id: 0,
            is_header: true,
            parent_id: raw_chunk_id & SPARE_PARENT_ID_MASK,
        })
    } else {
        Ok(SpareTags { seq_number, object_id: raw_obj_id, chunk_id: raw_chunk_id, is_header: false, parent_id: 0 })
    }
}

pub fn is_spare_valid(tags: &SpareTags) -> bool {
    tags.object_id <= MAX_OBJECT_ID && tags.seq_number >= LOWEST_SEQUENCE_NUMBER && tags.seq_number <= HIGHEST_SEQUENCE_NUMBER
}

/// Scans up to `BLOCKS_TO_TEST` blocks, collecting the last
/// `min(CHUNKS_TO_TEST, chunks_per_block)` spare areas of each (skipping
/// blocks whose last spare is all-0x00/0xFF, since YAFFS2 writes
/// sequentially within a block and such a spare means it was never
/// written), then scores every candidate 16-byte window for the four tag
/// fields. The sample is clamped to one block's worth of chunks so it never
/// spills into the next block, whose sequence number would differ.
pub fn detect_layout(image: &dyn ImageReader, page_size: u32, spare_size: u32, chunks_per_block: u32) -> Result<SpareLayout> {
    if spare_size < 16 {
        return Err(Error::Magic);
    }

    let chunk_size = (page_size + spare_size) as u64;
    let block_size = chunks_per_block as u64 * chunk_size;
    let image_size = image.size();
    let max_blocks = if block_size == 0 { 0 } else { image_size / block_size };
    let blocks_to_test = BLOCKS_TO_TEST.min(max_blocks as usize);

    // Sample within a single block: a block narrower than CHUNKS_TO_TEST
    // chunks would otherwise have the sample window spill into the next
    // block, whose sequence number differs and breaks the per-candidate
    // constancy check below.
    let sample = CHUNKS_TO_TEST.min(chunks_per_block as usize);
    if sample == 0 {
        return Err(Error::Magic);
    }
    let skip = chunks_per_block as usize - sample;

    let mut all_spares: Vec<u8> = Vec::new();
    let mut blocks_tested = 0usize;

    'blocks: for block_index in 0..blocks_to_test {
        let mut block_spares = vec![0u8; spare_size as usize * sample];
        for chunk_index in 0..sample {
            let offset =
                block_index as u64 * block_size + (skip + chunk_index) as u64 * chunk_size + page_size as u64;
            let mut spare = vec![0u8; spare_size as usize];
            if image.read_at(offset, &mut spare).unwrap_or(0) < spare_size as usize {
                continue 'blocks;
            }
            block_spares[chunk_index * spare_size as usize..(chunk_index + 1) * spare_size as usize].copy_from_slice(&spare);
        }

        let last = &block_spares[(sample - 1) * spare_size as usize..sample * spare_size as usize];
        if last.iter().all(|&b| b == 0xFF || b == 0x00) {
            continue;
        }

        all_spares.extend_from_slice(&block_spares);
        blocks_tested += 1;
        if blocks_tested >= BLOCKS_TO_TEST {
            break;
        }
    }

    if blocks_tested * sample < MIN_CHUNKS_READ {
        return Err(Error::Magic);
    }

    let mut ok_offset: Option<usize> = None;
    let mut good_offset: Option<usize> = None;

    for candidate in 0..=(spare_size as usize - 16) {
        let mut good = true;
        'check: for block in 0..blocks_tested {
            for chunk in 1..sample {
                let last_base = block * spare_size as usize * sample + (chunk - 1) * spare_size as usize;
                let this_base = last_base + spare_size as usize;
                let this = &all_spares[this_base + candidate..this_base + candidate + 4];
                let last = &all_spares[last_base + candidate..last_base + candidate + 4];

                if this == [0xFF, 0xFF, 0xFF, 0xFF] || this == [0x00, 0x00, 0x00, 0x00] || this != last {
                    good = false;
                    break 'check;
                }

                let obj_id = &all_spares[this_base + candidate + 4..this_base + candidate + 8];
                if obj_id == [0x00, 0x00, 0x00, 0x00] {
                    good = false;
                    break 'check;
                }

                let window = &all_spares[this_base + candidate..this_base + candidate + 16];
                if window.iter().all(|&b| b == window[0]) {
                    good = false;
                    break 'check;
                }
            }
        }

        if !good {
            continue;
        }

        if ok_offset.is_none() {
            ok_offset = Some(candidate);
        }

        let mut first_byte_ff = true;
        for block in 0..blocks_tested {
            for chunk in 1..sample {
                let base = block * spare_size as usize * sample + chunk * spare_size as usize;
                if all_spares[base + candidate] != 0xFF {
                    first_byte_ff = false;
                }
            }
        }

        if !first_byte_ff && good_offset.is_none() {
            good_offset = Some(candidate);
        }
    }

    let best = good_offset.or(ok_offset).ok_or(Error::Magic)?;
    Ok(SpareLayout { seq_offset: best, obj_id_offset: best + 4, chunk_id_offset: best + 8, nbytes_offset: best + 12 })
}
