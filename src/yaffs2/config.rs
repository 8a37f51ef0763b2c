// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The `.yaffs2_config` sidecar file (C10).
//!
//! Auto-detection of the spare layout is a best effort; an examiner who
//! already knows the NAND geometry (from a datasheet, or from the MTD
//! driver that produced the image) can pin every knob with a sidecar text
//! file named `<image>.yaffs2_config`, one `key=value` per line.

use std::collections::HashSet;

use crate::error::{Error, Result};
use crate::yaffs2::spare::SpareLayout;

#[derive(Clone, Debug, Default)]
pub struct Yaffs2Config {
    pub page_size: Option<u32>,
    pub spare_size: Option<u32>,
    pub chunks_per_block: Option<u32>,
    pub spare_layout: Option<SpareLayout>,
}

const KNOWN_KEYS: &[&str] =
    &["page_size", "spare_size", "chunks_per_block", "spare_seq_offset", "spare_obj_id_offset", "spare_chunk_id_offset"];

fn parse_u32_field(value: &str) -> Result<u32> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(Error::Arg);
    }
    value.parse().map_err(|_| Error::Arg)
}

impl Yaffs2Config {
    pub fn parse(text: &str) -> Result<Yaffs2Config> {
        let mut values = std::collections::HashMap::new();
        let mut seen = HashSet::new();

        for raw_line in text.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let (key, value) = line.split_once('=').ok_or(Error::Arg)?;
            let key = key.trim().to_lowercase();
            let value = value.trim().to_lowercase();

            if !KNOWN_KEYS.contains(&key.as_str()) {
                return Err(Error::Arg);
            }
            if !seen.insert(key.clone()) {
                return Err(Error::Arg);
            }
            values.insert(key, value);
        }

        let mut config = Yaffs2Config::default();

        if let Some(v) = values.get("page_size") {
            config.page_size = Some(parse_u32_field(v)?);
        }
        if let Some(v) = values.get("spare_size") {
            config.spare_size = Some(parse_u32_field(v)?);
        }
        if let Some(v) = values.get("chunks_per_block") {
            config.chunks_per_block = Some(parse_u32_field(v)?);
        }

        let offset_keys = ["spare_seq_offset", "spare_obj_id_offset", "spare_chunk_id_offset"];
        let present: Vec<bool> = offset_keys.iter().map(|k| values.contains_key(*k)).collect();
        let any_present = present.iter().any(|&p| p);
        let all_present = present.iter().all(|&p| p);

        if any_present && !all_present {
            return Err(Error::Arg);
        }

        if all_present {
            let seq_offset = parse_u32_field(&values["spare_seq_offset"])? as usize;
            let obj_id_offset = parse_u32_field(&values["spare_obj_id_offset"])? as usize;
            let chunk_id_offset = parse_u32_field(&values["spare_chunk_id_offset"])? as usize;

            if let Some(spare_size) = config.spare_size {
                for off in [seq_offset, obj_id_offset, chunk_id_offset] {
                    if off + 4 > spare_size as usize {
                        return Err(Error::Arg);
                    }
                }
            }

            config.spare_layout = Some(SpareLayout { seq_offset, obj_id_offset, chunk_id_offset, nbytes_offset: chunk_id_offset + 4 });
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_basic_geometry() {
        let cfg = Yaffs2Config::parse("page_size=2048\nspare_size=64\nchunks_per_block=64\n").unwrap();
        assert_eq!(cfg.page_size, Some(2048));
        assert_eq!(cfg.spare_size, Some(64));
        assert_eq!(cfg.chunks_per_block, Some(64));
        assert!(cfg.spare_layout.is_none());
    }

    #[test]
    fn ignores_comments_and_blank_lines() {
        let cfg = Yaffs2Config::parse("# comment\n\n; also a comment\npage_size=512\n").unwrap();
        assert_eq!(cfg.page_size, Some(512));
    }

    #[test]
    fn rejects_unknown_key() {
        assert!(Yaffs2Config::parse("bogus=1\n").is_err());
    }

    #[test]
    fn rejects_duplicate_key() {
        assert!(Yaffs2Config::parse("page_size=512\npage_size=1024\n").is_err());
    }

    #[test]
    fn rejects_non_digit_value() {
        assert!(Yaffs2Config::parse("page_size=2k\n").is_err());
    }

    #[test]
    fn rejects_partial_offsets() {
        assert!(Yaffs2Config::parse("spare_seq_offset=0\nspare_obj_id_offset=4\n").is_err());
    }

    #[test]
    fn accepts_full_offsets() {
        let cfg = Yaffs2Config::parse("spare_size=16\nspare_seq_offset=0\nspare_obj_id_offset=4\nspare_chunk_id_offset=8\n").unwrap();
        let layout = cfg.spare_layout.unwrap();
        assert_eq!(layout.seq_offset, 0);
        assert_eq!(layout.obj_id_offset, 4);
        assert_eq!(layout.chunk_id_offset, 8);
        assert_eq!(layout.nbytes_offset, 12);
    }

    #[test]
    fn rejects_offset_beyond_spare_size() {
        assert!(Yaffs2Config::parse("spare_size=8\nspare_seq_offset=0\nspare_obj_id_offset=4\nspare_chunk_id_offset=8\n").is_err());
    }

    #[test]
    fn rejects_unrecognized_nbytes_offset_key() {
        assert!(Yaffs2Config::parse("spare_nbytes_offset=12\n").is_err());
    }
}
