// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Explicit, unaligned-safe endian decoders (C2).
//!
//! XFS on-disk integers are big-endian; YAFFS2 spare and header fields are
//! little-endian. Rather than an operator-overload "endian read" macro, we
//! expose plain functions that slice and `from_be_bytes`/`from_le_bytes` —
//! safe on every target regardless of the buffer's alignment.

pub struct BigEndian;
pub struct LittleEndian;

macro_rules! endian_impl {
    ($name:ident, $from_bytes:ident, $to_bytes:ident) => {
        impl $name {
            pub fn read_u16(buf: &[u8]) -> u16 {
                u16::$from_bytes(buf[..2].try_into().unwrap())
            }

            pub fn read_u32(buf: &[u8]) -> u32 {
                u32::$from_bytes(buf[..4].try_into().unwrap())
            }

            pub fn read_u64(buf: &[u8]) -> u64 {
                u64::$from_bytes(buf[..8].try_into().unwrap())
            }

            pub fn write_u16(buf: &mut [u8], v: u16) {
                buf[..2].copy_from_slice(&v.$to_bytes());
            }

            pub fn write_u32(buf: &mut [u8], v: u32) {
                buf[..4].copy_from_slice(&v.$to_bytes());
            }

            pub fn write_u64(buf: &mut [u8], v: u64) {
                buf[..8].copy_from_slice(&v.$to_bytes());
            }
        }
    };
}

endian_impl!(BigEndian, from_be_bytes, to_be_bytes);
endian_impl!(LittleEndian, from_le_bytes, to_le_bytes);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn big_endian_roundtrip() {
        let buf = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(BigEndian::read_u32(&buf), 0x1234_5678);
        assert_eq!(BigEndian::read_u16(&buf), 0x1234);
    }

    #[test]
    fn little_endian_roundtrip() {
        let buf = [0x12, 0x34, 0x56, 0x78];
        assert_eq!(LittleEndian::read_u32(&buf), 0x7856_3412);
        assert_eq!(LittleEndian::read_u16(&buf), 0x3412);
    }

    #[test]
    fn unaligned_offset_reads() {
        let buf = [0xff, 0x00, 0x01, 0x02, 0x03, 0x04];
        assert_eq!(BigEndian::read_u32(&buf[1..]), 0x0001_0203);
    }

    #[test]
    fn write_then_read_roundtrip() {
        let mut buf = [0u8; 8];
        BigEndian::write_u64(&mut buf, 0x0102_0304_0506_0708);
        assert_eq!(BigEndian::read_u64(&buf), 0x0102_0304_0506_0708);
    }
}
