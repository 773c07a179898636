//! Block bitmap used both as the pack-side "blocks to consider" set and as the
//! unpack-side record of restored blocks.
//!
//! Bit `n` lives in byte `n / 8` at bit `n % 8`, the same layout as an
//! on-disk reiserfs bitmap block, so a bitmap can be built straight from the
//! filesystem's own bitmap blocks with [`Bitmap::from_bytes`].
//!
//! # File format
//! `save` writes `[u32 magic][u32 bit_count][ceil(bit_count / 8) bytes]`,
//! little-endian.  `load` rejects anything else.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

pub const BITMAP_FILE_MAGIC: u32 = 0x7062_6d62; // "bmbp"

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bitmap {
    bits:  u32,
    bytes: Vec<u8>,
}

impl Bitmap {
    /// An all-clear bitmap of `bits` bits.
    pub fn new(bits: u32) -> Self {
        Self { bits, bytes: vec![0u8; byte_len(bits)] }
    }

    /// Wrap raw bitmap bytes.  Bits beyond `bits` are ignored.
    pub fn from_bytes(bits: u32, mut bytes: Vec<u8>) -> Self {
        bytes.resize(byte_len(bits), 0);
        let mut bm = Self { bits, bytes };
        bm.mask_tail();
        bm
    }

    /// A bitmap with every bit set.
    pub fn full(bits: u32) -> Self {
        Self::from_bytes(bits, vec![0xff; byte_len(bits)])
    }

    pub fn len(&self) -> u32 { self.bits }

    pub fn is_empty(&self) -> bool { self.bits == 0 }

    pub fn as_bytes(&self) -> &[u8] { &self.bytes }

    /// Out-of-range bits read as clear.
    #[inline]
    pub fn test(&self, bit: u32) -> bool {
        if bit >= self.bits {
            return false;
        }
        (self.bytes[(bit / 8) as usize] >> (bit % 8)) & 1 == 1
    }

    /// Setting an out-of-range bit is a no-op.
    #[inline]
    pub fn set(&mut self, bit: u32) {
        if bit < self.bits {
            self.bytes[(bit / 8) as usize] |= 1 << (bit % 8);
        }
    }

    #[inline]
    pub fn clear(&mut self, bit: u32) {
        if bit < self.bits {
            self.bytes[(bit / 8) as usize] &= !(1 << (bit % 8));
        }
    }

    pub fn count_ones(&self) -> u32 {
        self.bytes.iter().map(|b| b.count_ones()).sum()
    }

    /// First set bit at or after `from`.
    pub fn next_set(&self, from: u32) -> Option<u32> {
        let mut bit = from;
        while bit < self.bits {
            let byte = self.bytes[(bit / 8) as usize];
            if byte == 0 && bit % 8 == 0 {
                bit += 8;
                continue;
            }
            if (byte >> (bit % 8)) & 1 == 1 {
                return Some(bit);
            }
            bit += 1;
        }
        None
    }

    /// Iterate over the set bits in ascending order.
    pub fn ones(&self) -> impl Iterator<Item = u32> + '_ {
        let mut cursor = 0u32;
        std::iter::from_fn(move || {
            let bit = self.next_set(cursor)?;
            cursor = bit + 1;
            Some(bit)
        })
    }

    pub fn save<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(BITMAP_FILE_MAGIC)?;
        writer.write_u32::<LittleEndian>(self.bits)?;
        writer.write_all(&self.bytes)?;
        Ok(())
    }

    pub fn load<R: Read>(mut reader: R) -> io::Result<Self> {
        let magic = reader.read_u32::<LittleEndian>()?;
        if magic != BITMAP_FILE_MAGIC {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("not a bitmap file (magic {magic:#010x})"),
            ));
        }
        let bits = reader.read_u32::<LittleEndian>()?;
        let mut bytes = vec![0u8; byte_len(bits)];
        reader.read_exact(&mut bytes)?;
        Ok(Self::from_bytes(bits, bytes))
    }

    fn mask_tail(&mut self) {
        let rem = self.bits % 8;
        if rem != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= (1u8 << rem) - 1;
            }
        }
    }
}

fn byte_len(bits: u32) -> usize {
    (bits as usize).div_ceil(8)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_test_clear() {
        let mut bm = Bitmap::new(20);
        bm.set(0);
        bm.set(9);
        bm.set(19);
        bm.set(20); // out of range
        assert!(bm.test(0) && bm.test(9) && bm.test(19));
        assert!(!bm.test(20));
        assert_eq!(bm.count_ones(), 3);
        bm.clear(9);
        assert!(!bm.test(9));
        assert_eq!(bm.ones().collect::<Vec<_>>(), vec![0, 19]);
    }

    #[test]
    fn full_masks_tail_bits() {
        let bm = Bitmap::full(13);
        assert_eq!(bm.count_ones(), 13);
        assert_eq!(bm.as_bytes(), &[0xff, 0x1f]);
    }

    #[test]
    fn next_set_skips_empty_bytes() {
        let mut bm = Bitmap::new(64);
        bm.set(41);
        assert_eq!(bm.next_set(0), Some(41));
        assert_eq!(bm.next_set(42), None);
    }

    #[test]
    fn save_load() {
        let mut bm = Bitmap::new(100);
        for b in [1, 7, 8, 64, 99] {
            bm.set(b);
        }
        let mut buf = Vec::new();
        bm.save(&mut buf).unwrap();
        let back = Bitmap::load(&buf[..]).unwrap();
        assert_eq!(back, bm);
    }

    #[test]
    fn load_rejects_bad_magic() {
        let buf = [0u8; 16];
        assert!(Bitmap::load(&buf[..]).is_err());
    }
}
