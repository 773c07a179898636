use byteorder::{ByteOrder, LittleEndian};
use std::io;
use std::ops::RangeInclusive;
use thiserror::Error;
use uuid::Uuid;

use crate::device::BlockDevice;
use crate::hash::HashCode;

/// Byte offset of the superblock on current filesystems (bitmaps spread).
pub const SUPERBLOCK_OFFSET: u64 = 64 * 1024;
/// Byte offset used by early 3.5 filesystems (bitmaps contiguous).
pub const OLD_SUPERBLOCK_OFFSET: u64 = 8 * 1024;

/// Bytes of the v1 superblock; v2 appends uuid and label.
pub const SUPERBLOCK_V1_SIZE: usize = 76;
pub const SUPERBLOCK_V2_SIZE: usize = 204;

const MAGIC_OFFSET: usize = 52;
pub const MAGICS: [&[u8]; 3] = [b"ReIsErFs", b"ReIsEr2Fs", b"ReIsEr3Fs"];

const PROBE_SIZE: usize = 1024;

#[derive(Error, Debug)]
pub enum SuperblockError {
    #[error("no reiserfs magic at 64k or 8k")]
    InvalidMagic,
    #[error("unsupported block size {0}")]
    BadBlockSize(u16),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct JournalParams {
    pub first_block:    u32,
    /// Nonzero when the journal lives on another device.
    pub dev:            u32,
    pub size:           u32,
    pub trans_max:      u32,
    pub magic:          u32,
    pub max_batch:      u32,
    pub max_commit_age: u32,
    pub max_trans_age:  u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Superblock {
    pub block_count:  u32,
    pub free_blocks:  u32,
    pub root_block:   u32,
    pub journal:      JournalParams,
    pub block_size:   u16,
    pub oid_maxsize:  u16,
    pub oid_cursize:  u16,
    pub umount_state: u16,
    pub magic:        [u8; 10],
    pub fs_state:     u16,
    pub hash_code:    u32,
    pub tree_height:  u16,
    pub bmap_nr:      u16,
    pub version:      u16,
    pub uuid:         Option<Uuid>,
    pub label:        Option<String>,
    /// Block number the superblock was found in.
    pub location:     u32,
}

impl Superblock {
    /// Whether a block holding the superblock at its start carries a magic.
    pub fn has_magic(buf: &[u8]) -> bool {
        buf.len() >= MAGIC_OFFSET + 10
            && MAGICS.iter().any(|m| buf[MAGIC_OFFSET..].starts_with(m))
    }

    /// Parse a superblock that starts at `buf[0]` and was found at byte
    /// `offset` of the device.
    pub fn parse(buf: &[u8], offset: u64) -> Result<Self, SuperblockError> {
        if buf.len() < SUPERBLOCK_V1_SIZE || !Self::has_magic(buf) {
            return Err(SuperblockError::InvalidMagic);
        }
        let block_size = LittleEndian::read_u16(&buf[44..46]);
        if !block_size.is_power_of_two() || block_size < 512 {
            return Err(SuperblockError::BadBlockSize(block_size));
        }
        let mut magic = [0u8; 10];
        magic.copy_from_slice(&buf[52..62]);

        let (uuid, label) = if buf.len() >= SUPERBLOCK_V2_SIZE && &magic[..9] != b"ReIsErFs\0" {
            let uuid = Uuid::from_slice(&buf[84..100]).ok().filter(|u| !u.is_nil());
            let raw = crate::hash::trim_name(&buf[100..116]);
            let label = (!raw.is_empty()).then(|| String::from_utf8_lossy(raw).into_owned());
            (uuid, label)
        } else {
            (None, None)
        };

        Ok(Self {
            block_count:  LittleEndian::read_u32(&buf[0..4]),
            free_blocks:  LittleEndian::read_u32(&buf[4..8]),
            root_block:   LittleEndian::read_u32(&buf[8..12]),
            journal: JournalParams {
                first_block:    LittleEndian::read_u32(&buf[12..16]),
                dev:            LittleEndian::read_u32(&buf[16..20]),
                size:           LittleEndian::read_u32(&buf[20..24]),
                trans_max:      LittleEndian::read_u32(&buf[24..28]),
                magic:          LittleEndian::read_u32(&buf[28..32]),
                max_batch:      LittleEndian::read_u32(&buf[32..36]),
                max_commit_age: LittleEndian::read_u32(&buf[36..40]),
                max_trans_age:  LittleEndian::read_u32(&buf[40..44]),
            },
            block_size,
            oid_maxsize:  LittleEndian::read_u16(&buf[46..48]),
            oid_cursize:  LittleEndian::read_u16(&buf[48..50]),
            umount_state: LittleEndian::read_u16(&buf[50..52]),
            magic,
            fs_state:     LittleEndian::read_u16(&buf[62..64]),
            hash_code:    LittleEndian::read_u32(&buf[64..68]),
            tree_height:  LittleEndian::read_u16(&buf[68..70]),
            bmap_nr:      LittleEndian::read_u16(&buf[70..72]),
            version:      LittleEndian::read_u16(&buf[72..74]),
            uuid,
            label,
            location:     (offset / block_size as u64) as u32,
        })
    }

    /// Probe the current location, then the old one.
    pub fn read<D: BlockDevice + ?Sized>(dev: &mut D) -> Result<Self, SuperblockError> {
        for offset in [SUPERBLOCK_OFFSET, OLD_SUPERBLOCK_OFFSET] {
            let probe = match dev.read_block((offset / PROBE_SIZE as u64) as u32, PROBE_SIZE) {
                Ok(b)  => b,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => continue,
                Err(e) => return Err(e.into()),
            };
            match Self::parse(&probe.data, offset) {
                Ok(sb) => return Ok(sb),
                Err(SuperblockError::InvalidMagic) => continue,
                Err(e) => return Err(e),
            }
        }
        Err(SuperblockError::InvalidMagic)
    }

    pub fn hash(&self) -> Option<HashCode> {
        HashCode::from_code(self.hash_code)
    }

    /// Bitmaps follow the superblock contiguously only on filesystems whose
    /// superblock sits at the old location.
    pub fn spread_bitmaps(&self) -> bool {
        self.location as u64 * self.block_size as u64 != OLD_SUPERBLOCK_OFFSET
    }

    pub fn bitmap_count(&self) -> u32 {
        if self.bmap_nr != 0 {
            return self.bmap_nr as u32;
        }
        let per = self.block_size as u32 * 8;
        self.block_count.div_ceil(per)
    }

    /// Block numbers of all bitmap blocks, ascending.
    pub fn bitmap_blocks(&self) -> Vec<u32> {
        let per = self.block_size as u32 * 8;
        (0..self.bitmap_count())
            .map(|i| {
                if !self.spread_bitmaps() {
                    self.location + 1 + i
                } else if i == 0 {
                    self.location + 1
                } else {
                    i * per
                }
            })
            .collect()
    }

    pub fn is_bitmap_block(&self, number: u32) -> bool {
        let per = self.block_size as u32 * 8;
        if number == self.location + 1 {
            return true;
        }
        if self.spread_bitmaps() {
            number % per == 0 && number / per < self.bitmap_count() && number != 0
        } else {
            number > self.location && number - self.location <= self.bitmap_count()
        }
    }

    pub fn journal_on_separate_device(&self) -> bool {
        self.journal.dev != 0
    }

    /// Journal blocks including the trailing journal header block.
    pub fn journal_blocks(&self) -> RangeInclusive<u32> {
        let start = self.journal.first_block;
        start..=start.saturating_add(self.journal.size)
    }

    pub fn magic_str(&self) -> String {
        String::from_utf8_lossy(crate::hash::trim_name(&self.magic)).into_owned()
    }
}

/// Fill the fields of `sb` into a zeroed block-sized buffer.  The layout is
/// the inverse of [`Superblock::parse`]; used to build images for tests and
/// benchmarks.
pub fn write_superblock(sb: &Superblock, buf: &mut [u8]) {
    LittleEndian::write_u32(&mut buf[0..4], sb.block_count);
    LittleEndian::write_u32(&mut buf[4..8], sb.free_blocks);
    LittleEndian::write_u32(&mut buf[8..12], sb.root_block);
    let j = &sb.journal;
    for (i, v) in [
        j.first_block, j.dev, j.size, j.trans_max,
        j.magic, j.max_batch, j.max_commit_age, j.max_trans_age,
    ].into_iter().enumerate() {
        LittleEndian::write_u32(&mut buf[12 + i * 4..16 + i * 4], v);
    }
    LittleEndian::write_u16(&mut buf[44..46], sb.block_size);
    LittleEndian::write_u16(&mut buf[46..48], sb.oid_maxsize);
    LittleEndian::write_u16(&mut buf[48..50], sb.oid_cursize);
    LittleEndian::write_u16(&mut buf[50..52], sb.umount_state);
    buf[52..62].copy_from_slice(&sb.magic);
    LittleEndian::write_u16(&mut buf[62..64], sb.fs_state);
    LittleEndian::write_u32(&mut buf[64..68], sb.hash_code);
    LittleEndian::write_u16(&mut buf[68..70], sb.tree_height);
    LittleEndian::write_u16(&mut buf[70..72], sb.bmap_nr);
    LittleEndian::write_u16(&mut buf[72..74], sb.version);
    if let Some(uuid) = sb.uuid {
        buf[84..100].copy_from_slice(uuid.as_bytes());
    }
    if let Some(label) = &sb.label {
        let n = label.len().min(16);
        buf[100..100 + n].copy_from_slice(&label.as_bytes()[..n]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{Block, ImageDevice};
    use std::io::Cursor;

    fn sample(block_size: u16, offset: u64) -> Superblock {
        let mut magic = [0u8; 10];
        magic[..9].copy_from_slice(b"ReIsEr2Fs");
        Superblock {
            block_count:  40_000,
            free_blocks:  1_000,
            root_block:   8_211,
            journal:      JournalParams { first_block: 18, size: 8192, ..Default::default() },
            block_size,
            oid_maxsize:  972,
            oid_cursize:  2,
            umount_state: 1,
            magic,
            fs_state:     0,
            hash_code:    3,
            tree_height:  2,
            bmap_nr:      2,
            version:      2,
            uuid:         Some(Uuid::from_bytes([7u8; 16])),
            label:        Some("scratch".into()),
            location:     (offset / block_size as u64) as u32,
        }
    }

    #[test]
    fn read_finds_superblock_at_64k() {
        let sb = sample(4096, SUPERBLOCK_OFFSET);
        let mut data = vec![0u8; 4096];
        write_superblock(&sb, &mut data);
        let mut dev = ImageDevice::new(Cursor::new(Vec::new()));
        dev.write_block(&Block::new(16, data)).unwrap();

        let back = Superblock::read(&mut dev).unwrap();
        assert_eq!(back, sb);
        assert!(back.spread_bitmaps());
        assert_eq!(back.hash(), Some(HashCode::R5));
        assert_eq!(back.bitmap_blocks(), vec![17, 32768]);
        assert_eq!(back.journal_blocks(), 18..=8210);
    }

    #[test]
    fn old_location_means_contiguous_bitmaps() {
        let sb = sample(4096, OLD_SUPERBLOCK_OFFSET);
        assert_eq!(sb.location, 2);
        assert!(!sb.spread_bitmaps());
        assert_eq!(sb.bitmap_blocks(), vec![3, 4]);
        assert!(sb.is_bitmap_block(4));
        assert!(!sb.is_bitmap_block(5));
    }

    #[test]
    fn missing_magic_is_reported() {
        let mut dev = ImageDevice::new(Cursor::new(vec![0u8; 128 * 1024]));
        assert!(matches!(Superblock::read(&mut dev), Err(SuperblockError::InvalidMagic)));
    }

    #[test]
    fn bitmap_count_derived_when_unset() {
        let mut sb = sample(1024, SUPERBLOCK_OFFSET);
        sb.bmap_nr = 0;
        sb.block_count = 8192 * 3 + 1;
        assert_eq!(sb.bitmap_count(), 4);
    }
}
