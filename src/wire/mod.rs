//! Stream framing: record tags, the packed item header, and mask bits.
//!
//! # Stream
//! ```text
//! [u32 STREAM_MAGIC][u16 block_size] record* [u16 END]
//! ```
//! Each record starts with a u16 whose low byte is the tag.  Leaf records
//! carry the directory hash code in the high byte; every other record has
//! a zero high byte.
//!
//! # Packed item header
//! One u32 per item: bits 0–1 item type, bits 2–19 field-presence mask,
//! bits 20–31 item length.  The accessors below are plain shifts and masks
//! over the integer so the layout does not depend on the host.
//!
//! # Endianness
//! Everything is little-endian.

pub mod block;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};
use thiserror::Error;

use crate::ondisk::{ItemType, Key, LeafItem, UNUSED_FREE_SPACE};

pub use block::{read_full_block_body, write_full_block, FullBlockHeader};

/// The reiserfs superblock magic number, reused as the stream signature.
pub const STREAM_MAGIC: u32 = 0x5234_5362;

// ── Record tags (low byte of the record word) ────────────────────────────────

pub const UNFORMATTED_BITMAP:      u8 = 0xe9;
pub const FULL_BLOCK_START:        u8 = 0xeb;
pub const FULL_BLOCK_END:          u8 = 0xec;
pub const LEAF_START:              u8 = 0xed;
pub const LEAF_END:                u8 = 0xee;
pub const END:                     u8 = 0xef;
pub const SEPARATED_JOURNAL_START: u8 = 0xf2;
pub const SEPARATED_JOURNAL_END:   u8 = 0xf3;

/// Build the u16 record word for `tag` with `high` in the upper byte.
#[inline]
pub fn record_word(tag: u8, high: u8) -> u16 {
    (high as u16) << 8 | tag as u16
}

// ── Item mask bits ───────────────────────────────────────────────────────────

pub mod mask {
    /// Key format 2.
    pub const NEW_FORMAT:           u32 = 1 << 0;
    pub const DIR_ID:               u32 = 1 << 1;
    pub const OBJECT_ID:            u32 = 1 << 2;
    pub const OFFSET_BITS_32:       u32 = 1 << 3;
    pub const OFFSET_BITS_64:       u32 = 1 << 4;
    /// `free_or_count` differs from the per-type default.
    pub const ENTRY_COUNT:          u32 = 1 << 5;
    /// The 4-bit item flags are nonzero.
    pub const ITEM_FLAGS:           u32 = 1 << 6;
    pub const SAFE_LINK:            u32 = 1 << 7;
    /// Extent pointers stored raw instead of run-length coded.
    pub const WHOLE_EXTENT:         u32 = 1 << 8;
    pub const SD_FIRST_DIRECT_BYTE: u32 = 1 << 9;
    pub const NLINK_BITS_32:        u32 = 1 << 10;
    pub const SIZE_BITS_64:         u32 = 1 << 11;
    /// Stat data owner, timestamps and the remaining v2 words follow.
    pub const SD_ATTRS:             u32 = 1 << 12;
}

// ── Directory entry mask bits ────────────────────────────────────────────────

pub mod entry_mask {
    /// Entry dir id differs from the directory's object id.
    pub const HAS_DIR_ID:      u8 = 1 << 0;
    pub const HAS_GEN_COUNTER: u8 = 1 << 1;
    /// State differs from the visible default.
    pub const HAS_STATE:       u8 = 1 << 2;
}

#[derive(Error, Debug)]
pub enum WireError {
    #[error("item length {0} does not fit the 12-bit length field")]
    ItemTooLong(usize),
    #[error("mask {0:#x} does not fit the 18-bit mask field")]
    MaskTooWide(u32),
    #[error("item type {0:?} has no wire code")]
    UnpackableType(ItemType),
}

// ── Packed item header ───────────────────────────────────────────────────────

const TYPE_SHIFT: u32 = 0;
const TYPE_BITS:  u32 = 2;
const MASK_SHIFT: u32 = 2;
const MASK_BITS:  u32 = 18;
const LEN_SHIFT:  u32 = 20;
const LEN_BITS:   u32 = 12;

pub const MAX_WIRE_ITEM_LEN: usize = (1 << LEN_BITS) - 1;

#[inline]
fn field(word: u32, shift: u32, bits: u32) -> u32 {
    (word >> shift) & ((1 << bits) - 1)
}

#[inline]
fn with_field(word: u32, shift: u32, bits: u32, value: u32) -> u32 {
    let m = ((1 << bits) - 1) << shift;
    (word & !m) | ((value << shift) & m)
}

pub fn wire_type_code(t: ItemType) -> Option<u32> {
    match t {
        ItemType::StatData   => Some(0),
        ItemType::Extent     => Some(1),
        ItemType::Direct     => Some(2),
        ItemType::Directory  => Some(3),
        ItemType::Unknown(_) => None,
    }
}

pub fn item_type_from_wire(code: u32) -> ItemType {
    match code & 3 {
        0 => ItemType::StatData,
        1 => ItemType::Extent,
        2 => ItemType::Direct,
        _ => ItemType::Directory,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WireItemHeader(pub u32);

impl WireItemHeader {
    /// Refuses lengths above 4095 and masks wider than 18 bits; such items
    /// must go out inside a full block instead.
    pub fn new(item_type: ItemType, mask: u32, item_len: usize) -> Result<Self, WireError> {
        let code = wire_type_code(item_type).ok_or(WireError::UnpackableType(item_type))?;
        if item_len > MAX_WIRE_ITEM_LEN {
            return Err(WireError::ItemTooLong(item_len));
        }
        if mask >> MASK_BITS != 0 {
            return Err(WireError::MaskTooWide(mask));
        }
        let mut h = WireItemHeader(0);
        h.0 = with_field(h.0, TYPE_SHIFT, TYPE_BITS, code);
        h.set_mask(mask);
        h.set_item_len(item_len as u16);
        Ok(h)
    }

    pub fn item_type(self) -> ItemType {
        item_type_from_wire(field(self.0, TYPE_SHIFT, TYPE_BITS))
    }

    pub fn mask(self) -> u32 {
        field(self.0, MASK_SHIFT, MASK_BITS)
    }

    pub fn item_len(self) -> u16 {
        field(self.0, LEN_SHIFT, LEN_BITS) as u16
    }

    pub fn has(self, bit: u32) -> bool {
        self.mask() & bit != 0
    }

    pub fn set_mask(&mut self, mask: u32) {
        self.0 = with_field(self.0, MASK_SHIFT, MASK_BITS, mask);
    }

    pub fn set_item_len(&mut self, len: u16) {
        self.0 = with_field(self.0, LEN_SHIFT, LEN_BITS, len as u32);
    }

    pub fn write<W: Write>(self, mut writer: W) -> io::Result<()> {
        writer.write_u32::<LittleEndian>(self.0)
    }

    pub fn read<R: Read>(mut reader: R) -> io::Result<Self> {
        Ok(WireItemHeader(reader.read_u32::<LittleEndian>()?))
    }
}

// ── Shared derivations ───────────────────────────────────────────────────────

/// The offset an item gets when none is sent.  Only an item continuing its
/// predecessor's object can inherit one: 1 after that object's stat data,
/// or the end of the extent it follows if it is a tail.
pub fn implied_offset(prev: Option<&LeafItem>, key: &Key, block_size: usize) -> u64 {
    let Some(prev) = prev else { return 0 };
    if !prev.head.key.same_object(key) {
        return 0;
    }
    match (prev.head.key.item_type, key.item_type) {
        (ItemType::StatData, _) => 1,
        (ItemType::Extent, ItemType::Direct) => {
            prev.head.key.offset.wrapping_add(prev.extent_span(block_size))
        }
        _ => 0,
    }
}

/// The per-type value of `free_or_count` that goes unsent.
pub fn default_free_or_count(item_type: ItemType) -> Option<u16> {
    match item_type {
        ItemType::StatData | ItemType::Direct => Some(UNUSED_FREE_SPACE),
        ItemType::Extent => Some(0),
        // directories always send their entry count
        _ => None,
    }
}

/// Two neighbouring extent pointers belong to the same run when both are
/// holes or the second follows the first on disk.
#[inline]
pub fn continues_run(prev: u32, next: u32) -> bool {
    if prev == 0 {
        next == 0
    } else {
        prev.checked_add(1) == Some(next)
    }
}

/// Split extent pointers into `(first pointer, run length)` pairs.
pub fn extent_runs(ptrs: &[u32]) -> Vec<(u32, u16)> {
    let mut runs: Vec<(u32, u16)> = Vec::new();
    let mut last = 0u32;
    for &p in ptrs {
        match runs.last_mut() {
            Some((_, len)) if continues_run(last, p) && *len < u16::MAX => *len += 1,
            _ => runs.push((p, 1)),
        }
        last = p;
    }
    runs
}

/// Inverse of [`extent_runs`] for a single run.
pub fn expand_run(first: u32, len: u16, out: &mut Vec<u32>) {
    for i in 0..len as u32 {
        out.push(if first == 0 { 0 } else { first.wrapping_add(i) });
    }
}

// ── Stream header ────────────────────────────────────────────────────────────

pub fn write_stream_header<W: Write>(mut writer: W, block_size: u16) -> io::Result<()> {
    writer.write_u32::<LittleEndian>(STREAM_MAGIC)?;
    writer.write_u16::<LittleEndian>(block_size)
}
