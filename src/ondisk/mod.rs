//! On-disk structures of a reiserfs tree block.
//!
//! # Layout
//! Every formatted block starts with a 24-byte block head.  In a leaf the
//! head is followed by an array of 24-byte item heads, and the item bodies
//! are packed from the end of the block towards the front: item 0's body
//! ends at the last byte of the block and each later body ends where the
//! previous one begins.  Whatever is left between the head array and the
//! last body is free space.
//!
//! All fields are little-endian.

pub mod item;
pub mod superblock;

use byteorder::{ByteOrder, LittleEndian};

pub use item::{DirEntry, DirEntryHead, ItemBody, LeafItem, StatDataV1, StatDataV2};
pub use superblock::Superblock;

pub const BLKH_SIZE:  usize = 24;
pub const IH_SIZE:    usize = 24;
pub const KEY_SIZE:   usize = 16;
pub const DEH_SIZE:   usize = 16;
pub const DC_SIZE:    usize = 8;

pub const LEAF_LEVEL: u16 = 1;
pub const MAX_HEIGHT: u16 = 5;

pub const KEY_FORMAT_1: u16 = 0;
pub const KEY_FORMAT_2: u16 = 1;

/// `ih_free_space` value of direct and stat-data items that do not use it.
pub const UNUSED_FREE_SPACE: u16 = 0xffff;
/// Dir id of a safe-link item.
pub const SAFE_LINK_DIR_ID: u32 = u32::MAX;

const V1_SD_UNIQUENESS:     u32 = 0;
const V1_DIRENTRY_UNIQUENESS: u32 = 500;
const V1_INDIRECT_UNIQUENESS: u32 = 0xffff_fffe;
const V1_DIRECT_UNIQUENESS: u32 = 0xffff_ffff;

const V2_OFFSET_MASK: u64 = (1 << 60) - 1;

// ── Keys ─────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ItemType {
    StatData,
    Extent,
    Direct,
    Directory,
    /// Raw uniqueness (format 1) or type nibble (format 2) of a key that
    /// names no known item type.
    Unknown(u32),
}

impl ItemType {
    fn from_uniqueness(u: u32) -> Self {
        match u {
            V1_SD_UNIQUENESS       => ItemType::StatData,
            V1_INDIRECT_UNIQUENESS => ItemType::Extent,
            V1_DIRECT_UNIQUENESS   => ItemType::Direct,
            V1_DIRENTRY_UNIQUENESS => ItemType::Directory,
            other                  => ItemType::Unknown(other),
        }
    }

    fn uniqueness(self) -> u32 {
        match self {
            ItemType::StatData   => V1_SD_UNIQUENESS,
            ItemType::Extent     => V1_INDIRECT_UNIQUENESS,
            ItemType::Direct     => V1_DIRECT_UNIQUENESS,
            ItemType::Directory  => V1_DIRENTRY_UNIQUENESS,
            ItemType::Unknown(u) => u,
        }
    }

    fn from_v2(t: u32) -> Self {
        match t {
            0     => ItemType::StatData,
            1     => ItemType::Extent,
            2     => ItemType::Direct,
            3     => ItemType::Directory,
            other => ItemType::Unknown(other),
        }
    }

    fn v2_code(self) -> u64 {
        match self {
            ItemType::StatData   => 0,
            ItemType::Extent     => 1,
            ItemType::Direct     => 2,
            ItemType::Directory  => 3,
            ItemType::Unknown(t) => (t & 0xf) as u64,
        }
    }

    pub fn is_known(self) -> bool {
        !matches!(self, ItemType::Unknown(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Key {
    pub dir_id:    u32,
    pub object_id: u32,
    pub offset:    u64,
    pub item_type: ItemType,
}

impl Key {
    pub fn new(dir_id: u32, object_id: u32, offset: u64, item_type: ItemType) -> Self {
        Self { dir_id, object_id, offset, item_type }
    }

    /// Decode a 16-byte key in the given key format.
    pub fn parse(buf: &[u8], key_format: u16) -> Self {
        let dir_id    = LittleEndian::read_u32(&buf[0..4]);
        let object_id = LittleEndian::read_u32(&buf[4..8]);
        if key_format == KEY_FORMAT_2 {
            let v = LittleEndian::read_u64(&buf[8..16]);
            Self {
                dir_id,
                object_id,
                offset:    v & V2_OFFSET_MASK,
                item_type: ItemType::from_v2((v >> 60) as u32),
            }
        } else {
            Self {
                dir_id,
                object_id,
                offset:    LittleEndian::read_u32(&buf[8..12]) as u64,
                item_type: ItemType::from_uniqueness(LittleEndian::read_u32(&buf[12..16])),
            }
        }
    }

    pub fn write(&self, buf: &mut [u8], key_format: u16) {
        LittleEndian::write_u32(&mut buf[0..4], self.dir_id);
        LittleEndian::write_u32(&mut buf[4..8], self.object_id);
        if key_format == KEY_FORMAT_2 {
            let v = (self.item_type.v2_code() << 60) | (self.offset & V2_OFFSET_MASK);
            LittleEndian::write_u64(&mut buf[8..16], v);
        } else {
            LittleEndian::write_u32(&mut buf[8..12], self.offset as u32);
            LittleEndian::write_u32(&mut buf[12..16], self.item_type.uniqueness());
        }
    }

    pub fn same_object(&self, other: &Key) -> bool {
        self.dir_id == other.dir_id && self.object_id == other.object_id
    }
}

// ── Heads ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHead {
    pub level:      u16,
    pub nr_items:   u16,
    pub free_space: u16,
    pub reserved:   u16,
    pub right_key:  [u8; KEY_SIZE],
}

impl BlockHead {
    pub fn parse(buf: &[u8]) -> Self {
        let mut right_key = [0u8; KEY_SIZE];
        right_key.copy_from_slice(&buf[8..24]);
        Self {
            level:      LittleEndian::read_u16(&buf[0..2]),
            nr_items:   LittleEndian::read_u16(&buf[2..4]),
            free_space: LittleEndian::read_u16(&buf[4..6]),
            reserved:   LittleEndian::read_u16(&buf[6..8]),
            right_key,
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        LittleEndian::write_u16(&mut buf[0..2], self.level);
        LittleEndian::write_u16(&mut buf[2..4], self.nr_items);
        LittleEndian::write_u16(&mut buf[4..6], self.free_space);
        LittleEndian::write_u16(&mut buf[6..8], self.reserved);
        buf[8..24].copy_from_slice(&self.right_key);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemHead {
    pub key:           Key,
    /// Free space in the last unformatted block for extents, entry count for
    /// directories, unused (0xffff) otherwise.
    pub free_or_count: u16,
    pub item_len:      u16,
    pub location:      u16,
    /// Low 12 bits: key format.  High 4 bits: item flags.
    pub format:        u16,
}

impl ItemHead {
    pub fn parse(buf: &[u8]) -> Self {
        let format = LittleEndian::read_u16(&buf[22..24]);
        Self {
            key:           Key::parse(&buf[0..16], format & 0x0fff),
            free_or_count: LittleEndian::read_u16(&buf[16..18]),
            item_len:      LittleEndian::read_u16(&buf[18..20]),
            location:      LittleEndian::read_u16(&buf[20..22]),
            format,
        }
    }

    pub fn write(&self, buf: &mut [u8]) {
        self.key.write(&mut buf[0..16], self.key_format());
        LittleEndian::write_u16(&mut buf[16..18], self.free_or_count);
        LittleEndian::write_u16(&mut buf[18..20], self.item_len);
        LittleEndian::write_u16(&mut buf[20..22], self.location);
        LittleEndian::write_u16(&mut buf[22..24], self.format);
    }

    pub fn key_format(&self) -> u16 {
        self.format & 0x0fff
    }

    pub fn flags(&self) -> u16 {
        self.format >> 12
    }

    pub fn is_safe_link(&self) -> bool {
        self.key.dir_id == SAFE_LINK_DIR_ID
            && self.item_len == 4
            && matches!(self.key.item_type, ItemType::Direct | ItemType::Extent)
    }
}

// ── Leaf access ──────────────────────────────────────────────────────────────

/// Read-only view over a leaf block.
#[derive(Debug, Clone, Copy)]
pub struct LeafView<'a> {
    data: &'a [u8],
    pub head: BlockHead,
}

impl<'a> LeafView<'a> {
    /// `None` if the block cannot even hold its own head array.
    pub fn new(data: &'a [u8]) -> Option<Self> {
        if data.len() < BLKH_SIZE {
            return None;
        }
        let head = BlockHead::parse(data);
        if BLKH_SIZE + head.nr_items as usize * IH_SIZE > data.len() {
            return None;
        }
        Some(Self { data, head })
    }

    pub fn block_size(&self) -> usize { self.data.len() }

    pub fn nr_items(&self) -> usize { self.head.nr_items as usize }

    pub fn item_head(&self, i: usize) -> ItemHead {
        let at = BLKH_SIZE + i * IH_SIZE;
        ItemHead::parse(&self.data[at..at + IH_SIZE])
    }

    pub fn item_heads(&self) -> impl Iterator<Item = ItemHead> + 'a {
        let this = *self;
        (0..this.nr_items()).map(move |i| this.item_head(i))
    }

    /// The body of `ih`, or `None` if it points outside the block.
    pub fn body(&self, ih: &ItemHead) -> Option<&'a [u8]> {
        let start = ih.location as usize;
        let end = start + ih.item_len as usize;
        self.data.get(start..end)
    }
}

/// Free space of a leaf holding items of the given lengths.
pub fn leaf_free_space(block_size: usize, item_lens: impl IntoIterator<Item = usize>) -> Option<u16> {
    let used: usize = item_lens.into_iter().map(|l| IH_SIZE + l).sum::<usize>() + BLKH_SIZE;
    block_size.checked_sub(used).and_then(|f| u16::try_from(f).ok())
}

/// Lay `items` out end-to-front in a fresh block and return it.  Item heads
/// get their locations recomputed; everything else is taken as given.
pub fn build_leaf(block_size: usize, items: &[LeafItem]) -> Option<Vec<u8>> {
    let free = leaf_free_space(block_size, items.iter().map(|it| it.head.item_len as usize))?;
    let mut data = vec![0u8; block_size];
    BlockHead {
        level:      LEAF_LEVEL,
        nr_items:   items.len() as u16,
        free_space: free,
        reserved:   0,
        right_key:  [0u8; KEY_SIZE],
    }
    .write(&mut data);

    let mut end = block_size;
    for (i, item) in items.iter().enumerate() {
        let len = item.head.item_len as usize;
        let start = end - len;
        let mut head = item.head;
        head.location = start as u16;
        let at = BLKH_SIZE + i * IH_SIZE;
        head.write(&mut data[at..at + IH_SIZE]);
        item.body.write(&mut data[start..end]);
        end = start;
    }
    Some(data)
}

// ── Classification ───────────────────────────────────────────────────────────

pub const JOURNAL_DESC_MAGIC: &[u8; 8] = b"ReIsErLB";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    Super,
    JournalDescriptor,
    Bitmap,
    Leaf,
    /// Leaf head is inconsistent but an item head array is recognisable.
    AmbiguousLeaf,
    Internal,
    Unknown,
}

/// Classify a block.  With a superblock at hand, the superblock and bitmap
/// positions are recognised by number; without one only by content.
pub fn classify(data: &[u8], number: u32, sb: Option<&Superblock>) -> BlockKind {
    if let Some(sb) = sb {
        if number == sb.location {
            return BlockKind::Super;
        }
        if sb.is_bitmap_block(number) {
            return BlockKind::Bitmap;
        }
    } else if Superblock::has_magic(data) {
        return BlockKind::Super;
    }
    if is_journal_desc(data) {
        return BlockKind::JournalDescriptor;
    }
    if data.len() < BLKH_SIZE {
        return BlockKind::Unknown;
    }
    let head = BlockHead::parse(data);
    if head.level == LEAF_LEVEL && is_leaf_consistent(data, &head) {
        return BlockKind::Leaf;
    }
    if (LEAF_LEVEL + 1..=MAX_HEIGHT).contains(&head.level) && is_internal_consistent(data, &head) {
        return BlockKind::Internal;
    }
    if has_item_head_array(data) {
        return BlockKind::AmbiguousLeaf;
    }
    BlockKind::Unknown
}

pub fn is_journal_desc(data: &[u8]) -> bool {
    data.len() >= 12 && &data[data.len() - 12..data.len() - 4] == JOURNAL_DESC_MAGIC
}

fn is_leaf_consistent(data: &[u8], head: &BlockHead) -> bool {
    let bs = data.len();
    let nr = head.nr_items as usize;
    let heads_end = BLKH_SIZE + nr * IH_SIZE;
    if heads_end + head.free_space as usize > bs {
        return false;
    }
    if nr == 0 {
        return heads_end + head.free_space as usize == bs;
    }
    let first = ItemHead::parse(&data[BLKH_SIZE..BLKH_SIZE + IH_SIZE]);
    let last_at = BLKH_SIZE + (nr - 1) * IH_SIZE;
    let last = ItemHead::parse(&data[last_at..last_at + IH_SIZE]);
    first.location as usize + first.item_len as usize == bs
        && last.location as usize == heads_end + head.free_space as usize
}

fn is_internal_consistent(data: &[u8], head: &BlockHead) -> bool {
    let nr = head.nr_items as usize;
    let used = BLKH_SIZE + nr * KEY_SIZE + (nr + 1) * DC_SIZE;
    used <= data.len() && data.len() - used == head.free_space as usize
}

/// Walk item heads from the start of the array for as long as they chain
/// end-to-front and name known item types.
fn has_item_head_array(data: &[u8]) -> bool {
    let bs = data.len();
    let mut end = bs;
    let mut count = 0usize;
    loop {
        let at = BLKH_SIZE + count * IH_SIZE;
        if at + IH_SIZE > bs {
            break;
        }
        let ih = ItemHead::parse(&data[at..at + IH_SIZE]);
        let loc = ih.location as usize;
        if ih.item_len == 0
            || !ih.key.item_type.is_known()
            || ih.key_format() > KEY_FORMAT_2
            || loc + ih.item_len as usize != end
            || loc < at + IH_SIZE
        {
            break;
        }
        end = loc;
        count += 1;
    }
    count > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_format_1_types_come_from_uniqueness() {
        let key = Key::new(1, 2, 1, ItemType::Directory);
        let mut buf = [0u8; 16];
        key.write(&mut buf, KEY_FORMAT_1);
        assert_eq!(LittleEndian::read_u32(&buf[12..16]), 500);
        assert_eq!(Key::parse(&buf, KEY_FORMAT_1), key);
    }

    #[test]
    fn key_format_2_packs_type_in_top_nibble() {
        let key = Key::new(1, 2, (1 << 40) + 1, ItemType::Direct);
        let mut buf = [0u8; 16];
        key.write(&mut buf, KEY_FORMAT_2);
        assert_eq!(buf[15] >> 4, 2);
        assert_eq!(Key::parse(&buf, KEY_FORMAT_2), key);
    }

    #[test]
    fn unknown_uniqueness_survives() {
        let mut buf = [0u8; 16];
        LittleEndian::write_u32(&mut buf[12..16], 77);
        let key = Key::parse(&buf, KEY_FORMAT_1);
        assert_eq!(key.item_type, ItemType::Unknown(77));
        let mut out = [0u8; 16];
        key.write(&mut out, KEY_FORMAT_1);
        assert_eq!(out, buf);
    }

    #[test]
    fn empty_leaf_classifies_as_leaf() {
        let mut data = vec![0u8; 1024];
        BlockHead { level: 1, nr_items: 0, free_space: 1000, reserved: 0, right_key: [0; 16] }
            .write(&mut data);
        assert_eq!(classify(&data, 100, None), BlockKind::Leaf);
    }

    #[test]
    fn internal_node_free_space_must_match() {
        let mut data = vec![0u8; 1024];
        let free = (1024 - 24 - 2 * 16 - 3 * 8) as u16;
        BlockHead { level: 2, nr_items: 2, free_space: free, reserved: 0, right_key: [0; 16] }
            .write(&mut data);
        assert_eq!(classify(&data, 100, None), BlockKind::Internal);
        BlockHead { level: 2, nr_items: 2, free_space: free - 1, reserved: 0, right_key: [0; 16] }
            .write(&mut data);
        assert_eq!(classify(&data, 100, None), BlockKind::Unknown);
    }

    #[test]
    fn journal_descriptor_is_recognised_by_tail_magic() {
        let mut data = vec![0u8; 1024];
        data[1012..1020].copy_from_slice(JOURNAL_DESC_MAGIC);
        assert_eq!(classify(&data, 5, None), BlockKind::JournalDescriptor);
    }

    #[test]
    fn zero_block_is_unknown() {
        assert_eq!(classify(&vec![0u8; 1024], 9, None), BlockKind::Unknown);
    }
}
