//! Item bodies.
//!
//! A leaf item is decoded into an [`ItemBody`] once and from then on both
//! directions of the codec work on the decoded form: the packer reads fields
//! out of it, the unpacker fills one in and lays it back out with
//! [`ItemBody::write`].  Direct items keep only their length; their bytes
//! are file data and never leave the source image.

use byteorder::{ByteOrder, LittleEndian};

use super::{ItemHead, ItemType, LeafView, DEH_SIZE, KEY_FORMAT_1, KEY_FORMAT_2};

pub const SD_V1_SIZE: usize = 32;
pub const SD_V2_SIZE: usize = 44;

/// `first_direct_byte` of a v1 stat data whose file has no tail.
pub const NO_FIRST_DIRECT_BYTE: u32 = u32::MAX;
/// Entry state of a visible directory entry.
pub const DEFAULT_DEH_STATE: u16 = 4;
/// Byte written in place of direct-item content on reconstruction.
pub const DIRECT_FILLER: u8 = b'#';

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatDataV1 {
    pub mode:              u16,
    pub nlink:             u16,
    pub uid:               u16,
    pub gid:               u16,
    pub size:              u32,
    pub atime:             u32,
    pub mtime:             u32,
    pub ctime:             u32,
    pub rdev_or_blocks:    u32,
    pub first_direct_byte: u32,
}

impl StatDataV1 {
    pub fn parse(b: &[u8]) -> Self {
        Self {
            mode:              LittleEndian::read_u16(&b[0..2]),
            nlink:             LittleEndian::read_u16(&b[2..4]),
            uid:               LittleEndian::read_u16(&b[4..6]),
            gid:               LittleEndian::read_u16(&b[6..8]),
            size:              LittleEndian::read_u32(&b[8..12]),
            atime:             LittleEndian::read_u32(&b[12..16]),
            mtime:             LittleEndian::read_u32(&b[16..20]),
            ctime:             LittleEndian::read_u32(&b[20..24]),
            rdev_or_blocks:    LittleEndian::read_u32(&b[24..28]),
            first_direct_byte: LittleEndian::read_u32(&b[28..32]),
        }
    }

    pub fn write(&self, b: &mut [u8]) {
        LittleEndian::write_u16(&mut b[0..2], self.mode);
        LittleEndian::write_u16(&mut b[2..4], self.nlink);
        LittleEndian::write_u16(&mut b[4..6], self.uid);
        LittleEndian::write_u16(&mut b[6..8], self.gid);
        LittleEndian::write_u32(&mut b[8..12], self.size);
        LittleEndian::write_u32(&mut b[12..16], self.atime);
        LittleEndian::write_u32(&mut b[16..20], self.mtime);
        LittleEndian::write_u32(&mut b[20..24], self.ctime);
        LittleEndian::write_u32(&mut b[24..28], self.rdev_or_blocks);
        LittleEndian::write_u32(&mut b[28..32], self.first_direct_byte);
    }

    /// Owner and timestamps are set.
    pub fn has_attrs(&self) -> bool {
        self.uid != 0 || self.gid != 0 || self.atime != 0 || self.mtime != 0 || self.ctime != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatDataV2 {
    pub mode:               u16,
    pub attrs:              u16,
    pub nlink:              u32,
    pub size:               u64,
    pub uid:                u32,
    pub gid:                u32,
    pub atime:              u32,
    pub mtime:              u32,
    pub ctime:              u32,
    pub blocks:             u32,
    pub rdev_or_generation: u32,
}

impl StatDataV2 {
    pub fn parse(b: &[u8]) -> Self {
        Self {
            mode:               LittleEndian::read_u16(&b[0..2]),
            attrs:              LittleEndian::read_u16(&b[2..4]),
            nlink:              LittleEndian::read_u32(&b[4..8]),
            size:               LittleEndian::read_u64(&b[8..16]),
            uid:                LittleEndian::read_u32(&b[16..20]),
            gid:                LittleEndian::read_u32(&b[20..24]),
            atime:              LittleEndian::read_u32(&b[24..28]),
            mtime:              LittleEndian::read_u32(&b[28..32]),
            ctime:              LittleEndian::read_u32(&b[32..36]),
            blocks:             LittleEndian::read_u32(&b[36..40]),
            rdev_or_generation: LittleEndian::read_u32(&b[40..44]),
        }
    }

    pub fn write(&self, b: &mut [u8]) {
        LittleEndian::write_u16(&mut b[0..2], self.mode);
        LittleEndian::write_u16(&mut b[2..4], self.attrs);
        LittleEndian::write_u32(&mut b[4..8], self.nlink);
        LittleEndian::write_u64(&mut b[8..16], self.size);
        LittleEndian::write_u32(&mut b[16..20], self.uid);
        LittleEndian::write_u32(&mut b[20..24], self.gid);
        LittleEndian::write_u32(&mut b[24..28], self.atime);
        LittleEndian::write_u32(&mut b[28..32], self.mtime);
        LittleEndian::write_u32(&mut b[32..36], self.ctime);
        LittleEndian::write_u32(&mut b[36..40], self.blocks);
        LittleEndian::write_u32(&mut b[40..44], self.rdev_or_generation);
    }

    pub fn has_attrs(&self) -> bool {
        self.attrs != 0
            || self.uid != 0
            || self.gid != 0
            || self.atime != 0
            || self.mtime != 0
            || self.ctime != 0
            || self.rdev_or_generation != 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirEntryHead {
    /// Hash value in bits 7..31, generation counter in bits 0..6.
    pub offset:    u32,
    pub dir_id:    u32,
    pub object_id: u32,
    pub location:  u16,
    pub state:     u16,
}

impl DirEntryHead {
    pub fn parse(b: &[u8]) -> Self {
        Self {
            offset:    LittleEndian::read_u32(&b[0..4]),
            dir_id:    LittleEndian::read_u32(&b[4..8]),
            object_id: LittleEndian::read_u32(&b[8..12]),
            location:  LittleEndian::read_u16(&b[12..14]),
            state:     LittleEndian::read_u16(&b[14..16]),
        }
    }

    pub fn write(&self, b: &mut [u8]) {
        LittleEndian::write_u32(&mut b[0..4], self.offset);
        LittleEndian::write_u32(&mut b[4..8], self.dir_id);
        LittleEndian::write_u32(&mut b[8..12], self.object_id);
        LittleEndian::write_u16(&mut b[12..14], self.location);
        LittleEndian::write_u16(&mut b[14..16], self.state);
    }
}

/// One directory entry: its head and its whole name slot, padding included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub head: DirEntryHead,
    pub name: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ItemBody {
    StatV1(StatDataV1),
    StatV2(StatDataV2),
    Extent(Vec<u32>),
    /// Length of an opaque tail.
    Direct(usize),
    Directory(Vec<DirEntry>),
    /// A 4-byte direct or extent item under dir id 0xffffffff, whose body
    /// is the dir id of the object the link refers to.
    SafeLink(u32),
}

impl ItemBody {
    /// Decode the body of `head`.  Returns a description of the first
    /// inconsistency found.
    pub fn parse(head: &ItemHead, body: &[u8]) -> Result<Self, String> {
        if body.len() != head.item_len as usize {
            return Err(format!("body is {} bytes, head says {}", body.len(), head.item_len));
        }
        if head.is_safe_link() {
            return Ok(ItemBody::SafeLink(LittleEndian::read_u32(body)));
        }
        match head.key.item_type {
            ItemType::StatData => match (head.key_format(), body.len()) {
                (KEY_FORMAT_1, SD_V1_SIZE) => Ok(ItemBody::StatV1(StatDataV1::parse(body))),
                (KEY_FORMAT_2, SD_V2_SIZE) => Ok(ItemBody::StatV2(StatDataV2::parse(body))),
                (fmt, len) => Err(format!("stat data of {len} bytes in key format {fmt}")),
            },
            ItemType::Extent => {
                if body.len() % 4 != 0 {
                    return Err(format!("extent item of {} bytes", body.len()));
                }
                Ok(ItemBody::Extent(
                    body.chunks_exact(4).map(LittleEndian::read_u32).collect(),
                ))
            }
            ItemType::Direct => Ok(ItemBody::Direct(body.len())),
            ItemType::Directory => parse_directory(head.free_or_count as usize, body)
                .map(ItemBody::Directory),
            ItemType::Unknown(t) => Err(format!("unknown item type {t:#x}")),
        }
    }

    /// Lay the body out into `out`, which must be exactly the item length.
    pub fn write(&self, out: &mut [u8]) {
        match self {
            ItemBody::StatV1(sd)     => sd.write(out),
            ItemBody::StatV2(sd)     => sd.write(out),
            ItemBody::Extent(ptrs)   => {
                for (slot, p) in out.chunks_exact_mut(4).zip(ptrs) {
                    LittleEndian::write_u32(slot, *p);
                }
            }
            ItemBody::Direct(_)      => out.fill(DIRECT_FILLER),
            ItemBody::SafeLink(dir)  => LittleEndian::write_u32(&mut out[0..4], *dir),
            ItemBody::Directory(entries) => {
                let mut end = out.len();
                for (i, e) in entries.iter().enumerate() {
                    let start = end - e.name.len();
                    let mut head = e.head;
                    head.location = start as u16;
                    head.write(&mut out[i * DEH_SIZE..(i + 1) * DEH_SIZE]);
                    out[start..end].copy_from_slice(&e.name);
                    end = start;
                }
            }
        }
    }
}

fn parse_directory(count: usize, body: &[u8]) -> Result<Vec<DirEntry>, String> {
    if count == 0 {
        return Err("directory item with no entries".into());
    }
    let heads_end = count * DEH_SIZE;
    if heads_end >= body.len() {
        return Err(format!("{count} entries do not fit in {} bytes", body.len()));
    }
    let mut entries = Vec::with_capacity(count);
    let mut end = body.len();
    for i in 0..count {
        let head = DirEntryHead::parse(&body[i * DEH_SIZE..(i + 1) * DEH_SIZE]);
        let loc = head.location as usize;
        if loc < heads_end || loc >= end {
            return Err(format!("entry {i} name at {loc} outside {heads_end}..{end}"));
        }
        entries.push(DirEntry { head, name: body[loc..end].to_vec() });
        end = loc;
    }
    if end != heads_end {
        return Err(format!("{} bytes between entry heads and names", end - heads_end));
    }
    Ok(entries)
}

/// A decoded leaf item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafItem {
    pub head: ItemHead,
    pub body: ItemBody,
}

impl LeafItem {
    pub fn new(head: ItemHead, body: ItemBody) -> Self {
        Self { head, body }
    }

    /// Decode every item of a leaf, stopping at the first bad one.
    pub fn parse_all(leaf: &LeafView<'_>) -> Result<Vec<LeafItem>, (usize, String)> {
        leaf.item_heads()
            .enumerate()
            .map(|(i, head)| {
                let body = leaf.body(&head)
                    .ok_or_else(|| (i, format!("body at {} runs past the block", head.location)))?;
                ItemBody::parse(&head, body)
                    .map(|body| LeafItem { head, body })
                    .map_err(|e| (i, e))
            })
            .collect()
    }

    /// Byte span covered by an extent item: one block per pointer.
    pub fn extent_span(&self, block_size: usize) -> u64 {
        match &self.body {
            ItemBody::Extent(ptrs) => ptrs.len() as u64 * block_size as u64,
            _ => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ondisk::{Key, UNUSED_FREE_SPACE};

    fn dir_head(count: u16, len: u16) -> ItemHead {
        ItemHead {
            key:           Key::new(1, 2, 1, ItemType::Directory),
            free_or_count: count,
            item_len:      len,
            location:      0,
            format:        KEY_FORMAT_1,
        }
    }

    #[test]
    fn directory_body_round_trips() {
        let entries = vec![
            DirEntry { head: DirEntryHead { offset: 1, dir_id: 1, object_id: 2, location: 0, state: 4 }, name: b".".to_vec() },
            DirEntry { head: DirEntryHead { offset: 2, dir_id: 0, object_id: 1, location: 0, state: 4 }, name: b"..".to_vec() },
            DirEntry { head: DirEntryHead { offset: 0x1000, dir_id: 2, object_id: 7, location: 0, state: 4 }, name: b"readme\0\0".to_vec() },
        ];
        let len = 3 * DEH_SIZE + 1 + 2 + 8;
        let mut buf = vec![0u8; len];
        ItemBody::Directory(entries.clone()).write(&mut buf);

        let parsed = ItemBody::parse(&dir_head(3, len as u16), &buf).unwrap();
        let ItemBody::Directory(back) = parsed else { panic!("not a directory") };
        assert_eq!(back.len(), 3);
        for (a, b) in back.iter().zip(&entries) {
            assert_eq!(a.name, b.name);
            assert_eq!(a.head.object_id, b.head.object_id);
        }
        assert_eq!(back[0].head.location as usize, len - 1);
        assert_eq!(back[2].head.location as usize, 3 * DEH_SIZE);
    }

    #[test]
    fn directory_with_gap_is_rejected() {
        let mut buf = vec![0u8; DEH_SIZE + 8];
        DirEntryHead { offset: 1, dir_id: 1, object_id: 2, location: (DEH_SIZE + 2) as u16, state: 4 }
            .write(&mut buf[..DEH_SIZE]);
        assert!(ItemBody::parse(&dir_head(1, buf.len() as u16), &buf).is_err());
    }

    #[test]
    fn stat_data_size_must_match_key_format() {
        let head = ItemHead {
            key:           Key::new(1, 2, 0, ItemType::StatData),
            free_or_count: UNUSED_FREE_SPACE,
            item_len:      SD_V2_SIZE as u16,
            location:      0,
            format:        KEY_FORMAT_1,
        };
        assert!(ItemBody::parse(&head, &[0u8; SD_V2_SIZE]).is_err());
        let head = ItemHead { format: KEY_FORMAT_2, ..head };
        assert!(matches!(ItemBody::parse(&head, &[0u8; SD_V2_SIZE]), Ok(ItemBody::StatV2(_))));
    }

    #[test]
    fn safe_link_is_its_own_variant() {
        let head = ItemHead {
            key:           Key::new(u32::MAX, 42, 1, ItemType::Direct),
            free_or_count: UNUSED_FREE_SPACE,
            item_len:      4,
            location:      0,
            format:        KEY_FORMAT_1,
        };
        let body = 17u32.to_le_bytes();
        assert_eq!(ItemBody::parse(&head, &body), Ok(ItemBody::SafeLink(17)));
    }

    #[test]
    fn direct_body_is_filler_on_write() {
        let mut out = [0u8; 5];
        ItemBody::Direct(5).write(&mut out);
        assert_eq!(out, [DIRECT_FILLER; 5]);
    }
}
