//! Compact leaf encoding.
//!
//! Every item goes out as a packed header followed by the key fields that
//! cannot be inferred from the item before it, then a per-type body.  The
//! decoder in `unpack::leaf` mirrors this file field for field.

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;

use crate::hash::{trim_name, HashCode, GENERATION_MASK};
use crate::ondisk::item::{DirEntry, DEFAULT_DEH_STATE, NO_FIRST_DIRECT_BYTE};
use crate::ondisk::{ItemBody, LeafItem, StatDataV1, StatDataV2, KEY_FORMAT_2};
use crate::wire::{
    default_free_or_count, entry_mask, extent_runs, implied_offset, mask, record_word,
    WireError, WireItemHeader, LEAF_END, LEAF_START,
};

/// Encode a validated leaf into one leaf record.  Nothing is written unless
/// every item encodes, so a failure leaves the caller free to send the block
/// another way.
pub fn encode_leaf<W: Write>(
    mut writer: W,
    number:     u32,
    items:      &[LeafItem],
    hash:       HashCode,
    block_size: usize,
) -> Result<u64, LeafEncodeError> {
    let mut buf: Vec<u8> = Vec::with_capacity(block_size);
    buf.write_u16::<LittleEndian>(record_word(LEAF_START, hash.code()))?;
    buf.write_u32::<LittleEndian>(number)?;
    buf.write_u16::<LittleEndian>(items.len() as u16)?;

    let mut prev: Option<&LeafItem> = None;
    for item in items {
        encode_item(&mut buf, prev, item, hash, block_size)?;
        prev = Some(item);
    }
    buf.write_u16::<LittleEndian>(record_word(LEAF_END, 0))?;

    writer.write_all(&buf)?;
    Ok(buf.len() as u64)
}

#[derive(Debug, thiserror::Error)]
pub enum LeafEncodeError {
    #[error(transparent)]
    Wire(#[from] WireError),
    #[error("directory entries need a hash function")]
    NoHash,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Mask bits shared by every item type: key fields, flags and the
/// overloaded free-space / entry-count word.
pub fn common_mask(prev: Option<&LeafItem>, item: &LeafItem, block_size: usize) -> u32 {
    let key = &item.head.key;
    let mut m = 0;
    if item.head.key_format() == KEY_FORMAT_2 {
        m |= mask::NEW_FORMAT;
    }
    if prev.map_or(true, |p| p.head.key.dir_id != key.dir_id) {
        m |= mask::DIR_ID;
    }
    if prev.map_or(true, |p| p.head.key.object_id != key.object_id) {
        m |= mask::OBJECT_ID;
    }
    if key.offset != implied_offset(prev, key, block_size) {
        m |= if key.offset > u32::MAX as u64 { mask::OFFSET_BITS_64 } else { mask::OFFSET_BITS_32 };
    }
    if item.head.flags() != 0 {
        m |= mask::ITEM_FLAGS;
    }
    if default_free_or_count(key.item_type) != Some(item.head.free_or_count) {
        m |= mask::ENTRY_COUNT;
    }
    if matches!(item.body, ItemBody::SafeLink(_)) {
        m |= mask::SAFE_LINK;
    }
    m
}

fn encode_item(
    buf:        &mut Vec<u8>,
    prev:       Option<&LeafItem>,
    item:       &LeafItem,
    hash:       HashCode,
    block_size: usize,
) -> Result<(), LeafEncodeError> {
    let head = &item.head;
    let mut m = common_mask(prev, item, block_size);
    m |= body_mask(&item.body);

    WireItemHeader::new(head.key.item_type, m, head.item_len as usize)?.write(&mut *buf)?;

    if m & mask::DIR_ID != 0 {
        buf.write_u32::<LittleEndian>(head.key.dir_id)?;
    }
    if m & mask::OBJECT_ID != 0 {
        buf.write_u32::<LittleEndian>(head.key.object_id)?;
    }
    if m & mask::OFFSET_BITS_64 != 0 {
        buf.write_u64::<LittleEndian>(head.key.offset)?;
    } else if m & mask::OFFSET_BITS_32 != 0 {
        buf.write_u32::<LittleEndian>(head.key.offset as u32)?;
    }
    if m & mask::ITEM_FLAGS != 0 {
        buf.write_u16::<LittleEndian>(head.flags())?;
    }
    if m & mask::ENTRY_COUNT != 0 {
        buf.write_u16::<LittleEndian>(head.free_or_count)?;
    }

    match &item.body {
        ItemBody::SafeLink(dir_id) => buf.write_u32::<LittleEndian>(*dir_id)?,
        ItemBody::Direct(_)        => {}
        ItemBody::Extent(ptrs)     => encode_extent(buf, ptrs, m & mask::WHOLE_EXTENT != 0)?,
        ItemBody::Directory(es)    => encode_directory(buf, head.key.object_id, es, hash)?,
        ItemBody::StatV1(sd)       => encode_sd_v1(buf, sd, m)?,
        ItemBody::StatV2(sd)       => encode_sd_v2(buf, sd, m)?,
    }
    Ok(())
}

/// Mask bits chosen by the body itself.
fn body_mask(body: &ItemBody) -> u32 {
    let mut m = 0;
    match body {
        ItemBody::Extent(ptrs) => {
            if extent_runs(ptrs).iter().all(|&(_, len)| len <= 2) {
                m |= mask::WHOLE_EXTENT;
            }
        }
        ItemBody::StatV1(sd) => {
            if sd.first_direct_byte != NO_FIRST_DIRECT_BYTE {
                m |= mask::SD_FIRST_DIRECT_BYTE;
            }
            if sd.has_attrs() {
                m |= mask::SD_ATTRS;
            }
        }
        ItemBody::StatV2(sd) => {
            if sd.nlink > u16::MAX as u32 {
                m |= mask::NLINK_BITS_32;
            }
            if sd.size > u32::MAX as u64 {
                m |= mask::SIZE_BITS_64;
            }
            if sd.has_attrs() {
                m |= mask::SD_ATTRS;
            }
        }
        _ => {}
    }
    m
}

fn encode_extent(buf: &mut Vec<u8>, ptrs: &[u32], whole: bool) -> std::io::Result<()> {
    if whole {
        for &p in ptrs {
            buf.write_u32::<LittleEndian>(p)?;
        }
        return Ok(());
    }
    for (first, len) in extent_runs(ptrs) {
        buf.write_u32::<LittleEndian>(first)?;
        buf.write_u16::<LittleEndian>(len)?;
    }
    Ok(())
}

fn encode_directory(
    buf:     &mut Vec<u8>,
    dir_obj: u32,
    entries: &[DirEntry],
    hash:    HashCode,
) -> Result<(), LeafEncodeError> {
    for e in entries {
        let name = trim_name(&e.name);
        let base = hash.entry_offset(name, 0).ok_or(LeafEncodeError::NoHash)?;

        let mut em = 0u8;
        if e.head.dir_id != dir_obj {
            em |= entry_mask::HAS_DIR_ID;
        }
        if e.head.offset != base {
            em |= entry_mask::HAS_GEN_COUNTER;
        }
        if e.head.state != DEFAULT_DEH_STATE {
            em |= entry_mask::HAS_STATE;
        }

        buf.write_u8(em)?;
        buf.write_u16::<LittleEndian>(e.name.len() as u16)?;
        buf.write_all(&e.name)?;
        buf.write_u32::<LittleEndian>(e.head.object_id)?;
        if em & entry_mask::HAS_DIR_ID != 0 {
            buf.write_u32::<LittleEndian>(e.head.dir_id)?;
        }
        if em & entry_mask::HAS_GEN_COUNTER != 0 {
            buf.write_u16::<LittleEndian>((e.head.offset & GENERATION_MASK) as u16)?;
        }
        if em & entry_mask::HAS_STATE != 0 {
            buf.write_u16::<LittleEndian>(e.head.state)?;
        }
    }
    Ok(())
}

fn encode_sd_v1(buf: &mut Vec<u8>, sd: &StatDataV1, m: u32) -> std::io::Result<()> {
    buf.write_u16::<LittleEndian>(sd.mode)?;
    buf.write_u16::<LittleEndian>(sd.nlink)?;
    buf.write_u32::<LittleEndian>(sd.size)?;
    buf.write_u32::<LittleEndian>(sd.rdev_or_blocks)?;
    if m & mask::SD_FIRST_DIRECT_BYTE != 0 {
        buf.write_u32::<LittleEndian>(sd.first_direct_byte)?;
    }
    if m & mask::SD_ATTRS != 0 {
        buf.write_u16::<LittleEndian>(sd.uid)?;
        buf.write_u16::<LittleEndian>(sd.gid)?;
        buf.write_u32::<LittleEndian>(sd.atime)?;
        buf.write_u32::<LittleEndian>(sd.mtime)?;
        buf.write_u32::<LittleEndian>(sd.ctime)?;
    }
    Ok(())
}

fn encode_sd_v2(buf: &mut Vec<u8>, sd: &StatDataV2, m: u32) -> std::io::Result<()> {
    buf.write_u16::<LittleEndian>(sd.mode)?;
    if m & mask::NLINK_BITS_32 != 0 {
        buf.write_u32::<LittleEndian>(sd.nlink)?;
    } else {
        buf.write_u16::<LittleEndian>(sd.nlink as u16)?;
    }
    if m & mask::SIZE_BITS_64 != 0 {
        buf.write_u64::<LittleEndian>(sd.size)?;
    } else {
        buf.write_u32::<LittleEndian>(sd.size as u32)?;
    }
    buf.write_u32::<LittleEndian>(sd.blocks)?;
    if m & mask::SD_ATTRS != 0 {
        buf.write_u16::<LittleEndian>(sd.attrs)?;
        buf.write_u32::<LittleEndian>(sd.uid)?;
        buf.write_u32::<LittleEndian>(sd.gid)?;
        buf.write_u32::<LittleEndian>(sd.atime)?;
        buf.write_u32::<LittleEndian>(sd.mtime)?;
        buf.write_u32::<LittleEndian>(sd.ctime)?;
        buf.write_u32::<LittleEndian>(sd.rdev_or_generation)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ondisk::{ItemHead, ItemType, Key, UNUSED_FREE_SPACE};

    fn head(dir: u32, obj: u32, off: u64, t: ItemType, len: u16) -> ItemHead {
        ItemHead {
            key:           Key::new(dir, obj, off, t),
            free_or_count: if t == ItemType::Extent { 0 } else { UNUSED_FREE_SPACE },
            item_len:      len,
            location:      0,
            format:        0,
        }
    }

    fn sd(dir: u32, obj: u32, off: u64) -> LeafItem {
        LeafItem::new(
            head(dir, obj, off, ItemType::StatData, 32),
            ItemBody::StatV1(StatDataV1 { first_direct_byte: NO_FIRST_DIRECT_BYTE, ..Default::default() }),
        )
    }

    #[test]
    fn consecutive_items_of_one_object_omit_ids_and_offset() {
        let items = [
            sd(5, 100, 1),
            LeafItem::new(head(5, 100, 1, ItemType::Direct, 10), ItemBody::Direct(10)),
            sd(5, 101, 1),
        ];
        let m1 = common_mask(None, &items[0], 4096);
        assert_eq!(m1 & (mask::DIR_ID | mask::OBJECT_ID), mask::DIR_ID | mask::OBJECT_ID);
        assert_ne!(m1 & mask::OFFSET_BITS_32, 0);

        let m2 = common_mask(Some(&items[0]), &items[1], 4096);
        assert_eq!(m2 & (mask::DIR_ID | mask::OBJECT_ID | mask::OFFSET_BITS_32 | mask::OFFSET_BITS_64), 0);

        let m3 = common_mask(Some(&items[1]), &items[2], 4096);
        assert_eq!(m3 & mask::DIR_ID, 0);
        assert_ne!(m3 & mask::OBJECT_ID, 0);
    }

    #[test]
    fn tail_after_extent_inherits_offset() {
        let ext = LeafItem::new(head(1, 9, 1, ItemType::Extent, 12), ItemBody::Extent(vec![20, 21, 22]));
        let tail = LeafItem::new(head(1, 9, 1 + 3 * 4096, ItemType::Direct, 5), ItemBody::Direct(5));
        let m = common_mask(Some(&ext), &tail, 4096);
        assert_eq!(m & (mask::OFFSET_BITS_32 | mask::OFFSET_BITS_64), 0);
    }

    #[test]
    fn large_offsets_use_64_bits() {
        let mut it = sd(1, 2, 0);
        it.head.key.offset = 1 << 33;
        assert_ne!(common_mask(None, &it, 4096) & mask::OFFSET_BITS_64, 0);
    }

    #[test]
    fn extent_with_long_run_is_run_length_coded() {
        let ptrs = vec![10, 11, 12, 0, 0, 50];
        assert_eq!(body_mask(&ItemBody::Extent(ptrs.clone())) & mask::WHOLE_EXTENT, 0);
        let mut buf = Vec::new();
        encode_extent(&mut buf, &ptrs, false).unwrap();
        // (10,3)(0,2)(50,1)
        assert_eq!(buf.len(), 3 * 6);
        assert_eq!(&buf[..6], &[10, 0, 0, 0, 3, 0]);
        assert_eq!(&buf[12..], &[50, 0, 0, 0, 1, 0]);
    }

    #[test]
    fn extent_without_long_runs_is_whole() {
        let body = ItemBody::Extent(vec![7, 8, 0, 0, 3, 9]);
        assert_ne!(body_mask(&body) & mask::WHOLE_EXTENT, 0);
    }

    #[test]
    fn safe_link_sends_only_the_target() {
        let mut h = head(u32::MAX, 44, 1, ItemType::Direct, 4);
        h.free_or_count = UNUSED_FREE_SPACE;
        let item = LeafItem::new(h, ItemBody::SafeLink(1234));
        let mut out = Vec::new();
        let n = encode_leaf(&mut out, 77, &[item], HashCode::R5, 4096).unwrap();
        assert_eq!(n as usize, out.len());
        // tag, block, count, header, dir id, object id, offset, payload, end tag
        assert_eq!(out.len(), 2 + 4 + 2 + 4 + 4 + 4 + 4 + 4 + 2);
        let header = u32::from_le_bytes(out[8..12].try_into().unwrap());
        assert_ne!(WireItemHeader(header).mask() & mask::SAFE_LINK, 0);
        assert_eq!(&out[24..28], &1234u32.to_le_bytes());
    }

    #[test]
    fn oversized_item_is_refused() {
        let item = LeafItem::new(head(1, 2, 1, ItemType::Direct, 4096), ItemBody::Direct(4096));
        let err = encode_leaf(Vec::new(), 1, &[item], HashCode::R5, 8192).unwrap_err();
        assert!(matches!(err, LeafEncodeError::Wire(WireError::ItemTooLong(4096))));
    }

    #[test]
    fn leaf_tag_carries_hash_code() {
        let mut out = Vec::new();
        encode_leaf(&mut out, 1, &[sd(1, 2, 0)], HashCode::Tea, 4096).unwrap();
        assert_eq!(out[0], LEAF_START);
        assert_eq!(out[1], HashCode::Tea.code());
    }
}
