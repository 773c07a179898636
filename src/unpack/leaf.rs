//! Leaf record decoding, the inverse of `pack::leaf`.

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::Read;

use crate::error::UnpackError;
use crate::hash::{trim_name, HashCode};
use crate::ondisk::item::{DirEntry, DEFAULT_DEH_STATE, NO_FIRST_DIRECT_BYTE, SD_V1_SIZE, SD_V2_SIZE};
use crate::ondisk::{
    build_leaf, DirEntryHead, ItemBody, ItemHead, ItemType, Key, LeafItem, StatDataV1, StatDataV2,
    DEH_SIZE, KEY_FORMAT_1, KEY_FORMAT_2,
};
use crate::wire::{
    default_free_or_count, entry_mask, expand_run, implied_offset, mask, record_word,
    WireItemHeader, LEAF_END,
};

/// Decode the rest of a leaf record whose start word and block number have
/// been read, and rebuild the block.
pub fn decode_leaf<R: Read>(
    mut reader: R,
    number:     u32,
    hash_code:  u8,
    block_size: usize,
) -> Result<Vec<u8>, UnpackError> {
    let items = decode_items(&mut reader, number, hash_code, block_size)?;
    build_leaf(block_size, &items).ok_or_else(|| UnpackError::BadLeaf {
        block:  number,
        detail: format!("{} items do not fit in {block_size} bytes", items.len()),
    })
}

/// Decode the items of a leaf record, including its end word.
pub fn decode_items<R: Read>(
    mut reader: R,
    number:     u32,
    hash_code:  u8,
    block_size: usize,
) -> Result<Vec<LeafItem>, UnpackError> {
    let mut dec = ItemDecoder { reader: &mut reader, number, hash_code, block_size };
    let count = dec.u16()?;
    let mut items: Vec<LeafItem> = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let item = dec.item(items.last())?;
        items.push(item);
    }
    let end = dec.u16()?;
    let expected = record_word(LEAF_END, 0);
    if end != expected {
        return Err(UnpackError::MissingEndMagic { block: number, expected, found: end });
    }
    Ok(items)
}

struct ItemDecoder<'r, R: Read> {
    reader:     &'r mut R,
    number:     u32,
    hash_code:  u8,
    block_size: usize,
}

impl<R: Read> ItemDecoder<'_, R> {
    fn u8(&mut self) -> Result<u8, UnpackError> {
        self.reader.read_u8().map_err(UnpackError::from_read)
    }

    fn u16(&mut self) -> Result<u16, UnpackError> {
        self.reader.read_u16::<LittleEndian>().map_err(UnpackError::from_read)
    }

    fn u32(&mut self) -> Result<u32, UnpackError> {
        self.reader.read_u32::<LittleEndian>().map_err(UnpackError::from_read)
    }

    fn u64(&mut self) -> Result<u64, UnpackError> {
        self.reader.read_u64::<LittleEndian>().map_err(UnpackError::from_read)
    }

    fn bad(&self, detail: impl Into<String>) -> UnpackError {
        UnpackError::BadLeaf { block: self.number, detail: detail.into() }
    }

    fn item(&mut self, prev: Option<&LeafItem>) -> Result<LeafItem, UnpackError> {
        let wh = WireItemHeader::read(&mut *self.reader).map_err(UnpackError::from_read)?;
        let m = wh.mask();
        let item_type = wh.item_type();

        let dir_id = match (m & mask::DIR_ID != 0, prev) {
            (true, _)        => self.u32()?,
            (false, Some(p)) => p.head.key.dir_id,
            (false, None)    => {
                return Err(UnpackError::MissingKeyField { block: self.number, field: "dir id" })
            }
        };
        let object_id = match (m & mask::OBJECT_ID != 0, prev) {
            (true, _)        => self.u32()?,
            (false, Some(p)) => p.head.key.object_id,
            (false, None)    => {
                return Err(UnpackError::MissingKeyField { block: self.number, field: "object id" })
            }
        };
        let mut key = Key::new(dir_id, object_id, 0, item_type);
        key.offset = if m & mask::OFFSET_BITS_64 != 0 {
            self.u64()?
        } else if m & mask::OFFSET_BITS_32 != 0 {
            self.u32()? as u64
        } else {
            implied_offset(prev, &key, self.block_size)
        };

        let flags = if m & mask::ITEM_FLAGS != 0 { self.u16()? } else { 0 };
        let key_format = if m & mask::NEW_FORMAT != 0 { KEY_FORMAT_2 } else { KEY_FORMAT_1 };
        let free_or_count = if m & mask::ENTRY_COUNT != 0 {
            self.u16()?
        } else {
            default_free_or_count(item_type)
                .ok_or_else(|| self.bad("directory item without entry count"))?
        };

        let head = ItemHead {
            key,
            free_or_count,
            item_len: wh.item_len(),
            location: 0,
            format:   key_format | (flags << 12),
        };
        let body = self.body(&head, m)?;
        Ok(LeafItem::new(head, body))
    }

    fn body(&mut self, head: &ItemHead, m: u32) -> Result<ItemBody, UnpackError> {
        let len = head.item_len as usize;
        if m & mask::SAFE_LINK != 0 {
            if len != 4 {
                return Err(self.bad(format!("safe link of {len} bytes")));
            }
            return Ok(ItemBody::SafeLink(self.u32()?));
        }
        match head.key.item_type {
            ItemType::Direct => Ok(ItemBody::Direct(len)),
            ItemType::Extent => self.extent(len, m & mask::WHOLE_EXTENT != 0),
            ItemType::Directory => self.directory(head),
            ItemType::StatData if head.key_format() == KEY_FORMAT_2 => self.stat_v2(len, m),
            ItemType::StatData => self.stat_v1(len, m),
            ItemType::Unknown(t) => Err(self.bad(format!("item type {t:#x}"))),
        }
    }

    fn extent(&mut self, len: usize, whole: bool) -> Result<ItemBody, UnpackError> {
        if len % 4 != 0 {
            return Err(self.bad(format!("extent item of {len} bytes")));
        }
        let n = len / 4;
        let mut ptrs = Vec::with_capacity(n);
        if whole {
            for _ in 0..n {
                ptrs.push(self.u32()?);
            }
            return Ok(ItemBody::Extent(ptrs));
        }
        while ptrs.len() < n {
            let first = self.u32()?;
            let run = self.u16()?;
            if run == 0 || ptrs.len() + run as usize > n {
                return Err(self.bad(format!("extent run of {run} with {} of {n} pointers decoded", ptrs.len())));
            }
            expand_run(first, run, &mut ptrs);
        }
        Ok(ItemBody::Extent(ptrs))
    }

    fn directory(&mut self, head: &ItemHead) -> Result<ItemBody, UnpackError> {
        let hash = HashCode::from_code(self.hash_code as u32)
            .ok_or(UnpackError::UnknownHash(self.hash_code))?;
        let count = head.free_or_count as usize;
        let mut entries = Vec::with_capacity(count);
        let mut used = count * DEH_SIZE;

        for _ in 0..count {
            let em = self.u8()?;
            let slot_len = self.u16()? as usize;
            let mut name = vec![0u8; slot_len];
            self.reader.read_exact(&mut name).map_err(UnpackError::from_read)?;
            let object_id = self.u32()?;
            let dir_id = if em & entry_mask::HAS_DIR_ID != 0 { self.u32()? } else { head.key.object_id };
            let gen = if em & entry_mask::HAS_GEN_COUNTER != 0 { self.u16()? } else { 0 };
            let state = if em & entry_mask::HAS_STATE != 0 { self.u16()? } else { DEFAULT_DEH_STATE };

            let offset = hash
                .entry_offset(trim_name(&name), gen as u32)
                .ok_or_else(|| self.bad(format!("directory entries under hash {}", hash.name())))?;
            used += slot_len;
            entries.push(DirEntry {
                head: DirEntryHead { offset, dir_id, object_id, location: 0, state },
                name,
            });
        }
        if used != head.item_len as usize {
            return Err(self.bad(format!("directory of {used} bytes, header says {}", head.item_len)));
        }
        Ok(ItemBody::Directory(entries))
    }

    fn stat_v1(&mut self, len: usize, m: u32) -> Result<ItemBody, UnpackError> {
        if len != SD_V1_SIZE {
            return Err(self.bad(format!("v1 stat data of {len} bytes")));
        }
        let mut sd = StatDataV1 {
            mode:              self.u16()?,
            nlink:             self.u16()?,
            size:              self.u32()?,
            rdev_or_blocks:    self.u32()?,
            first_direct_byte: NO_FIRST_DIRECT_BYTE,
            ..Default::default()
        };
        if m & mask::SD_FIRST_DIRECT_BYTE != 0 {
            sd.first_direct_byte = self.u32()?;
        }
        if m & mask::SD_ATTRS != 0 {
            sd.uid = self.u16()?;
            sd.gid = self.u16()?;
            sd.atime = self.u32()?;
            sd.mtime = self.u32()?;
            sd.ctime = self.u32()?;
        }
        Ok(ItemBody::StatV1(sd))
    }

    fn stat_v2(&mut self, len: usize, m: u32) -> Result<ItemBody, UnpackError> {
        if len != SD_V2_SIZE {
            return Err(self.bad(format!("v2 stat data of {len} bytes")));
        }
        let mode = self.u16()?;
        let nlink = if m & mask::NLINK_BITS_32 != 0 { self.u32()? } else { self.u16()? as u32 };
        let size = if m & mask::SIZE_BITS_64 != 0 { self.u64()? } else { self.u32()? as u64 };
        let mut sd = StatDataV2 { mode, nlink, size, blocks: self.u32()?, ..Default::default() };
        if m & mask::SD_ATTRS != 0 {
            sd.attrs = self.u16()?;
            sd.uid = self.u32()?;
            sd.gid = self.u32()?;
            sd.atime = self.u32()?;
            sd.mtime = self.u32()?;
            sd.ctime = self.u32()?;
            sd.rdev_or_generation = self.u32()?;
        }
        Ok(ItemBody::StatV2(sd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ondisk::item::DIRECT_FILLER;
    use crate::ondisk::{LeafView, UNUSED_FREE_SPACE};
    use crate::pack::encode_leaf;
    use crate::validate::{check_leaf, StructuralValidator};
    use byteorder::WriteBytesExt;

    const BS: usize = 4096;

    fn head(dir: u32, obj: u32, off: u64, t: ItemType, len: u16, fmt: u16) -> ItemHead {
        ItemHead {
            key:           Key::new(dir, obj, off, t),
            free_or_count: if t == ItemType::Extent { 0 } else { UNUSED_FREE_SPACE },
            item_len:      len,
            location:      0,
            format:        fmt,
        }
    }

    fn sd_v1(dir: u32, obj: u32) -> LeafItem {
        LeafItem::new(
            head(dir, obj, 0, ItemType::StatData, SD_V1_SIZE as u16, KEY_FORMAT_1),
            ItemBody::StatV1(StatDataV1 {
                mode: 0o100644, nlink: 1, size: 10, uid: 1000, gid: 100,
                mtime: 1_700_000_000, first_direct_byte: 1, ..Default::default()
            }),
        )
    }

    /// Encode, then decode past the start word and block number.
    fn round_trip(items: &[LeafItem], hash: HashCode) -> Vec<LeafItem> {
        let mut wire = Vec::new();
        encode_leaf(&mut wire, 9, items, hash, BS).unwrap();
        decode_items(&wire[6..], 9, hash.code(), BS).unwrap()
    }

    /// Items as they read back from a laid-out leaf, locations filled in.
    fn canonical(items: &[LeafItem]) -> Vec<LeafItem> {
        let data = build_leaf(BS, items).unwrap();
        LeafItem::parse_all(&LeafView::new(&data).unwrap()).unwrap()
    }

    #[test]
    fn worked_example_reconstructs_ids_and_offsets() {
        let items = vec![
            LeafItem::new(head(5, 100, 1, ItemType::StatData, 32, KEY_FORMAT_1), sd_v1(5, 100).body),
            LeafItem::new(head(5, 100, 1, ItemType::Direct, 10, KEY_FORMAT_1), ItemBody::Direct(10)),
            LeafItem::new(head(5, 101, 1, ItemType::StatData, 32, KEY_FORMAT_1), sd_v1(5, 101).body),
        ];
        let back = round_trip(&items, HashCode::R5);
        assert_eq!(back, items);
    }

    #[test]
    fn extent_runs_decode_back() {
        let ptrs = vec![10, 11, 12, 0, 0, 50];
        let items = vec![
            sd_v1(1, 2),
            LeafItem::new(head(1, 2, 1, ItemType::Extent, 24, KEY_FORMAT_1), ItemBody::Extent(ptrs)),
            LeafItem::new(
                head(1, 2, 1 + 6 * BS as u64, ItemType::Direct, 7, KEY_FORMAT_1),
                ItemBody::Direct(7),
            ),
        ];
        assert_eq!(round_trip(&items, HashCode::R5), items);
    }

    #[test]
    fn whole_extent_rebuilds_the_block() {
        let ptrs = vec![7, 8, 0, 0, 3, u32::MAX];
        let items = vec![
            sd_v1(1, 2),
            LeafItem::new(head(1, 2, 1, ItemType::Extent, 24, KEY_FORMAT_1), ItemBody::Extent(ptrs)),
            LeafItem::new(
                head(1, 2, 1 + 6 * BS as u64, ItemType::Direct, 3, KEY_FORMAT_1),
                ItemBody::Direct(3),
            ),
        ];
        let data = build_leaf(BS, &items).unwrap();
        let checked = check_leaf(&data, &StructuralValidator::new(Some(HashCode::R5))).unwrap();

        let mut wire = Vec::new();
        encode_leaf(&mut wire, 9, &checked, HashCode::R5, BS).unwrap();
        assert_eq!(decode_leaf(&wire[6..], 9, HashCode::R5.code(), BS).unwrap(), data);
        assert_eq!(round_trip(&items, HashCode::R5), items);
    }

    #[test]
    fn rebuilt_leaf_matches_source_except_tail_bytes() {
        let items = vec![
            sd_v1(3, 4),
            LeafItem::new(head(3, 4, 1, ItemType::Direct, 5, KEY_FORMAT_1), ItemBody::Direct(5)),
        ];
        let mut wire = Vec::new();
        encode_leaf(&mut wire, 9, &items, HashCode::R5, BS).unwrap();
        let data = decode_leaf(&wire[6..], 9, HashCode::R5.code(), BS).unwrap();
        assert_eq!(data, build_leaf(BS, &items).unwrap());

        let view = LeafView::new(&data).unwrap();
        let tail = view.item_head(1);
        assert_eq!(view.body(&tail).unwrap(), &[DIRECT_FILLER; 5]);
    }

    #[test]
    fn directory_entries_round_trip() {
        let hash = HashCode::R5;
        let names: [&[u8]; 4] = [b".", b"..", b"hello", b"collides"];
        let mut entries = Vec::new();
        for (i, n) in names.iter().enumerate() {
            let mut slot = n.to_vec();
            slot.resize((n.len() + 7) & !7, 0);
            let gen = if i == 3 { 2 } else { 0 };
            entries.push(DirEntry {
                head: DirEntryHead {
                    offset:    hash.entry_offset(n, gen).unwrap(),
                    dir_id:    if i == 1 { 1 } else { 2 },
                    object_id: 10 + i as u32,
                    location:  0,
                    state:     if i == 2 { 0 } else { DEFAULT_DEH_STATE },
                },
                name: slot,
            });
        }
        let len: usize = entries.iter().map(|e| DEH_SIZE + e.name.len()).sum();
        let mut h = head(1, 2, 1, ItemType::Directory, len as u16, KEY_FORMAT_1);
        h.free_or_count = entries.len() as u16;
        let items = canonical(&[sd_v1(1, 2), LeafItem::new(h, ItemBody::Directory(entries))]);

        assert_eq!(canonical(&round_trip(&items, hash)), items);
    }

    #[test]
    fn v2_stat_data_with_wide_fields() {
        let sd = StatDataV2 {
            mode: 0o40755, nlink: 70_000, size: 1 << 40, blocks: 9,
            uid: 1 << 20, rdev_or_generation: 3, ..Default::default()
        };
        let mut h = head(1, 2, 0, ItemType::StatData, SD_V2_SIZE as u16, KEY_FORMAT_2);
        h.format |= 0x3 << 12;
        let items = vec![LeafItem::new(h, ItemBody::StatV2(sd))];
        assert_eq!(round_trip(&items, HashCode::Tea), items);
    }

    #[test]
    fn safe_link_round_trips() {
        let items = vec![LeafItem::new(
            head(u32::MAX, 44, 1, ItemType::Direct, 4, KEY_FORMAT_1),
            ItemBody::SafeLink(1234),
        )];
        assert_eq!(round_trip(&items, HashCode::R5), items);
    }

    #[test]
    fn first_item_without_ids_is_fatal() {
        let mut wire = Vec::new();
        wire.write_u16::<LittleEndian>(1).unwrap();
        WireItemHeader::new(ItemType::Direct, mask::OBJECT_ID, 4).unwrap().write(&mut wire).unwrap();
        wire.write_u32::<LittleEndian>(7).unwrap();
        let err = decode_items(&wire[..], 3, 0, BS).unwrap_err();
        assert!(matches!(err, UnpackError::MissingKeyField { block: 3, field: "dir id" }));
    }

    #[test]
    fn overlong_extent_run_is_rejected() {
        let mut wire = Vec::new();
        wire.write_u16::<LittleEndian>(1).unwrap();
        WireItemHeader::new(ItemType::Extent, mask::DIR_ID | mask::OBJECT_ID, 8)
            .unwrap()
            .write(&mut wire)
            .unwrap();
        wire.write_u32::<LittleEndian>(1).unwrap();
        wire.write_u32::<LittleEndian>(2).unwrap();
        wire.write_u32::<LittleEndian>(100).unwrap();
        wire.write_u16::<LittleEndian>(3).unwrap();
        let err = decode_items(&wire[..], 3, 0, BS).unwrap_err();
        assert!(matches!(err, UnpackError::BadLeaf { block: 3, .. }));
    }

    #[test]
    fn missing_leaf_end_is_fatal() {
        let mut wire = Vec::new();
        wire.write_u16::<LittleEndian>(0).unwrap();
        wire.write_u16::<LittleEndian>(record_word(crate::wire::END, 0)).unwrap();
        let err = decode_items(&wire[..], 5, 0, BS).unwrap_err();
        assert!(matches!(err, UnpackError::MissingEndMagic { block: 5, .. }));
    }

    #[test]
    fn short_stream_is_truncated() {
        let err = decode_items(&[1u8, 0][..], 5, 0, BS).unwrap_err();
        assert!(matches!(err, UnpackError::Truncated));
    }
}
