//! Leaf validity gate.
//!
//! A leaf is only worth packing item by item if the unpacker can rebuild it
//! exactly from the compact form.  The gate checks the leaf layout itself
//! (head free space, end-to-front item placement, item lengths that fit the
//! wire header) and then asks an [`ItemValidator`] about every item.  Any
//! failure sends the whole block out verbatim.
//!
//! The gate has no side effects: the same block and validator always give
//! the same answer.

use crate::hash::{trim_name, HashCode, GENERATION_MASK};
use crate::ondisk::{
    leaf_free_space, ItemBody, LeafItem, LeafView, BLKH_SIZE, IH_SIZE, KEY_FORMAT_2,
};
use crate::wire::MAX_WIRE_ITEM_LEN;

/// Per-item correctness predicate.
pub trait ItemValidator {
    fn check_item(&self, item: &LeafItem) -> Result<(), String>;
}

/// Why a leaf was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    /// Offending item, if the problem is item-specific.
    pub item:   Option<usize>,
    pub reason: String,
}

impl Rejection {
    fn leaf(reason: impl Into<String>) -> Self {
        Self { item: None, reason: reason.into() }
    }

    fn item(i: usize, reason: impl Into<String>) -> Self {
        Self { item: Some(i), reason: reason.into() }
    }
}

/// Run the gate and hand back the decoded items on success.
pub fn check_leaf<V: ItemValidator + ?Sized>(
    data:      &[u8],
    validator: &V,
) -> Result<Vec<LeafItem>, Rejection> {
    let leaf = LeafView::new(data).ok_or_else(|| Rejection::leaf("item head array overflows block"))?;
    let heads: Vec<_> = leaf.item_heads().collect();

    let expected_free = leaf_free_space(data.len(), heads.iter().map(|h| h.item_len as usize))
        .ok_or_else(|| Rejection::leaf("items overflow block"))?;
    if leaf.head.free_space != expected_free {
        return Err(Rejection::leaf(format!(
            "free space {} but items leave {}",
            leaf.head.free_space, expected_free
        )));
    }

    let mut end = data.len();
    for (i, ih) in heads.iter().enumerate() {
        if ih.item_len as usize > MAX_WIRE_ITEM_LEN {
            return Err(Rejection::item(i, format!("length {} exceeds wire limit", ih.item_len)));
        }
        let start = end - ih.item_len as usize;
        if ih.location as usize != start {
            return Err(Rejection::item(i, format!("at {} instead of {}", ih.location, start)));
        }
        end = start;
    }
    debug_assert!(end >= BLKH_SIZE + heads.len() * IH_SIZE);

    let items = LeafItem::parse_all(&leaf).map_err(|(i, e)| Rejection::item(i, e))?;
    for (i, item) in items.iter().enumerate() {
        validator.check_item(item).map_err(|e| Rejection::item(i, e))?;
    }
    Ok(items)
}

/// `true` iff [`check_leaf`] accepts the block.
pub fn can_pack_leaf<V: ItemValidator + ?Sized>(data: &[u8], validator: &V) -> bool {
    check_leaf(data, validator).is_ok()
}

// ── Default validator ────────────────────────────────────────────────────────

/// Key sanity, directory hashing and extent pointer plausibility.
#[derive(Debug, Clone, Copy)]
pub struct StructuralValidator {
    pub hash:        Option<HashCode>,
    /// When set, extent pointers must fall below this block count.  Packing
    /// runs offline against an image, so this is normally left unset.
    pub block_count: Option<u32>,
}

impl StructuralValidator {
    pub fn new(hash: Option<HashCode>) -> Self {
        Self { hash, block_count: None }
    }

    pub fn with_range_check(mut self, block_count: u32) -> Self {
        self.block_count = Some(block_count);
        self
    }
}

impl ItemValidator for StructuralValidator {
    fn check_item(&self, item: &LeafItem) -> Result<(), String> {
        let head = &item.head;
        if head.key_format() > KEY_FORMAT_2 {
            return Err(format!("key format {}", head.key_format()));
        }
        if head.key.dir_id == 0 || head.key.object_id == 0 {
            return Err(format!("null key id ({}, {})", head.key.dir_id, head.key.object_id));
        }

        match &item.body {
            ItemBody::Directory(entries) => {
                let hash = self.hash
                    .filter(|h| *h != HashCode::Unset)
                    .ok_or("directory item but the hash function is unknown")?;
                for (i, e) in entries.iter().enumerate() {
                    let gen = e.head.offset & GENERATION_MASK;
                    let want = hash.entry_offset(trim_name(&e.name), gen);
                    if want != Some(e.head.offset) {
                        return Err(format!(
                            "entry {i}: offset {:#x} does not match {} hash",
                            e.head.offset,
                            hash.name()
                        ));
                    }
                    if e.head.object_id == 0 {
                        return Err(format!("entry {i}: null object id"));
                    }
                }
            }
            ItemBody::Extent(ptrs) => {
                if let Some(total) = self.block_count {
                    if let Some(p) = ptrs.iter().find(|&&p| p >= total) {
                        return Err(format!("pointer {p} beyond {total} blocks"));
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}
