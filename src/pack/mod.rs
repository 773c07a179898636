//! Pack side: read a reiserfs image and write the metadata stream.
//!
//! # Order
//! 1. Stream header.
//! 2. Frozen data, always as full blocks: the superblock, every bitmap
//!    block, then the journal (wrapped in separated-journal markers when it
//!    lives on its own device).
//! 3. Every block still set in the caller's bitmap, ascending: leaves that
//!    pass the validity gate as compact leaf records, everything else that
//!    is recognisable as full blocks.
//! 4. Optionally the bitmap of unformatted blocks referenced by extents.
//! 5. The end record.
//!
//! A bit is cleared as soon as its block has gone out, so a block that is
//! both frozen data and in the bulk range is sent once.
//!
//! # Failure policy
//! A block that cannot be read is logged, counted and skipped.  Errors
//! writing the stream abort the run.

pub mod leaf;

use byteorder::{LittleEndian, WriteBytesExt};
use std::io::Write;
use tracing::{debug, info, warn};

use crate::bitmap::Bitmap;
use crate::device::BlockDevice;
use crate::error::PackError;
use crate::hash::HashCode;
use crate::ondisk::{classify, BlockKind, ItemBody, LeafItem, Superblock};
use crate::options::PackOptions;
use crate::stats::PackStats;
use crate::validate::{check_leaf, ItemValidator, StructuralValidator};
use crate::wire::{
    record_word, write_full_block, write_stream_header, END, SEPARATED_JOURNAL_END,
    SEPARATED_JOURNAL_START, UNFORMATTED_BITMAP,
};

pub use leaf::{encode_leaf, LeafEncodeError};

/// Progress callback: `(blocks done, blocks total)`.  Progress is reported
/// here and never written into the stream.
pub type ProgressFn<'a> = dyn FnMut(u64, u64) + 'a;

pub struct Packer<'a, W: Write> {
    pub superblock: Superblock,
    device:         &'a mut dyn BlockDevice,
    journal:        Option<&'a mut dyn BlockDevice>,
    writer:         W,
    opts:           PackOptions,
    validator:      Box<dyn ItemValidator + 'a>,
    hash:           HashCode,
    /// Blocks referenced by extents of packed leaves.
    unformatted:    Option<Bitmap>,
    progress:       Option<Box<ProgressFn<'a>>>,
}

impl<'a, W: Write> Packer<'a, W> {
    /// Read the superblock of `device`.  Nothing is written yet.
    pub fn new(device: &'a mut dyn BlockDevice, writer: W, opts: PackOptions) -> Result<Self, PackError> {
        let superblock = Superblock::read(&mut *device)?;
        let hash = superblock.hash().unwrap_or_else(|| {
            warn!(code = superblock.hash_code, "unknown hash code, directory leaves go out whole");
            HashCode::Unset
        });
        let mut validator = StructuralValidator::new(Some(hash));
        if opts.check_ranges {
            validator = validator.with_range_check(superblock.block_count);
        }
        let unformatted = opts.emit_unformatted_bitmap.then(|| Bitmap::new(superblock.block_count));
        info!(
            blocks = superblock.block_count,
            block_size = superblock.block_size,
            hash = hash.name(),
            "opened filesystem"
        );
        Ok(Self {
            device,
            journal: None,
            writer,
            superblock,
            opts,
            validator: Box::new(validator),
            hash,
            unformatted,
            progress: None,
        })
    }

    /// Device holding a journal that lives outside the filesystem device.
    pub fn with_journal(mut self, journal: &'a mut dyn BlockDevice) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn with_validator<V: ItemValidator + 'a>(mut self, validator: V) -> Self {
        self.validator = Box::new(validator);
        self
    }

    pub fn with_progress<F: FnMut(u64, u64) + 'a>(mut self, f: F) -> Self {
        self.progress = Some(Box::new(f));
        self
    }

    pub fn block_size(&self) -> usize {
        self.superblock.block_size as usize
    }

    /// Run the whole pass over the blocks set in `to_pack` and hand back the
    /// statistics and the writer.
    pub fn pack(mut self, mut to_pack: Bitmap) -> Result<(PackStats, W), PackError> {
        let sb = &self.superblock;
        if sb.journal_on_separate_device() && self.journal.is_none() {
            if !self.opts.allow_missing_journal {
                return Err(PackError::JournalDeviceMissing { dev: sb.journal.dev });
            }
            warn!(dev = sb.journal.dev, "journal device not supplied, packing without journal");
        }

        let mut stats = PackStats::default();
        write_stream_header(&mut self.writer, sb.block_size)?;
        self.pack_frozen_data(&mut to_pack, &mut stats)?;
        self.pack_partition(&mut to_pack, &mut stats)?;
        if let Some(bm) = self.unformatted.take() {
            self.writer.write_u16::<LittleEndian>(record_word(UNFORMATTED_BITMAP, 0))?;
            self.writer.write_u32::<LittleEndian>(bm.as_bytes().len() as u32)?;
            self.writer.write_all(bm.as_bytes())?;
            debug!(blocks = bm.count_ones(), "unformatted bitmap sent");
        }
        self.writer.write_u16::<LittleEndian>(record_word(END, 0))?;
        self.writer.flush()?;

        info!("{}", stats.summary());
        Ok((stats, self.writer))
    }

    // ── Frozen data ──────────────────────────────────────────────────────────

    /// Superblock, bitmaps, journal.  All go out whole, in that order.
    pub fn pack_frozen_data(&mut self, to_pack: &mut Bitmap, stats: &mut PackStats) -> Result<(), PackError> {
        let sb_block = self.superblock.location;
        self.send_from_device(sb_block, stats)?;
        to_pack.clear(sb_block);

        for nr in self.superblock.bitmap_blocks() {
            self.send_from_device(nr, stats)?;
            to_pack.clear(nr);
        }

        let journal = self.superblock.journal_blocks();
        if !self.superblock.journal_on_separate_device() {
            for nr in journal {
                self.send_from_device(nr, stats)?;
                to_pack.clear(nr);
            }
            return Ok(());
        }

        let bs = self.block_size();
        let Some(jdev) = self.journal.as_deref_mut() else {
            return Ok(());
        };
        let name = self.opts.journal_name.clone().unwrap_or_default();
        self.writer.write_u16::<LittleEndian>(record_word(SEPARATED_JOURNAL_START, 0))?;
        self.writer.write_u16::<LittleEndian>(name.len() as u16)?;
        self.writer.write_all(name.as_bytes())?;
        for nr in journal {
            match jdev.read_block(nr, bs) {
                Ok(block) => {
                    let n = write_full_block(&mut self.writer, nr, &block.data)?;
                    stats.full_blocks += 1;
                    stats.sent(n, bs);
                }
                Err(e) => {
                    warn!(block = nr, error = %e, "cannot read journal block");
                    stats.read_errors += 1;
                }
            }
        }
        self.writer.write_u16::<LittleEndian>(record_word(SEPARATED_JOURNAL_END, 0))?;
        Ok(())
    }

    fn send_from_device(&mut self, nr: u32, stats: &mut PackStats) -> Result<(), PackError> {
        let bs = self.block_size();
        match self.device.read_block(nr, bs) {
            Ok(block) => {
                let n = write_full_block(&mut self.writer, nr, &block.data)?;
                stats.full_blocks += 1;
                stats.sent(n, bs);
            }
            Err(e) => {
                warn!(block = nr, error = %e, "cannot read block");
                stats.read_errors += 1;
            }
        }
        Ok(())
    }

    // ── Bulk range ───────────────────────────────────────────────────────────

    /// Send every block still set in `to_pack`, clearing bits as it goes.
    pub fn pack_partition(&mut self, to_pack: &mut Bitmap, stats: &mut PackStats) -> Result<(), PackError> {
        let total = to_pack.count_ones() as u64;
        let bs = self.block_size();
        let mut done = 0u64;
        let mut cursor = 0u32;

        while let Some(nr) = to_pack.next_set(cursor) {
            cursor = nr + 1;
            to_pack.clear(nr);
            done += 1;

            match self.device.read_block(nr, bs) {
                Ok(block) => self.dispatch(nr, &block.data, stats)?,
                Err(e) => {
                    warn!(block = nr, error = %e, "cannot read block");
                    stats.read_errors += 1;
                }
            }
            if let Some(progress) = self.progress.as_mut() {
                progress(done, total);
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, nr: u32, data: &[u8], stats: &mut PackStats) -> Result<(), PackError> {
        match classify(data, nr, Some(&self.superblock)) {
            BlockKind::Leaf => self.send_leaf(nr, data, stats),
            BlockKind::Internal => {
                // internal nodes are never compacted
                stats.internals += 1;
                self.send_full(nr, data, stats)
            }
            BlockKind::AmbiguousLeaf => {
                debug!(block = nr, "leaf head inconsistent, sending whole");
                self.send_full(nr, data, stats)
            }
            BlockKind::Super | BlockKind::Bitmap | BlockKind::JournalDescriptor => {
                self.send_full(nr, data, stats)
            }
            BlockKind::Unknown if self.opts.pack_unknown => self.send_full(nr, data, stats),
            BlockKind::Unknown => {
                stats.skipped += 1;
                Ok(())
            }
        }
    }

    fn send_leaf(&mut self, nr: u32, data: &[u8], stats: &mut PackStats) -> Result<(), PackError> {
        let items = match check_leaf(data, self.validator.as_ref()) {
            Ok(items) => items,
            Err(rej) => {
                debug!(block = nr, item = ?rej.item, reason = %rej.reason, "leaf refused by gate");
                stats.bad_leaves += 1;
                return self.send_full(nr, data, stats);
            }
        };

        match encode_leaf(&mut self.writer, nr, &items, self.hash, data.len()) {
            Ok(n) => {
                stats.leaves += 1;
                stats.sent(n, data.len());
                self.note_unformatted(&items);
                Ok(())
            }
            Err(LeafEncodeError::Io(e)) => Err(e.into()),
            Err(e) => {
                debug!(block = nr, error = %e, "leaf not encodable, sending whole");
                self.send_full(nr, data, stats)
            }
        }
    }

    fn send_full(&mut self, nr: u32, data: &[u8], stats: &mut PackStats) -> Result<(), PackError> {
        let n = write_full_block(&mut self.writer, nr, data)?;
        stats.full_blocks += 1;
        stats.sent(n, data.len());
        Ok(())
    }

    fn note_unformatted(&mut self, items: &[LeafItem]) {
        let Some(bm) = self.unformatted.as_mut() else { return };
        for item in items {
            if let ItemBody::Extent(ptrs) = &item.body {
                for &p in ptrs.iter().filter(|&&p| p != 0) {
                    bm.set(p);
                }
            }
        }
    }
}
