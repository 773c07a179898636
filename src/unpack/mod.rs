//! Unpack side: replay a metadata stream onto a target device.
//!
//! The unpacker is a small state machine over the record tags:
//!
//! ```text
//! ReadHeader ─▶ ReadTag ─┬▶ InLeaf ─────────────┐
//!                        ├▶ InFullBlock ────────┤
//!                        ├▶ InSeparatedJournal ─┤
//!                        ├▶ (skip bitmap) ──────┤
//!                        └▶ Done                │
//!                  ▲                            │
//!                  └────────────────────────────┘
//! ```
//!
//! Stream-format violations end the run with an error.  A block that cannot
//! be written is logged, counted and skipped.

pub mod leaf;

use byteorder::{LittleEndian, ReadBytesExt};
use std::fs::File;
use std::io::{self, BufWriter, Read};
use tracing::{debug, info, warn};

use crate::bitmap::Bitmap;
use crate::device::{Block, BlockDevice};
use crate::error::UnpackError;
use crate::ondisk::Superblock;
use crate::options::UnpackOptions;
use crate::stats::UnpackStats;
use crate::wire::{
    read_full_block_body, record_word, FullBlockHeader, END, FULL_BLOCK_END, FULL_BLOCK_START,
    LEAF_START, SEPARATED_JOURNAL_END, SEPARATED_JOURNAL_START, STREAM_MAGIC, UNFORMATTED_BITMAP,
};

pub use leaf::{decode_items, decode_leaf};

/// Smallest block size a stream may declare.
pub const MIN_BLOCK_SIZE: u16 = 512;

/// What a finished run hands back.
#[derive(Debug)]
pub struct UnpackReport {
    pub stats:    UnpackStats,
    /// Every block written to the target device; `None` if the stream never
    /// carried a superblock to size it.
    pub restored: Option<Bitmap>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    ReadHeader,
    ReadTag,
    InLeaf { hash_code: u8 },
    InFullBlock,
    InSeparatedJournal,
    Done,
}

/// Counts bytes consumed so errors can point at a stream offset.
struct Tracked<R> {
    inner: R,
    pos:   u64,
}

impl<R: Read> Read for Tracked<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

pub struct StreamUnpacker<'a, R: Read> {
    reader:     Tracked<R>,
    device:     &'a mut dyn BlockDevice,
    journal:    Option<&'a mut dyn BlockDevice>,
    opts:       UnpackOptions,
    block_size: usize,
    /// Full blocks currently go to the journal device.
    in_journal: bool,
    restored:   Option<Bitmap>,
    stats:      UnpackStats,
}

impl<'a, R: Read> StreamUnpacker<'a, R> {
    pub fn new(reader: R, device: &'a mut dyn BlockDevice, opts: UnpackOptions) -> Self {
        Self {
            reader: Tracked { inner: reader, pos: 0 },
            device,
            journal: None,
            opts,
            block_size: 0,
            in_journal: false,
            restored: None,
            stats: UnpackStats::default(),
        }
    }

    /// Destination for blocks inside separated-journal markers.
    pub fn with_journal(mut self, journal: &'a mut dyn BlockDevice) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn run(mut self) -> Result<UnpackReport, UnpackError> {
        let mut state = State::ReadHeader;
        while state != State::Done {
            state = match state {
                State::ReadHeader         => self.read_header()?,
                State::ReadTag            => self.read_tag()?,
                State::InLeaf { hash_code } => self.read_leaf(hash_code)?,
                State::InFullBlock        => self.read_full_block()?,
                State::InSeparatedJournal => self.read_journal_marker()?,
                State::Done               => State::Done,
            };
        }

        info!("{}", self.stats.summary());
        if let (Some(path), Some(bm)) = (self.opts.bitmap_out.as_ref(), self.restored.as_ref()) {
            let mut out = BufWriter::new(File::create(path)?);
            bm.save(&mut out)?;
            debug!(path = %path.display(), blocks = bm.count_ones(), "saved restored-block bitmap");
        }
        Ok(UnpackReport { stats: self.stats, restored: self.restored })
    }

    fn u16(&mut self) -> Result<u16, UnpackError> {
        self.reader.read_u16::<LittleEndian>().map_err(UnpackError::from_read)
    }

    fn u32(&mut self) -> Result<u32, UnpackError> {
        self.reader.read_u32::<LittleEndian>().map_err(UnpackError::from_read)
    }

    // ── States ───────────────────────────────────────────────────────────────

    fn read_header(&mut self) -> Result<State, UnpackError> {
        let magic = self.u32()?;
        if magic != STREAM_MAGIC {
            return Err(UnpackError::BadStreamMagic { found: magic });
        }
        let bs = self.u16()?;
        if bs < MIN_BLOCK_SIZE || !bs.is_power_of_two() {
            return Err(UnpackError::BadBlockSize(bs));
        }
        self.block_size = bs as usize;
        debug!(block_size = bs, "stream header ok");
        Ok(State::ReadTag)
    }

    /// Read the next record word, skipping legacy progress characters.
    fn read_tag(&mut self) -> Result<State, UnpackError> {
        let word = loop {
            let lo = self.reader.read_u8().map_err(UnpackError::from_read)?;
            if lo == b'.' {
                self.stats.progress_bytes += 1;
                continue;
            }
            if lo.is_ascii_digit() {
                self.reader.read_u8().map_err(UnpackError::from_read)?;
                self.stats.progress_bytes += 2;
                continue;
            }
            let hi = self.reader.read_u8().map_err(UnpackError::from_read)?;
            break u16::from_le_bytes([lo, hi]);
        };

        let [tag, high] = word.to_le_bytes();
        Ok(match tag {
            LEAF_START              => State::InLeaf { hash_code: high },
            FULL_BLOCK_START        => State::InFullBlock,
            SEPARATED_JOURNAL_START => State::InSeparatedJournal,
            SEPARATED_JOURNAL_END   => {
                debug!("separated journal ends");
                self.in_journal = false;
                State::ReadTag
            }
            UNFORMATTED_BITMAP      => {
                let len = self.u32()? as u64;
                let skipped = io::copy(&mut (&mut self.reader).take(len), &mut io::sink())?;
                if skipped != len {
                    return Err(UnpackError::Truncated);
                }
                State::ReadTag
            }
            END                     => State::Done,
            _ => {
                let pos = self.reader.pos - 2;
                warn!(word = %hex::encode(word.to_le_bytes()), pos, "unknown record tag");
                return Err(UnpackError::UnknownTag { tag: word, pos });
            }
        })
    }

    fn read_leaf(&mut self, hash_code: u8) -> Result<State, UnpackError> {
        let number = self.u32()?;
        let data = decode_leaf(&mut self.reader, number, hash_code, self.block_size)?;
        if self.write(Block::new(number, data), false) {
            self.stats.leaves += 1;
        }
        Ok(State::ReadTag)
    }

    fn read_full_block(&mut self) -> Result<State, UnpackError> {
        let header = FullBlockHeader::read_after_tag(record_word(FULL_BLOCK_START, 0), &mut self.reader)
            .map_err(UnpackError::from_read)?;
        let number = header.number;
        let (data, end) = read_full_block_body(&mut self.reader, self.block_size)
            .map_err(UnpackError::from_read)?;
        let expected = record_word(FULL_BLOCK_END, 0);
        if end != expected {
            return Err(UnpackError::MissingEndMagic { block: number, expected, found: end });
        }

        if self.in_journal {
            if self.journal.is_none() {
                self.stats.journal_skipped += 1;
                return Ok(State::ReadTag);
            }
            if self.write(Block::new(number, data), true) {
                self.stats.journal_blocks += 1;
            }
            return Ok(State::ReadTag);
        }

        if self.restored.is_none() && Superblock::has_magic(&data) {
            match Superblock::parse(&data, number as u64 * self.block_size as u64) {
                Ok(sb) => {
                    info!(blocks = sb.block_count, block = number, "superblock restored");
                    self.restored = Some(Bitmap::new(sb.block_count));
                }
                Err(e) => warn!(block = number, error = %e, "superblock magic without a usable superblock"),
            }
        }
        if self.write(Block::new(number, data), false) {
            self.stats.full_blocks += 1;
        }
        Ok(State::ReadTag)
    }

    fn read_journal_marker(&mut self) -> Result<State, UnpackError> {
        let len = self.u16()? as usize;
        let mut name = vec![0u8; len];
        self.reader.read_exact(&mut name).map_err(UnpackError::from_read)?;
        let name = String::from_utf8_lossy(&name);
        if self.journal.is_none() {
            warn!(journal = %name, "no journal device given, its blocks are dropped");
        } else {
            debug!(journal = %name, "separated journal starts");
        }
        self.in_journal = true;
        Ok(State::ReadTag)
    }

    // ── Output ───────────────────────────────────────────────────────────────

    /// Write one block.  Failures are logged and counted, never returned.
    fn write(&mut self, block: Block, journal: bool) -> bool {
        let number = block.number;
        let target: &mut dyn BlockDevice = match (journal, self.journal.as_deref_mut()) {
            (true, Some(j)) => j,
            _ => &mut *self.device,
        };
        if let Err(e) = target.write_block(&block) {
            warn!(block = number, journal, error = %e, "cannot write block");
            self.stats.write_errors += 1;
            return false;
        }
        if !journal {
            if let Some(bm) = self.restored.as_mut() {
                bm.set(number);
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::ImageDevice;
    use crate::wire::{write_full_block, write_stream_header};
    use byteorder::WriteBytesExt;
    use std::io::Cursor;

    const BS: usize = 1024;

    fn image(blocks: usize) -> ImageDevice<Cursor<Vec<u8>>> {
        ImageDevice::new(Cursor::new(vec![0u8; blocks * BS]))
    }

    fn stream(body: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
        let mut s = Vec::new();
        write_stream_header(&mut s, BS as u16).unwrap();
        body(&mut s);
        s.write_u16::<LittleEndian>(record_word(END, 0)).unwrap();
        s
    }

    #[test]
    fn full_blocks_land_at_their_numbers() {
        let s = stream(|s| {
            write_full_block(&mut *s, 2, &[0xaa; BS]).unwrap();
        });
        let mut dev = image(4);
        let report = StreamUnpacker::new(&s[..], &mut dev, UnpackOptions::default()).run().unwrap();
        assert_eq!(report.stats.full_blocks, 1);
        assert!(report.restored.is_none());
        let img = dev.into_inner().into_inner();
        assert!(img[2 * BS..3 * BS].iter().all(|&b| b == 0xaa));
        assert!(img[..2 * BS].iter().all(|&b| b == 0));
    }

    #[test]
    fn progress_characters_are_skipped() {
        let s = stream(|s| {
            s.extend_from_slice(b"..42");
            write_full_block(&mut *s, 1, &[1; BS]).unwrap();
            s.extend_from_slice(b"9%.");
        });
        let mut dev = image(2);
        let report = StreamUnpacker::new(&s[..], &mut dev, UnpackOptions::default()).run().unwrap();
        assert_eq!(report.stats.full_blocks, 1);
        assert_eq!(report.stats.progress_bytes, 7);
    }

    #[test]
    fn bad_magic_is_fatal() {
        let mut dev = image(1);
        let s = [0u8, 1, 2, 3, 0, 4];
        let err = StreamUnpacker::new(&s[..], &mut dev, UnpackOptions::default()).run().unwrap_err();
        assert!(matches!(err, UnpackError::BadStreamMagic { found: 0x0302_0100 }));
    }

    #[test]
    fn odd_block_size_is_fatal() {
        let mut s = Vec::new();
        write_stream_header(&mut s, 1000).unwrap();
        let mut dev = image(1);
        let err = StreamUnpacker::new(&s[..], &mut dev, UnpackOptions::default()).run().unwrap_err();
        assert!(matches!(err, UnpackError::BadBlockSize(1000)));
    }

    #[test]
    fn unknown_tag_reports_position() {
        let s = stream(|s| s.write_u16::<LittleEndian>(0x00f0).unwrap());
        let mut dev = image(1);
        let err = StreamUnpacker::new(&s[..], &mut dev, UnpackOptions::default()).run().unwrap_err();
        assert!(matches!(err, UnpackError::UnknownTag { tag: 0x00f0, pos: 6 }));
    }

    #[test]
    fn missing_end_record_is_truncated() {
        let mut s = Vec::new();
        write_stream_header(&mut s, BS as u16).unwrap();
        write_full_block(&mut s, 0, &[0; BS]).unwrap();
        let mut dev = image(1);
        let err = StreamUnpacker::new(&s[..], &mut dev, UnpackOptions::default()).run().unwrap_err();
        assert!(matches!(err, UnpackError::Truncated));
    }

    #[test]
    fn journal_markers_redirect_full_blocks() {
        let s = stream(|s| {
            s.write_u16::<LittleEndian>(record_word(SEPARATED_JOURNAL_START, 0)).unwrap();
            s.write_u16::<LittleEndian>(4).unwrap();
            s.extend_from_slice(b"sdb1");
            write_full_block(&mut *s, 1, &[7; BS]).unwrap();
            s.write_u16::<LittleEndian>(record_word(SEPARATED_JOURNAL_END, 0)).unwrap();
            write_full_block(&mut *s, 0, &[9; BS]).unwrap();
        });
        let mut dev = image(2);
        let mut jdev = image(2);
        let report = StreamUnpacker::new(&s[..], &mut dev, UnpackOptions::default())
            .with_journal(&mut jdev)
            .run()
            .unwrap();
        assert_eq!(report.stats.journal_blocks, 1);
        assert_eq!(report.stats.full_blocks, 1);

        let main = dev.into_inner().into_inner();
        let journal = jdev.into_inner().into_inner();
        assert!(main[..BS].iter().all(|&b| b == 9));
        assert!(main[BS..].iter().all(|&b| b == 0));
        assert!(journal[BS..].iter().all(|&b| b == 7));
    }

    #[test]
    fn journal_blocks_without_device_are_dropped() {
        let s = stream(|s| {
            s.write_u16::<LittleEndian>(record_word(SEPARATED_JOURNAL_START, 0)).unwrap();
            s.write_u16::<LittleEndian>(0).unwrap();
            write_full_block(&mut *s, 1, &[7; BS]).unwrap();
            s.write_u16::<LittleEndian>(record_word(SEPARATED_JOURNAL_END, 0)).unwrap();
        });
        let mut dev = image(2);
        let report = StreamUnpacker::new(&s[..], &mut dev, UnpackOptions::default()).run().unwrap();
        assert_eq!(report.stats.journal_skipped, 1);
        assert_eq!(report.stats.restored(), 0);
        assert!(dev.into_inner().into_inner().iter().all(|&b| b == 0));
    }

    #[test]
    fn unformatted_bitmap_is_skipped() {
        let s = stream(|s| {
            s.write_u16::<LittleEndian>(record_word(UNFORMATTED_BITMAP, 0)).unwrap();
            s.write_u32::<LittleEndian>(3).unwrap();
            s.extend_from_slice(&[0xff, 0x01, 0x80]);
        });
        let mut dev = image(1);
        let report = StreamUnpacker::new(&s[..], &mut dev, UnpackOptions::default()).run().unwrap();
        assert_eq!(report.stats.restored(), 0);
    }

    #[test]
    fn write_errors_are_counted_not_fatal() {
        // a two-block image cannot take block 5
        let s = stream(|s| {
            write_full_block(&mut *s, 5, &[1; BS]).unwrap();
        });
        let mut dev = ImageDevice::new(Cursor::new([0u8; 2 * BS]));
        let report = StreamUnpacker::new(&s[..], &mut dev, UnpackOptions::default()).run().unwrap();
        assert_eq!(report.stats.write_errors, 1);
        assert_eq!(report.stats.full_blocks, 0);
    }
}
