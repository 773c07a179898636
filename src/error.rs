//! Error types for the pack and unpack passes.
//!
//! Only stream-format violations and misconfiguration are errors.  A block
//! that cannot be read (pack) or written (unpack) is logged and skipped, and
//! a leaf rejected by the validity gate is not an error at all: it is sent as
//! a full block and counted.

use std::io;
use thiserror::Error;

use crate::ondisk::superblock::SuperblockError;
use crate::wire::WireError;

#[derive(Error, Debug)]
pub enum PackError {
    #[error("superblock: {0}")]
    Superblock(#[from] SuperblockError),

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    /// The journal lives on another device that was not supplied.
    #[error("journal is on a separate device ({dev:#x}); supply it or allow packing without it")]
    JournalDeviceMissing { dev: u32 },

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Error, Debug)]
pub enum UnpackError {
    #[error("bad stream magic {found:#010x}")]
    BadStreamMagic { found: u32 },

    #[error("unsupported block size {0}")]
    BadBlockSize(u16),

    #[error("unknown record tag {tag:#06x} at byte {pos}")]
    UnknownTag { tag: u16, pos: u64 },

    #[error("expected {expected:#06x} after block {block}, found {found:#06x}")]
    MissingEndMagic { block: u32, expected: u16, found: u16 },

    /// The first item of a leaf must carry both its dir id and object id.
    #[error("block {block}: first item has no {field}")]
    MissingKeyField { block: u32, field: &'static str },

    #[error("block {block}: {detail}")]
    BadLeaf { block: u32, detail: String },

    #[error("unknown directory hash code {0}")]
    UnknownHash(u8),

    #[error("stream ended before the end record")]
    Truncated,

    #[error("wire: {0}")]
    Wire(#[from] WireError),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

impl UnpackError {
    /// Map a read error to `Truncated` when the stream simply ran out.
    pub(crate) fn from_read(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::UnexpectedEof {
            UnpackError::Truncated
        } else {
            UnpackError::Io(e)
        }
    }
}
