use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

use super::{record_word, FULL_BLOCK_END, FULL_BLOCK_START};

/// `[u16 FULL_BLOCK_START][u32 block]`, then `block_size` raw bytes, then
/// `[u16 FULL_BLOCK_END]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FullBlockHeader {
    pub magic:  u16,
    pub number: u32,
}

impl FullBlockHeader {
    pub fn new(number: u32) -> Self {
        Self { magic: record_word(FULL_BLOCK_START, 0), number }
    }

    pub fn write<W: Write>(&self, mut writer: W) -> io::Result<()> {
        writer.write_u16::<LittleEndian>(self.magic)?;
        writer.write_u32::<LittleEndian>(self.number)?;
        Ok(())
    }

    /// Read the block number; the start word has already been consumed by
    /// the record dispatcher.
    pub fn read_after_tag<R: Read>(magic: u16, mut reader: R) -> io::Result<Self> {
        Ok(Self { magic, number: reader.read_u32::<LittleEndian>()? })
    }
}

/// Emit one full-block record.  Returns the record size in bytes.
pub fn write_full_block<W: Write>(mut writer: W, number: u32, data: &[u8]) -> io::Result<u64> {
    FullBlockHeader::new(number).write(&mut writer)?;
    writer.write_all(data)?;
    writer.write_u16::<LittleEndian>(record_word(FULL_BLOCK_END, 0))?;
    Ok(2 + 4 + data.len() as u64 + 2)
}

/// Read the body and end word of a full-block record.  Returns the data and
/// the end word actually found.
pub fn read_full_block_body<R: Read>(mut reader: R, block_size: usize) -> io::Result<(Vec<u8>, u16)> {
    let mut data = vec![0u8; block_size];
    reader.read_exact(&mut data)?;
    let end = reader.read_u16::<LittleEndian>()?;
    Ok((data, end))
}
