//! Block access.  The pack side only reads, the unpack side only writes.

use std::io::{self, Read, Seek, SeekFrom, Write};

/// A block-sized buffer and the block number it belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub number: u32,
    pub data:   Vec<u8>,
}

impl Block {
    pub fn new(number: u32, data: Vec<u8>) -> Self {
        Self { number, data }
    }

    pub fn zeroed(number: u32, size: usize) -> Self {
        Self { number, data: vec![0u8; size] }
    }

    pub fn size(&self) -> usize { self.data.len() }
}

pub trait BlockDevice {
    fn read_block(&mut self, number: u32, size: usize) -> io::Result<Block>;
    fn write_block(&mut self, block: &Block) -> io::Result<()>;
}

/// Any seekable byte stream addressed in `block.size()` units: a file, a
/// block device node, or an in-memory `Cursor<Vec<u8>>`.
#[derive(Debug)]
pub struct ImageDevice<T> {
    inner: T,
}

impl<T> ImageDevice<T> {
    pub fn new(inner: T) -> Self {
        Self { inner }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }

    pub fn get_ref(&self) -> &T {
        &self.inner
    }
}

impl<T: Read + Write + Seek> BlockDevice for ImageDevice<T> {
    fn read_block(&mut self, number: u32, size: usize) -> io::Result<Block> {
        self.inner.seek(SeekFrom::Start(number as u64 * size as u64))?;
        let mut data = vec![0u8; size];
        self.inner.read_exact(&mut data)?;
        Ok(Block { number, data })
    }

    fn write_block(&mut self, block: &Block) -> io::Result<()> {
        self.inner.seek(SeekFrom::Start(block.number as u64 * block.size() as u64))?;
        self.inner.write_all(&block.data)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn write_then_read_back() {
        let mut dev = ImageDevice::new(Cursor::new(Vec::new()));
        dev.write_block(&Block::new(3, vec![7u8; 512])).unwrap();
        assert_eq!(dev.get_ref().get_ref().len(), 4 * 512);
        let b = dev.read_block(3, 512).unwrap();
        assert_eq!(b.data, vec![7u8; 512]);
        assert_eq!(dev.read_block(1, 512).unwrap().data, vec![0u8; 512]);
    }

    #[test]
    fn short_read_is_an_error() {
        let mut dev = ImageDevice::new(Cursor::new(vec![0u8; 700]));
        assert!(dev.read_block(1, 512).is_err());
    }
}
