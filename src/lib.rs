pub mod bitmap;
pub mod device;
pub mod error;
pub mod hash;
pub mod ondisk;
pub mod options;
pub mod pack;
pub mod stats;
pub mod unpack;
pub mod validate;
pub mod wire;

pub use bitmap::Bitmap;
pub use device::{Block, BlockDevice, ImageDevice};
pub use error::{PackError, UnpackError};
pub use hash::HashCode;
pub use ondisk::{classify, BlockKind, LeafItem, Superblock};
pub use options::{PackOptions, UnpackOptions};
pub use pack::Packer;
pub use stats::{PackStats, UnpackStats};
pub use unpack::{StreamUnpacker, UnpackReport};
pub use validate::{can_pack_leaf, ItemValidator, StructuralValidator};
