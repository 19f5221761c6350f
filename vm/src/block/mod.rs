mod block_core;
mod block_error;

pub use block_core::{BlockDevice, BlockSector, RamDisk, BLOCK_SECTOR_SIZE};
pub use block_error::BlockError;
