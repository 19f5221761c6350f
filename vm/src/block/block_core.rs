use super::BlockError;
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;

/// Size of a block device sector in bytes.
///
/// All IDE disks use this sector size, as do most USB and SCSI disks.
pub const BLOCK_SECTOR_SIZE: usize = kidneyos_shared::sizes::SECTOR_SIZE as usize;

/// Index of a block device sector.
///
/// Good enough for devices up to 2 TB.
pub type BlockSector = u32;

/// A device addressed in fixed-size sectors, such as the swap partition.
pub trait BlockDevice: Send {
    /// Size of the device in sectors.
    fn size(&self) -> BlockSector;

    /// Reads sector `sector` into `buf`, which must be exactly `BLOCK_SECTOR_SIZE` bytes.
    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError>;

    /// Writes `buf`, which must be exactly `BLOCK_SECTOR_SIZE` bytes, to sector `sector`.
    /// Returns after the device has acknowledged receiving the data.
    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError>;
}

/// A block device kept entirely in kernel memory.
pub struct RamDisk {
    sectors: Vec<[u8; BLOCK_SECTOR_SIZE]>,
    read_count: u32,
    write_count: u32,
}

impl RamDisk {
    pub fn new(sectors: BlockSector) -> Self {
        Self {
            sectors: vec![[0; BLOCK_SECTOR_SIZE]; sectors as usize],
            read_count: 0,
            write_count: 0,
        }
    }

    pub fn read_count(&self) -> u32 {
        self.read_count
    }

    pub fn write_count(&self) -> u32 {
        self.write_count
    }

    fn check(&self, sector: BlockSector, len: usize) -> Result<usize, BlockError> {
        if len != BLOCK_SECTOR_SIZE {
            return Err(BlockError::BufferInvalid);
        }
        let idx = sector as usize;
        if idx >= self.sectors.len() {
            return Err(BlockError::SectorOutOfBounds);
        }
        Ok(idx)
    }
}

impl BlockDevice for RamDisk {
    #[allow(clippy::cast_possible_truncation)]
    fn size(&self) -> BlockSector {
        self.sectors.len() as BlockSector
    }

    fn read(&mut self, sector: BlockSector, buf: &mut [u8]) -> Result<(), BlockError> {
        let idx = self.check(sector, buf.len())?;
        buf.copy_from_slice(&self.sectors[idx]);
        self.read_count += 1;
        Ok(())
    }

    fn write(&mut self, sector: BlockSector, buf: &[u8]) -> Result<(), BlockError> {
        let idx = self.check(sector, buf.len())?;
        self.sectors[idx].copy_from_slice(buf);
        self.write_count += 1;
        Ok(())
    }
}

impl fmt::Display for RamDisk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "ramdisk: {:04} sectors, {:04} read, {:04} write",
            self.sectors.len(),
            self.read_count,
            self.write_count
        )
    }
}
