use core::fmt;

/// Failures reported by a block device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockError {
    /// The sector is past the end of the device
    SectorOutOfBounds,
    /// The buffer is not exactly one sector long
    BufferInvalid,
    ReadError,
    WriteError,
}

impl fmt::Display for BlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::SectorOutOfBounds => "sector out of bounds",
            Self::BufferInvalid => "buffer is not one sector long",
            Self::ReadError => "read failed",
            Self::WriteError => "write failed",
        })
    }
}

impl core::error::Error for BlockError {}
