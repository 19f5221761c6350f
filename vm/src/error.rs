use crate::block::BlockError;
use core::fmt;

/// Failures reported by the virtual memory subsystem.
///
/// Each variant is either fatal to the faulting process or fatal to the
/// kernel; see [`VmError::is_fatal`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// The process has no supplemental page table (it is exiting or never had one)
    NoPageTable,
    /// Access to an address that is neither registered nor a legal stack growth
    SegmentationFault,
    /// A page is already registered at this virtual address
    AlreadyMapped,
    /// A file-backed page could not read its minimum length from the file
    ShortRead,
    /// No free frame and no frame can be evicted
    NoVictimAvailable,
    /// Every swap slot is in use
    SwapExhausted,
    /// The swap device failed
    Block(BlockError),
}

impl VmError {
    /// Returns `true` if the kernel cannot continue after this error, as
    /// opposed to only the faulting process.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::NoVictimAvailable | Self::SwapExhausted | Self::Block(_)
        )
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoPageTable => write!(f, "process has no page table"),
            Self::SegmentationFault => write!(f, "segmentation fault"),
            Self::AlreadyMapped => write!(f, "virtual page already mapped"),
            Self::ShortRead => write!(f, "short read from backing file"),
            Self::NoVictimAvailable => write!(f, "no frame available for eviction"),
            Self::SwapExhausted => write!(f, "swap space exhausted"),
            Self::Block(err) => write!(f, "swap device error: {err}"),
        }
    }
}

impl core::error::Error for VmError {}

impl From<BlockError> for VmError {
    fn from(err: BlockError) -> Self {
        Self::Block(err)
    }
}

pub type Result<T> = core::result::Result<T, VmError>;
