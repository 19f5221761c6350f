/// Byte offset within a file.
pub type FileOffset = u64;

/// A file pages can be loaded from and written back to.
///
/// The virtual memory subsystem serializes calls through its file lock, so
/// implementations only need interior mutability, not their own locking
/// discipline across calls.
pub trait BackingFile: Send + Sync {
    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the number
    /// of bytes read, which is short at end of file.
    fn read_at(&self, offset: FileOffset, buf: &mut [u8]) -> usize;

    /// Writes `buf` starting at `offset`, returning the number of bytes written.
    fn write_at(&self, offset: FileOffset, buf: &[u8]) -> usize;
}
