mod user_pool;

pub use user_pool::UserPool;

use core::ptr::NonNull;

/// Physical address of a page frame.
pub type PhysAddr = usize;

/// The pool of physical frames user pages are drawn from.
///
/// # Safety
///
/// Implementors must hand out each frame to at most one caller between an
/// [`alloc_zeroed`](Self::alloc_zeroed) and the matching [`free`](Self::free),
/// and [`kernel_view`](Self::kernel_view) must return a pointer to
/// `PAGE_FRAME_SIZE` bytes that stay valid while the frame is allocated.
pub unsafe trait PhysicalAllocator: Send + Sync {
    /// Allocates one zero-filled frame, or returns [`None`] if the pool is
    /// exhausted.
    fn alloc_zeroed(&self) -> Option<PhysAddr>;

    /// Returns a frame obtained from [`alloc_zeroed`](Self::alloc_zeroed) to the pool.
    fn free(&self, paddr: PhysAddr);

    /// Kernel-visible address of the frame at `paddr`.
    fn kernel_view(&self, paddr: PhysAddr) -> NonNull<u8>;

    /// Total number of frames in the pool.
    fn capacity(&self) -> usize;

    /// Number of frames not currently allocated.
    fn free_frames(&self) -> usize;
}
