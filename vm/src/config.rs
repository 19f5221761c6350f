use kidneyos_shared::mem::{OFFSET, PAGE_FRAME_SIZE};

/// Largest stack a process may grow: 8 MiB.
pub const STACK_MAX_PAGES: usize = 2048;

/// How far below the stack pointer an access may land and still count as
/// stack growth. `pusha` writes 32 bytes below `esp` before moving it.
pub const STACK_SLACK: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    pub stack_max_pages: usize,
    pub stack_slack: usize,
    /// First address above user space; the stack grows down from here.
    pub user_top: usize,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            stack_max_pages: STACK_MAX_PAGES,
            stack_slack: STACK_SLACK,
            user_top: OFFSET,
        }
    }
}

impl VmConfig {
    /// Lowest address the stack may grow to.
    pub fn stack_bottom(&self) -> usize {
        self.user_top - self.stack_max_pages * PAGE_FRAME_SIZE
    }

    /// Whether a fault at `addr` with stack pointer `esp` is the stack
    /// growing.
    pub fn is_stack_access(&self, addr: usize, esp: usize) -> bool {
        (self.stack_bottom()..self.user_top).contains(&addr)
            && addr.saturating_add(self.stack_slack) >= esp
    }
}
