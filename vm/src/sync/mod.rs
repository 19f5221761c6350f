//! Locks used by the virtual memory subsystem.
//!
//! Page faults may spin on these from any thread, so none of them sleep.

mod reentrant;
mod ticket;

pub use reentrant::{ReentrantMutex, ReentrantMutexGuard};
pub use ticket::{TicketMutex, TicketMutexGuard};

pub type Mutex<T> = TicketMutex<T>;
pub type MutexGuard<'a, T> = TicketMutexGuard<'a, T>;
