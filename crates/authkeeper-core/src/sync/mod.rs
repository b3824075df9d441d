//! Propagation of credential changes between tabs.

pub mod channel;
pub mod file;
pub mod listener;

pub use channel::{CrossTabMessage, LocalChannel, LocalHub, NullChannel, TabChannel};
pub use file::FileChannel;
pub use listener::CrossTabSync;
