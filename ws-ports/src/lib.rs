//! Network port management library.
//!
//! Hands out unique TCP ports from a configured inclusive range, per host,
//! with allocations persisted in a file-locked JSON registry so concurrent
//! callers (threads or processes) never receive the same port.

pub mod allocator;
pub mod error;
pub mod range;

pub use allocator::{Allocation, PortAllocator};
pub use error::{PortError, Result};
pub use range::PortRange;
