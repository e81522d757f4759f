//! Client-side layout wrapper for a redirect-based remote storage
//! protocol.
//!
//! This crate mediates between upper filesystem operations
//! (open/read/write/truncate/close/stat) and a remote-file transport that
//! speaks a redirect-based protocol against a metadata master and one or
//! more data servers. It adds a two-phase open (lazy metadata-only open,
//! then a synchronous or asynchronous data-server open with repair and
//! auth-loss recovery), a write-side client cache with owner authority
//! that survives a handle's close, and a restore protocol that replays
//! cached bytes to a new file when the original could not be durably
//! committed.

#![warn(
    missing_docs,
    missing_debug_implementations,
    rust_2018_idioms,
    unreachable_pub
)]

mod buffer;
mod cache;
mod cgi;
mod config;
mod error;
mod inode;
mod open_flags;
mod queue;
mod repair;
mod retry;
mod transport;
mod wrapper;

pub use crate::buffer::ByteBuffer;
pub use crate::cache::{AcquireResult, CacheEntry, Lifetime, Registry, REGISTRY};
pub use crate::cgi::{Cgi, AUTH_KEYS};
pub use crate::config::WrapperConfig;
pub use crate::error::{Errno, WrapperError};
pub use crate::inode::{IdentityTranslator, InodeTranslator};
pub use crate::open_flags::{OpenAccMode, OpenFlags};
pub use crate::queue::ConcurrentQueue;
pub use crate::repair::{repair, restore, RestoreOutcome};
pub use crate::retry::RetryPolicy;
pub use crate::transport::{LayoutTransport, MockServer, MockTransport, RemoteStat};
pub use crate::wrapper::{LayoutWrapper, OpenRequest, OpenState};
