//! Burrow's core facilities.
//!
//! - [`alloc`]: loopback address and relay port allocation.
//! - [`tcp`]: the relay engine, one listener per forwarded service.
//! - [`backoff`]: retry delays.
//! - [`signal`]: one-shot ready/stop signals shared between tasks.
//! - [`view`] and [`hosts`]: the collaborators notifications and
//!   name resolution go through.

pub mod alloc;
pub mod backoff;
pub mod endpoint;
pub mod hosts;
pub mod signal;
pub mod tcp;
pub mod view;

pub use alloc::{AllocError, Allocator, AllocatorOpts};
pub use backoff::Backoff;
pub use endpoint::{PortPair, ProxyForward, RemoteAddr};
pub use hosts::{Hostfile, HostsFile};
pub use signal::Signal;
pub use tcp::Proxy;
pub use view::{LogView, MemoryView, View};
