//! Burrow exposes remote services as local ones.
//!
//! Every forward declaration gets a loopback address and a host name; a tcp
//! relay on that address leads to a tunnel backend (cluster port-forward or
//! ssh) which a supervisor keeps alive.

pub mod cmd;
pub mod conf;
pub mod forward;

pub use burrow_core as core;
pub use burrow_tunnel as tunnel;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
