//! Library interface to the authentication worker process.
//!
//! The worker runs the actual checks (reverse DNS, ident, DNSBL, proxy
//! scan); this crate spawns it, feeds it commands over its stdin and turns
//! the reply lines on its stdout into [`AuthEvent`]s on a channel.

mod event;
pub use event::*;

mod handle;
pub use handle::*;
