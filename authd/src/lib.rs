//! Worker process performing identity checks for an IRC server, and the
//! building blocks it is made of.
//!
//! The parent server hands each new connection to the worker over a line
//! protocol on stdin/stdout. A set of providers (reverse DNS, ident,
//! DNSBL, open proxy scan) then runs concurrently for the connection, and
//! exactly one accept or reject line goes back once they settle.

pub mod client;
pub mod dispatch;
pub mod dns;
pub mod error;
pub mod protocol;
pub mod provider;
pub mod providers;
pub mod replies;
pub mod service;

pub use client::ClientRecord;
pub use dns::{spawn_resolver, DnsClient};
pub use error::FatalError;
pub use protocol::{ClientId, Reply, WarnLevel};
pub use provider::{Provider, ProviderContext, ProviderEvent, ProviderId, ServiceEvent};
pub use replies::Replies;
pub use service::AuthService;
