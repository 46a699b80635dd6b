//! The built-in authentication providers.

mod blacklist;
mod ident;
mod opm;
mod rdns;

pub use blacklist::BlacklistProvider;
pub use ident::IdentProvider;
pub use opm::OpmProvider;
pub use rdns::RdnsProvider;

use crate::service::AuthService;

/// Register the standard provider set. Order matters: reverse DNS and
/// ident run first so the DNSBL provider can wait on their results.
pub fn load_all(service: &mut AuthService) {
    service.load(Box::new(RdnsProvider::new()));
    service.load(Box::new(IdentProvider::new()));
    service.load(Box::new(BlacklistProvider::new()));
    service.load(Box::new(OpmProvider::new()));
}
