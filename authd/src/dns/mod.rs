//! Asynchronous stub resolver used by the providers and by parent-initiated
//! `D` resolution requests.
//!
//! The resolver owns its transport policy: random collision-free
//! transaction IDs, nameserver failover with cubic backoff, reply
//! validation against the outstanding request, bounded retries with
//! exponentially growing per-attempt timeouts, and forward confirmation of
//! reverse lookups. Only DNS message encoding and decoding is delegated to
//! `trust-dns-proto`.

mod resconf;
mod resolver;

pub use resconf::MAX_NAMESERVERS;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;

use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::oneshot;

pub(crate) enum ResolverCommand {
    LookupIp {
        name: String,
        v6: bool,
        reply: oneshot::Sender<Option<IpAddr>>,
    },
    LookupHostname {
        addr: IpAddr,
        reply: oneshot::Sender<Option<String>>,
    },
    Nameservers {
        reply: oneshot::Sender<Vec<SocketAddr>>,
    },
    Reload,
}

/// Handle to the resolver task. Cheap to clone; all lookups are single-shot
/// and resolve to either a result or `None`, never both.
#[derive(Clone)]
pub struct DnsClient {
    sender: UnboundedSender<ResolverCommand>,
}

impl DnsClient {
    pub(crate) fn from_sender(sender: UnboundedSender<ResolverCommand>) -> Self {
        Self { sender }
    }

    /// Resolve a hostname to a single address. Dropping the receiver
    /// cancels interest in the result; the query itself is retired by the
    /// resolver's own retry/timeout policy.
    pub fn lookup_ip(&self, name: &str, v6: bool) -> oneshot::Receiver<Option<IpAddr>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.sender.send(ResolverCommand::LookupIp {
            name: name.to_string(),
            v6,
            reply,
        });
        rx
    }

    /// Resolve an address to a hostname, with a forward lookup confirming
    /// the name maps back to the original address before the result is
    /// delivered.
    pub fn lookup_hostname(&self, addr: IpAddr) -> oneshot::Receiver<Option<String>> {
        let (reply, rx) = oneshot::channel();
        let _ = self
            .sender
            .send(ResolverCommand::LookupHostname { addr, reply });
        rx
    }

    /// The currently configured nameserver list, for stats reporting.
    pub fn nameservers(&self) -> oneshot::Receiver<Vec<SocketAddr>> {
        let (reply, rx) = oneshot::channel();
        let _ = self.sender.send(ResolverCommand::Nameservers { reply });
        rx
    }

    /// Re-read the nameserver configuration and reset failover state.
    pub fn reload(&self) {
        let _ = self.sender.send(ResolverCommand::Reload);
    }
}

/// Start the resolver task reading nameservers from `conf_path`.
pub fn spawn_resolver(conf_path: PathBuf) -> DnsClient {
    let (sender, receiver) = unbounded_channel();
    tokio::spawn(async move {
        match resolver::Resolver::new(conf_path, receiver).await {
            Ok(resolver) => resolver.run().await,
            Err(e) => {
                // Lookups will resolve as failures when their senders drop.
                tracing::error!("Unable to start DNS resolver: {}", e);
            }
        }
    });
    DnsClient::from_sender(sender)
}

/// The reversed-octet prefix used both for `in-addr.arpa`/`ip6.arpa` names
/// and for DNSBL query names.
pub fn reverse_octets(addr: &IpAddr) -> String {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            format!("{}.{}.{}.{}", o[3], o[2], o[1], o[0])
        }
        IpAddr::V6(v6) => {
            let mut out = String::with_capacity(63);
            for byte in v6.octets().iter().rev() {
                out.push_str(&format!(
                    "{:x}.{:x}.",
                    byte & 0xf,
                    byte >> 4
                ));
            }
            out.pop();
            out
        }
    }
}

/// The `in-addr.arpa`/`ip6.arpa` name for a reverse lookup of `addr`.
pub(crate) fn reverse_name(addr: &IpAddr) -> String {
    match addr {
        IpAddr::V4(_) => format!("{}.in-addr.arpa.", reverse_octets(addr)),
        IpAddr::V6(_) => format!("{}.ip6.arpa.", reverse_octets(addr)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reverse_octets_v4() {
        let addr: IpAddr = "203.0.113.5".parse().unwrap();
        assert_eq!(reverse_octets(&addr), "5.113.0.203");
        assert_eq!(reverse_name(&addr), "5.113.0.203.in-addr.arpa.");
    }

    #[test]
    fn reverse_octets_v6() {
        let addr: IpAddr = "2001:db8::1".parse().unwrap();
        let prefix = reverse_octets(&addr);
        assert!(prefix.starts_with("1.0.0.0."));
        assert!(prefix.ends_with("8.b.d.0.1.0.0.2"));
        assert_eq!(prefix.split('.').count(), 32);
    }
}
