//! The provider contract.
//!
//! A provider is one authentication-related check (reverse DNS, ident,
//! DNSBL, proxy scan) run against a connecting client. Providers are
//! trusted collaborators: a provider that goes asynchronous must eventually
//! acknowledge completion or cancellation through [`ProviderContext::done`]
//! or [`ProviderContext::reject`].

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use tokio::sync::mpsc::UnboundedSender;

use crate::client::ClientRecord;
use crate::dns::DnsClient;
use crate::protocol::{ClientId, WarnLevel};
use crate::replies::Replies;

/// Dense identifier for a loaded provider, assigned at load time and stable
/// for the provider's lifetime. Freed IDs are reused by later loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProviderId(usize);

impl ProviderId {
    pub(crate) fn from_index(index: usize) -> Self {
        Self(index)
    }

    pub fn index(&self) -> usize {
        self.0
    }
}

impl std::fmt::Display for ProviderId {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Completion of asynchronous work, routed back to the provider that
/// initiated it. Delivered only while the provider's slot for the client is
/// still `Running`; stale results are dropped by the service.
#[derive(Debug)]
pub enum ProviderEvent {
    /// Reverse DNS finished, with the forward-confirmed hostname if any.
    HostnameResolved(Option<String>),
    /// The ident exchange finished, with the validated username if any.
    IdentReply(Option<String>),
    /// One DNSBL lookup finished. `reply` is the listed address, or `None`
    /// when the client is not listed.
    BlacklistReply { list: String, reply: Option<IpAddr> },
    /// One proxy probe finished.
    ProxyProbe {
        proto: &'static str,
        port: u16,
        open: bool,
    },
}

/// An event delivered to the service task's main loop.
#[derive(Debug)]
pub enum ServiceEvent {
    /// Asynchronous provider work finished.
    Provider {
        cid: ClientId,
        pid: ProviderId,
        detail: ProviderEvent,
    },
    /// Answer to a parent-initiated `D` resolution request.
    DnsAnswer {
        reqid: String,
        qtype: char,
        result: Option<String>,
    },
    /// Nameserver list for a `S <rid> D` stats request.
    NameserverList {
        rid: String,
        letter: char,
        servers: Vec<std::net::SocketAddr>,
    },
}

/// Registry-level effects requested by a provider callback.
///
/// Callbacks hold a mutable borrow of the client record, so effects that
/// re-enter the registry (completion notification, rejection) are queued
/// here and applied after the callback frame returns. This replaces the
/// manual reference counting the original design needed to survive
/// re-entrant callback chains.
#[derive(Debug)]
pub(crate) enum Action {
    Done {
        cid: ClientId,
        pid: ProviderId,
    },
    Reject {
        cid: ClientId,
        pid: ProviderId,
        data: Option<String>,
        reason: String,
    },
}

/// A named runtime option a provider accepts via the `O` command.
#[derive(Debug, Clone, Copy)]
pub struct OptionSpec {
    pub name: &'static str,
    pub min_args: usize,
}

/// Per-invocation context handed to provider callbacks.
pub struct ProviderContext<'a> {
    pub(crate) pid: ProviderId,
    pub(crate) actions: &'a mut VecDeque<Action>,
    pub(crate) replies: &'a Replies,
    pub(crate) dns: &'a DnsClient,
    pub(crate) events: &'a UnboundedSender<ServiceEvent>,
    pub(crate) names: &'a HashMap<String, ProviderId>,
}

impl ProviderContext<'_> {
    /// The ID the registry assigned to the provider being invoked.
    pub fn self_id(&self) -> ProviderId {
        self.pid
    }

    /// Report this provider finished for `cid` with a neutral result.
    pub fn done(&mut self, cid: ClientId) {
        self.actions.push_back(Action::Done { cid, pid: self.pid });
    }

    /// Reject `cid`. The reject reply carries this provider's cause letter,
    /// the optional free-form `data` token and a human-readable reason.
    pub fn reject(&mut self, cid: ClientId, data: Option<String>, reason: &str) {
        self.actions.push_back(Action::Reject {
            cid,
            pid: self.pid,
            data,
            reason: reason.to_string(),
        });
    }

    /// Send advisory text for the parent to relay to the client.
    pub fn notice(&self, cid: ClientId, text: &str) {
        self.replies.notice(cid, text);
    }

    /// Send an operational warning to the parent.
    pub fn warn(&self, level: WarnLevel, text: &str) {
        self.replies.warn(level, text);
    }

    /// Handle to the stub resolver.
    pub fn dns(&self) -> &DnsClient {
        self.dns
    }

    /// Sender for routing completed asynchronous work back to the service
    /// loop. Tasks spawned from `start` should send
    /// [`ServiceEvent::Provider`] with [`Self::self_id`] here.
    pub fn event_sender(&self) -> UnboundedSender<ServiceEvent> {
        self.events.clone()
    }

    /// Look up another loaded provider's ID by name. Used to build
    /// dependency chains together with [`ClientRecord::is_done`].
    pub fn provider_id(&self, name: &str) -> Option<ProviderId> {
        self.names.get(name).copied()
    }
}

/// One pluggable authentication check.
///
/// `start` is invoked for every new client in registration order. It may
/// finish synchronously (optionally calling [`ProviderContext::done`]),
/// mark itself running via [`ClientRecord::mark_running`] and return
/// `true`, or return `false` to signal an immediate rejection (having
/// queued the reject itself).
pub trait Provider {
    fn name(&self) -> &'static str;

    /// Single-character cause letter used in reject replies.
    fn cause(&self) -> char;

    /// Process-lifetime initialisation. A `false` return is logged but the
    /// provider remains loaded; init failures are operationally recoverable
    /// by reload.
    fn init(&mut self, _ctx: &mut ProviderContext) -> bool {
        true
    }

    /// Process-lifetime teardown. Per-client work has already been
    /// cancelled by the registry before this is called.
    fn destroy(&mut self, _ctx: &mut ProviderContext) {}

    fn start(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) -> bool;

    /// Unconditional teardown of this provider's work for one client. Must
    /// acknowledge via [`ProviderContext::done`] if the slot was running.
    fn cancel(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext);

    /// The slot's deadline elapsed.
    fn timeout(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) {
        self.cancel(client, ctx);
    }

    /// Another provider finished for this client while ours is running.
    /// Edge-triggered, once per other-provider completion; implementations
    /// should re-check all their prerequisites when it fires.
    fn completed(
        &mut self,
        _client: &mut ClientRecord,
        _finished: ProviderId,
        _ctx: &mut ProviderContext,
    ) {
    }

    /// Asynchronous work initiated by this provider finished.
    fn event(
        &mut self,
        _client: &mut ClientRecord,
        _detail: ProviderEvent,
        _ctx: &mut ProviderContext,
    ) {
    }

    /// Runtime options this provider accepts.
    fn options(&self) -> &'static [OptionSpec] {
        &[]
    }

    fn handle_option(&mut self, _name: &str, _args: &[&str], _ctx: &mut ProviderContext) {}

    /// Single-letter stats selector, if this provider reports stats.
    fn stats_letter(&self) -> Option<char> {
        None
    }

    fn handle_stats(&mut self, _rid: &str, _letter: char, _ctx: &mut ProviderContext) {}
}
