//! The provider registry and per-client orchestration.
//!
//! All state lives on the service task; provider callbacks run synchronously
//! with a mutable borrow of the client record, and any effect that would
//! re-enter the registry (completion, rejection) is queued as an
//! [`Action`] and applied once the callback frame has returned. The drain
//! loop iterates until the queue is empty, so completion chains of any
//! depth settle before the next input is processed.

use std::collections::{HashMap, VecDeque};
use std::net::{IpAddr, SocketAddr};
use std::time::Instant;

use tokio::sync::mpsc::UnboundedSender;

use crate::client::{ClientRecord, SlotStatus, MAX_PROVIDERS};
use crate::dns::DnsClient;
use crate::error::FatalError;
use crate::protocol::ClientId;
use crate::provider::{Action, Provider, ProviderContext, ProviderId, ServiceEvent};
use crate::replies::Replies;

struct LoadedProvider {
    /// Taken out for the duration of a callback so the callback can borrow
    /// the rest of the service.
    provider: Option<Box<dyn Provider>>,
    name: &'static str,
    cause: char,
}

pub struct AuthService {
    providers: Vec<Option<LoadedProvider>>,
    free_ids: Vec<usize>,
    names: HashMap<String, ProviderId>,
    option_handlers: HashMap<String, (ProviderId, usize)>,
    stats_handlers: HashMap<char, ProviderId>,

    clients: HashMap<ClientId, ClientRecord>,
    actions: VecDeque<Action>,

    replies: Replies,
    dns: DnsClient,
    events: UnboundedSender<ServiceEvent>,
}

impl AuthService {
    pub fn new(replies: Replies, dns: DnsClient, events: UnboundedSender<ServiceEvent>) -> Self {
        Self {
            providers: Vec::new(),
            free_ids: Vec::new(),
            names: HashMap::new(),
            option_handlers: HashMap::new(),
            stats_handlers: HashMap::new(),
            clients: HashMap::new(),
            actions: VecDeque::new(),
            replies,
            dns,
            events,
        }
    }

    /// Register a provider, assigning it the lowest free ID. New clients
    /// fan out to providers in ID order.
    pub fn load(&mut self, provider: Box<dyn Provider>) -> Option<ProviderId> {
        let index = match self.free_ids.pop() {
            Some(index) => index,
            None => {
                if self.providers.len() >= MAX_PROVIDERS {
                    tracing::warn!(
                        "Can't load provider {}: provider table is full",
                        provider.name()
                    );
                    return None;
                }
                self.providers.push(None);
                self.providers.len() - 1
            }
        };

        let pid = ProviderId::from_index(index);
        let name = provider.name();
        let cause = provider.cause();

        self.names.insert(name.to_string(), pid);
        for opt in provider.options() {
            self.option_handlers
                .insert(opt.name.to_string(), (pid, opt.min_args));
        }
        if let Some(letter) = provider.stats_letter() {
            self.stats_handlers.insert(letter, pid);
        }
        self.providers[index] = Some(LoadedProvider {
            provider: Some(provider),
            name,
            cause,
        });

        if !self.invoke_service(pid, |p, ctx| p.init(ctx)).unwrap_or(false) {
            // Still loaded; a later configuration reload may fix it.
            tracing::warn!("Provider {} failed to initialise", name);
        }
        self.drain_actions();

        tracing::info!("Loaded provider {} as id {}", name, pid);
        Some(pid)
    }

    /// Tear a provider down and return its ID to the free list. Work it has
    /// outstanding for any client is cancelled first.
    pub fn unload(&mut self, pid: ProviderId) {
        let cids: Vec<ClientId> = self.clients.keys().copied().collect();
        for cid in cids {
            let running = self
                .clients
                .get(&cid)
                .map(|r| r.status(pid) == SlotStatus::Running)
                .unwrap_or(false);
            if running {
                self.invoke(pid, cid, |p, c, ctx| p.cancel(c, ctx));
                self.drain_actions();
            }
        }

        self.invoke_service(pid, |p, ctx| p.destroy(ctx));
        self.drain_actions();

        if let Some(slot) = self.providers[pid.index()].take() {
            self.names.remove(slot.name);
            self.option_handlers.retain(|_, v| v.0 != pid);
            self.stats_handlers.retain(|_, v| *v != pid);
            self.free_ids.push(pid.index());
            tracing::info!("Unloaded provider {}", slot.name);
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Handle a `C` line: begin checks for a new connection.
    pub fn start_auth(
        &mut self,
        cid: &str,
        listen_ip: &str,
        listen_port: &str,
        peer_ip: &str,
        peer_port: &str,
    ) -> Result<(), FatalError> {
        let cid: ClientId = cid
            .parse()
            .map_err(|_| FatalError::BadClientId(cid.to_string()))?;
        if self.clients.contains_key(&cid) {
            return Err(FatalError::DuplicateClient(cid));
        }
        let listen_addr = parse_addr(listen_ip, listen_port)?;
        let peer_addr = parse_addr(peer_ip, peer_port)?;

        let mut record = ClientRecord::new(cid, listen_addr, peer_addr);
        record.set_starting(true);
        self.clients.insert(cid, record);

        for index in 0..self.providers.len() {
            if self.providers[index].is_none() {
                continue;
            }
            // A provider earlier in the fan-out may already have decided.
            let Some(record) = self.clients.get(&cid) else {
                break;
            };
            if record.is_cancelled() {
                break;
            }

            let pid = ProviderId::from_index(index);
            let carry_on = self
                .invoke(pid, cid, |p, c, ctx| p.start(c, ctx))
                .unwrap_or(true);
            self.drain_actions();
            if !carry_on {
                self.cancel_providers(cid);
                self.drain_actions();
                break;
            }
        }

        if let Some(record) = self.clients.get_mut(&cid) {
            record.set_starting(false);
        }
        self.check_finished(cid);
        self.drain_actions();
        Ok(())
    }

    /// Handle an `E` line: the parent lost interest in this connection.
    /// No accept or reject is ever sent for an explicitly cancelled client.
    pub fn handle_cancel(&mut self, cid: &str) {
        let Ok(cid) = cid.parse::<ClientId>() else {
            tracing::warn!("Ignoring cancel with bad client ID {:?}", cid);
            return;
        };
        if !self.clients.contains_key(&cid) {
            return;
        }
        self.cancel_providers(cid);
        self.drain_actions();
        self.check_finished(cid);
    }

    /// Handle a `D` line: resolve on the parent's behalf.
    pub fn handle_dns(&mut self, reqid: &str, qtype: &str, query: &str) -> Result<(), FatalError> {
        let qtype_char = match qtype {
            "4" => '4',
            "6" => '6',
            "R" => 'R',
            "S" => 'S',
            _ => return Err(FatalError::BadDnsQuery(qtype.to_string())),
        };

        let events = self.events.clone();
        let reqid = reqid.to_string();
        match qtype_char {
            '4' | '6' => {
                let lookup = self.dns.lookup_ip(query, qtype_char == '6');
                tokio::spawn(async move {
                    let result = lookup.await.ok().flatten().map(|ip| ip.to_string());
                    let _ = events.send(ServiceEvent::DnsAnswer {
                        reqid,
                        qtype: qtype_char,
                        result,
                    });
                });
            }
            _ => {
                let addr: IpAddr = query
                    .parse()
                    .map_err(|_| FatalError::BadDnsQuery(query.to_string()))?;
                let lookup = self.dns.lookup_hostname(addr);
                tokio::spawn(async move {
                    let result = lookup.await.ok().flatten();
                    let _ = events.send(ServiceEvent::DnsAnswer {
                        reqid,
                        qtype: qtype_char,
                        result,
                    });
                });
            }
        }
        Ok(())
    }

    /// Handle an `O` line: route a runtime option to the provider that
    /// registered it. Unknown names and short argument lists are ignored
    /// with a warning; the parent's configuration may simply be newer.
    pub fn handle_option(&mut self, args: &[&str]) {
        let name = args[0];
        let rest = &args[1..];
        let Some(&(pid, min_args)) = self.option_handlers.get(name) else {
            tracing::warn!("Ignoring unknown option {:?}", name);
            return;
        };
        if rest.len() < min_args {
            tracing::warn!(
                "Ignoring option {:?}: expected {} arguments, got {}",
                name,
                min_args,
                rest.len()
            );
            return;
        }
        let rest: Vec<&str> = rest.to_vec();
        self.invoke_service(pid, |p, ctx| p.handle_option(name, &rest, ctx));
        self.drain_actions();
    }

    /// Handle an `S` line: stats dump keyed by a single letter. `D` is
    /// answered by the service itself with the nameserver list.
    pub fn handle_stats(&mut self, rid: &str, letter: &str) {
        let Some(letter) = letter.chars().next() else {
            return;
        };

        if letter == 'D' {
            let lookup = self.dns.nameservers();
            let events = self.events.clone();
            let rid = rid.to_string();
            tokio::spawn(async move {
                let servers = lookup.await.unwrap_or_default();
                let _ = events.send(ServiceEvent::NameserverList {
                    rid,
                    letter,
                    servers,
                });
            });
            return;
        }

        match self.stats_handlers.get(&letter).copied() {
            Some(pid) => {
                self.invoke_service(pid, |p, ctx| p.handle_stats(rid, letter, ctx));
                self.drain_actions();
            }
            None => {
                self.replies
                    .stats_error(rid, letter, "Unknown statistics type");
            }
        }
    }

    /// Handle an `R` line: re-read external configuration. Currently only
    /// the resolver (`R D`, or a bare `R`) has anything to re-read.
    pub fn handle_reload(&mut self, args: &[&str]) {
        match args.first() {
            None | Some(&"D") => self.dns.reload(),
            Some(what) => tracing::warn!("Ignoring reload request for {:?}", what),
        }
    }

    /// Deliver completed asynchronous work back into provider callbacks.
    pub fn handle_event(&mut self, event: ServiceEvent) {
        match event {
            ServiceEvent::Provider { cid, pid, detail } => {
                // Results that arrive after the slot left Running are stale:
                // the client was decided or cancelled in the meantime.
                let running = self
                    .clients
                    .get(&cid)
                    .map(|r| r.status(pid) == SlotStatus::Running)
                    .unwrap_or(false);
                if !running {
                    return;
                }
                self.invoke(pid, cid, |p, c, ctx| p.event(c, detail, ctx));
                self.drain_actions();
            }
            ServiceEvent::DnsAnswer {
                reqid,
                qtype,
                result,
            } => {
                self.replies.dns_result(&reqid, qtype, result.as_deref());
            }
            ServiceEvent::NameserverList {
                rid,
                letter,
                servers,
            } => {
                if servers.is_empty() {
                    self.replies.stats_error(&rid, letter, "NONAMESERVERS");
                } else {
                    for server in servers {
                        self.replies
                            .stats_result(&rid, letter, &server.ip().to_string());
                    }
                }
                self.replies.stats_done(&rid, letter);
            }
        }
    }

    /// Fire `timeout` on every running slot whose deadline has elapsed.
    /// The ID list is snapshotted first: a timeout handler may complete or
    /// reject synchronously and remove records mid-sweep.
    pub fn timeout_sweep(&mut self, now: Instant) {
        let cids: Vec<ClientId> = self.clients.keys().copied().collect();
        for cid in cids {
            let Some(record) = self.clients.get(&cid) else {
                continue;
            };
            let expired: Vec<ProviderId> = record
                .running_ids()
                .into_iter()
                .filter(|pid| record.deadline(*pid).map(|d| now >= d).unwrap_or(false))
                .collect();

            for pid in expired {
                let Some(record) = self.clients.get_mut(&cid) else {
                    break;
                };
                if record.status(pid) != SlotStatus::Running {
                    continue;
                }
                // Disarm before firing so a handler that stays running
                // without rearming doesn't fire again next sweep.
                record.set_timeout(pid, None);
                self.invoke(pid, cid, |p, c, ctx| p.timeout(c, ctx));
                self.drain_actions();
            }
        }
    }

    /// Cancel every client and provider; called before process exit.
    pub fn shutdown(&mut self) {
        let cids: Vec<ClientId> = self.clients.keys().copied().collect();
        for cid in cids {
            self.cancel_providers(cid);
            self.drain_actions();
            self.clients.remove(&cid);
        }
        for index in 0..self.providers.len() {
            if self.providers[index].is_some() {
                self.unload(ProviderId::from_index(index));
            }
        }
    }

    /// Latch the cancelled flag and fire `cancel` on every running slot.
    /// Idempotent: a second call is a no-op.
    fn cancel_providers(&mut self, cid: ClientId) {
        let Some(record) = self.clients.get_mut(&cid) else {
            return;
        };
        if !record.set_cancelled() {
            return;
        }
        for pid in record.running_ids() {
            self.invoke(pid, cid, |p, c, ctx| p.cancel(c, ctx));
        }
    }

    /// If nothing is running and the fan-out has finished, the client's
    /// fate is settled: accept it, or remove it silently if it was
    /// cancelled along the way.
    fn check_finished(&mut self, cid: ClientId) {
        let Some(record) = self.clients.get(&cid) else {
            return;
        };
        if record.is_starting() || record.running_count() > 0 {
            return;
        }
        let record = self.clients.remove(&cid).expect("record vanished");
        if !record.is_cancelled() {
            self.replies.accept(cid, &record.username, &record.hostname);
        }
    }

    fn drain_actions(&mut self) {
        while let Some(action) = self.actions.pop_front() {
            match action {
                Action::Done { cid, pid } => self.process_done(cid, pid),
                Action::Reject {
                    cid,
                    pid,
                    data,
                    reason,
                } => self.process_reject(cid, pid, data, reason),
            }
        }
    }

    fn process_done(&mut self, cid: ClientId, pid: ProviderId) {
        let Some(record) = self.clients.get_mut(&cid) else {
            // The decision already went out; late acknowledgements are
            // no-ops.
            return;
        };
        if !record.mark_done(pid) {
            return;
        }

        if !record.is_cancelled() {
            // Notify the providers still running so dependency chains make
            // progress. Snapshot first; callbacks queue further actions
            // rather than mutating the table.
            for other in record.running_ids() {
                if other != pid {
                    self.invoke(other, cid, |p, c, ctx| p.completed(c, pid, ctx));
                }
            }
        }
        self.check_finished(cid);
    }

    fn process_reject(
        &mut self,
        cid: ClientId,
        pid: ProviderId,
        data: Option<String>,
        reason: String,
    ) {
        if !self.clients.contains_key(&cid) {
            return;
        }
        // Wind everything else down before the record goes away; cancel
        // callbacks still get the record.
        self.cancel_providers(cid);

        let Some(record) = self.clients.remove(&cid) else {
            return;
        };
        let cause = self.providers[pid.index()]
            .as_ref()
            .map(|s| s.cause)
            .unwrap_or('*');
        self.replies.reject(
            cid,
            cause,
            &record.username,
            &record.hostname,
            data.as_deref(),
            &reason,
        );
    }

    /// Run a per-client provider callback. The provider box and the client
    /// record are both lifted out of their containers for the duration, so
    /// the callback gets `&mut` to each plus a context over the rest of the
    /// service. Returns `None` if either party no longer exists.
    fn invoke<R>(
        &mut self,
        pid: ProviderId,
        cid: ClientId,
        f: impl FnOnce(&mut dyn Provider, &mut ClientRecord, &mut ProviderContext) -> R,
    ) -> Option<R> {
        let mut provider = self.providers.get_mut(pid.index())?.as_mut()?.provider.take()?;
        let Some(mut client) = self.clients.remove(&cid) else {
            self.providers[pid.index()].as_mut().expect("provider slot vanished").provider =
                Some(provider);
            return None;
        };

        let result = {
            let mut ctx = ProviderContext {
                pid,
                actions: &mut self.actions,
                replies: &self.replies,
                dns: &self.dns,
                events: &self.events,
                names: &self.names,
            };
            f(provider.as_mut(), &mut client, &mut ctx)
        };

        self.clients.insert(cid, client);
        if let Some(slot) = self.providers.get_mut(pid.index()).and_then(|s| s.as_mut()) {
            slot.provider = Some(provider);
        }
        Some(result)
    }

    /// Run a provider callback that doesn't involve a client.
    fn invoke_service<R>(
        &mut self,
        pid: ProviderId,
        f: impl FnOnce(&mut dyn Provider, &mut ProviderContext) -> R,
    ) -> Option<R> {
        let mut provider = self.providers.get_mut(pid.index())?.as_mut()?.provider.take()?;
        let result = {
            let mut ctx = ProviderContext {
                pid,
                actions: &mut self.actions,
                replies: &self.replies,
                dns: &self.dns,
                events: &self.events,
                names: &self.names,
            };
            f(provider.as_mut(), &mut ctx)
        };
        if let Some(slot) = self.providers.get_mut(pid.index()).and_then(|s| s.as_mut()) {
            slot.provider = Some(provider);
        }
        Some(result)
    }
}

fn parse_addr(ip: &str, port: &str) -> Result<SocketAddr, FatalError> {
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| FatalError::BadAddress(ip.to_string()))?;
    let port: u16 = port
        .parse()
        .map_err(|_| FatalError::BadAddress(port.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::ProviderEvent;
    use std::sync::{Arc, Mutex};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy)]
    enum Mode {
        /// Finish synchronously during `start`.
        Sync,
        /// Go asynchronous; acknowledges cancellation with `done`.
        Async,
        /// Reject the client during `start`.
        RejectOnStart,
    }

    struct Stub {
        name: &'static str,
        cause: char,
        mode: Mode,
        log: Log,
    }

    impl Stub {
        fn boxed(name: &'static str, cause: char, mode: Mode, log: &Log) -> Box<dyn Provider> {
            Box::new(Self {
                name,
                cause,
                mode,
                log: log.clone(),
            })
        }

        fn record(&self, what: &str) {
            self.log.lock().unwrap().push(format!("{} {}", self.name, what));
        }
    }

    impl Provider for Stub {
        fn name(&self) -> &'static str {
            self.name
        }

        fn cause(&self) -> char {
            self.cause
        }

        fn start(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) -> bool {
            self.record("start");
            match self.mode {
                Mode::Sync => {
                    ctx.done(client.cid);
                    true
                }
                Mode::Async => {
                    client.mark_running(ctx.self_id());
                    true
                }
                Mode::RejectOnStart => {
                    ctx.reject(client.cid, None, "rejected in start");
                    false
                }
            }
        }

        fn cancel(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) {
            self.record("cancel");
            if client.status(ctx.self_id()) == SlotStatus::Running {
                ctx.done(client.cid);
            }
        }

        fn completed(
            &mut self,
            _client: &mut ClientRecord,
            finished: ProviderId,
            _ctx: &mut ProviderContext,
        ) {
            self.record(&format!("completed {}", finished));
        }

        fn event(
            &mut self,
            client: &mut ClientRecord,
            detail: ProviderEvent,
            ctx: &mut ProviderContext,
        ) {
            self.record("event");
            match detail {
                ProviderEvent::BlacklistReply {
                    list,
                    reply: Some(_),
                } => ctx.reject(client.cid, Some(list), "Listed in DNSBL"),
                ProviderEvent::IdentReply(Some(username)) => {
                    client.username = username;
                    ctx.done(client.cid);
                }
                _ => ctx.done(client.cid),
            }
        }
    }

    struct Harness {
        service: AuthService,
        reply_rx: UnboundedReceiver<String>,
        #[allow(dead_code)]
        event_rx: UnboundedReceiver<ServiceEvent>,
        log: Log,
    }

    impl Harness {
        fn new() -> Self {
            let (replies, reply_rx) = Replies::new();
            let (event_tx, event_rx) = unbounded_channel();
            let (dns_tx, _) = unbounded_channel();
            Self {
                service: AuthService::new(replies, DnsClient::from_sender(dns_tx), event_tx),
                reply_rx,
                event_rx,
                log: Arc::new(Mutex::new(Vec::new())),
            }
        }

        fn start_client(&mut self, cid: u32) {
            self.service
                .start_auth(
                    &format!("{:x}", cid),
                    "127.0.0.1",
                    "6667",
                    "203.0.113.5",
                    "51000",
                )
                .unwrap();
        }

        fn replies(&mut self) -> Vec<String> {
            let mut lines = Vec::new();
            while let Ok(line) = self.reply_rx.try_recv() {
                lines.push(line);
            }
            lines
        }

        fn log(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn all_synchronous_providers_accept_immediately() {
        let mut h = Harness::new();
        h.service.load(Stub::boxed("one", 'D', Mode::Sync, &h.log));
        h.service.load(Stub::boxed("two", 'I', Mode::Sync, &h.log));

        h.start_client(0x1a);

        assert_eq!(h.replies(), vec!["A 1a * *"]);
        assert_eq!(h.service.client_count(), 0);
        assert_eq!(h.log(), vec!["one start", "two start"]);
    }

    #[tokio::test]
    async fn fan_out_follows_provider_id_order() {
        let mut h = Harness::new();
        let first = h.service.load(Stub::boxed("one", 'D', Mode::Sync, &h.log)).unwrap();
        h.service.load(Stub::boxed("two", 'I', Mode::Sync, &h.log));

        // Freed IDs are reused, so the replacement slots in where the old
        // provider was and runs in its position.
        h.service.unload(first);
        let reused = h.service.load(Stub::boxed("three", 'O', Mode::Sync, &h.log)).unwrap();
        assert_eq!(reused, first);

        h.start_client(1);
        assert_eq!(h.log(), vec!["three start", "two start"]);
    }

    #[tokio::test]
    async fn reject_on_start_halts_fan_out() {
        let mut h = Harness::new();
        h.service.load(Stub::boxed("one", 'B', Mode::RejectOnStart, &h.log));
        h.service.load(Stub::boxed("two", 'I', Mode::Sync, &h.log));

        h.start_client(2);

        assert_eq!(h.replies(), vec!["R 2 B * * * :rejected in start"]);
        assert_eq!(h.service.client_count(), 0);
        // The second provider never starts.
        assert_eq!(h.log(), vec!["one start"]);
    }

    #[tokio::test]
    async fn at_most_one_decision() {
        let mut h = Harness::new();
        let slow = h.service.load(Stub::boxed("slow", 'D', Mode::Async, &h.log)).unwrap();
        let rejecting = h
            .service
            .load(Stub::boxed("rejecting", 'B', Mode::Async, &h.log))
            .unwrap();

        h.start_client(3);
        assert!(h.replies().is_empty());

        // The rejecting provider decides first; the slow provider's later
        // result must not produce a second decision.
        let cid = ClientId::new(3).unwrap();
        h.service.handle_event(ServiceEvent::Provider {
            cid,
            pid: rejecting,
            detail: ProviderEvent::BlacklistReply {
                list: "dnsbl.example.net".to_string(),
                reply: Some("127.0.0.2".parse().unwrap()),
            },
        });
        h.service.handle_event(ServiceEvent::Provider {
            cid,
            pid: slow,
            detail: ProviderEvent::HostnameResolved(None),
        });

        let replies = h.replies();
        let decisions: Vec<&str> = replies
            .iter()
            .map(|l| l.as_str())
            .filter(|l| l.starts_with('A') || l.starts_with('R'))
            .collect();
        assert_eq!(
            decisions,
            vec!["R 3 B * * dnsbl.example.net :Listed in DNSBL"],
            "exactly one decision: {:?}",
            replies
        );
        assert_eq!(h.service.client_count(), 0);
    }

    #[tokio::test]
    async fn stale_events_after_decision_are_dropped() {
        let mut h = Harness::new();
        let pid = h.service.load(Stub::boxed("one", 'D', Mode::Async, &h.log)).unwrap();

        h.start_client(4);
        let cid = ClientId::new(4).unwrap();
        h.service.handle_cancel("4");
        assert_eq!(h.service.client_count(), 0);
        h.log.lock().unwrap().clear();

        h.service.handle_event(ServiceEvent::Provider {
            cid,
            pid,
            detail: ProviderEvent::HostnameResolved(Some("late.example.com".to_string())),
        });

        assert!(h.log().is_empty(), "stale event must not reach the provider");
        assert!(h.replies().iter().all(|l| !l.starts_with('A') && !l.starts_with('R')));
    }

    #[tokio::test]
    async fn explicit_cancel_is_silent_and_idempotent() {
        let mut h = Harness::new();
        h.service.load(Stub::boxed("one", 'D', Mode::Async, &h.log));
        h.service.load(Stub::boxed("two", 'I', Mode::Async, &h.log));

        h.start_client(5);
        h.service.handle_cancel("5");
        h.service.handle_cancel("5");

        // No accept, no reject, record gone, each provider cancelled once.
        assert!(h.replies().is_empty());
        assert_eq!(h.service.client_count(), 0);
        let cancels = h.log().iter().filter(|l| l.ends_with("cancel")).count();
        assert_eq!(cancels, 2);
    }

    #[tokio::test]
    async fn completion_notifies_remaining_providers() {
        let mut h = Harness::new();
        let one = h.service.load(Stub::boxed("one", 'D', Mode::Async, &h.log)).unwrap();
        h.service.load(Stub::boxed("two", 'B', Mode::Async, &h.log));

        h.start_client(6);
        let cid = ClientId::new(6).unwrap();
        h.service.handle_event(ServiceEvent::Provider {
            cid,
            pid: one,
            detail: ProviderEvent::HostnameResolved(None),
        });

        assert!(h.log().contains(&format!("two completed {}", one)));
    }

    #[tokio::test]
    async fn accept_carries_resolved_identity() {
        let mut h = Harness::new();
        let pid = h.service.load(Stub::boxed("ident", 'I', Mode::Async, &h.log)).unwrap();

        h.start_client(7);
        h.service.handle_event(ServiceEvent::Provider {
            cid: ClientId::new(7).unwrap(),
            pid,
            detail: ProviderEvent::IdentReply(Some("alice".to_string())),
        });

        assert_eq!(h.replies(), vec!["A 7 alice *"]);
    }

    #[tokio::test]
    async fn duplicate_client_id_is_fatal() {
        let mut h = Harness::new();
        h.service.load(Stub::boxed("one", 'D', Mode::Async, &h.log));

        h.start_client(8);
        let err = h
            .service
            .start_auth("8", "127.0.0.1", "6667", "203.0.113.9", "51001")
            .unwrap_err();
        assert!(matches!(err, FatalError::DuplicateClient(_)));
    }

    #[tokio::test]
    async fn timeout_fires_once_and_defaults_to_cancel() {
        let mut h = Harness::new();

        struct TimeoutStub {
            log: Log,
        }
        impl Provider for TimeoutStub {
            fn name(&self) -> &'static str {
                "timeout_stub"
            }
            fn cause(&self) -> char {
                'T'
            }
            fn start(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) -> bool {
                client.mark_running(ctx.self_id());
                client.set_timeout_relative(ctx.self_id(), std::time::Duration::from_secs(0));
                true
            }
            fn cancel(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) {
                self.log.lock().unwrap().push("timeout_stub cancel".to_string());
                ctx.done(client.cid);
            }
        }

        h.service.load(Box::new(TimeoutStub { log: h.log.clone() }));
        h.start_client(9);

        h.service.timeout_sweep(Instant::now() + std::time::Duration::from_secs(1));
        h.service.timeout_sweep(Instant::now() + std::time::Duration::from_secs(2));

        assert_eq!(h.log(), vec!["timeout_stub cancel"]);
        // Timing out with the default handler abandons the check and the
        // remaining slots decide: none left, so the client is accepted.
        assert_eq!(h.replies(), vec!["A 9 * *"]);
    }

    #[tokio::test]
    async fn provider_table_is_bounded() {
        let mut h = Harness::new();
        for i in 0..MAX_PROVIDERS {
            let name: &'static str = Box::leak(format!("stub{}", i).into_boxed_str());
            assert!(h.service.load(Stub::boxed(name, 'D', Mode::Sync, &h.log)).is_some());
        }
        assert!(
            h.service
                .load(Stub::boxed("surplus", 'D', Mode::Sync, &h.log))
                .is_none(),
            "a full table must refuse further providers"
        );

        // A full table still authenticates, with every loaded provider run.
        h.start_client(0xa);
        assert_eq!(h.replies(), vec!["A a * *"]);
        let starts = h.log().iter().filter(|l| l.ends_with("start")).count();
        assert_eq!(starts, MAX_PROVIDERS);
        assert!(!h.log().iter().any(|l| l.starts_with("surplus")));
    }

    #[tokio::test]
    async fn unknown_option_is_ignored() {
        let mut h = Harness::new();
        h.service.load(Stub::boxed("one", 'D', Mode::Async, &h.log));
        h.service.handle_option(&["no_such_option", "1"]);
        assert!(h.replies().is_empty());
    }

    #[tokio::test]
    async fn unknown_stats_letter_reports_error() {
        let mut h = Harness::new();
        h.service.handle_stats("7", "Q");
        assert_eq!(h.replies(), vec!["X 7 Q :Unknown statistics type"]);
    }
}
