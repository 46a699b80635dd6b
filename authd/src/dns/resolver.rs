use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use rand::Rng;
use tokio::net::UdpSocket;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::oneshot;
use trust_dns_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use trust_dns_proto::rr::{Name, RData, RecordType};

use super::{reverse_name, resconf, ResolverCommand};

const MAX_PACKET: usize = 1024;
const MAX_RETRIES: u8 = 3;
const INITIAL_TIMEOUT: Duration = Duration::from_secs(4);

/// What to do with a completed lookup.
enum Origin {
    /// Forward lookup on behalf of a caller.
    Ip {
        reply: oneshot::Sender<Option<IpAddr>>,
    },
    /// Reverse lookup, first stage: find the PTR name.
    Hostname {
        reply: oneshot::Sender<Option<String>>,
        addr: IpAddr,
    },
    /// Reverse lookup, second stage: confirm the PTR name resolves back to
    /// the address we started from.
    HostnameConfirm {
        reply: oneshot::Sender<Option<String>>,
        addr: IpAddr,
        name: String,
    },
}

struct Pending {
    qname: Name,
    rtype: RecordType,
    origin: Origin,
    retries: u8,
    timeout: Duration,
    sent_at: Instant,
    sends: u64,
    last_ns: usize,
}

/// What a validated, nominally successful reply contained.
enum Outcome {
    Ip(IpAddr),
    Ptr(Name),
    Confirmed(bool),
    /// Right question, wrong record types in the answer section.
    Corrupt,
}

enum Step {
    Command(Option<ResolverCommand>),
    Packet(usize, SocketAddr),
    Tick,
}

pub(crate) struct Resolver {
    socket: UdpSocket,
    nameservers: Vec<SocketAddr>,
    /// Consecutive timeouts and bad replies per nameserver; decays on
    /// success and drives the cubic backoff in [`Resolver::pick_server`].
    failures: Vec<u32>,
    retrycnt: u64,
    pending: HashMap<u16, Pending>,
    commands: UnboundedReceiver<ResolverCommand>,
    conf_path: PathBuf,
}

/// How many queries to skip before retrying a server with this many
/// consecutive failures. Cubic backoff; a broken server is still probed
/// occasionally but never permanently excluded.
fn retry_frequency(failures: u32) -> u64 {
    match failures {
        0 => 1,
        1 => 3,
        2 => 9,
        3 => 27,
        4 => 81,
        _ => 243,
    }
}

async fn bind_for(nameservers: &[SocketAddr]) -> io::Result<UdpSocket> {
    let local: SocketAddr = match nameservers.first() {
        Some(SocketAddr::V6(_)) => "[::]:0".parse().unwrap(),
        _ => "0.0.0.0:0".parse().unwrap(),
    };
    UdpSocket::bind(local).await
}

impl Resolver {
    pub(crate) async fn new(
        conf_path: PathBuf,
        commands: UnboundedReceiver<ResolverCommand>,
    ) -> io::Result<Self> {
        let nameservers = resconf::load(&conf_path);
        let socket = bind_for(&nameservers).await?;
        let failures = vec![0; nameservers.len()];
        Ok(Self {
            socket,
            nameservers,
            failures,
            retrycnt: 0,
            pending: HashMap::new(),
            commands,
            conf_path,
        })
    }

    pub(crate) async fn run(mut self) {
        let mut sweep = tokio::time::interval(Duration::from_secs(1));
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut buf = [0u8; MAX_PACKET];

        loop {
            let step = tokio::select! {
                cmd = self.commands.recv() => Step::Command(cmd),
                recv = self.socket.recv_from(&mut buf) => match recv {
                    Ok((len, src)) => Step::Packet(len, src),
                    Err(_) => continue,
                },
                _ = sweep.tick() => Step::Tick,
            };

            match step {
                Step::Command(None) => break,
                Step::Command(Some(cmd)) => self.handle_command(cmd).await,
                Step::Packet(len, src) => self.handle_packet(&buf[..len], src).await,
                Step::Tick => self.sweep_timeouts().await,
            }
        }
    }

    async fn handle_command(&mut self, cmd: ResolverCommand) {
        match cmd {
            ResolverCommand::LookupIp { name, v6, reply } => {
                let rtype = if v6 { RecordType::AAAA } else { RecordType::A };
                match Name::from_ascii(&name) {
                    Ok(qname) => {
                        self.start_query(Pending {
                            qname,
                            rtype,
                            origin: Origin::Ip { reply },
                            retries: MAX_RETRIES,
                            timeout: INITIAL_TIMEOUT,
                            sent_at: Instant::now(),
                            sends: 0,
                            last_ns: 0,
                        })
                        .await;
                    }
                    Err(_) => {
                        let _ = reply.send(None);
                    }
                }
            }
            ResolverCommand::LookupHostname { addr, reply } => {
                match Name::from_ascii(reverse_name(&addr)) {
                    Ok(qname) => {
                        self.start_query(Pending {
                            qname,
                            rtype: RecordType::PTR,
                            origin: Origin::Hostname { reply, addr },
                            retries: MAX_RETRIES,
                            timeout: INITIAL_TIMEOUT,
                            sent_at: Instant::now(),
                            sends: 0,
                            last_ns: 0,
                        })
                        .await;
                    }
                    Err(_) => {
                        let _ = reply.send(None);
                    }
                }
            }
            ResolverCommand::Nameservers { reply } => {
                let _ = reply.send(self.nameservers.clone());
            }
            ResolverCommand::Reload => self.reload().await,
        }
    }

    async fn reload(&mut self) {
        self.nameservers = resconf::load(&self.conf_path);
        self.failures = vec![0; self.nameservers.len()];
        // In-flight requests may still reference servers that the new list
        // no longer contains; their next resend picks a server afresh.
        for pending in self.pending.values_mut() {
            pending.last_ns = 0;
        }
        match bind_for(&self.nameservers).await {
            Ok(socket) => self.socket = socket,
            Err(e) => tracing::error!("Unable to reopen resolver socket: {}", e),
        }
        tracing::info!("Reloaded nameservers: {:?}", self.nameservers);
    }

    fn generate_id(&self) -> u16 {
        let mut rng = rand::thread_rng();
        loop {
            let id: u16 = rng.gen();
            if id != 0xffff && !self.pending.contains_key(&id) {
                return id;
            }
        }
    }

    async fn start_query(&mut self, pending: Pending) {
        let id = self.generate_id();
        self.pending.insert(id, pending);
        self.send_query(id).await;
    }

    /// Transmit (or retransmit) the request with transaction ID `id`. The
    /// ID is stable across resends so that late replies remain usable.
    async fn send_query(&mut self, id: u16) {
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };

        let mut msg = Message::new();
        msg.set_id(id)
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(pending.qname.clone(), pending.rtype));

        let buf = match msg.to_vec() {
            Ok(buf) => buf,
            Err(e) => {
                tracing::error!("Unable to encode DNS query: {}", e);
                self.fail_query(id);
                return;
            }
        };

        pending.sends += 1;
        pending.sent_at = Instant::now();
        let rotation = pending.sends;

        if let Some(ns) = self.transmit(&buf, rotation).await {
            if let Some(pending) = self.pending.get_mut(&id) {
                pending.last_ns = ns;
            }
        }
        // If no server was reachable, the request stays pending and the
        // timeout sweep will try again.
    }

    /// Pick a nameserver and send. Servers with recent failures are skipped
    /// on most attempts per the cubic backoff, but still probed; if no
    /// healthy server accepts the datagram, the broken ones are tried too.
    async fn transmit(&mut self, buf: &[u8], rotation: u64) -> Option<usize> {
        self.retrycnt += 1;
        let count = self.nameservers.len();

        for i in 0..count {
            let ns = (i + rotation as usize - 1) % count;
            if self.failures[ns] > 0 && self.retrycnt % retry_frequency(self.failures[ns]) != 0 {
                continue;
            }
            if self.socket.send_to(buf, self.nameservers[ns]).await.is_ok() {
                return Some(ns);
            }
        }

        for i in 0..count {
            let ns = (i + rotation as usize - 1) % count;
            if self.failures[ns] == 0 {
                continue;
            }
            if self.socket.send_to(buf, self.nameservers[ns]).await.is_ok() {
                return Some(ns);
            }
        }

        None
    }

    async fn resend_query(&mut self, id: u16) {
        let Some(pending) = self.pending.get_mut(&id) else {
            return;
        };
        if pending.retries <= 1 {
            self.fail_query(id);
            return;
        }
        pending.retries -= 1;
        self.send_query(id).await;
    }

    /// Retire a request and deliver the null result.
    fn fail_query(&mut self, id: u16) {
        if let Some(pending) = self.pending.remove(&id) {
            match pending.origin {
                Origin::Ip { reply } => {
                    let _ = reply.send(None);
                }
                Origin::Hostname { reply, .. } | Origin::HostnameConfirm { reply, .. } => {
                    let _ = reply.send(None);
                }
            }
        }
    }

    async fn sweep_timeouts(&mut self) {
        let now = Instant::now();
        let expired: Vec<u16> = self
            .pending
            .iter()
            .filter(|(_, p)| now >= p.sent_at + p.timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in expired {
            if let Some(pending) = self.pending.get_mut(&id) {
                self.failures[pending.last_ns] += 1;
                pending.timeout *= 2;
            }
            self.resend_query(id).await;
        }
    }

    /// Validate and act on a datagram. A reply is accepted only if its
    /// transaction ID matches an outstanding request, it originates from a
    /// configured nameserver, and it echoes the question we asked;
    /// anything else is dropped and the request stays pending.
    async fn handle_packet(&mut self, buf: &[u8], src: SocketAddr) {
        let Ok(msg) = Message::from_vec(buf) else {
            return;
        };
        let id = msg.id();

        let Some(pending) = self.pending.get(&id) else {
            return;
        };

        let Some(ns) = self.nameservers.iter().position(|a| *a == src) else {
            return;
        };

        if ns != pending.last_ns {
            // A late reply from a previous attempt is usable, but penalise
            // the laggy server so it doesn't end up favoured.
            self.failures[ns] += 3;
        }

        let question_matches = msg
            .queries()
            .first()
            .map(|q| q.name() == &pending.qname && q.query_type() == pending.rtype)
            .unwrap_or(false);
        if !question_matches {
            return;
        }

        match msg.response_code() {
            ResponseCode::ServFail | ResponseCode::NotImp | ResponseCode::Refused => {
                self.failures[ns] += 1;
                self.resend_query(id).await;
            }
            ResponseCode::NoError if !msg.answers().is_empty() => {
                match Self::extract(pending, &msg) {
                    Outcome::Corrupt => {
                        self.failures[ns] += 1;
                        self.resend_query(id).await;
                    }
                    outcome => {
                        self.failures[ns] /= 4;
                        let Some(pending) = self.pending.remove(&id) else {
                            return;
                        };
                        self.deliver(outcome, pending.origin).await;
                    }
                }
            }
            rcode => {
                // Terminal: NXDOMAIN, or a nominal success with no answers.
                if rcode == ResponseCode::NXDomain {
                    self.failures[ns] /= 4;
                }
                self.fail_query(id);
            }
        }
    }

    fn extract(pending: &Pending, msg: &Message) -> Outcome {
        match &pending.origin {
            Origin::Ip { .. } => {
                let addr = msg.answers().iter().find_map(|rec| match rec.rdata() {
                    RData::A(a) if pending.rtype == RecordType::A => Some(IpAddr::from(*a)),
                    RData::AAAA(a) if pending.rtype == RecordType::AAAA => Some(IpAddr::from(*a)),
                    _ => None,
                });
                match addr {
                    Some(addr) => Outcome::Ip(addr),
                    None => Outcome::Corrupt,
                }
            }
            Origin::Hostname { .. } => {
                let ptr = msg.answers().iter().find_map(|rec| match rec.rdata() {
                    RData::PTR(name) => Some(name.clone()),
                    _ => None,
                });
                match ptr {
                    Some(name) => Outcome::Ptr(name),
                    None => Outcome::Corrupt,
                }
            }
            Origin::HostnameConfirm { addr, .. } => {
                let confirmed = msg.answers().iter().any(|rec| match rec.rdata() {
                    RData::A(a) => IpAddr::from(*a) == *addr,
                    RData::AAAA(a) => IpAddr::from(*a) == *addr,
                    _ => false,
                });
                Outcome::Confirmed(confirmed)
            }
        }
    }

    async fn deliver(&mut self, outcome: Outcome, origin: Origin) {
        match (outcome, origin) {
            (Outcome::Ip(addr), Origin::Ip { reply }) => {
                let _ = reply.send(Some(addr));
            }
            (Outcome::Ptr(name), Origin::Hostname { reply, addr }) => {
                // Confirm the name maps back to the address before
                // believing it.
                let display = name.to_utf8().trim_end_matches('.').to_string();
                let rtype = if addr.is_ipv6() {
                    RecordType::AAAA
                } else {
                    RecordType::A
                };
                self.start_query(Pending {
                    qname: name,
                    rtype,
                    origin: Origin::HostnameConfirm {
                        reply,
                        addr,
                        name: display,
                    },
                    retries: MAX_RETRIES,
                    timeout: INITIAL_TIMEOUT,
                    sent_at: Instant::now(),
                    sends: 0,
                    last_ns: 0,
                })
                .await;
            }
            (Outcome::Confirmed(confirmed), Origin::HostnameConfirm { reply, name, .. }) => {
                let _ = reply.send(if confirmed { Some(name) } else { None });
            }
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc::unbounded_channel;
    use trust_dns_proto::rr::Record;

    struct FakeServer {
        socket: UdpSocket,
        buf: [u8; MAX_PACKET],
    }

    impl FakeServer {
        async fn new() -> Self {
            Self {
                socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
                buf: [0u8; MAX_PACKET],
            }
        }

        fn addr(&self) -> SocketAddr {
            self.socket.local_addr().unwrap()
        }

        async fn recv_query(&mut self) -> (Message, SocketAddr) {
            let (len, from) = self.socket.recv_from(&mut self.buf).await.unwrap();
            (Message::from_vec(&self.buf[..len]).unwrap(), from)
        }

        async fn send_to(&self, msg: &Message, to: SocketAddr) {
            self.socket.send_to(&msg.to_vec().unwrap(), to).await.unwrap();
        }
    }

    fn response_for(query: &Message) -> Message {
        let mut msg = Message::new();
        msg.set_id(query.id())
            .set_message_type(MessageType::Response)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .set_recursion_available(true);
        if let Some(q) = query.queries().first() {
            msg.add_query(q.clone());
        }
        msg
    }

    async fn start_resolver(ns: SocketAddr) -> super::super::DnsClient {
        let (tx, rx) = unbounded_channel();
        let resolver = Resolver {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            nameservers: vec![ns],
            failures: vec![0],
            retrycnt: 0,
            pending: HashMap::new(),
            commands: rx,
            conf_path: PathBuf::from("/nonexistent"),
        };
        tokio::spawn(resolver.run());
        super::super::DnsClient::from_sender(tx)
    }

    async fn assert_still_pending(rx: &mut oneshot::Receiver<Option<IpAddr>>) {
        let poll = tokio::time::timeout(Duration::from_millis(200), rx).await;
        assert!(poll.is_err(), "request should still be pending");
    }

    #[tokio::test]
    async fn forged_replies_are_discarded() {
        let mut server = FakeServer::new().await;
        let client = start_resolver(server.addr()).await;

        let mut lookup = client.lookup_ip("test.example.com", false);
        let (query, resolver_addr) = server.recv_query().await;

        let answer = Record::from_rdata(
            query.queries()[0].name().clone(),
            60,
            RData::A("192.0.2.1".parse().unwrap()),
        );

        // Wrong transaction ID.
        let mut bad_id = response_for(&query);
        bad_id.set_id(query.id().wrapping_add(1));
        bad_id.add_answer(answer.clone());
        server.send_to(&bad_id, resolver_addr).await;
        assert_still_pending(&mut lookup).await;

        // Right ID, wrong source address.
        let mut good = response_for(&query);
        good.add_answer(answer.clone());
        let off_path = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        off_path
            .send_to(&good.to_vec().unwrap(), resolver_addr)
            .await
            .unwrap();
        assert_still_pending(&mut lookup).await;

        // Right ID and source, mismatched question name.
        let mut wrong_question = Message::new();
        wrong_question
            .set_id(query.id())
            .set_message_type(MessageType::Response)
            .add_query(Query::query(
                Name::from_ascii("other.example.com.").unwrap(),
                RecordType::A,
            ))
            .add_answer(answer.clone());
        server.send_to(&wrong_question, resolver_addr).await;
        assert_still_pending(&mut lookup).await;

        // The genuine reply still resolves the request.
        server.send_to(&good, resolver_addr).await;
        let result = tokio::time::timeout(Duration::from_secs(2), &mut lookup)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Some("192.0.2.1".parse().unwrap()));
    }

    #[tokio::test]
    async fn nxdomain_is_terminal() {
        let mut server = FakeServer::new().await;
        let client = start_resolver(server.addr()).await;

        let lookup = client.lookup_ip("missing.example.com", false);
        let (query, resolver_addr) = server.recv_query().await;

        let mut response = response_for(&query);
        response.set_response_code(ResponseCode::NXDomain);
        server.send_to(&response, resolver_addr).await;

        let result = tokio::time::timeout(Duration::from_secs(2), lookup)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, None);
    }

    #[tokio::test]
    async fn reverse_lookup_confirms_forward_mapping() {
        let mut server = FakeServer::new().await;
        let client = start_resolver(server.addr()).await;
        let addr: IpAddr = "203.0.113.5".parse().unwrap();

        let lookup = client.lookup_hostname(addr);

        let (ptr_query, resolver_addr) = server.recv_query().await;
        assert_eq!(
            ptr_query.queries()[0].name().to_utf8(),
            "5.113.0.203.in-addr.arpa."
        );
        let mut ptr_response = response_for(&ptr_query);
        ptr_response.add_answer(Record::from_rdata(
            ptr_query.queries()[0].name().clone(),
            60,
            RData::PTR(Name::from_ascii("host.example.com.").unwrap()),
        ));
        server.send_to(&ptr_response, resolver_addr).await;

        // The resolver must now confirm the PTR result with a forward query.
        let (a_query, resolver_addr) = server.recv_query().await;
        assert_eq!(a_query.queries()[0].name().to_utf8(), "host.example.com.");
        assert_eq!(a_query.queries()[0].query_type(), RecordType::A);
        let mut a_response = response_for(&a_query);
        a_response.add_answer(Record::from_rdata(
            a_query.queries()[0].name().clone(),
            60,
            RData::A("203.0.113.5".parse().unwrap()),
        ));
        server.send_to(&a_response, resolver_addr).await;

        let result = tokio::time::timeout(Duration::from_secs(2), lookup)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Some("host.example.com".to_string()));
    }

    #[tokio::test]
    async fn reload_redirects_in_flight_queries() {
        let (_tx, rx) = unbounded_channel();
        let (reply, mut result) = oneshot::channel();
        let mut resolver = Resolver {
            socket: UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            nameservers: vec![
                "127.0.0.1:5300".parse().unwrap(),
                "127.0.0.1:5301".parse().unwrap(),
            ],
            failures: vec![0, 0],
            retrycnt: 0,
            pending: HashMap::new(),
            commands: rx,
            conf_path: PathBuf::from("/nonexistent"),
        };
        resolver.pending.insert(
            0x1234,
            Pending {
                qname: Name::from_ascii("test.example.com.").unwrap(),
                rtype: RecordType::A,
                origin: Origin::Ip { reply },
                retries: MAX_RETRIES,
                timeout: INITIAL_TIMEOUT,
                sent_at: Instant::now() - Duration::from_secs(10),
                sends: 1,
                last_ns: 1,
            },
        );

        // The unreadable config falls back to a single local server, so the
        // index of the server this request last used no longer exists.
        resolver.reload().await;
        assert_eq!(resolver.nameservers.len(), 1);

        // The expired request must be charged to a server on the new list
        // and retransmitted, not left pointing past the end of the table.
        resolver.sweep_timeouts().await;
        assert_eq!(resolver.failures, vec![1]);
        assert!(resolver.pending.values().all(|p| p.last_ns == 0));
        assert_eq!(resolver.pending[&0x1234].retries, MAX_RETRIES - 1);
        assert!(result.try_recv().is_err());
    }

    #[tokio::test]
    async fn spoofed_ptr_without_forward_match_yields_none() {
        let mut server = FakeServer::new().await;
        let client = start_resolver(server.addr()).await;
        let addr: IpAddr = "203.0.113.5".parse().unwrap();

        let lookup = client.lookup_hostname(addr);

        let (ptr_query, resolver_addr) = server.recv_query().await;
        let mut ptr_response = response_for(&ptr_query);
        ptr_response.add_answer(Record::from_rdata(
            ptr_query.queries()[0].name().clone(),
            60,
            RData::PTR(Name::from_ascii("victim.example.com.").unwrap()),
        ));
        server.send_to(&ptr_response, resolver_addr).await;

        let (a_query, resolver_addr) = server.recv_query().await;
        let mut a_response = response_for(&a_query);
        a_response.add_answer(Record::from_rdata(
            a_query.queries()[0].name().clone(),
            60,
            RData::A("198.51.100.99".parse().unwrap()),
        ));
        server.send_to(&a_response, resolver_addr).await;

        let result = tokio::time::timeout(Duration::from_secs(2), lookup)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, None);
    }
}
