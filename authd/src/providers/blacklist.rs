//! DNSBL provider: checks the connecting address against configured DNS
//! blacklists.
//!
//! Lookups are deferred until the reverse DNS and ident providers have
//! finished, so a client rejected here has already had its hostname and
//! username resolved for the reject report.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use crate::client::{ClientRecord, SlotStatus};
use crate::dns::reverse_octets;
use crate::protocol::{ClientId, WarnLevel};
use crate::provider::{
    OptionSpec, Provider, ProviderContext, ProviderEvent, ProviderId, ServiceEvent,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Minimum interval between warnings about one misbehaving list.
const WARN_INTERVAL: Duration = Duration::from_secs(3600);

const IPTYPE_V4: u8 = 0x1;
const IPTYPE_V6: u8 = 0x2;

const REPORT_CLEAR: &str = "*** IP not found in DNS blacklist(s)";

const OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "rbl",
        min_args: 4,
    },
    OptionSpec {
        name: "rbl_del",
        min_args: 1,
    },
    OptionSpec {
        name: "rbl_del_all",
        min_args: 0,
    },
    OptionSpec {
        name: "rbl_timeout",
        min_args: 1,
    },
];

/// How a configured reply address constrains which DNSBL answers count as
/// listings.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Filter {
    /// The full reply address must match.
    All(String),
    /// Only the last octet of the reply must match.
    Last(String),
}

impl Filter {
    /// Entries carrying a full address are exact-match filters; a bare
    /// number matches the final octet only.
    fn parse(entry: &str) -> Self {
        if entry.contains('.') || entry.contains(':') {
            Self::All(entry.to_string())
        } else {
            Self::Last(entry.to_string())
        }
    }

    fn matches(&self, reply: &IpAddr) -> bool {
        match self {
            Self::All(addr) => reply.to_string() == *addr,
            Self::Last(octet) => match reply {
                IpAddr::V4(v4) => v4.octets()[3].to_string() == *octet,
                IpAddr::V6(_) => false,
            },
        }
    }
}

struct Blacklist {
    host: String,
    iptype: u8,
    filters: Vec<Filter>,
    reason: String,
    hits: u64,
    last_warning: Option<Instant>,
}

impl Blacklist {
    fn applies_to(&self, addr: &IpAddr) -> bool {
        match addr {
            IpAddr::V4(_) => self.iptype & IPTYPE_V4 != 0,
            IpAddr::V6(_) => self.iptype & IPTYPE_V6 != 0,
        }
    }

    fn is_hit(&self, reply: &IpAddr) -> bool {
        self.filters.is_empty() || self.filters.iter().any(|f| f.matches(reply))
    }

    /// Whether to warn about a bad reply from this list, at most once per
    /// hour.
    fn should_warn(&mut self) -> bool {
        let now = Instant::now();
        match self.last_warning {
            Some(last) if now < last + WARN_INTERVAL => false,
            _ => {
                self.last_warning = Some(now);
                true
            }
        }
    }
}

/// Per-client scan state: lookups issued but not yet answered.
struct Scan {
    outstanding: usize,
    launched: bool,
}

pub struct BlacklistProvider {
    lists: Vec<Blacklist>,
    timeout: Duration,
    scans: HashMap<ClientId, Scan>,
}

impl BlacklistProvider {
    pub fn new() -> Self {
        Self {
            lists: Vec::new(),
            timeout: DEFAULT_TIMEOUT,
            scans: HashMap::new(),
        }
    }

    /// The providers whose results we wait for before querying any list.
    fn prerequisites_done(&self, client: &ClientRecord, ctx: &ProviderContext) -> bool {
        ["rdns", "ident"].iter().all(|name| {
            ctx.provider_id(name)
                .map(|pid| client.is_done(pid))
                .unwrap_or(true)
        })
    }

    fn launch_lookups(&mut self, client: &ClientRecord, ctx: &mut ProviderContext) {
        let addr = client.peer_addr.ip();
        let pid = ctx.self_id();
        let mut outstanding = 0;

        for list in self.lists.iter().filter(|l| l.applies_to(&addr)) {
            let qname = format!("{}.{}", reverse_octets(&addr), list.host);
            let lookup = ctx.dns().lookup_ip(&qname, false);
            let events = ctx.event_sender();
            let cid = client.cid;
            let host = list.host.clone();
            tokio::spawn(async move {
                let reply = lookup.await.ok().flatten();
                let _ = events.send(ServiceEvent::Provider {
                    cid,
                    pid,
                    detail: ProviderEvent::BlacklistReply { list: host, reply },
                });
            });
            outstanding += 1;
        }

        if outstanding == 0 {
            self.scans.remove(&client.cid);
            ctx.done(client.cid);
        } else if let Some(scan) = self.scans.get_mut(&client.cid) {
            scan.outstanding = outstanding;
            scan.launched = true;
        }
    }
}

impl Default for BlacklistProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider for BlacklistProvider {
    fn name(&self) -> &'static str {
        "blacklist"
    }

    fn cause(&self) -> char {
        'B'
    }

    fn start(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) -> bool {
        if self.lists.is_empty() {
            ctx.done(client.cid);
            return true;
        }

        let pid = ctx.self_id();
        client.mark_running(pid);
        client.set_timeout_relative(pid, self.timeout);
        self.scans.insert(
            client.cid,
            Scan {
                outstanding: 0,
                launched: false,
            },
        );

        if self.prerequisites_done(client, ctx) {
            self.launch_lookups(client, ctx);
        }
        true
    }

    fn cancel(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) {
        self.scans.remove(&client.cid);
        if client.status(ctx.self_id()) == SlotStatus::Running {
            ctx.done(client.cid);
        }
    }

    fn completed(
        &mut self,
        client: &mut ClientRecord,
        _finished: ProviderId,
        ctx: &mut ProviderContext,
    ) {
        let waiting = self
            .scans
            .get(&client.cid)
            .map(|scan| !scan.launched)
            .unwrap_or(false);
        if waiting && self.prerequisites_done(client, ctx) {
            self.launch_lookups(client, ctx);
        }
    }

    fn event(
        &mut self,
        client: &mut ClientRecord,
        detail: ProviderEvent,
        ctx: &mut ProviderContext,
    ) {
        let ProviderEvent::BlacklistReply { list, reply } = detail else {
            return;
        };

        let hit = match reply {
            Some(addr) => {
                let Some(entry) = self.lists.iter_mut().find(|l| l.host == list) else {
                    return;
                };
                if addr.is_ipv6() {
                    // DNSBLs answer with IPv4 result codes; an AAAA-shaped
                    // reply means the list is broken or wildcarded.
                    if entry.should_warn() {
                        ctx.warn(
                            WarnLevel::Warning,
                            &format!("Garbage reply from blacklist {}", list),
                        );
                    }
                    false
                } else if entry.is_hit(&addr) {
                    entry.hits += 1;
                    true
                } else {
                    false
                }
            }
            None => false,
        };

        if hit {
            let reason = self
                .lists
                .iter()
                .find(|l| l.host == list)
                .map(|l| l.reason.clone())
                .unwrap_or_default();
            self.scans.remove(&client.cid);
            ctx.reject(client.cid, Some(list), &reason);
            return;
        }

        let finished = match self.scans.get_mut(&client.cid) {
            Some(scan) => {
                scan.outstanding = scan.outstanding.saturating_sub(1);
                scan.outstanding == 0
            }
            None => return,
        };
        if finished {
            self.scans.remove(&client.cid);
            ctx.notice(client.cid, REPORT_CLEAR);
            ctx.done(client.cid);
        }
    }

    fn options(&self) -> &'static [OptionSpec] {
        OPTIONS
    }

    fn handle_option(&mut self, name: &str, args: &[&str], _ctx: &mut ProviderContext) {
        match name {
            "rbl" => {
                let host = args[0].to_string();
                let Ok(iptype) = args[1].parse::<u8>() else {
                    tracing::warn!("Ignoring blacklist {} with bad address type", host);
                    return;
                };
                let filters = match args[2] {
                    "*" => Vec::new(),
                    entries => entries.split(',').map(Filter::parse).collect(),
                };
                let reason = args[3].to_string();

                self.lists.retain(|l| l.host != host);
                self.lists.push(Blacklist {
                    host,
                    iptype,
                    filters,
                    reason,
                    hits: 0,
                    last_warning: None,
                });
            }
            "rbl_del" => {
                self.lists.retain(|l| l.host != args[0]);
            }
            "rbl_del_all" => self.lists.clear(),
            "rbl_timeout" => match args[0].parse::<u64>() {
                Ok(secs) => self.timeout = Duration::from_secs(secs),
                Err(_) => tracing::warn!("Ignoring bad rbl_timeout value {:?}", args[0]),
            },
            _ => {}
        }
    }

    fn stats_letter(&self) -> Option<char> {
        Some('B')
    }

    fn handle_stats(&mut self, rid: &str, letter: char, ctx: &mut ProviderContext) {
        for list in &self.lists {
            ctx.replies.stats_result(
                rid,
                letter,
                &format!("{} {} {}", list.host, list.iptype, list.hits),
            );
        }
        ctx.replies.stats_done(rid, letter);
    }
}
