//! Reverse DNS provider: resolves the connecting address to a hostname.

use std::time::Duration;

use crate::client::{ClientRecord, SlotStatus};
use crate::provider::{
    OptionSpec, Provider, ProviderContext, ProviderEvent, ServiceEvent,
};

/// Longest hostname we will attach to a client.
const HOSTLEN: usize = 63;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

const REPORT_LOOKUP: &str = "*** Looking up your hostname...";
const REPORT_FOUND: &str = "*** Found your hostname";
const REPORT_FAIL: &str = "*** Couldn't look up your hostname";

const OPTIONS: &[OptionSpec] = &[OptionSpec {
    name: "rdns_timeout",
    min_args: 1,
}];

pub struct RdnsProvider {
    timeout: Duration,
}

impl RdnsProvider {
    pub fn new() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Default for RdnsProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// A usable result fits the hostname field; anything longer is treated as
/// a failed lookup.
fn usable_hostname(name: &str) -> bool {
    !name.is_empty() && name.len() <= HOSTLEN
}

impl Provider for RdnsProvider {
    fn name(&self) -> &'static str {
        "rdns"
    }

    fn cause(&self) -> char {
        'D'
    }

    fn start(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) -> bool {
        ctx.notice(client.cid, REPORT_LOOKUP);

        let pid = ctx.self_id();
        client.mark_running(pid);
        client.set_timeout_relative(pid, self.timeout);

        let lookup = ctx.dns().lookup_hostname(client.peer_addr.ip());
        let events = ctx.event_sender();
        let cid = client.cid;
        tokio::spawn(async move {
            let result = lookup.await.ok().flatten();
            let _ = events.send(ServiceEvent::Provider {
                cid,
                pid,
                detail: ProviderEvent::HostnameResolved(result),
            });
        });
        true
    }

    fn cancel(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) {
        if client.status(ctx.self_id()) == SlotStatus::Running {
            ctx.done(client.cid);
        }
    }

    fn timeout(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) {
        ctx.notice(client.cid, REPORT_FAIL);
        ctx.done(client.cid);
    }

    fn event(
        &mut self,
        client: &mut ClientRecord,
        detail: ProviderEvent,
        ctx: &mut ProviderContext,
    ) {
        let ProviderEvent::HostnameResolved(result) = detail else {
            return;
        };
        match result {
            Some(name) if usable_hostname(&name) => {
                client.hostname = name;
                ctx.notice(client.cid, REPORT_FOUND);
            }
            _ => ctx.notice(client.cid, REPORT_FAIL),
        }
        ctx.done(client.cid);
    }

    fn options(&self) -> &'static [OptionSpec] {
        OPTIONS
    }

    fn handle_option(&mut self, _name: &str, args: &[&str], _ctx: &mut ProviderContext) {
        match args[0].parse::<u64>() {
            Ok(secs) => self.timeout = Duration::from_secs(secs),
            Err(_) => tracing::warn!("Ignoring bad rdns_timeout value {:?}", args[0]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_hostnames_are_rejected() {
        assert!(usable_hostname("host.example.com"));
        assert!(!usable_hostname(""));
        assert!(!usable_hostname(&"a".repeat(HOSTLEN + 1)));
    }
}
