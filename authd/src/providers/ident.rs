//! Ident (RFC 1413) provider: asks the connecting host who owns the
//! connection.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpSocket;

use crate::client::{ClientRecord, SlotStatus};
use crate::provider::{
    OptionSpec, Provider, ProviderContext, ProviderEvent, ServiceEvent,
};

const IDENT_PORT: u16 = 113;
const USERLEN: usize = 10;
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

const REPORT_LOOKUP: &str = "*** Checking Ident";
const REPORT_FOUND: &str = "*** Got Ident response";
const REPORT_FAIL: &str = "*** No Ident response";
const REPORT_DISABLED: &str = "*** Ident disabled, not checking ident";

const OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "ident_enabled",
        min_args: 0,
    },
    OptionSpec {
        name: "ident_disabled",
        min_args: 0,
    },
    OptionSpec {
        name: "ident_timeout",
        min_args: 1,
    },
];

pub struct IdentProvider {
    enabled: bool,
    timeout: Duration,
}

impl IdentProvider {
    pub fn new() -> Self {
        Self {
            enabled: true,
            timeout: DEFAULT_TIMEOUT,
        }
    }
}

impl Default for IdentProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// Run the ident exchange against the connecting host. We bind the local
/// end to the address the client connected to so multihomed servers query
/// from the expected interface.
async fn query_ident(listen_addr: SocketAddr, peer_addr: SocketAddr) -> Option<String> {
    let socket = match listen_addr {
        SocketAddr::V4(_) => TcpSocket::new_v4().ok()?,
        SocketAddr::V6(_) => TcpSocket::new_v6().ok()?,
    };
    socket
        .bind(SocketAddr::new(listen_addr.ip(), 0))
        .ok()?;

    let mut stream = socket
        .connect(SocketAddr::new(peer_addr.ip(), IDENT_PORT))
        .await
        .ok()?;

    let request = format!("{} , {}\r\n", peer_addr.port(), listen_addr.port());
    stream.write_all(request.as_bytes()).await.ok()?;

    let mut response = Vec::with_capacity(256);
    let mut buf = [0u8; 256];
    loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            break;
        }
        response.extend_from_slice(&buf[..n]);
        if response.contains(&b'\n') || response.len() >= 1024 {
            break;
        }
    }

    let line = String::from_utf8_lossy(&response);
    parse_ident_reply(line.lines().next()?, peer_addr.port(), listen_addr.port())
}

/// Extract a usable username from an ident response line, or `None` when
/// the response is an error, echoes the wrong ports, or contains nothing
/// usable.
fn parse_ident_reply(line: &str, peer_port: u16, listen_port: u16) -> Option<String> {
    let mut fields = line.splitn(4, ':');
    let ports = fields.next()?;
    let resptype = fields.next()?.trim();
    let _opsys = fields.next()?;
    let raw = fields.next()?;

    if resptype != "USERID" {
        return None;
    }

    let mut port_fields = ports.split(',');
    let echoed_peer: u16 = port_fields.next()?.trim().parse().ok()?;
    let echoed_listen: u16 = port_fields.next()?.trim().parse().ok()?;
    if echoed_peer != peer_port || echoed_listen != listen_port {
        return None;
    }

    // Strip operator prefixes, stop at a hostname separator, drop
    // characters that cannot appear in a username.
    let raw = raw.trim().trim_start_matches(|c| c == '~' || c == '^');
    let mut username = String::new();
    for c in raw.chars() {
        if c == '@' {
            break;
        }
        if c.is_whitespace() || c == ':' || c == '[' {
            continue;
        }
        username.push(c);
        if username.len() >= USERLEN {
            break;
        }
    }

    if username.is_empty() {
        None
    } else {
        Some(username)
    }
}

impl Provider for IdentProvider {
    fn name(&self) -> &'static str {
        "ident"
    }

    fn cause(&self) -> char {
        'I'
    }

    fn start(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) -> bool {
        if !self.enabled {
            ctx.notice(client.cid, REPORT_DISABLED);
            ctx.done(client.cid);
            return true;
        }

        ctx.notice(client.cid, REPORT_LOOKUP);

        let pid = ctx.self_id();
        client.mark_running(pid);
        client.set_timeout_relative(pid, self.timeout);

        let events = ctx.event_sender();
        let cid = client.cid;
        let listen_addr = client.listen_addr;
        let peer_addr = client.peer_addr;
        tokio::spawn(async move {
            let result = query_ident(listen_addr, peer_addr).await;
            let _ = events.send(ServiceEvent::Provider {
                cid,
                pid,
                detail: ProviderEvent::IdentReply(result),
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
        let ProviderEvent::IdentReply(result) = detail else {
            return;
        };
        match result {
            Some(username) => {
                client.username = username;
                ctx.notice(client.cid, REPORT_FOUND);
            }
            None => ctx.notice(client.cid, REPORT_FAIL),
        }
        ctx.done(client.cid);
    }

    fn options(&self) -> &'static [OptionSpec] {
        OPTIONS
    }

    fn handle_option(&mut self, name: &str, args: &[&str], _ctx: &mut ProviderContext) {
        match name {
            "ident_enabled" => self.enabled = true,
            "ident_disabled" => self.enabled = false,
            "ident_timeout" => match args[0].parse::<u64>() {
                Ok(secs) => self.timeout = Duration::from_secs(secs),
                Err(_) => tracing::warn!("Ignoring bad ident_timeout value {:?}", args[0]),
            },
            _ => {}
        }
    }
}
