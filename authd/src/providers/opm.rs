//! Open proxy monitor: probes the connecting address for common proxy
//! protocols and rejects clients whose host grants a relay handshake.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::client::{ClientRecord, SlotStatus};
use crate::protocol::ClientId;
use crate::provider::{
    OptionSpec, Provider, ProviderContext, ProviderEvent, ServiceEvent,
};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const REPORT_SCANNING: &str = "*** Scanning for open proxies...";
const REPORT_CLEAR: &str = "*** Did not detect open proxies";
const REJECT_REASON: &str = "Open proxy detected";

const OPTIONS: &[OptionSpec] = &[
    OptionSpec {
        name: "opm_enabled",
        min_args: 0,
    },
    OptionSpec {
        name: "opm_disabled",
        min_args: 0,
    },
    OptionSpec {
        name: "opm_timeout",
        min_args: 1,
    },
    OptionSpec {
        name: "opm_listener",
        min_args: 2,
    },
    OptionSpec {
        name: "opm_scanner",
        min_args: 2,
    },
    OptionSpec {
        name: "opm_scanner_del",
        min_args: 2,
    },
    OptionSpec {
        name: "opm_scanner_del_all",
        min_args: 0,
    },
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Proto {
    Socks4,
    Socks5,
    HttpConnect,
}

impl Proto {
    fn parse(name: &str) -> Option<Self> {
        match name {
            "socks4" => Some(Self::Socks4),
            "socks5" => Some(Self::Socks5),
            "httpconnect" => Some(Self::HttpConnect),
            _ => None,
        }
    }

    fn name(&self) -> &'static str {
        match self {
            Self::Socks4 => "socks4",
            Self::Socks5 => "socks5",
            Self::HttpConnect => "httpconnect",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Scanner {
    proto: Proto,
    port: u16,
}

pub struct OpmProvider {
    enabled: bool,
    timeout: Duration,
    /// Address a cooperating proxy would be asked to relay to. Falls back
    /// to the listener the client connected to.
    target: Option<SocketAddr>,
    scanners: Vec<Scanner>,
    outstanding: HashMap<ClientId, usize>,
}

impl OpmProvider {
    pub fn new() -> Self {
        Self {
            enabled: false,
            timeout: DEFAULT_TIMEOUT,
            target: None,
            scanners: Vec::new(),
            outstanding: HashMap::new(),
        }
    }
}

impl Default for OpmProvider {
    fn default() -> Self {
        Self::new()
    }
}

fn socks4_request(target: SocketAddr) -> Option<Vec<u8>> {
    // SOCKS4 only carries IPv4 targets.
    let SocketAddr::V4(v4) = target else {
        return None;
    };
    let mut req = vec![0x04, 0x01];
    req.extend_from_slice(&v4.port().to_be_bytes());
    req.extend_from_slice(&v4.ip().octets());
    req.push(0x00);
    Some(req)
}

fn socks5_request(target: SocketAddr) -> Vec<u8> {
    let mut req = vec![0x05, 0x01, 0x00];
    match target.ip() {
        IpAddr::V4(v4) => {
            req.push(0x01);
            req.extend_from_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            req.push(0x04);
            req.extend_from_slice(&v6.octets());
        }
    }
    req.extend_from_slice(&target.port().to_be_bytes());
    req
}

/// Run one probe. `true` means the remote granted the relay handshake,
/// which is all the evidence we need.
async fn probe(proto: Proto, probe_addr: SocketAddr, target: SocketAddr) -> bool {
    let Ok(mut stream) = TcpStream::connect(probe_addr).await else {
        return false;
    };
    let mut buf = [0u8; 512];

    match proto {
        Proto::Socks4 => {
            let Some(request) = socks4_request(target) else {
                return false;
            };
            if stream.write_all(&request).await.is_err() {
                return false;
            }
            match stream.read(&mut buf).await {
                Ok(n) if n >= 2 => buf[1] == 0x5a,
                _ => false,
            }
        }
        Proto::Socks5 => {
            // Method negotiation first: no authentication.
            if stream.write_all(&[0x05, 0x01, 0x00]).await.is_err() {
                return false;
            }
            match stream.read(&mut buf).await {
                Ok(n) if n >= 2 && buf[0] == 0x05 && buf[1] == 0x00 => {}
                _ => return false,
            }
            if stream.write_all(&socks5_request(target)).await.is_err() {
                return false;
            }
            match stream.read(&mut buf).await {
                Ok(n) if n >= 2 => buf[0] == 0x05 && buf[1] == 0x00,
                _ => false,
            }
        }
        Proto::HttpConnect => {
            let request = format!("CONNECT {}:{} HTTP/1.0\r\n\r\n", target.ip(), target.port());
            if stream.write_all(request.as_bytes()).await.is_err() {
                return false;
            }
            match stream.read(&mut buf).await {
                Ok(n) if n > 0 => http_connect_granted(&buf[..n]),
                _ => false,
            }
        }
    }
}

fn http_connect_granted(response: &[u8]) -> bool {
    let line = String::from_utf8_lossy(response);
    let Some(status) = line.split_whitespace().nth(1) else {
        return false;
    };
    status.starts_with('2')
}

impl Provider for OpmProvider {
    fn name(&self) -> &'static str {
        "opm"
    }

    fn cause(&self) -> char {
        'O'
    }

    fn start(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) -> bool {
        if !self.enabled || self.scanners.is_empty() {
            ctx.done(client.cid);
            return true;
        }

        let peer_ip = client.peer_addr.ip();
        let target = self.target.unwrap_or(client.listen_addr);
        let scanners: Vec<Scanner> = self
            .scanners
            .iter()
            .copied()
            .filter(|s| !(peer_ip.is_ipv6() && s.proto == Proto::Socks4))
            .collect();
        if scanners.is_empty() {
            ctx.done(client.cid);
            return true;
        }

        ctx.notice(client.cid, REPORT_SCANNING);

        let pid = ctx.self_id();
        client.mark_running(pid);
        client.set_timeout_relative(pid, self.timeout);
        self.outstanding.insert(client.cid, scanners.len());

        for scanner in scanners {
            let events = ctx.event_sender();
            let cid = client.cid;
            let probe_addr = SocketAddr::new(peer_ip, scanner.port);
            tokio::spawn(async move {
                let open = probe(scanner.proto, probe_addr, target).await;
                let _ = events.send(ServiceEvent::Provider {
                    cid,
                    pid,
                    detail: ProviderEvent::ProxyProbe {
                        proto: scanner.proto.name(),
                        port: scanner.port,
                        open,
                    },
                });
            });
        }
        true
    }

    fn cancel(&mut self, client: &mut ClientRecord, ctx: &mut ProviderContext) {
        self.outstanding.remove(&client.cid);
        if client.status(ctx.self_id()) == SlotStatus::Running {
            ctx.done(client.cid);
        }
    }

    fn event(
        &mut self,
        client: &mut ClientRecord,
        detail: ProviderEvent,
        ctx: &mut ProviderContext,
    ) {
        let ProviderEvent::ProxyProbe { proto, port, open } = detail else {
            return;
        };

        if open {
            self.outstanding.remove(&client.cid);
            ctx.reject(
                client.cid,
                Some(format!("{}:{}", proto, port)),
                REJECT_REASON,
            );
            return;
        }

        let finished = match self.outstanding.get_mut(&client.cid) {
            Some(count) => {
                *count = count.saturating_sub(1);
                *count == 0
            }
            None => return,
        };
        if finished {
            self.outstanding.remove(&client.cid);
            ctx.notice(client.cid, REPORT_CLEAR);
            ctx.done(client.cid);
        }
    }

    fn options(&self) -> &'static [OptionSpec] {
        OPTIONS
    }

    fn handle_option(&mut self, name: &str, args: &[&str], _ctx: &mut ProviderContext) {
        match name {
            "opm_enabled" => self.enabled = true,
            "opm_disabled" => self.enabled = false,
            "opm_timeout" => match args[0].parse::<u64>() {
                Ok(secs) => self.timeout = Duration::from_secs(secs),
                Err(_) => tracing::warn!("Ignoring bad opm_timeout value {:?}", args[0]),
            },
            "opm_listener" => {
                let addr = args[0].parse::<IpAddr>().ok();
                let port = args[1].parse::<u16>().ok();
                match (addr, port) {
                    (Some(addr), Some(port)) => self.target = Some(SocketAddr::new(addr, port)),
                    _ => tracing::warn!(
                        "Ignoring bad opm_listener address {:?} {:?}",
                        args[0],
                        args[1]
                    ),
                }
            }
            "opm_scanner" => {
                let proto = Proto::parse(args[0]);
                let port = args[1].parse::<u16>().ok();
                match (proto, port) {
                    (Some(proto), Some(port)) => {
                        self.scanners
                            .retain(|s| !(s.proto == proto && s.port == port));
                        self.scanners.push(Scanner { proto, port });
                    }
                    _ => tracing::warn!(
                        "Ignoring bad opm_scanner {:?} port {:?}",
                        args[0],
                        args[1]
                    ),
                }
            }
            "opm_scanner_del" => {
                if let (Some(proto), Ok(port)) = (Proto::parse(args[0]), args[1].parse::<u16>()) {
                    self.scanners
                        .retain(|s| !(s.proto == proto && s.port == port));
                }
            }
            "opm_scanner_del_all" => self.scanners.clear(),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks4_request_format() {
        let req = socks4_request("192.0.2.1:6667".parse().unwrap()).unwrap();
        assert_eq!(req, vec![0x04, 0x01, 0x1a, 0x0b, 192, 0, 2, 1, 0x00]);
        assert!(socks4_request("[2001:db8::1]:6667".parse().unwrap()).is_none());
    }

    #[test]
    fn socks5_request_format() {
        let req = socks5_request("192.0.2.1:6667".parse().unwrap());
        assert_eq!(
            req,
            vec![0x05, 0x01, 0x00, 0x01, 192, 0, 2, 1, 0x1a, 0x0b]
        );
    }

    #[test]
    fn http_connect_status_parsing() {
        assert!(http_connect_granted(b"HTTP/1.0 200 Connection established\r\n"));
        assert!(!http_connect_granted(b"HTTP/1.0 403 Forbidden\r\n"));
        assert!(!http_connect_granted(b"garbage"));
    }
}
