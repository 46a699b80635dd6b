use std::env::current_exe;
use std::io;
use std::net::SocketAddr;
use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::select;
use tokio::sync::mpsc::{unbounded_channel, Sender, UnboundedReceiver, UnboundedSender};
use tokio::task;

use authd::protocol::Reply;

use crate::AuthEvent;

#[derive(Debug, Error)]
pub enum AuthdError {
    #[error("i/o error communicating with worker: {0}")]
    Io(#[from] io::Error),
    #[error("worker process is no longer running")]
    WorkerGone,
}

enum ControlMessage {
    Line(String),
    Shutdown,
}

/// Handle to a running authentication worker process.
pub struct Authd {
    control_sender: UnboundedSender<ControlMessage>,
    comm_task: task::JoinHandle<io::Result<()>>,
    child: Child,
}

async fn run_communication_task(
    mut stdin: ChildStdin,
    stdout: ChildStdout,
    mut control_receiver: UnboundedReceiver<ControlMessage>,
    event_sender: Sender<AuthEvent>,
) -> io::Result<()> {
    let mut lines = BufReader::new(stdout).lines();

    loop {
        select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) => {
                        match Reply::parse(&line) {
                            Some(reply) => {
                                let event = AuthEvent::from_reply(reply);
                                if event_sender.send(event).await.is_err() {
                                    break;
                                }
                            }
                            // The worker and we disagree about the
                            // protocol; drop the line and let the
                            // supervisor decide whether to restart.
                            None => tracing::error!(
                                "Unparseable reply from auth worker: {:?}",
                                line
                            ),
                        }
                    }
                    None => break,
                }
            },
            control = control_receiver.recv() => {
                match control {
                    Some(ControlMessage::Line(line)) => {
                        stdin.write_all(line.as_bytes()).await?;
                        stdin.write_all(b"\n").await?;
                        stdin.flush().await?;
                    }
                    // Closing stdin tells the worker to wind down.
                    Some(ControlMessage::Shutdown) | None => break,
                }
            },
        }
    }

    Ok(())
}

impl Authd {
    /// Spawn the worker from the `authd` binary next to the current
    /// executable.
    pub fn new(event_channel: Sender<AuthEvent>) -> Result<Self, AuthdError> {
        let my_path = current_exe()?;
        let dir = my_path
            .parent()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))?;
        Self::with_exe_path(dir.join("authd"), event_channel)
    }

    pub fn with_exe_path(
        exec_path: impl AsRef<Path>,
        event_channel: Sender<AuthEvent>,
    ) -> Result<Self, AuthdError> {
        let mut child = Command::new(exec_path.as_ref())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::from(io::ErrorKind::BrokenPipe))?;

        let (control_sender, control_receiver) = unbounded_channel();
        let comm_task = task::spawn(run_communication_task(
            stdin,
            stdout,
            control_receiver,
            event_channel,
        ));

        Ok(Self {
            control_sender,
            comm_task,
            child,
        })
    }

    fn send(&self, line: String) {
        if self.control_sender.send(ControlMessage::Line(line)).is_err() {
            tracing::error!("Auth worker communication task has gone away");
        }
    }

    /// Ask the worker to begin checks for a new connection.
    pub fn start_auth(&self, cid: u32, listen_addr: SocketAddr, peer_addr: SocketAddr) {
        self.send(lines::start_auth(cid, listen_addr, peer_addr));
    }

    /// Withdraw a connection; no accept or reject will be sent for it.
    pub fn cancel_auth(&self, cid: u32) {
        self.send(lines::cancel_auth(cid));
    }

    /// Resolve a name or address via the worker's resolver. The answer
    /// comes back as [`AuthEvent::DnsResult`] carrying `reqid`.
    pub fn dns_lookup(&self, reqid: &str, qtype: char, query: &str) {
        self.send(format!("D {} {} {}", reqid, qtype, query));
    }

    /// Send a raw provider option.
    pub fn set_option(&self, name: &str, args: &[&str]) {
        let mut line = format!("O {}", name);
        for arg in args {
            line.push(' ');
            line.push_str(arg);
        }
        self.send(line);
    }

    /// Configure a DNS blacklist. `iptype` is a bitmask (1 = IPv4,
    /// 2 = IPv6); `filters` lists reply addresses or final octets that
    /// count as listings, empty meaning any reply.
    pub fn add_blacklist(&self, host: &str, iptype: u8, filters: &[&str], reason: &str) {
        self.send(lines::add_blacklist(host, iptype, filters, reason));
    }

    pub fn del_blacklist(&self, host: &str) {
        self.set_option("rbl_del", &[host]);
    }

    pub fn del_blacklist_all(&self) {
        self.set_option("rbl_del_all", &[]);
    }

    pub fn ident_check_enable(&self, enabled: bool) {
        self.set_option(
            if enabled { "ident_enabled" } else { "ident_disabled" },
            &[],
        );
    }

    pub fn opm_check_enable(&self, enabled: bool) {
        self.set_option(if enabled { "opm_enabled" } else { "opm_disabled" }, &[]);
    }

    /// Add a proxy scanner probing `port` with the named protocol
    /// (`socks4`, `socks5` or `httpconnect`).
    pub fn create_opm_scanner(&self, proto: &str, port: u16) {
        self.set_option("opm_scanner", &[proto, &port.to_string()]);
    }

    /// Request a stats dump; lines come back as [`AuthEvent::StatsResult`]
    /// terminated by [`AuthEvent::StatsDone`].
    pub fn request_stats(&self, rid: &str, letter: char) {
        self.send(format!("S {} {}", rid, letter));
    }

    /// Ask the worker to re-read its resolver configuration.
    pub fn reload_dns(&self) {
        self.send("R D".to_string());
    }

    /// Stop the worker and wait for it to exit.
    pub async fn shutdown(mut self) -> Result<(), AuthdError> {
        self.control_sender
            .send(ControlMessage::Shutdown)
            .map_err(|_| AuthdError::WorkerGone)?;
        self.comm_task
            .await
            .map_err(|_| AuthdError::WorkerGone)??;
        self.child.wait().await?;
        Ok(())
    }
}

/// Wire formatting for the command lines we send.
mod lines {
    use std::net::SocketAddr;

    pub(super) fn start_auth(cid: u32, listen_addr: SocketAddr, peer_addr: SocketAddr) -> String {
        format!(
            "C {:x} {} {} {} {}",
            cid,
            listen_addr.ip(),
            listen_addr.port(),
            peer_addr.ip(),
            peer_addr.port()
        )
    }

    pub(super) fn cancel_auth(cid: u32) -> String {
        format!("E {:x}", cid)
    }

    pub(super) fn add_blacklist(host: &str, iptype: u8, filters: &[&str], reason: &str) -> String {
        let filters = if filters.is_empty() {
            "*".to_string()
        } else {
            filters.join(",")
        };
        format!("O rbl {} {} {} :{}", host, iptype, filters, reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_auth_line_format() {
        assert_eq!(
            lines::start_auth(
                0x1a,
                "127.0.0.1:6667".parse().unwrap(),
                "203.0.113.5:51000".parse().unwrap()
            ),
            "C 1a 127.0.0.1 6667 203.0.113.5 51000"
        );
    }

    #[test]
    fn cancel_line_is_hex() {
        assert_eq!(lines::cancel_auth(255), "E ff");
    }

    #[test]
    fn blacklist_line_format() {
        assert_eq!(
            lines::add_blacklist("dnsbl.example.net", 1, &["127.0.0.2", "3"], "Listed in DNSBL"),
            "O rbl dnsbl.example.net 1 127.0.0.2,3 :Listed in DNSBL"
        );
        assert_eq!(
            lines::add_blacklist("dnsbl.example.net", 3, &[], "Listed"),
            "O rbl dnsbl.example.net 3 * :Listed"
        );
    }
}
