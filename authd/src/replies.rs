//! Channel for status lines sent back to the parent process.
//!
//! Formatted lines are queued on an unbounded channel and drained by a
//! writer task, so nothing in the provider core ever blocks on the pipe to
//! the parent.

use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

use crate::protocol::{ClientId, Reply, WarnLevel};

#[derive(Clone)]
pub struct Replies {
    sender: UnboundedSender<String>,
}

impl Replies {
    pub fn new() -> (Self, UnboundedReceiver<String>) {
        let (sender, receiver) = unbounded_channel();
        (Self { sender }, receiver)
    }

    fn send(&self, reply: Reply) {
        // Failure means the writer task is gone and we are shutting down.
        let _ = self.sender.send(reply.to_string());
    }

    pub fn accept(&self, cid: ClientId, username: &str, hostname: &str) {
        self.send(Reply::Accept {
            cid,
            username: username.to_string(),
            hostname: hostname.to_string(),
        });
    }

    pub fn reject(
        &self,
        cid: ClientId,
        cause: char,
        username: &str,
        hostname: &str,
        data: Option<&str>,
        reason: &str,
    ) {
        self.send(Reply::Reject {
            cid,
            cause,
            username: username.to_string(),
            hostname: hostname.to_string(),
            data: data.map(str::to_string),
            reason: reason.to_string(),
        });
    }

    pub fn notice(&self, cid: ClientId, text: &str) {
        self.send(Reply::Notice {
            cid,
            text: text.to_string(),
        });
    }

    pub fn warn(&self, level: WarnLevel, text: &str) {
        match level {
            WarnLevel::Debug => tracing::debug!("{}", text),
            WarnLevel::Info => tracing::info!("{}", text),
            WarnLevel::Warning => tracing::warn!("{}", text),
            WarnLevel::Critical => tracing::error!("{}", text),
        }
        self.send(Reply::Warn {
            level,
            text: text.to_string(),
        });
    }

    pub fn dns_result(&self, reqid: &str, qtype: char, result: Option<&str>) {
        self.send(Reply::DnsResult {
            reqid: reqid.to_string(),
            success: result.is_some(),
            qtype,
            result: result.map(str::to_string),
        });
    }

    pub fn stats_result(&self, rid: &str, letter: char, text: &str) {
        self.send(Reply::StatsResult {
            rid: rid.to_string(),
            letter,
            text: text.to_string(),
        });
    }

    pub fn stats_error(&self, rid: &str, letter: char, text: &str) {
        self.send(Reply::StatsError {
            rid: rid.to_string(),
            letter,
            text: text.to_string(),
        });
    }

    pub fn stats_done(&self, rid: &str, letter: char) {
        self.send(Reply::StatsDone {
            rid: rid.to_string(),
            letter,
        });
    }
}
