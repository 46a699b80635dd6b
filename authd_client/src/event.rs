use authd::protocol::Reply;

/// A parsed reply from the worker process.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum AuthEvent {
    /// The connection passed all checks.
    Accept {
        cid: u32,
        username: String,
        hostname: String,
    },
    /// A check rejected the connection. `cause` identifies the provider;
    /// see [`provider_cause_name`].
    Reject {
        cid: u32,
        cause: char,
        username: String,
        hostname: String,
        data: Option<String>,
        reason: String,
    },
    /// Progress text to relay to the connecting client.
    Notice { cid: u32, text: String },
    /// Operational warning from the worker.
    Warn { level: char, text: String },
    /// Result of a DNS lookup made on our behalf.
    DnsResult {
        reqid: String,
        success: bool,
        qtype: char,
        result: Option<String>,
    },
    /// One line of a requested stats dump.
    StatsResult {
        rid: String,
        letter: char,
        text: String,
    },
    /// An error line within a stats dump.
    StatsError {
        rid: String,
        letter: char,
        text: String,
    },
    /// End of a stats dump.
    StatsDone { rid: String, letter: char },
}

impl AuthEvent {
    pub(crate) fn from_reply(reply: Reply) -> Self {
        match reply {
            Reply::Accept {
                cid,
                username,
                hostname,
            } => Self::Accept {
                cid: cid.value(),
                username,
                hostname,
            },
            Reply::Reject {
                cid,
                cause,
                username,
                hostname,
                data,
                reason,
            } => Self::Reject {
                cid: cid.value(),
                cause,
                username,
                hostname,
                data,
                reason,
            },
            Reply::Notice { cid, text } => Self::Notice {
                cid: cid.value(),
                text,
            },
            Reply::Warn { level, text } => Self::Warn {
                level: level.letter(),
                text,
            },
            Reply::DnsResult {
                reqid,
                success,
                qtype,
                result,
            } => Self::DnsResult {
                reqid,
                success,
                qtype,
                result,
            },
            Reply::StatsResult { rid, letter, text } => Self::StatsResult { rid, letter, text },
            Reply::StatsError { rid, letter, text } => Self::StatsError { rid, letter, text },
            Reply::StatsDone { rid, letter } => Self::StatsDone { rid, letter },
        }
    }
}

/// Human-readable name for a reject cause letter.
pub fn provider_cause_name(cause: char) -> &'static str {
    match cause {
        'B' => "Blacklist",
        'D' => "rDNS",
        'I' => "Ident",
        'O' => "Proxy scanner",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_reject_reply() {
        let reply =
            Reply::parse("R 1a B alice host.example.com dnsbl.example.net :Listed in DNSBL")
                .unwrap();
        assert_eq!(
            AuthEvent::from_reply(reply),
            AuthEvent::Reject {
                cid: 0x1a,
                cause: 'B',
                username: "alice".to_string(),
                hostname: "host.example.com".to_string(),
                data: Some("dnsbl.example.net".to_string()),
                reason: "Listed in DNSBL".to_string(),
            }
        );
    }

    #[test]
    fn maps_notice_reply() {
        let reply = Reply::parse("N 2 :*** Checking Ident").unwrap();
        assert_eq!(
            AuthEvent::from_reply(reply),
            AuthEvent::Notice {
                cid: 2,
                text: "*** Checking Ident".to_string(),
            }
        );
    }

    #[test]
    fn cause_names() {
        assert_eq!(provider_cause_name('B'), "Blacklist");
        assert_eq!(provider_cause_name('D'), "rDNS");
        assert_eq!(provider_cause_name('?'), "Unknown");
    }
}
