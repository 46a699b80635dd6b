//! The line protocol spoken between the authentication helper and its
//! parent process.
//!
//! Commands and replies are newline-delimited lines of space-separated
//! tokens. The first character of the first token selects the handler. A
//! token beginning with `:` marks the final argument, which runs to the end
//! of the line and may contain spaces. Client IDs are parent-assigned and
//! encoded as hexadecimal.

use std::fmt;
use std::str::FromStr;

/// A parent-assigned identifier for one in-flight connection.
///
/// Always non-zero; the wire encoding is lower-case hexadecimal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(u32);

impl ClientId {
    pub fn new(value: u32) -> Option<Self> {
        if value == 0 {
            None
        } else {
            Some(Self(value))
        }
    }

    pub fn value(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}", self.0)
    }
}

impl FromStr for ClientId {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, ()> {
        let value = u32::from_str_radix(s, 16).map_err(|_| ())?;
        ClientId::new(value).ok_or(())
    }
}

/// Severity of an operational warning relayed to the parent as a `W` line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WarnLevel {
    Debug,
    Info,
    Warning,
    Critical,
}

impl WarnLevel {
    pub fn letter(&self) -> char {
        match self {
            Self::Debug => 'D',
            Self::Info => 'I',
            Self::Warning => 'W',
            Self::Critical => 'C',
        }
    }

    pub fn from_letter(c: char) -> Option<Self> {
        match c {
            'D' => Some(Self::Debug),
            'I' => Some(Self::Info),
            'W' => Some(Self::Warning),
            'C' => Some(Self::Critical),
            _ => None,
        }
    }
}

/// Split a protocol line into its argument tokens.
///
/// Tokens are separated by runs of spaces. A token whose first character is
/// `:` terminates tokenisation; the remainder of the line after the colon
/// becomes the final argument verbatim.
pub fn tokenize(line: &str) -> Vec<&str> {
    let mut args = Vec::new();
    let mut rest = line.trim_start_matches(' ');

    loop {
        if rest.is_empty() {
            break;
        }

        if let Some(trailing) = rest.strip_prefix(':') {
            args.push(trailing);
            break;
        }

        match rest.find(' ') {
            Some(offset) => {
                args.push(&rest[..offset]);
                rest = rest[offset + 1..].trim_start_matches(' ');
            }
            None => {
                args.push(rest);
                break;
            }
        }
    }

    args
}

/// A reply sent from the helper to the parent process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// The client passed all checks and may be admitted.
    Accept {
        cid: ClientId,
        username: String,
        hostname: String,
    },
    /// A provider rejected the client. `cause` identifies the provider.
    Reject {
        cid: ClientId,
        cause: char,
        username: String,
        hostname: String,
        data: Option<String>,
        reason: String,
    },
    /// Advisory text to relay to the connecting client.
    Notice { cid: ClientId, text: String },
    /// Operational warning for the parent to record.
    Warn { level: WarnLevel, text: String },
    /// Result of a `D` resolution request.
    DnsResult {
        reqid: String,
        success: bool,
        qtype: char,
        result: Option<String>,
    },
    /// One line of a stats dump.
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

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Accept {
                cid,
                username,
                hostname,
            } => {
                write!(f, "A {} {} {}", cid, username, hostname)
            }
            Self::Reject {
                cid,
                cause,
                username,
                hostname,
                data,
                reason,
            } => {
                write!(
                    f,
                    "R {} {} {} {} {} :{}",
                    cid,
                    cause,
                    username,
                    hostname,
                    data.as_deref().unwrap_or("*"),
                    reason
                )
            }
            Self::Notice { cid, text } => write!(f, "N {} :{}", cid, text),
            Self::Warn { level, text } => write!(f, "W {} :{}", level.letter(), text),
            Self::DnsResult {
                reqid,
                success,
                qtype,
                result,
            } => {
                write!(
                    f,
                    "E {} {} {} {}",
                    reqid,
                    if *success { 'O' } else { 'E' },
                    qtype,
                    result.as_deref().unwrap_or("*")
                )
            }
            Self::StatsResult { rid, letter, text } => write!(f, "Y {} {} :{}", rid, letter, text),
            Self::StatsError { rid, letter, text } => write!(f, "X {} {} :{}", rid, letter, text),
            Self::StatsDone { rid, letter } => write!(f, "Z {} {}", rid, letter),
        }
    }
}

impl Reply {
    /// Parse a reply line received from the helper. Returns `None` for
    /// unrecognised or malformed lines; the parent treats those as a
    /// protocol error.
    pub fn parse(line: &str) -> Option<Self> {
        let args = tokenize(line);
        let first = *args.first()?;
        let letter = first.chars().next()?;

        match letter {
            'A' if args.len() >= 4 => Some(Self::Accept {
                cid: args[1].parse().ok()?,
                username: args[2].to_string(),
                hostname: args[3].to_string(),
            }),
            'R' if args.len() >= 7 => Some(Self::Reject {
                cid: args[1].parse().ok()?,
                cause: args[2].chars().next()?,
                username: args[3].to_string(),
                hostname: args[4].to_string(),
                data: match args[5] {
                    "*" => None,
                    data => Some(data.to_string()),
                },
                reason: args[6].to_string(),
            }),
            'N' if args.len() >= 3 => Some(Self::Notice {
                cid: args[1].parse().ok()?,
                text: args[2].to_string(),
            }),
            'W' if args.len() >= 3 => Some(Self::Warn {
                level: WarnLevel::from_letter(args[1].chars().next()?)?,
                text: args[2].to_string(),
            }),
            'E' if args.len() >= 5 => Some(Self::DnsResult {
                reqid: args[1].to_string(),
                success: args[2] == "O",
                qtype: args[3].chars().next()?,
                result: match args[4] {
                    "*" => None,
                    result => Some(result.to_string()),
                },
            }),
            'Y' if args.len() >= 4 => Some(Self::StatsResult {
                rid: args[1].to_string(),
                letter: args[2].chars().next()?,
                text: args[3].to_string(),
            }),
            'X' if args.len() >= 4 => Some(Self::StatsError {
                rid: args[1].to_string(),
                letter: args[2].chars().next()?,
                text: args[3].to_string(),
            }),
            'Z' if args.len() >= 3 => Some(Self::StatsDone {
                rid: args[1].to_string(),
                letter: args[2].chars().next()?,
            }),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokenize_simple() {
        assert_eq!(tokenize("C 1a 127.0.0.1 6667"), vec!["C", "1a", "127.0.0.1", "6667"]);
    }

    #[test]
    fn tokenize_trailing() {
        assert_eq!(
            tokenize("N 1a :*** Checking Ident"),
            vec!["N", "1a", "*** Checking Ident"]
        );
    }

    #[test]
    fn tokenize_extra_spaces() {
        assert_eq!(tokenize("  O  rbl_timeout  5"), vec!["O", "rbl_timeout", "5"]);
    }

    #[test]
    fn tokenize_empty() {
        assert!(tokenize("").is_empty());
    }

    #[test]
    fn cid_is_hex_and_nonzero() {
        assert_eq!("1a".parse::<ClientId>().unwrap().value(), 0x1a);
        assert_eq!("1a".parse::<ClientId>().unwrap().to_string(), "1a");
        assert!("0".parse::<ClientId>().is_err());
        assert!("zz".parse::<ClientId>().is_err());
        assert!("100000000".parse::<ClientId>().is_err());
    }

    #[test]
    fn reject_reply_round_trip() {
        let reply = Reply::Reject {
            cid: ClientId::new(3).unwrap(),
            cause: 'B',
            username: "*".to_string(),
            hostname: "host.example.com".to_string(),
            data: Some("dnsbl.example.net".to_string()),
            reason: "Listed in DNSBL".to_string(),
        };
        let line = reply.to_string();
        assert_eq!(line, "R 3 B * host.example.com dnsbl.example.net :Listed in DNSBL");
        assert_eq!(Reply::parse(&line), Some(reply));
    }

    #[test]
    fn accept_reply_round_trip() {
        let reply = Reply::Accept {
            cid: ClientId::new(0x2f).unwrap(),
            username: "alice".to_string(),
            hostname: "*".to_string(),
        };
        assert_eq!(Reply::parse(&reply.to_string()), Some(reply));
    }

    #[test]
    fn dns_result_null_sentinel() {
        let reply = Reply::DnsResult {
            reqid: "7".to_string(),
            success: false,
            qtype: 'R',
            result: None,
        };
        assert_eq!(reply.to_string(), "E 7 E R *");
    }

    #[test]
    fn unknown_reply_ignored() {
        assert_eq!(Reply::parse("Q something else"), None);
        assert_eq!(Reply::parse(""), None);
    }
}
