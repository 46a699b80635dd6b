use thiserror::Error;

use crate::protocol::ClientId;

/// Exit status used when the parent sends something indicating the two
/// processes no longer agree about outstanding work.
pub const EX_PROTOCOL_ERROR: i32 = 4;
/// Exit status for unrecoverable DNS subsystem failures.
pub const EX_DNS_ERROR: i32 = 5;

/// A condition that cannot be recovered from locally. The helper exits with
/// a distinct status so the supervising parent can restart it cleanly.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("parent sent a new connection with duplicate client ID {0}")]
    DuplicateClient(ClientId),
    #[error("parent sent a bad client ID: {0:?}")]
    BadClientId(String),
    #[error("parent sent an unparseable address in {0:?}")]
    BadAddress(String),
    #[error("{0:?} command is missing required arguments: expected {1}, got {2}")]
    MissingArguments(char, usize, usize),
    #[error("parent sent an unknown DNS query type: {0:?}")]
    BadDnsQuery(String),
}

impl FatalError {
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::BadDnsQuery(_) => EX_DNS_ERROR,
            _ => EX_PROTOCOL_ERROR,
        }
    }
}
