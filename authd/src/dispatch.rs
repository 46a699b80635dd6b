//! Routing for command lines received from the parent process.
//!
//! The first character of a line selects the handler. Commands that
//! establish or retire per-client state (`C`, `D`) are strict: a malformed
//! one means the two processes disagree about what exists, and the only
//! safe recovery is to exit and be restarted. Purely advisory commands
//! (`E`, `O`, `S`) are ignored with a warning when malformed, and unknown
//! command letters are skipped entirely so the parent can grow the
//! protocol first.

use crate::error::FatalError;
use crate::protocol::tokenize;
use crate::service::AuthService;

pub fn handle_line(service: &mut AuthService, line: &str) -> Result<(), FatalError> {
    let args = tokenize(line);
    let Some(first) = args.first() else {
        return Ok(());
    };
    let Some(letter) = first.chars().next() else {
        return Ok(());
    };
    let argc = args.len() - 1;

    match letter {
        'C' => {
            if argc < 5 {
                return Err(FatalError::MissingArguments('C', 5, argc));
            }
            service.start_auth(args[1], args[2], args[3], args[4], args[5])
        }
        'D' => {
            if argc < 3 {
                return Err(FatalError::MissingArguments('D', 3, argc));
            }
            service.handle_dns(args[1], args[2], args[3])
        }
        'E' => {
            if argc < 1 {
                tracing::warn!("Ignoring cancel with no client ID");
            } else {
                service.handle_cancel(args[1]);
            }
            Ok(())
        }
        'O' => {
            if argc < 1 {
                tracing::warn!("Ignoring option command with no option name");
            } else {
                service.handle_option(&args[1..]);
            }
            Ok(())
        }
        'S' => {
            if argc < 2 {
                tracing::warn!("Ignoring stats request with missing arguments");
            } else {
                service.handle_stats(args[1], args[2]);
            }
            Ok(())
        }
        'R' => {
            service.handle_reload(&args[1..]);
            Ok(())
        }
        _ => Ok(()),
    }
}
