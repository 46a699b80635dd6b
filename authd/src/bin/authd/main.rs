use std::path::PathBuf;
use std::time::{Duration, Instant};

use structopt::StructOpt;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::select;
use tokio::sync::mpsc::unbounded_channel;

use authd::dispatch;
use authd::providers;
use authd::{spawn_resolver, AuthService, Replies};

#[derive(Debug, StructOpt)]
#[structopt(about = "Authentication helper process")]
struct Opts {
    /// Nameserver configuration to read
    #[structopt(long, default_value = "/etc/resolv.conf")]
    resolv_conf: PathBuf,

    /// Log filter (e.g. info, authd=debug)
    #[structopt(long, default_value = "info")]
    log: String,
}

#[tokio::main]
async fn main() {
    let opts = Opts::from_args();

    // stdout carries the protocol; logs go to stderr only.
    tracing_subscriber::fmt()
        .with_env_filter(opts.log.as_str())
        .with_writer(std::io::stderr)
        .init();

    let (replies, mut reply_rx) = Replies::new();
    let (event_tx, mut event_rx) = unbounded_channel();
    let dns = spawn_resolver(opts.resolv_conf);

    let mut service = AuthService::new(replies, dns, event_tx);
    providers::load_all(&mut service);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut sweep = tokio::time::interval(Duration::from_secs(1));
    sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        if let Err(e) = dispatch::handle_line(&mut service, &line) {
                            tracing::error!("{}", e);
                            service.shutdown();
                            std::process::exit(e.exit_code());
                        }
                    }
                    // Parent went away; wind down.
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!("Error reading from parent: {}", e);
                        break;
                    }
                }
            },
            reply = reply_rx.recv() => {
                let Some(reply) = reply else { break; };
                let line = format!("{}\n", reply);
                if stdout.write_all(line.as_bytes()).await.is_err()
                    || stdout.flush().await.is_err()
                {
                    break;
                }
            },
            event = event_rx.recv() => {
                let Some(event) = event else { break; };
                service.handle_event(event);
            },
            _ = sweep.tick() => {
                service.timeout_sweep(Instant::now());
            },
        }
    }

    service.shutdown();
}
