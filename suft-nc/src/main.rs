//! Netcat-style front-end: pumps stdin into a connection and the connection
//! back to stdout, either dialing out or accepting one inbound peer.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::Parser;
use suft::{Conn, Endpoint, Params};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(
    name = "suft-nc",
    about = "netcat over a rate-paced reliable UDP transport"
)]
struct Args {
    /// Local address to bind, host:port. Empty picks an ephemeral port.
    #[arg(short = 'l', long = "local", default_value = "")]
    local: String,

    /// Remote address to dial, host:port.
    #[arg(short = 'r', long = "remote")]
    remote: Option<String>,

    /// Accept one inbound connection instead of dialing out.
    #[arg(short = 's', long = "server")]
    server: bool,

    /// Bandwidth ceiling in mbps.
    #[arg(short = 'b', long = "bandwidth", default_value_t = 2)]
    bandwidth: i64,

    /// Retransmit on duplicate selective acks instead of waiting for the
    /// timer.
    #[arg(long = "fr")]
    fast_retransmit: bool,

    /// Pace packets evenly over the RTT instead of bursting a window.
    #[arg(long = "ft")]
    flat_traffic: bool,

    /// Never give up on retransmissions.
    #[arg(long = "sr")]
    super_retransmit: bool,

    /// Positive values dump connection state periodically.
    #[arg(long, default_value_t = 0)]
    debug: i32,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .from_env_lossy(),
        )
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let endpoint = Endpoint::new(Params {
        local_addr: args.local.clone(),
        bandwidth: args.bandwidth,
        is_serv: args.server,
        fast_retransmit: args.fast_retransmit,
        flat_traffic: args.flat_traffic,
        super_retransmit: args.super_retransmit,
        debug: args.debug,
    })
    .await?;

    let conn = if args.server {
        endpoint
            .accept()
            .await
            .context("endpoint closed while waiting for a peer")?
    } else {
        let remote = args.remote.as_deref().context("missing -r <remote>")?;
        endpoint.dial(remote).await?
    };

    tracing::info!(peer = %conn.remote_addr(), "connected");

    let mut send_side = tokio::spawn(pump_stdin(conn.clone()));
    let mut recv_side = tokio::spawn(pump_stdout(conn.clone()));

    // Whichever direction finishes first ends the session; give the other a
    // moment to flush before reporting.
    let send_finished_first = tokio::select! {
        r = &mut send_side => {
            r.context("send pump crashed")??;
            true
        }
        r = &mut recv_side => {
            r.context("receive pump crashed")??;
            false
        }
    };

    report(&conn);

    let second = if send_finished_first {
        recv_side
    } else {
        send_side
    };
    if let Ok(r) = tokio::time::timeout(Duration::from_secs(1), second).await {
        r.context("pump task crashed")??;
    }

    endpoint.close()?;

    Ok(())
}

/// stdin -> connection, closing the write side at EOF.
async fn pump_stdin(conn: Conn) -> Result<()> {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; 32 * 1024];
    let mut watch = Stopwatch::start();

    loop {
        let n = stdin.read(&mut buf).await?;
        if n == 0 {
            break;
        }

        let mut off = 0;
        while off < n {
            off += conn.write(&buf[off..n]).await?;
        }
        watch.add(n);
    }

    tracing::info!(send = %watch.report(), "send side done");
    if let Err(e) = conn.close().await {
        tracing::debug!("close: {e}");
    }

    Ok(())
}

/// connection -> stdout until end of stream.
async fn pump_stdout(conn: Conn) -> Result<()> {
    let mut stdout = tokio::io::stdout();
    let mut buf = vec![0u8; 32 * 1024];
    let mut watch = Stopwatch::start();

    loop {
        let n = match conn.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!("receive side ended: {e}");
                break;
            }
        };

        stdout.write_all(&buf[..n]).await?;
        watch.add(n);
    }

    stdout.flush().await?;
    tracing::info!(recv = %watch.report(), "receive side done");
    if let Err(e) = conn.close().await {
        tracing::debug!("close: {e}");
    }

    Ok(())
}

fn report(conn: &Conn) {
    let stats = conn.stats();

    tracing::info!(
        rx = stats.in_packets,
        rx_dup = stats.in_duplicates,
        tx = stats.out_packets,
        tx_dup = stats.out_duplicates,
        fast_resends = stats.fast_resends,
        "transfer counters"
    );
}

struct Stopwatch {
    start: Instant,
    bytes: usize,
}

impl Stopwatch {
    fn start() -> Stopwatch {
        Stopwatch {
            start: Instant::now(),
            bytes: 0,
        }
    }

    fn add(&mut self, n: usize) {
        self.bytes += n;
    }

    fn report(&self) -> String {
        let elapsed = self.start.elapsed().as_secs_f64().max(1e-6);
        let mib = self.bytes as f64 / (1024.0 * 1024.0);

        format!("{mib:.2} MiB in {elapsed:.2}s ({:.2} MiB/s)", mib / elapsed)
    }
}
