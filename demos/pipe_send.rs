//! Sending side of the bulk-transfer demo: connect and stream N megabytes.
//!
//! ```text
//! cargo run --example pipe_send -- 127.0.0.1:9000 100
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use fdt::{Endpoint, FdtConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let mut args = std::env::args().skip(1);
    let peer: SocketAddr = args.next()
        .unwrap_or_else(|| "127.0.0.1:9000".to_string())
        .parse()?;
    let megabytes: usize = args.next()
        .unwrap_or_else(|| "100".to_string())
        .parse()?;

    let endpoint = Arc::new(Endpoint::new("0.0.0.0:0".parse()?, FdtConfig::default_stream()).await?);
    tokio::spawn({
        let endpoint = endpoint.clone();
        async move { endpoint.recv_loop().await }
    });

    let flow = endpoint.connect(peer).await?;
    info!("connected to {:?}, sending {} MB", peer, megabytes);

    let chunk = vec![0x5Au8; 1 << 20];
    let started = Instant::now();
    for _ in 0..megabytes {
        flow.send(&chunk).await?;
    }

    // close() lingers until the send buffer drains or the allowance expires
    endpoint.close(&flow).await;

    let elapsed = started.elapsed();
    let stats = flow.stats().await;
    info!("sent {} MB in {:.2}s ({:.1} Mbit/s)",
        megabytes,
        elapsed.as_secs_f64(),
        (megabytes as f64) * 8.0 / elapsed.as_secs_f64());
    info!("packets: {} sent, {} retransmitted, {} NAKs received, send interval {:.1}us, rtt {}us",
        stats.pkts_sent, stats.retransmitted, stats.naks_received,
        stats.send_interval_us, stats.rtt_us);

    Ok(())
}
