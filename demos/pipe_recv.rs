//! Receiving side of the bulk-transfer demo: listen, accept one flow, drain
//!  it to a sink and report throughput.
//!
//! ```text
//! cargo run --example pipe_recv -- 0.0.0.0:9000
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use fdt::{Endpoint, FdtConfig};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let bind_addr: SocketAddr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "0.0.0.0:9000".to_string())
        .parse()?;

    let endpoint = Arc::new(Endpoint::new(bind_addr, FdtConfig::default_stream()).await?);
    tokio::spawn({
        let endpoint = endpoint.clone();
        async move { endpoint.recv_loop().await }
    });

    endpoint.listen();
    info!("waiting for a sender on {:?}", endpoint.local_addr());

    let flow = endpoint.accept().await?;
    info!("accepted flow from {:?}", flow.peer_addr());

    let started = Instant::now();
    let mut total = 0u64;
    let mut buf = vec![0u8; 1 << 16];
    loop {
        let n = flow.recv(&mut buf).await?;
        if n == 0 {
            break;
        }
        total += n as u64;
    }

    let elapsed = started.elapsed();
    let stats = flow.stats().await;
    info!("received {} MB in {:.2}s ({:.1} Mbit/s)",
        total / (1024 * 1024),
        elapsed.as_secs_f64(),
        total as f64 * 8.0 / elapsed.as_secs_f64() / 1e6);
    info!("packets: {} received, {} duplicates, {} sequences seen missing, rtt {}us",
        stats.pkts_received, stats.duplicates, stats.recv_loss, stats.rtt_us);

    endpoint.close(&flow).await;
    Ok(())
}
