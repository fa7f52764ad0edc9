use std::net::IpAddr;
use std::sync::Mutex;

use rustc_hash::FxHashMap;
use tracing::debug;

/// Path characteristics observed by a finished flow, reused to seed the
///  estimators of the next flow to the same host instead of starting cold.
#[derive(Copy, Clone, Debug, PartialEq)]
pub struct CachedPeerInfo {
    pub rtt_us: u32,
    pub rtt_var_us: u32,
    pub bandwidth_pps: u32,
    pub loss_rate: f64,
    pub cwnd_packets: f64,
}

/// Endpoint-wide cache, keyed by peer host address (not port - parallel flows
///  to the same host share one path).
#[derive(Default)]
pub struct PeerInfoCache {
    entries: Mutex<FxHashMap<IpAddr, CachedPeerInfo>>,
}

impl PeerInfoCache {
    pub fn new() -> PeerInfoCache {
        PeerInfoCache::default()
    }

    pub fn lookup(&self, peer: IpAddr) -> Option<CachedPeerInfo> {
        self.entries.lock().unwrap().get(&peer).copied()
    }

    pub fn update(&self, peer: IpAddr, info: CachedPeerInfo) {
        debug!("caching path info for {:?}: {:?}", peer, info);
        self.entries.lock().unwrap().insert(peer, info);
    }
}
