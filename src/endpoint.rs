//! The process-wide endpoint: it owns the UDP socket, demultiplexes inbound
//!  datagrams to their flows by destination id, runs the handshake (with
//!  stateless cookies on the listening side), and carries the
//!  per-destination cache across flows.
//!
//! Like every other long-lived service here it is created explicitly and the
//!  application drives its receive loop:
//!
//! ```ignore
//! let endpoint = Arc::new(Endpoint::new(addr, config).await?);
//! tokio::spawn({ let e = endpoint.clone(); async move { e.recv_loop().await } });
//! ```

use std::hash::Hasher;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use anyhow::bail;
use bytes::BytesMut;
use rand::Rng;
use rustc_hash::FxHashMap;
use siphasher::sip::SipHasher13;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, RwLock};
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::cache::PeerInfoCache;
use crate::config::FdtConfig;
use crate::connection::{Connection, ConnectionSeed};
use crate::packet::{
    self, ControlMessage, ControlPacket, Handshake, HANDSHAKE_VERSION, HS_REQUEST, HS_RESPONSE,
    HS_RESPONSE_FINAL, SOCK_TYPE_FRAME, SOCK_TYPE_STREAM,
};
use crate::send_pipeline::SendPipeline;
use crate::seq::SeqNo;

/// cookies rotate on this period; the previous window stays valid to cover
///  handshakes spanning a boundary
const COOKIE_WINDOW_SECS: u64 = 60;

pub struct Endpoint {
    config: Arc<FdtConfig>,
    socket: Arc<UdpSocket>,
    pipeline: Arc<SendPipeline>,
    cache: PeerInfoCache,

    /// established flows by local socket id
    flows: RwLock<FxHashMap<u32, Arc<Connection>>>,
    /// listening side: (peer address, peer socket id) -> local socket id,
    ///  for recognizing repeated handshake requests
    peer_index: Mutex<FxHashMap<(SocketAddr, u32), u32>>,
    /// client side: connects awaiting their handshake responses
    pending_connects: Mutex<FxHashMap<u32, mpsc::Sender<Handshake>>>,

    listening: AtomicBool,
    accept_tx: mpsc::Sender<Arc<Connection>>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Connection>>>,

    next_socket_id: AtomicU32,
    cookie_key: [u8; 16],
}

impl Endpoint {
    pub async fn new(bind_addr: SocketAddr, config: FdtConfig) -> anyhow::Result<Endpoint> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("bound endpoint to {:?}", socket.local_addr()?);

        let (accept_tx, accept_rx) = mpsc::channel(64);

        Ok(Endpoint {
            config: Arc::new(config),
            pipeline: Arc::new(SendPipeline::new(Arc::new(socket.clone()))),
            socket,
            cache: PeerInfoCache::new(),
            flows: RwLock::new(FxHashMap::default()),
            peer_index: Mutex::new(FxHashMap::default()),
            pending_connects: Mutex::new(FxHashMap::default()),
            listening: AtomicBool::new(false),
            accept_tx,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            next_socket_id: AtomicU32::new(rand::thread_rng().gen_range(1..=0xFFFF)),
            cookie_key: rand::thread_rng().gen(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.pipeline.local_addr()
    }

    fn alloc_socket_id(&self) -> u32 {
        loop {
            let id = self.next_socket_id.fetch_add(1, Ordering::Relaxed);
            if id != 0 {
                return id;
            }
        }
    }

    fn advertised_flow_window(&self) -> u32 {
        self.config.flow_window.min(self.config.recv_buffer_packets)
    }

    fn own_sock_type(&self) -> u32 {
        if self.config.frame_aware { SOCK_TYPE_FRAME } else { SOCK_TYPE_STREAM }
    }

    fn cookie_for(&self, peer: SocketAddr, windows_back: u64) -> u32 {
        let window = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_secs() / COOKIE_WINDOW_SECS)
            .unwrap_or(0)
            .saturating_sub(windows_back);

        let mut hasher = SipHasher13::new_with_key(&self.cookie_key);
        hasher.write(&Handshake::addr_bytes(peer.ip()));
        hasher.write_u16(peer.port());
        hasher.write_u64(window);
        let hash = hasher.finish();

        let cookie = (hash ^ (hash >> 32)) as u32;
        if cookie == 0 { 1 } else { cookie }
    }

    fn cookie_valid(&self, peer: SocketAddr, cookie: u32) -> bool {
        cookie == self.cookie_for(peer, 0) || cookie == self.cookie_for(peer, 1)
    }

    async fn send_handshake(&self, to: SocketAddr, dest_id: u32, hs: Handshake) {
        let packet = ControlPacket {
            timestamp: 0,
            dest_id,
            message: ControlMessage::Handshake(hs),
        };
        let mut buf = BytesMut::with_capacity(packet::HEADER_LEN + Handshake::SERIALIZED_LEN);
        packet.ser(&mut buf);
        self.pipeline.send_packet(to, &buf).await;
    }

    /// Open a flow to a listening peer. The handshake is retried with
    ///  exponential backoff until `connect_timeout`.
    pub async fn connect(&self, peer: SocketAddr) -> anyhow::Result<Arc<Connection>> {
        let local_id = self.alloc_socket_id();
        let (tx, rx) = mpsc::channel(4);
        self.pending_connects.lock().unwrap().insert(local_id, tx);

        let result = self.drive_connect(peer, local_id, rx).await;
        self.pending_connects.lock().unwrap().remove(&local_id);
        result
    }

    async fn drive_connect(
        &self,
        peer: SocketAddr,
        local_id: u32,
        mut rx: mpsc::Receiver<Handshake>,
    ) -> anyhow::Result<Arc<Connection>> {
        let init_seq = SeqNo::from_raw(rand::thread_rng().gen_range(0..=SeqNo::MAX));
        let mut request = Handshake {
            version: HANDSHAKE_VERSION,
            sock_type: self.own_sock_type(),
            init_seq,
            mss: self.config.mss,
            flow_window: self.advertised_flow_window(),
            req_type: HS_REQUEST,
            socket_id: local_id,
            cookie: 0,
            peer_addr: Handshake::addr_bytes(peer.ip()),
        };

        let deadline = tokio::time::Instant::now() + self.config.connect_timeout;
        let mut retry_interval = self.config.connect_retry_interval;

        debug!("connecting to {:?} as flow {}", peer, local_id);
        loop {
            self.send_handshake(peer, 0, request.clone()).await;

            let response = match timeout(retry_interval, rx.recv()).await {
                Ok(Some(response)) => response,
                Ok(None) => bail!("endpoint shut down while connecting"),
                Err(_) => {
                    if tokio::time::Instant::now() >= deadline {
                        bail!("connect to {:?} timed out", peer);
                    }
                    retry_interval = (retry_interval * 2).min(Duration::from_secs(2));
                    continue;
                }
            };

            match response.req_type {
                HS_RESPONSE => {
                    // cookie challenge: repeat the request with the cookie set
                    trace!("received cookie challenge from {:?}", peer);
                    request.cookie = response.cookie;
                }
                HS_RESPONSE_FINAL => {
                    if response.sock_type != request.sock_type {
                        bail!("peer {:?} runs in a different mode (socket type {} vs {})",
                            peer, response.sock_type, request.sock_type);
                    }

                    let connection = Connection::new(
                        ConnectionSeed {
                            config: self.config.clone(),
                            peer_addr: peer,
                            local_id,
                            peer_id: response.socket_id,
                            own_init_seq: init_seq,
                            peer_init_seq: response.init_seq,
                            mss: self.config.mss.min(response.mss),
                            frame_aware: self.config.frame_aware,
                            flow_window: response.flow_window,
                            cache_hint: self.cache.lookup(peer.ip()),
                            hs_response: None,
                        },
                        self.pipeline.clone(),
                    );
                    self.flows.write().await.insert(local_id, connection.clone());
                    info!("connected to {:?} as flow {} (peer flow {})", peer, local_id, response.socket_id);
                    return Ok(connection);
                }
                other => {
                    debug!("ignoring handshake with unexpected request type {}", other);
                }
            }

            if tokio::time::Instant::now() >= deadline {
                bail!("connect to {:?} timed out", peer);
            }
        }
    }

    /// start answering handshake requests
    pub fn listen(&self) {
        info!("listening on {:?}", self.local_addr());
        self.listening.store(true, Ordering::Release);
    }

    /// next flow opened by a remote peer; `listen` must have been called
    pub async fn accept(&self) -> anyhow::Result<Arc<Connection>> {
        if !self.listening.load(Ordering::Acquire) {
            bail!("endpoint is not listening");
        }
        match self.accept_rx.lock().await.recv().await {
            Some(connection) => Ok(connection),
            None => bail!("endpoint shut down"),
        }
    }

    /// Close a flow: drain within the linger allowance, announce shutdown to
    ///  the peer, record path characteristics for future flows, release the
    ///  local state.
    pub async fn close(&self, connection: &Arc<Connection>) {
        connection.shutdown().await;
        self.cache.update(connection.peer_addr().ip(), connection.cache_entry().await);

        self.flows.write().await.remove(&connection.local_id());
        self.peer_index.lock().unwrap()
            .retain(|_, &mut local_id| local_id != connection.local_id());
        debug!("closed flow {}", connection.local_id());
    }

    /// The endpoint's receive loop: demultiplexes every inbound datagram to
    ///  its flow, or into handshake processing. Spawn exactly one per
    ///  endpoint.
    pub async fn recv_loop(&self) {
        info!("starting receive loop");
        let mut buf = vec![0u8; self.config.mss as usize + packet::HEADER_LEN_FRAME + 64];

        loop {
            let (len, from) = match self.socket.recv_from(&mut buf).await {
                Ok(x) => x,
                Err(e) => {
                    warn!("socket error: {}", e);
                    continue;
                }
            };
            let datagram = &buf[..len];

            let Some(dest_id) = packet::peek_dest_id(datagram) else {
                trace!("dropping runt datagram of {} bytes from {:?}", len, from);
                continue;
            };

            if dest_id == 0 {
                self.on_handshake_datagram(datagram, from).await;
                continue;
            }

            let flow = self.flows.read().await.get(&dest_id).cloned();
            if let Some(flow) = flow {
                flow.on_datagram(datagram).await;
            }
            else if let Some(hs) = parse_handshake(datagram) {
                // a response to one of our in-flight connects
                let waiter = self.pending_connects.lock().unwrap().get(&dest_id).cloned();
                match waiter {
                    Some(waiter) => {
                        let _ = waiter.try_send(hs);
                    }
                    None => debug!("handshake for unknown flow {} from {:?}", dest_id, from),
                }
            }
            else {
                trace!("dropping datagram for unknown flow {} from {:?}", dest_id, from);
            }
        }
    }

    async fn on_handshake_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let Some(hs) = parse_handshake(datagram) else {
            trace!("dropping non-handshake datagram for flow 0 from {:?}", from);
            return;
        };

        if hs.req_type != HS_REQUEST {
            trace!("ignoring handshake with request type {} from {:?}", hs.req_type, from);
            return;
        }
        if !self.listening.load(Ordering::Acquire) {
            trace!("not listening - dropping handshake request from {:?}", from);
            return;
        }
        if hs.version != HANDSHAKE_VERSION {
            debug!("dropping handshake with unsupported version {} from {:?}", hs.version, from);
            return;
        }

        if hs.cookie == 0 {
            // stateless challenge: no connection state exists until the
            //  peer proves it owns its address
            let challenge = Handshake {
                req_type: HS_RESPONSE,
                cookie: self.cookie_for(from, 0),
                socket_id: 0,
                init_seq: SeqNo::from_raw(0),
                peer_addr: Handshake::addr_bytes(from.ip()),
                ..hs
            };
            self.send_handshake(from, hs.socket_id, challenge).await;
            return;
        }

        if !self.cookie_valid(from, hs.cookie) {
            debug!("cookie mismatch in handshake from {:?} - discarding", from);
            return;
        }

        // a repeated request for an already-established flow means our final
        //  response got lost; the flow replays it
        let existing = self.peer_index.lock().unwrap().get(&(from, hs.socket_id)).copied();
        if let Some(local_id) = existing {
            let flow = self.flows.read().await.get(&local_id).cloned();
            if let Some(flow) = flow {
                flow.on_datagram(datagram).await;
            }
            return;
        }

        if hs.sock_type != self.own_sock_type() {
            debug!("handshake from {:?} requests socket type {} but this endpoint runs {} - discarding",
                from, hs.sock_type, self.own_sock_type());
            return;
        }

        let local_id = self.alloc_socket_id();
        let own_init_seq = SeqNo::from_raw(rand::thread_rng().gen_range(0..=SeqNo::MAX));
        let mss = self.config.mss.min(hs.mss);

        let response = Handshake {
            version: HANDSHAKE_VERSION,
            sock_type: hs.sock_type,
            init_seq: own_init_seq,
            mss,
            flow_window: self.advertised_flow_window(),
            req_type: HS_RESPONSE_FINAL,
            socket_id: local_id,
            cookie: hs.cookie,
            peer_addr: Handshake::addr_bytes(from.ip()),
        };

        let connection = Connection::new(
            ConnectionSeed {
                config: self.config.clone(),
                peer_addr: from,
                local_id,
                peer_id: hs.socket_id,
                own_init_seq,
                peer_init_seq: hs.init_seq,
                mss,
                frame_aware: hs.sock_type == SOCK_TYPE_FRAME,
                flow_window: hs.flow_window,
                cache_hint: self.cache.lookup(from.ip()),
                hs_response: Some(response.clone()),
            },
            self.pipeline.clone(),
        );

        self.flows.write().await.insert(local_id, connection.clone());
        self.peer_index.lock().unwrap().insert((from, hs.socket_id), local_id);
        info!("accepted flow {} from {:?} (peer flow {})", local_id, from, hs.socket_id);

        self.send_handshake(from, hs.socket_id, response).await;

        if self.accept_tx.send(connection).await.is_err() {
            warn!("accept queue is gone - dropping incoming flow");
        }
    }
}

fn parse_handshake(datagram: &[u8]) -> Option<Handshake> {
    if !packet::is_control(datagram) {
        return None;
    }
    match ControlPacket::deser(&mut &datagram[..]) {
        Ok(ControlPacket { message: ControlMessage::Handshake(hs), .. }) => Some(hs),
        _ => None,
    }
}
