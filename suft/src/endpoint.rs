//! One UDP socket multiplexing many connections: the listen loop, the
//! connection registry and the listen/dial/accept lifecycle.

use std::collections::{BTreeSet, HashMap};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bufferpool::BufferPool;
use parking_lot::{Mutex, RwLock};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::conn::{self, Conn, ConnShared, Inbox};
use crate::error::{Error, Fatal};
use crate::packet::{self, ConnId, Flags, INVALID_SEQ, Packet};

const SO_BUF_SIZE: usize = 8 << 20;
/// Pooled receive buffers: one datagram each, with headroom over the MTU.
const RECV_BUF_LEN: usize = 1600;
const POOL_MAX_IDLE: usize = 2_000;
/// Without traffic for this long, the listen loop runs housekeeping.
const IDLE_PERIOD: Duration = Duration::from_secs(60);
/// How long a frame may wait for a congested connection inbox before it is
/// dropped. The peer retransmits.
const DISPATCH_TIMEOUT: Duration = Duration::from_millis(30);
/// How long a freshly accepted connection waits for someone to accept it.
const ACCEPT_PUBLISH_TIMEOUT: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct Params {
    /// Local "host:port" to bind. Empty binds an ephemeral port on all
    /// interfaces.
    pub local_addr: String,
    /// Rate ceiling in mbps, within 1..=100.
    pub bandwidth: i64,
    pub is_serv: bool,
    pub fast_retransmit: bool,
    /// Space packets evenly over the RTT instead of bursting a window.
    pub flat_traffic: bool,
    /// Never give up on retransmissions.
    pub super_retransmit: bool,
    /// Positive values enable a periodic per-connection state dump.
    pub debug: i32,
}

impl Default for Params {
    fn default() -> Params {
        Params {
            local_addr: String::new(),
            bandwidth: 2,
            is_serv: false,
            fast_retransmit: false,
            flat_traffic: false,
            super_retransmit: false,
            debug: 0,
        }
    }
}

/// The per-connection slice of [`Params`].
#[derive(Debug, Clone, Copy)]
pub(crate) struct Config {
    pub bandwidth_bps: i64,
    pub fast_retransmit: bool,
    pub flat_traffic: bool,
    pub super_retransmit: bool,
    pub debug: i32,
}

pub(crate) struct EndpointInner {
    pub sock: Arc<UdpSocket>,
    pub cfg: Config,
    pub is_serv: bool,
    pub epoch: Instant,
    closed: AtomicBool,
    id_seq: AtomicU32,
    registry: RwLock<HashMap<u32, Arc<ConnShared>>>,
    /// Remote ids seen per peer address, for duplicate-SYN suppression.
    syn_seen: Mutex<HashMap<SocketAddr, BTreeSet<u32>>>,
    accept_tx: Mutex<Option<mpsc::Sender<Conn>>>,
    pool: BufferPool<Vec<u8>>,
}

impl EndpointInner {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn remove_conn(&self, lid: u32) {
        self.registry.write().remove(&lid);
    }

    /// A fresh local id: servers count deterministically from 1, clients
    /// from a random seed. 0 and the invalid id are never handed out.
    fn alloc_id(&self) -> u32 {
        loop {
            let id = self.id_seq.fetch_add(1, Ordering::SeqCst);

            if id == 0 || id == INVALID_SEQ {
                continue;
            }
            if self.registry.read().contains_key(&id) {
                continue;
            }

            return id;
        }
    }
}

/// A bound UDP socket speaking the reliable transport. Dial out from it, or
/// accept inbound connections when constructed as a server.
pub struct Endpoint {
    inner: Arc<EndpointInner>,
    accept_rx: tokio::sync::Mutex<mpsc::Receiver<Conn>>,
    listen_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Endpoint {
    pub async fn new(params: Params) -> Result<Endpoint, Error> {
        if !(1..=100).contains(&params.bandwidth) {
            return Err(Error::BandwidthOutOfRange);
        }

        let local = if params.local_addr.is_empty() {
            "0.0.0.0:0".to_owned()
        } else {
            params.local_addr.clone()
        };
        let addr = resolve(&local).await?;

        let addr = socket2::SockAddr::from(addr);
        let socket = socket2::Socket::new(addr.domain(), socket2::Type::DGRAM, None)?;
        socket.set_recv_buffer_size(SO_BUF_SIZE)?;
        socket.set_send_buffer_size(SO_BUF_SIZE)?;
        socket.set_nonblocking(true)?;
        socket.bind(&addr)?;

        let socket = std::net::UdpSocket::from(socket);
        let sock = Arc::new(UdpSocket::try_from(socket)?);

        let (accept_tx, accept_rx) = mpsc::channel(1);

        let inner = Arc::new(EndpointInner {
            sock,
            cfg: Config {
                bandwidth_bps: params.bandwidth << 20,
                fast_retransmit: params.fast_retransmit,
                flat_traffic: params.flat_traffic,
                super_retransmit: params.super_retransmit,
                debug: params.debug,
            },
            is_serv: params.is_serv,
            epoch: Instant::now(),
            closed: AtomicBool::new(false),
            id_seq: AtomicU32::new(if params.is_serv { 1 } else { rand::random() }),
            registry: RwLock::new(HashMap::new()),
            syn_seen: Mutex::new(HashMap::new()),
            accept_tx: Mutex::new(Some(accept_tx)),
            pool: BufferPool::new(RECV_BUF_LEN, POOL_MAX_IDLE),
        });

        let listen_task = tokio::spawn(listen_loop(inner.clone()));

        tracing::info!(addr = ?inner.sock.local_addr(), serv = params.is_serv, "endpoint up");

        Ok(Endpoint {
            inner,
            accept_rx: tokio::sync::Mutex::new(accept_rx),
            listen_task: Mutex::new(Some(listen_task)),
        })
    }

    /// Connect to `addr` ("host:port") and run the handshake.
    pub async fn dial(&self, addr: &str) -> Result<Conn, Error> {
        if self.inner.is_closed() {
            return Err(Error::ClosedPipe);
        }

        let remote = resolve(addr).await?;
        let lid = self.inner.alloc_id();
        let (shared, mut channels) = ConnShared::new(self.inner.clone(), remote, lid, 0);
        self.inner.registry.write().insert(lid, shared.clone());

        match conn::dial(&shared, &mut channels.inbox_rx).await {
            Ok(()) => {
                conn::spawn_loops(&shared, channels);
                Ok(Conn::new(shared))
            }
            Err(e) => {
                self.inner.remove_conn(lid);
                Err(e)
            }
        }
    }

    /// The next inbound connection. `None` once the endpoint is closed.
    pub async fn accept(&self) -> Option<Conn> {
        self.accept_rx.lock().await.recv().await
    }

    /// [`Endpoint::accept`] bounded by `timeout`.
    pub async fn listen_timeout(&self, timeout: Duration) -> Option<Conn> {
        tokio::time::timeout(timeout, self.accept()).await.ok().flatten()
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.sock.local_addr()
    }

    /// Registered connections, pending handshakes included.
    pub fn active_connections(&self) -> usize {
        self.inner.registry.read().len()
    }

    /// Stop the listen loop, abort every connection and wake any pending
    /// accept. Idempotent.
    pub fn close(&self) -> Result<(), Error> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(task) = self.listen_task.lock().take() {
            task.abort();
        }
        *self.inner.accept_tx.lock() = None;

        let conns: Vec<_> = {
            let mut registry = self.inner.registry.write();
            registry.drain().map(|(_, conn)| conn).collect()
        };
        for conn in conns {
            conn.fake_shutdown(Fatal::Closed);
        }

        Ok(())
    }
}

#[cfg(test)]
impl Endpoint {
    pub(crate) fn inner(&self) -> &Arc<EndpointInner> {
        &self.inner
    }
}

impl Drop for Endpoint {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

async fn resolve(addr: &str) -> Result<SocketAddr, Error> {
    tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| {
            Error::Io(io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no address for {addr}"),
            ))
        })
}

/// The endpoint's single receive task: read datagrams, validate frames and
/// route them by local id.
async fn listen_loop(inner: Arc<EndpointInner>) {
    loop {
        let mut buf = inner.pool.pull();

        let received =
            tokio::time::timeout(IDLE_PERIOD, inner.sock.recv_from(&mut buf[..])).await;

        let (n, from) = match received {
            Err(_) => {
                idle_housekeeping(&inner);
                continue;
            }
            Ok(Err(e)) => {
                if inner.is_closed() {
                    return;
                }
                tracing::debug!("socket receive failed: {e}");
                continue;
            }
            Ok(Ok(pair)) => pair,
        };

        buf.truncate(n);

        let Some(id) = packet::parse_frame(&buf) else {
            tracing::trace!(%from, len = n, "dropping malformed datagram");
            continue;
        };

        match id.lid {
            0 => {
                if inner.is_serv {
                    tokio::spawn(accept_new_conn(inner.clone(), from, id, buf));
                } else {
                    tracing::trace!(%from, "dropping new-connection frame on client");
                }
            }
            INVALID_SEQ => {
                tracing::trace!(%from, "dropping frame with reserved id");
            }
            lid => {
                let conn = inner.registry.read().get(&lid).cloned();

                match conn {
                    Some(conn) if !conn.shutdown.load(Ordering::SeqCst) => {
                        if conn
                            .inbox_tx
                            .send_timeout(Inbox::Datagram(buf), DISPATCH_TIMEOUT)
                            .await
                            .is_err()
                        {
                            tracing::debug!(lid, "inbox congested, dropping frame");
                        }
                    }
                    _ => {
                        // Unknown connection: tell the peer to tear down.
                        let reset = Packet::control(0, 0, Flags::RESET | Flags::FIN);
                        let frame = reset.encode(ConnId {
                            lid: id.lid,
                            rid: id.rid,
                        });
                        if let Err(e) = inner.sock.send_to(&frame, from).await {
                            tracing::debug!("reset send failed: {e}");
                        }
                        tracing::trace!(%from, lid, "reset unknown connection");
                    }
                }
            }
        }
    }
}

/// Return pooled memory and let idle connections restart their pacing
/// schedule from scratch.
fn idle_housekeeping(inner: &EndpointInner) {
    inner.pool.drain();

    for conn in inner.registry.read().values() {
        if conn.out_pending.load(Ordering::Relaxed) == 0 {
            conn.urgent.store(false, Ordering::SeqCst);
        }
    }
}

async fn accept_new_conn(
    inner: Arc<EndpointInner>,
    from: SocketAddr,
    id: ConnId,
    buf: bufferpool::Buffer<Vec<u8>>,
) {
    {
        let mut seen = inner.syn_seen.lock();
        if !seen.entry(from).or_default().insert(id.rid) {
            tracing::trace!(%from, rid = id.rid, "duplicate SYN");
            return;
        }
    }

    let first = Packet::decode(&buf[packet::TH_SIZE..]);
    drop(buf);

    let lid = inner.alloc_id();
    let (shared, mut channels) = ConnShared::new(inner.clone(), from, lid, id.rid);
    inner.registry.write().insert(lid, shared.clone());

    if let Err(e) = conn::accept(&shared, first, &mut channels.inbox_rx).await {
        tracing::debug!(%from, "inbound handshake failed: {e}");
        inner.remove_conn(lid);
        return;
    }

    conn::spawn_loops(&shared, channels);

    let Some(tx) = inner.accept_tx.lock().clone() else {
        shared.fake_shutdown(Fatal::Closed);
        return;
    };

    if tx
        .send_timeout(Conn::new(shared.clone()), ACCEPT_PUBLISH_TIMEOUT)
        .await
        .is_err()
    {
        tracing::warn!(%from, "nobody accepting, discarding connection");
        shared.fake_shutdown(Fatal::Closed);
    }
}
