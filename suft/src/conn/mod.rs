//! Per-connection state and the user-facing byte-stream API.

mod ack;
mod close;
mod handshake;
mod recv;
mod send;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{Notify, mpsc};

pub(crate) use handshake::{accept, dial, spawn_loops};

use crate::endpoint::{Config, EndpointInner};
use crate::error::{Error, Fatal};
use crate::packet::{self, ConnId, Flags, Packet};
use crate::queue::{OrderedQueue, QueueNode};
use crate::rtt::RttEstimator;
use crate::stats::{ConnStats, Counters};

pub(crate) const MAX_RETRIES: u8 = 6;
pub(crate) const FR_THRESHOLD: u32 = 2;
pub(crate) const MIN_CWND: i32 = 4;
const INBOX_DEPTH: usize = 32;

/// Connection lifecycle. Post-handshake transitions only move toward
/// [`State::Fin`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub(crate) enum State {
    Fin = 0,
    Fin0 = 1,
    Fin1 = 2,
    Syn0 = 3,
    Syn1 = 4,
    Est0 = 5,
    Est1 = 6,
}

impl State {
    fn from_u32(v: u32) -> State {
        match v {
            0 => State::Fin,
            1 => State::Fin0,
            2 => State::Fin1,
            3 => State::Syn0,
            4 => State::Syn1,
            5 => State::Est0,
            _ => State::Est1,
        }
    }
}

/// A message dispatched into a connection's inbox by the endpoint.
pub(crate) enum Inbox {
    Datagram(bufferpool::Buffer<Vec<u8>>),
    /// Posted instead of closing the channel: the endpoint may still hold a
    /// sender for late retransmits.
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SwndSignal {
    Active,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseEvent {
    /// Our FIN was acknowledged by the peer.
    FinAcked,
    /// The peer's FIN arrived and the read side is closed.
    Closed,
}

/// Receiving halves of the per-connection channels, handed to the transport
/// tasks when the handshake completes.
pub(crate) struct LoopChannels {
    pub inbox_rx: mpsc::Receiver<Inbox>,
    pub swnd_rx: mpsc::Receiver<SwndSignal>,
    pub ack_rx: mpsc::Receiver<()>,
}

/// Inbound side: reassembly queue and the readable staging buffer.
/// Serialised by one lock as a unit.
pub(crate) struct InState {
    pub q: OrderedQueue,
    pub ready: BytesMut,
    /// Highest seq already staged for the reader.
    pub last_read_seq: u32,
    /// Highest seq for which all prior seqs are present.
    pub max_ctn_seq: u32,
    /// Last cumulative ack we told the peer about.
    pub last_ack: u32,
    pub last_ack_time: i64,
    /// An in-order arrival is waiting for the delayed-ack timer.
    pub need_ack: bool,
    pub read_closed: bool,
    pub last_time_probe: i64,
}

/// Outbound side: retransmit queue, sequence counter and the send window.
pub(crate) struct OutState {
    pub q: OrderedQueue,
    pub my_seq: u32,
    /// Count of queued nodes not yet transmitted once.
    pub unsent: i32,
    pub rtt: RttEstimator,
    pub swnd: i32,
    pub cwnd: i32,
    pub last_shrink: i64,
    pub last_grow: i64,
    /// Pacing timeline in microseconds (flat-traffic mode).
    pub next_send_at: i64,
    /// Seq of our FIN once queued, 0 before that.
    pub fin_seq: u32,
    pub fin_acked: bool,
    pub write_closed: bool,
    /// The retransmit budget ran out or the peer reset us.
    pub broken: bool,
}

impl OutState {
    pub fn in_flight(&self) -> i32 {
        self.q.len() as i32 - self.unsent
    }
}

pub(crate) struct ConnShared {
    pub endpoint: Arc<EndpointInner>,
    pub sock: Arc<UdpSocket>,
    pub peer: SocketAddr,
    pub lid: u32,
    /// The peer's id, learned from the first frame it sends us.
    pub rid: AtomicU32,
    pub cfg: Config,
    epoch: Instant,

    pub state: AtomicU32,
    pub fatal: Mutex<Option<Fatal>>,
    /// Checked by the endpoint before dispatching into the inbox.
    pub shutdown: AtomicBool,
    /// Pacing timeline is primed. Cleared by idle housekeeping so the next
    /// burst starts from a fresh schedule.
    pub urgent: AtomicBool,
    pub out_pending: AtomicI32,
    pub inexplicable: AtomicU32,

    pub inq: Mutex<InState>,
    pub outq: Mutex<OutState>,

    pub ev_read: Notify,
    pub ev_write: Notify,
    pub ev_feed: Notify,
    pub ev_swnd_tx: mpsc::Sender<SwndSignal>,
    pub ev_ack_tx: mpsc::Sender<()>,
    pub ev_close_tx: mpsc::Sender<CloseEvent>,
    pub ev_close_rx: tokio::sync::Mutex<mpsc::Receiver<CloseEvent>>,
    pub inbox_tx: mpsc::Sender<Inbox>,

    pub read_deadline: Mutex<Option<Instant>>,
    pub write_deadline: Mutex<Option<Instant>>,
    pub stats: Counters,
    /// Encoded last handshake reply (SYN+ACK on servers, ACK3 on clients),
    /// replayed when the peer retransmits its handshake.
    pub handshake_reply: Mutex<Option<Vec<u8>>>,
}

impl ConnShared {
    pub fn new(
        endpoint: Arc<EndpointInner>,
        peer: SocketAddr,
        lid: u32,
        rid: u32,
    ) -> (Arc<ConnShared>, LoopChannels) {
        let (inbox_tx, inbox_rx) = mpsc::channel(INBOX_DEPTH);
        let (ev_swnd_tx, swnd_rx) = mpsc::channel(2);
        let (ev_ack_tx, ack_rx) = mpsc::channel(1);
        let (ev_close_tx, ev_close_rx) = mpsc::channel(2);

        let shared = Arc::new(ConnShared {
            sock: endpoint.sock.clone(),
            cfg: endpoint.cfg,
            epoch: endpoint.epoch,
            endpoint,
            peer,
            lid,
            rid: AtomicU32::new(rid),
            state: AtomicU32::new(State::Fin as u32),
            fatal: Mutex::new(None),
            shutdown: AtomicBool::new(false),
            urgent: AtomicBool::new(false),
            out_pending: AtomicI32::new(0),
            inexplicable: AtomicU32::new(0),
            inq: Mutex::new(InState {
                q: OrderedQueue::default(),
                ready: BytesMut::new(),
                last_read_seq: 0,
                max_ctn_seq: 0,
                last_ack: 0,
                last_ack_time: 0,
                need_ack: false,
                read_closed: false,
                last_time_probe: 0,
            }),
            outq: Mutex::new(OutState {
                q: OrderedQueue::default(),
                my_seq: 0,
                unsent: 0,
                rtt: RttEstimator::new(0),
                swnd: MIN_CWND,
                cwnd: MIN_CWND,
                last_shrink: 0,
                last_grow: 0,
                next_send_at: 0,
                fin_seq: 0,
                fin_acked: false,
                write_closed: false,
                broken: false,
            }),
            ev_read: Notify::new(),
            ev_write: Notify::new(),
            ev_feed: Notify::new(),
            ev_swnd_tx,
            ev_ack_tx,
            ev_close_tx,
            ev_close_rx: tokio::sync::Mutex::new(ev_close_rx),
            inbox_tx,
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            stats: Counters::default(),
            handshake_reply: Mutex::new(None),
        });

        let channels = LoopChannels {
            inbox_rx,
            swnd_rx,
            ack_rx,
        };

        (shared, channels)
    }

    pub fn state(&self) -> State {
        State::from_u32(self.state.load(Ordering::SeqCst))
    }

    pub fn set_state(&self, state: State) {
        self.state.store(state as u32, Ordering::SeqCst);
    }

    pub fn cas_state(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u32, to as u32, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn id(&self) -> ConnId {
        ConnId {
            lid: self.lid,
            rid: self.rid.load(Ordering::SeqCst),
        }
    }

    /// Milliseconds since the endpoint came up.
    pub fn now_ms(&self) -> i64 {
        self.epoch.elapsed().as_millis() as i64
    }

    /// Microseconds since the endpoint came up. Pacing gaps are sub-ms.
    pub fn now_us(&self) -> i64 {
        self.epoch.elapsed().as_micros() as i64
    }

    pub fn fatal(&self) -> Option<Fatal> {
        *self.fatal.lock()
    }

    pub async fn send_packet(&self, pk: &Packet) {
        let frame = pk.encode(self.id());
        if let Err(e) = self.sock.send_to(&frame, self.peer).await {
            tracing::debug!(peer = %self.peer, "failed to send frame: {e}");
        }
    }

    /// Abort the connection without the FIN exchange: peer reset, endpoint
    /// shutdown or an exhausted retransmit budget.
    pub fn fake_shutdown(&self, fatal: Fatal) {
        {
            let mut slot = self.fatal.lock();
            if slot.is_none() {
                *slot = Some(fatal);
            }
        }

        self.shutdown.store(true, Ordering::SeqCst);
        self.set_state(State::Fin);
        self.inq.lock().read_closed = true;
        {
            let mut o = self.outq.lock();
            o.broken = true;
            o.write_closed = true;
        }

        self.wake_all();
        let _ = self.ev_close_tx.try_send(CloseEvent::Closed);
        self.endpoint.remove_conn(self.lid);
    }

    /// Final deregistration once the close protocol has run.
    pub fn teardown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.wake_all();
        self.endpoint.remove_conn(self.lid);
    }

    fn wake_all(&self) {
        self.ev_read.notify_waiters();
        self.ev_write.notify_waiters();
        self.ev_feed.notify_waiters();
        let _ = self.ev_swnd_tx.try_send(SwndSignal::Close);
        let _ = self.inbox_tx.try_send(Inbox::Shutdown);
    }

    /// A frame made no sense for the current state. A few of those are
    /// tolerated; a stream of them means the peer lost track of this
    /// connection entirely.
    pub fn note_inexplicable(&self) {
        const RESET_THRESHOLD: u32 = 8;

        let n = self.inexplicable.fetch_add(1, Ordering::Relaxed) + 1;
        if n >= RESET_THRESHOLD {
            tracing::debug!(peer = %self.peer, "{n} inexplicable frames, resetting");
            self.fake_shutdown(Fatal::Inexplicable);
        }
    }
}

/// One reliable byte-stream connection.
///
/// Cheap to clone; reads and writes may run concurrently from different
/// tasks. Dropping the handle does not close the connection: call
/// [`Conn::close`] for the orderly FIN exchange.
#[derive(Clone)]
pub struct Conn {
    shared: Arc<ConnShared>,
}

impl Conn {
    pub(crate) fn new(shared: Arc<ConnShared>) -> Conn {
        Conn { shared }
    }

    /// Read up to `buf.len()` bytes, waiting until data is available.
    /// Returns `Ok(0)` at end of stream.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, Error> {
        if buf.is_empty() {
            return Ok(0);
        }

        let shared = &self.shared;

        loop {
            let notified = shared.ev_read.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            {
                let mut inq = shared.inq.lock();

                if !inq.ready.is_empty() {
                    let n = buf.len().min(inq.ready.len());
                    buf[..n].copy_from_slice(&inq.ready[..n]);
                    inq.ready.advance(n);

                    return Ok(n);
                }

                if inq.read_closed {
                    return match shared.fatal() {
                        Some(fatal) => Err(fatal.into_error()),
                        None => Ok(0),
                    };
                }
            }

            let deadline = *shared.read_deadline.lock();
            match deadline {
                Some(d) => {
                    if tokio::time::timeout_at(d.into(), notified).await.is_err() {
                        return Err(Error::Timeout);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Queue `data` as MSS-sized DATA packets. Applies backpressure once
    /// twice the send window is outstanding. On a deadline hit after a
    /// partial enqueue the partial count is reported.
    pub async fn write(&self, data: &[u8]) -> Result<usize, Error> {
        let shared = &self.shared;
        let mut written = 0usize;

        for chunk in data.chunks(packet::MSS) {
            loop {
                let notified = shared.ev_write.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                {
                    let mut o = shared.outq.lock();

                    if o.broken || o.write_closed {
                        let err = shared
                            .fatal()
                            .map(Fatal::into_error)
                            .unwrap_or(Error::ClosedPipe);
                        return if written > 0 { Ok(written) } else { Err(err) };
                    }

                    if (o.q.len() as i32) < o.swnd * 2 {
                        o.my_seq = o.my_seq.wrapping_add(1);
                        let pk = Packet {
                            seq: o.my_seq,
                            ack: 0,
                            flags: Flags::DATA,
                            scnt: 0,
                            payload: Bytes::copy_from_slice(chunk),
                        };
                        o.q.push_back(QueueNode::new(pk));
                        o.unsent += 1;
                        shared
                            .out_pending
                            .store(o.q.len() as i32, Ordering::Relaxed);
                        break;
                    }
                }

                let deadline = *shared.write_deadline.lock();
                match deadline {
                    Some(d) => {
                        if tokio::time::timeout_at(d.into(), notified).await.is_err() {
                            return if written > 0 {
                                Ok(written)
                            } else {
                                Err(Error::Timeout)
                            };
                        }
                    }
                    None => notified.await,
                }
            }

            written += chunk.len();
            let _ = shared.ev_swnd_tx.try_send(SwndSignal::Active);
        }

        Ok(written)
    }

    /// Close the write side and run the symmetric FIN exchange. Safe to call
    /// more than once; later calls wait for the first to finish.
    pub async fn close(&self) -> Result<(), Error> {
        close::close(&self.shared).await
    }

    /// Deadline for in-flight and future reads. `None` blocks forever.
    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *self.shared.read_deadline.lock() = deadline;
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *self.shared.write_deadline.lock() = deadline;
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.shared.sock.local_addr()
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.peer
    }

    pub fn stats(&self) -> ConnStats {
        self.shared.stats.snapshot()
    }

    /// Whether the connection reached its terminal state.
    pub fn is_closed(&self) -> bool {
        self.shared.state() == State::Fin
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("lid", &self.shared.lid)
            .field("peer", &self.shared.peer)
            .field("state", &self.shared.state())
            .finish()
    }
}

/// Periodic state dump, spawned when `Params::debug` is positive.
pub(crate) async fn debug_dump(shared: Arc<ConnShared>) {
    loop {
        tokio::time::sleep(Duration::from_secs(10)).await;

        if shared.state() == State::Fin {
            return;
        }

        let (in_q, ready, max_ctn, last_read) = {
            let i = shared.inq.lock();
            (i.q.len(), i.ready.len(), i.max_ctn_seq, i.last_read_seq)
        };
        let (out_q, my_seq) = {
            let o = shared.outq.lock();
            (o.q.len(), o.my_seq)
        };
        let stats = shared.stats.snapshot();

        tracing::debug!(
            lid = shared.lid,
            in_q,
            ready,
            max_ctn,
            last_read,
            out_q,
            my_seq,
            ?stats,
            "connection state"
        );
    }
}
