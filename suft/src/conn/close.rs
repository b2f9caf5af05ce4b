//! The symmetric half-close protocol.
//!
//! Active close: flush the outbound queue, send FIN, wait for its ack, then
//! wait for the peer's own FIN. Passive close: the peer's FIN closes the
//! read side immediately, but our FIN only goes out once the application is
//! done writing and calls close itself.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::error::Error;
use crate::packet::{FIN_ACK_SEQ, Flags, Packet};
use crate::queue::QueueNode;

use super::{CloseEvent, ConnShared, State, SwndSignal};

/// Wait for `ready`, napping 10 ms x4, 100 ms x6, then 1 s x2.
pub(crate) async fn self_spin_wait(mut ready: impl FnMut() -> bool) -> Result<(), Error> {
    const MAX_SPIN: usize = 12;

    for i in 0..MAX_SPIN {
        if ready() {
            return Ok(());
        }

        let nap = if i < 4 {
            Duration::from_millis(10)
        } else if i < 10 {
            Duration::from_millis(100)
        } else {
            Duration::from_secs(1)
        };
        tokio::time::sleep(nap).await;
    }

    Err(Error::Timeout)
}

pub(crate) async fn close(shared: &Arc<ConnShared>) -> Result<(), Error> {
    // Active close from the established state.
    if shared.cas_state(State::Est1, State::Fin0) {
        mark_write_closed(shared);
        let flushed = close_w(shared).await;

        // The peer's FIN moves us to the terminal state; without it, close
        // the read side on our own.
        if self_spin_wait(|| shared.state() == State::Fin)
            .await
            .is_err()
        {
            local_close_r(shared);
        }

        shared.teardown();
        return flushed;
    }

    // Passive close: the peer's FIN already shut the read side and the
    // application has finished answering.
    if shared.cas_state(State::Fin1, State::Fin0) {
        mark_write_closed(shared);
        let flushed = close_w(shared).await;
        shared.set_state(State::Fin);
        shared.teardown();
        return flushed;
    }

    // Some other task is already closing; wait it out.
    self_spin_wait(|| shared.state() == State::Fin).await
}

fn mark_write_closed(shared: &Arc<ConnShared>) {
    shared.outq.lock().write_closed = true;
    shared.ev_write.notify_waiters();
}

/// Flush pending data, append the FIN and wait until both the queue is
/// drained and the FIN is acknowledged.
async fn close_w(shared: &Arc<ConnShared>) -> Result<(), Error> {
    let flushed = before_close_w(shared).await;

    let budget = {
        let o = shared.outq.lock();
        (o.rtt.smoothed() / 10).max(20)
    };

    let mut done = false;
    {
        let mut rx = shared.ev_close_rx.lock().await;

        for _ in 0..budget {
            {
                let o = shared.outq.lock();
                if o.fin_acked && o.q.is_empty() {
                    done = true;
                }
                if o.broken {
                    break;
                }
            }
            if done {
                break;
            }

            tokio::select! {
                ev = rx.recv() => match ev {
                    Some(CloseEvent::FinAcked) => {}
                    Some(CloseEvent::Closed) => {
                        // Not ours to consume; make it visible again for the
                        // terminal-state waiter.
                        let tx = shared.ev_close_tx.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(Duration::from_millis(100)).await;
                            let _ = tx.try_send(CloseEvent::Closed);
                        });
                    }
                    None => break,
                },
                _ = tokio::time::sleep(Duration::from_millis(100)) => {}
            }
        }
    }

    // The FIN is acknowledged or abandoned; the pace task can go.
    let _ = shared.ev_swnd_tx.send(SwndSignal::Close).await;

    if done || flushed.is_err() {
        flushed
    } else {
        Err(Error::Timeout)
    }
}

/// Wait for the outbound queue to drain, then append and transmit the FIN.
async fn before_close_w(shared: &Arc<ConnShared>) -> Result<(), Error> {
    let mut drained = Err(Error::Timeout);

    for _ in 0..2 {
        if self_spin_wait(|| shared.out_pending.load(Ordering::Relaxed) == 0)
            .await
            .is_ok()
        {
            drained = Ok(());
            break;
        }
    }

    let frame = {
        let mut o = shared.outq.lock();

        o.my_seq = o.my_seq.wrapping_add(1);
        o.fin_seq = o.my_seq;

        let mut node = QueueNode::new(Packet::control(o.my_seq, 0, Flags::FIN));
        node.mark_sent(shared.now_ms());
        let frame = node.packet.encode(shared.id());
        o.q.push_back(node);
        shared
            .out_pending
            .store(o.q.len() as i32, Ordering::Relaxed);

        frame
    };

    if let Err(e) = shared.sock.send_to(&frame, shared.peer).await {
        tracing::debug!(peer = %shared.peer, "fin send failed: {e}");
    }
    let _ = shared.ev_swnd_tx.try_send(SwndSignal::Active);

    drained
}

/// The peer's FIN arrived. Settle the read side exactly once; every further
/// FIN is only re-acknowledged.
pub(crate) async fn on_peer_fin(shared: Arc<ConnShared>, pk: Packet) {
    if shared.inq.lock().read_closed {
        ack_fin(&shared, pk.seq).await;
        return;
    }

    loop {
        match shared.state() {
            State::Fin | State::Fin1 => {
                ack_fin(&shared, pk.seq).await;
                return;
            }
            state @ (State::Fin0 | State::Est0 | State::Est1) => {
                if !shared.cas_state(state, State::Fin1) {
                    continue;
                }

                let active_close_running = state == State::Fin0;

                settle_read(&shared, pk.seq).await;
                ack_fin(&shared, pk.seq).await;

                if active_close_running {
                    shared.cas_state(State::Fin1, State::Fin);
                    let _ = shared.ev_close_tx.try_send(CloseEvent::Closed);
                }

                return;
            }
            State::Syn0 | State::Syn1 => return,
        }
    }
}

/// Give retransmissions a chance to complete the inbound queue up to the
/// FIN, stage whatever is contiguous, then close the read side.
async fn settle_read(shared: &Arc<ConnShared>, fin_seq: u32) {
    let settled = self_spin_wait(|| {
        shared.inq.lock().max_ctn_seq.wrapping_add(1) == fin_seq
    })
    .await;

    if settled.is_err() {
        tracing::debug!(peer = %shared.peer, "read side closed with missing data");
    }

    {
        let mut inq = shared.inq.lock();

        while let Some(head) = inq.q.head_seq() {
            if head != inq.last_read_seq.wrapping_add(1) {
                break;
            }
            if let Some(node) = inq.q.pop_head() {
                inq.ready.extend_from_slice(&node.packet.payload);
                inq.last_read_seq = head;
            }
        }

        inq.read_closed = true;
    }

    shared.ev_read.notify_waiters();
    shared.ev_feed.notify_waiters();
}

async fn ack_fin(shared: &Arc<ConnShared>, fin_seq: u32) {
    let ack = Packet::control(FIN_ACK_SEQ, fin_seq, Flags::ACK);
    shared.send_packet(&ack).await;
}

/// Close the read side without a peer FIN (its FIN never arrived, or the
/// endpoint is going away).
fn local_close_r(shared: &Arc<ConnShared>) {
    {
        let mut inq = shared.inq.lock();
        inq.read_closed = true;
    }

    shared.set_state(State::Fin);
    shared.ev_read.notify_waiters();
    shared.ev_feed.notify_waiters();
}
