//! Send-window and pacing task: transmits fresh packets under the
//! congestion window and retransmits on RTO expiry.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::Fatal;

use super::{ConnShared, MAX_RETRIES, MIN_CWND, OutState, SwndSignal};

/// Idle wake interval when nothing is queued.
const IDLE_TICK_US: i64 = 200_000;

/// Pacing debt beyond this is forgiven instead of burst-repaid.
const MAX_PACING_DEBT_US: i64 = 50_000;

pub(crate) async fn send_loop(shared: Arc<ConnShared>, mut signals: mpsc::Receiver<SwndSignal>) {
    loop {
        let sleep_us = next_wake_us(&shared);

        tokio::select! {
            sig = signals.recv() => match sig {
                Some(SwndSignal::Active) => {}
                Some(SwndSignal::Close) | None => return,
            },
            _ = tokio::time::sleep(Duration::from_micros(sleep_us as u64)) => {}
        }

        // The FIN keeps retransmitting from here through the close protocol;
        // only the shutdown flag or the close sentinel stop this task.
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        let (batch, first_sends, gave_up) = collect_transmits(&shared);

        if gave_up {
            tracing::debug!(peer = %shared.peer, "retransmit budget exhausted");
            shared.fake_shutdown(Fatal::Timeout);
            return;
        }

        if first_sends > 0 {
            shared
                .stats
                .out_packets
                .fetch_add(first_sends, Ordering::Relaxed);
        }

        for frame in &batch {
            if let Err(e) = shared.sock.send_to(frame, shared.peer).await {
                tracing::debug!(peer = %shared.peer, "send failed: {e}");
            }
        }
    }
}

/// Microseconds until this loop needs to run again: the earliest RTO expiry,
/// the pacing slot of the next fresh packet, or an idle tick.
fn next_wake_us(shared: &Arc<ConnShared>) -> i64 {
    let o = shared.outq.lock();
    let now_ms = shared.now_ms();
    let now_us = shared.now_us();

    let mut wake = IDLE_TICK_US;

    if let Some(expiry) = o
        .q
        .iter_from(0)
        .filter_map(|n| n.sent)
        .map(|sent| sent + o.rtt.rto)
        .min()
    {
        wake = wake.min((expiry - now_ms) * 1_000);
    }

    if o.unsent > 0 && o.in_flight() < o.cwnd.min(o.swnd) {
        if shared.cfg.flat_traffic {
            wake = wake.min(o.next_send_at - now_us);
        } else {
            wake = 0;
        }
    }

    wake.max(0)
}

/// Gather every frame due right now: RTO retransmissions first, then fresh
/// packets as the window and the pacing schedule allow. Encoding happens
/// under the queue lock, transmission after it is released.
fn collect_transmits(shared: &Arc<ConnShared>) -> (Vec<Vec<u8>>, u64, bool) {
    let now_ms = shared.now_ms();
    let now_us = shared.now_us();
    let id = shared.id();

    let mut o = shared.outq.lock();

    if o.broken {
        return (Vec::new(), 0, false);
    }

    let mut batch = Vec::new();

    // Retransmissions.
    let rto = o.rtt.rto;
    let cwnd = o.cwnd;
    let mut resent = 0i32;
    let mut loss = false;

    for node in o.q.iter_mut() {
        let Some(sent) = node.sent else {
            continue;
        };

        if now_ms - sent <= rto {
            continue;
        }

        if node.packet.scnt >= MAX_RETRIES && !shared.cfg.super_retransmit {
            return (Vec::new(), 0, true);
        }

        node.mark_sent(now_ms);
        node.miss = 0;
        batch.push(node.packet.encode(id));
        loss = true;
        resent += 1;

        if resent >= cwnd {
            break;
        }
    }

    if loss {
        shared
            .stats
            .out_duplicates
            .fetch_add(resent as u64, Ordering::Relaxed);
        o.rtt.backoff_rto();
        o.cwnd = (o.cwnd / 2).max(MIN_CWND);
        o.last_shrink = now_ms;
    }

    // Fresh transmissions.
    let mut first_sends = 0u64;
    let window = o.cwnd.min(o.swnd);
    let flat = shared.cfg.flat_traffic;

    if o.unsent > 0 && !shared.urgent.swap(true, Ordering::SeqCst) {
        // First burst after idle: restart the pacing timeline.
        o.next_send_at = now_us;
    }

    let gap_us = pacing_gap_us(&o);
    let room = (window - o.in_flight()).max(0) as usize;

    let candidates: Vec<u32> = o
        .q
        .iter_from(0)
        .filter(|node| node.sent.is_none())
        .map(|node| node.packet.seq)
        .take(room)
        .collect();

    for seq in candidates {
        if flat && o.next_send_at > now_us {
            break;
        }

        let Some(node) = o.q.get_mut(seq) else {
            continue;
        };

        node.mark_sent(now_ms);
        batch.push(node.packet.encode(id));
        o.unsent -= 1;
        first_sends += 1;

        if flat {
            o.next_send_at += gap_us;
            if now_us - o.next_send_at > MAX_PACING_DEBT_US {
                o.next_send_at = now_us;
            }
        }
    }

    (batch, first_sends, false)
}

/// The flat-traffic inter-packet spacing: `rtt / swnd` spreads one window
/// evenly over one round trip, which caps the rate at the configured
/// bandwidth.
fn pacing_gap_us(o: &OutState) -> i64 {
    (o.rtt.smoothed() * 1_000 / o.swnd.max(1) as i64).max(1)
}
