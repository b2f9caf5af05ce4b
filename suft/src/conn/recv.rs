//! Receive-dispatch and reassembly tasks of an established connection.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;

use crate::error::Fatal;
use crate::packet::{self, FIN_ACK_SEQ, Flags, Packet};
use crate::queue::QueueNode;
use crate::sack;

use super::handshake::calc_swnd;
use super::{ConnShared, CloseEvent, FR_THRESHOLD, Inbox, State, SwndSignal, close};

/// Drains the inbox the endpoint dispatches into and classifies each frame.
pub(crate) async fn recv_loop(shared: Arc<ConnShared>, mut inbox: mpsc::Receiver<Inbox>) {
    while let Some(msg) = inbox.recv().await {
        let buf = match msg {
            Inbox::Datagram(buf) => buf,
            Inbox::Shutdown => break,
        };

        // Terminal state alone is not a reason to stop: the ack of our own
        // FIN still arrives here while the close protocol is finishing.
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }

        let pk = Packet::decode(&buf[packet::TH_SIZE..]);
        drop(buf);

        dispatch(&shared, pk).await;
    }
}

async fn dispatch(shared: &Arc<ConnShared>, pk: Packet) {
    let flags = pk.flags;

    if flags.contains(Flags::RESET) {
        tracing::debug!(peer = %shared.peer, "peer reset");
        shared.fake_shutdown(Fatal::PeerReset);
        return;
    }

    if flags.contains(Flags::FIN) {
        tokio::spawn(close::on_peer_fin(shared.clone(), pk));
        return;
    }

    if flags.contains(Flags::SYN) {
        // A retransmitted handshake: the peer missed our last reply.
        let replay = shared.handshake_reply.lock().clone();
        if let Some(frame) = replay {
            if let Err(e) = shared.sock.send_to(&frame, shared.peer).await {
                tracing::debug!("failed to replay handshake: {e}");
            }
        }
        return;
    }

    if flags.contains(Flags::ACK) {
        on_ack(shared, &pk).await;

        if flags.contains(Flags::TIME) {
            answer_time_probe(shared, &pk).await;
        }
        return;
    }

    if flags == Flags::TIME {
        on_time_echo(shared, &pk);
        return;
    }

    if flags.contains(Flags::DATA) {
        on_data(shared, pk).await;
        return;
    }

    tracing::debug!(peer = %shared.peer, ?flags, seq = pk.seq, "unexpected frame");
    shared.note_inexplicable();
}

/// Watches the reassembly queue's head and stages contiguous payload for the
/// reader.
pub(crate) async fn feed_loop(shared: Arc<ConnShared>) {
    loop {
        let feed = shared.ev_feed.notified();
        tokio::pin!(feed);
        feed.as_mut().enable();

        let (progressed, closed) = {
            let mut inq = shared.inq.lock();
            let mut progressed = false;

            while let Some(head) = inq.q.head_seq() {
                if head != inq.last_read_seq.wrapping_add(1) {
                    break;
                }

                if let Some(node) = inq.q.pop_head() {
                    inq.ready.extend_from_slice(&node.packet.payload);
                    inq.last_read_seq = head;
                    progressed = true;
                }
            }

            (progressed, inq.read_closed)
        };

        if progressed {
            shared.ev_read.notify_waiters();
        }

        if closed || shared.state() == State::Fin {
            return;
        }

        feed.await;
    }
}

/// Insert a DATA packet into the reassembly queue with duplicate
/// suppression, and schedule the acknowledgment it deserves.
async fn on_data(shared: &Arc<ConnShared>, pk: Packet) {
    shared.stats.in_packets.fetch_add(1, Ordering::Relaxed);

    let retransmitted = pk.scnt > 1;
    let seq = pk.seq;

    let (inserted, immediate, late_ack) = {
        let mut inq = shared.inq.lock();

        if inq.read_closed {
            // Late retransmit after the FIN settled. The ack task is gone,
            // so quiet the peer from here.
            shared.stats.in_duplicates.fetch_add(1, Ordering::Relaxed);
            let ack = Packet::control(0, inq.max_ctn_seq, Flags::ACK);
            (false, false, Some(ack))
        } else if seq <= inq.max_ctn_seq || inq.q.contains(seq) {
            shared.stats.in_duplicates.fetch_add(1, Ordering::Relaxed);
            (false, true, None)
        } else {
            let expected = inq.max_ctn_seq.wrapping_add(1);
            let had_gap = inq.q.first_seq_after(inq.max_ctn_seq).is_some();

            inq.q.insert(QueueNode::new(pk));

            while inq.q.contains(inq.max_ctn_seq.wrapping_add(1)) {
                inq.max_ctn_seq = inq.max_ctn_seq.wrapping_add(1);
            }

            if seq != expected || had_gap || retransmitted {
                (true, true, None)
            } else {
                inq.need_ack = true;
                (true, false, None)
            }
        }
    };

    if inserted {
        shared.ev_feed.notify_waiters();
    }

    if immediate {
        let _ = shared.ev_ack_tx.try_send(());
    }

    if let Some(ack) = late_ack {
        shared.send_packet(&ack).await;
    }
}

/// Apply a cumulative ACK (and its optional SACK bitmap) to the outbound
/// queue: drain confirmed packets, sample the RTT, count misses and fire
/// fast retransmissions.
async fn on_ack(shared: &Arc<ConnShared>, pk: &Packet) {
    let now = shared.now_ms();
    let mut resends: Vec<Vec<u8>> = Vec::new();
    let mut progressed = false;
    let mut drained_for_close = false;

    {
        let mut o = shared.outq.lock();

        if pk.seq == FIN_ACK_SEQ {
            if o.fin_seq != 0 && pk.ack == o.fin_seq && !o.fin_acked {
                o.fin_acked = true;
                let fin_seq = o.fin_seq;
                if o.q.remove(fin_seq).is_some() {
                    progressed = true;
                }
            }
        }

        let mut sample: Option<i64> = None;

        for node in o.q.drop_head_until(pk.ack) {
            progressed = true;
            if node.packet.scnt == 1 {
                // Karn's rule: only packets sent exactly once give a sample.
                if let Some(sent_1) = node.sent_1 {
                    sample = Some(now - sent_1);
                }
            }
        }

        if pk.flags.contains(Flags::SACK) && pk.payload.len() >= 8 {
            let bitmap = u64::from_be_bytes(
                pk.payload[..8].try_into().unwrap_or_default(),
            );
            let base = pk.seq;
            let mut max_sacked = pk.ack;

            for seq in sack::seqs(base, bitmap) {
                if let Some(node) = o.q.remove(seq) {
                    progressed = true;
                    if seq > max_sacked {
                        max_sacked = seq;
                    }
                    if node.packet.scnt == 1 {
                        if let Some(sent_1) = node.sent_1 {
                            sample = Some(now - sent_1);
                        }
                    }
                } else if seq > max_sacked {
                    max_sacked = seq;
                }
            }

            // A later seq got through while earlier ones did not: count a
            // miss against every hole below the highest sacked seq.
            if shared.cfg.fast_retransmit && max_sacked > pk.ack {
                let id = shared.id();
                let mut fast = 0u64;

                for node in o.q.range_mut(pk.ack.wrapping_add(1)..max_sacked) {
                    if node.sent.is_none() {
                        break;
                    }

                    node.miss += 1;
                    if node.miss >= FR_THRESHOLD {
                        node.miss = 0;
                        node.mark_sent(now);
                        resends.push(node.packet.encode(id));
                        fast += 1;
                    }
                }

                if fast > 0 {
                    shared.stats.fast_resends.fetch_add(fast, Ordering::Relaxed);
                    shared
                        .stats
                        .out_duplicates
                        .fetch_add(fast, Ordering::Relaxed);
                }
            }
        }

        // Every removed node had been transmitted at least once.
        o.unsent = o.unsent.min(o.q.len() as i32);
        shared
            .out_pending
            .store(o.q.len() as i32, Ordering::Relaxed);

        if let Some(m) = sample {
            o.rtt.update(m);
            o.swnd = calc_swnd(shared.cfg.bandwidth_bps, o.rtt.smoothed());
        }

        // Additive growth: at most one packet per RTT since the last shrink.
        if progressed
            && o.cwnd < o.swnd
            && now - o.last_shrink >= o.rtt.smoothed()
            && now - o.last_grow >= o.rtt.smoothed()
        {
            o.cwnd += 1;
            o.last_grow = now;
        }

        if o.fin_seq != 0 && o.fin_acked && o.q.is_empty() {
            drained_for_close = true;
        }
    }

    for frame in &resends {
        if let Err(e) = shared.sock.send_to(frame, shared.peer).await {
            tracing::debug!("fast retransmit failed: {e}");
        }
    }

    if progressed {
        shared.ev_write.notify_waiters();
        let _ = shared.ev_swnd_tx.try_send(SwndSignal::Active);
    }

    if drained_for_close {
        let _ = shared.ev_close_tx.try_send(CloseEvent::FinAcked);
    }
}

/// The peer attached a timestamp to its ack; echo it back so it can sample
/// the path RTT without waiting on data acknowledgments.
async fn answer_time_probe(shared: &Arc<ConnShared>, pk: &Packet) {
    if pk.payload.len() < 4 {
        return;
    }

    let ts = u32::from_be_bytes(
        pk.payload[pk.payload.len() - 4..]
            .try_into()
            .unwrap_or_default(),
    );

    let echo = Packet::control(ts, 0, Flags::TIME);
    shared.send_packet(&echo).await;
}

/// Our own probe coming back: seq carries the timestamp we stamped, scnt the
/// milliseconds the peer held it.
fn on_time_echo(shared: &Arc<ConnShared>, pk: &Packet) {
    let now = shared.now_ms() as u32;
    let age = pk.scnt as i64;
    let sample = (now.wrapping_sub(pk.seq)) as i64 - age;

    if !(0..=60_000).contains(&sample) {
        return;
    }

    let mut o = shared.outq.lock();
    o.rtt.update(sample);
    o.swnd = calc_swnd(shared.cfg.bandwidth_bps, o.rtt.smoothed());
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::endpoint::{Endpoint, Params};
    use crate::rtt::RttEstimator;

    #[tokio::test]
    async fn ack_recompute_keeps_swnd_at_the_handshake_value() {
        let endpoint = Endpoint::new(Params {
            local_addr: "127.0.0.1:0".to_owned(),
            bandwidth: 100,
            ..Default::default()
        })
        .await
        .unwrap();

        let (shared, _channels) = ConnShared::new(
            endpoint.inner().clone(),
            "127.0.0.1:9".parse().unwrap(),
            1,
            2,
        );

        let handshake_swnd = {
            let mut o = shared.outq.lock();
            o.rtt = RttEstimator::new(8);
            o.swnd = calc_swnd(shared.cfg.bandwidth_bps, o.rtt.rtt);

            let mut node = QueueNode::new(Packet {
                seq: 1,
                ack: 0,
                flags: Flags::DATA,
                scnt: 0,
                payload: Bytes::new(),
            });
            node.mark_sent(shared.now_ms());
            // A sample from the future floors to the minimum RTT, pinning
            // the estimate regardless of scheduler delay.
            node.sent_1 = Some(shared.now_ms() + 10_000);
            o.q.push_back(node);
            o.my_seq = 1;

            o.swnd
        };

        let ack = Packet::control(0, 1, Flags::ACK);
        on_ack(&shared, &ack).await;

        let o = shared.outq.lock();
        assert_eq!(
            o.swnd, handshake_swnd,
            "an unchanged RTT must not move the send window"
        );
    }
}
