//! Three-way handshake, for both the dialing and the accepting side.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;

use crate::error::Error;
use crate::packet::{self, Flags, Packet};
use crate::rtt::RttEstimator;

use super::{
    ConnShared, Inbox, LoopChannels, MAX_RETRIES, MIN_CWND, State, ack, debug_dump, recv, send,
};

/// How long one handshake attempt waits for the peer's reply.
const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(1);

/// The handshake reply interval, in milliseconds. Discounted from RTT
/// samples taken across retransmitted handshake frames.
const ATTEMPT_TIMEOUT_MS: i64 = 1_000;

/// Client half: send SYN, await SYN+ACK, answer with ACK3.
pub(crate) async fn dial(
    shared: &Arc<ConnShared>,
    inbox: &mut mpsc::Receiver<Inbox>,
) -> Result<(), Error> {
    shared.set_state(State::Syn0);

    let mut syn = Packet::control(0, 0, Flags::SYN);
    let t0 = shared.now_ms();
    let mut reply = None;

    for _ in 0..MAX_RETRIES {
        syn.scnt = syn.scnt.saturating_add(1);
        shared.send_packet(&syn).await;

        match tokio::time::timeout(ATTEMPT_TIMEOUT, recv_frame(shared, inbox)).await {
            Ok(Some(pk)) => {
                reply = Some((pk, shared.now_ms() - t0));
                break;
            }
            Ok(None) => return Err(Error::ClosedPipe),
            Err(_) => continue,
        }
    }

    let Some((pk, mut rtt)) = reply else {
        return Err(Error::TooManyAttempts);
    };

    shared.set_state(State::Syn1);

    if pk.flags != (Flags::SYN | Flags::ACK) || pk.ack != 0 {
        tracing::debug!(peer = %shared.peer, flags = ?pk.flags, "expected SYN+ACK");
        return Err(Error::InexplicableData);
    }

    // The peer's scnt counts every handshake frame on this exchange; each
    // extra one sat out a full retry interval.
    if pk.scnt > 1 {
        rtt -= (pk.scnt - 1) as i64 * ATTEMPT_TIMEOUT_MS;
    }
    tracing::debug!(peer = %shared.peer, rtt, "handshake complete");

    shared.set_state(State::Est0);

    let ack3 = Packet::control(0, pk.seq, Flags::ACK);
    let encoded = ack3.encode(shared.id());
    *shared.handshake_reply.lock() = Some(encoded.clone());
    if let Err(e) = shared.sock.send_to(&encoded, shared.peer).await {
        return Err(Error::Io(e));
    }

    establish(shared, rtt, pk.seq);

    Ok(())
}

/// Server half: the first frame must be a SYN; reply SYN+ACK until the ACK3
/// arrives.
pub(crate) async fn accept(
    shared: &Arc<ConnShared>,
    first: Packet,
    inbox: &mut mpsc::Receiver<Inbox>,
) -> Result<(), Error> {
    if first.flags != Flags::SYN {
        tracing::debug!(peer = %shared.peer, flags = ?first.flags, "expected SYN");
        return Err(Error::InexplicableData);
    }

    shared.set_state(State::Syn1);

    let mut syn_ack = Packet::control(0, first.seq, Flags::SYN | Flags::ACK);
    // Start one below the client's attempt count so that, on the wire, scnt
    // reflects the total frames of this exchange and the client's RTT
    // discount comes out right.
    syn_ack.scnt = first.scnt.saturating_sub(1);

    let mut reply = None;

    for _ in 0..MAX_RETRIES {
        syn_ack.scnt = syn_ack.scnt.saturating_add(1);
        let t0 = shared.now_ms();
        shared.send_packet(&syn_ack).await;

        match tokio::time::timeout(ATTEMPT_TIMEOUT, recv_frame(shared, inbox)).await {
            Ok(Some(pk)) => {
                reply = Some((pk, shared.now_ms() - t0));
                break;
            }
            Ok(None) => return Err(Error::ClosedPipe),
            Err(_) => continue,
        }
    }

    let Some((pk, rtt)) = reply else {
        return Err(Error::TooManyAttempts);
    };

    shared.set_state(State::Est0);

    if pk.flags == Flags::ACK && pk.ack == 0 {
        // The expected ACK3.
    } else if pk.flags.contains(Flags::DATA) && pk.seq > first.seq && pk.ack == 0 {
        // The ACK3 was lost but the client believes the connection is up.
        // Re-answer the handshake once and drop the data; it will be
        // retransmitted against the established connection.
        syn_ack.scnt = syn_ack.scnt.saturating_add(1);
        shared.send_packet(&syn_ack).await;
    } else {
        tracing::debug!(peer = %shared.peer, flags = ?pk.flags, "expected ACK3");
        return Err(Error::InexplicableData);
    }

    *shared.handshake_reply.lock() = Some(syn_ack.encode(shared.id()));

    establish(shared, rtt, first.seq);

    Ok(())
}

/// Initialise estimators, windows and queue positions, then mark the
/// connection fully established.
fn establish(shared: &Arc<ConnShared>, rtt_sample: i64, last_ack: u32) {
    {
        let mut o = shared.outq.lock();
        o.rtt = RttEstimator::new(rtt_sample);
        o.swnd = calc_swnd(shared.cfg.bandwidth_bps, o.rtt.rtt);
        o.cwnd = 8;
    }

    {
        let mut i = shared.inq.lock();
        i.last_read_seq = last_ack;
        i.max_ctn_seq = last_ack;
        i.last_ack = last_ack;
    }

    shared.set_state(State::Est1);
}

/// The send window for `bandwidth` at the given RTT: half the in-flight
/// packet count that would saturate it, the partial packet rounded up
/// before halving. Every window computation goes through here so the rate
/// ceiling stays consistent across the handshake and later RTT updates.
pub(crate) fn calc_swnd(bandwidth_bps: i64, rtt_ms: i64) -> i32 {
    let mss = packet::MSS as i64;
    let numerator = bandwidth_bps * rtt_ms;
    let denominator = 8_000 * mss;
    let window = (numerator + denominator - 1) / denominator;

    ((window / 2) as i32).max(MIN_CWND)
}

/// Start the four transport tasks of an established connection.
pub(crate) fn spawn_loops(shared: &Arc<ConnShared>, channels: LoopChannels) {
    let LoopChannels {
        inbox_rx,
        swnd_rx,
        ack_rx,
    } = channels;

    tokio::spawn(recv::recv_loop(shared.clone(), inbox_rx));
    tokio::spawn(recv::feed_loop(shared.clone()));
    tokio::spawn(send::send_loop(shared.clone(), swnd_rx));
    tokio::spawn(ack::ack_loop(shared.clone(), ack_rx));

    if shared.cfg.debug > 0 {
        tokio::spawn(debug_dump(shared.clone()));
    }
}

/// Next valid frame from the inbox, with the peer id recorded as a side
/// effect. `None` once the connection is being torn down.
async fn recv_frame(shared: &Arc<ConnShared>, inbox: &mut mpsc::Receiver<Inbox>) -> Option<Packet> {
    loop {
        match inbox.recv().await? {
            Inbox::Datagram(buf) => {
                let Some(id) = packet::parse_frame(&buf) else {
                    continue;
                };

                if shared.rid.load(std::sync::atomic::Ordering::SeqCst) == 0 {
                    shared.rid.store(id.rid, std::sync::atomic::Ordering::SeqCst);
                }

                return Some(Packet::decode(&buf[packet::TH_SIZE..]));
            }
            Inbox::Shutdown => return None,
        }
    }
}
