//! Delayed/immediate acknowledgment task.

use std::sync::Arc;
use std::time::Duration;

use bytes::{BufMut, BytesMut};
use tokio::sync::mpsc;

use crate::packet::{Flags, Packet};
use crate::sack;

use super::{ConnShared, InState, State};

/// How often an ack carries a TIME probe so a pure receiver can keep its
/// RTT estimate fresh.
const TIME_PROBE_INTERVAL_MS: i64 = 4_000;

/// Fires on the delayed-ack timer for in-order data, or immediately when the
/// receive task asks for it (out-of-order, duplicates, gap fills).
pub(crate) async fn ack_loop(shared: Arc<ConnShared>, mut immediate: mpsc::Receiver<()>) {
    loop {
        let ato = shared.outq.lock().rtt.ato;
        let mut send_now = false;

        tokio::select! {
            sig = immediate.recv() => match sig {
                Some(()) => send_now = true,
                None => return,
            },
            _ = tokio::time::sleep(Duration::from_millis(ato as u64)) => {}
        }

        if shared.state() == State::Fin {
            return;
        }

        let now = shared.now_ms();
        let (frame, closed) = {
            let mut inq = shared.inq.lock();

            if inq.read_closed {
                (None, true)
            } else if send_now || inq.need_ack {
                inq.need_ack = false;
                (Some(build_ack(&mut inq, now).encode(shared.id())), false)
            } else {
                (None, false)
            }
        };

        if let Some(frame) = frame {
            if let Err(e) = shared.sock.send_to(&frame, shared.peer).await {
                tracing::debug!(peer = %shared.peer, "ack send failed: {e}");
            }
        }

        if closed {
            return;
        }
    }
}

/// A cumulative ACK, upgraded to a SACK when out-of-order seqs are queued
/// and stamped with a TIME probe every few seconds.
fn build_ack(inq: &mut InState, now: i64) -> Packet {
    let mut flags = Flags::ACK;
    let mut seq = 0u32;
    let mut payload = BytesMut::new();

    if let Some(base) = inq.q.first_seq_after(inq.max_ctn_seq) {
        flags = flags | Flags::SACK;
        seq = base;

        let bitmap = sack::build(
            base,
            inq.q.iter_from(base).map(|node| node.packet.seq),
        );
        payload.put_u64(bitmap);
    }

    if now - inq.last_time_probe >= TIME_PROBE_INTERVAL_MS {
        flags = flags | Flags::TIME;
        payload.put_u32(now as u32);
        inq.last_time_probe = now;
    }

    inq.last_ack = inq.max_ctn_seq;
    inq.last_ack_time = now;

    Packet {
        seq,
        ack: inq.max_ctn_seq,
        flags,
        scnt: 0,
        payload: payload.freeze(),
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::packet::Flags;
    use crate::queue::QueueNode;

    fn in_state(max_ctn: u32, queued: &[u32]) -> InState {
        let mut state = InState {
            q: Default::default(),
            ready: Default::default(),
            last_read_seq: max_ctn,
            max_ctn_seq: max_ctn,
            last_ack: 0,
            last_ack_time: 0,
            need_ack: true,
            read_closed: false,
            last_time_probe: 0,
        };

        for &seq in queued {
            state.q.insert(QueueNode::new(Packet {
                seq,
                ack: 0,
                flags: Flags::DATA,
                scnt: 1,
                payload: Bytes::new(),
            }));
        }

        state
    }

    #[test]
    fn in_order_state_yields_a_plain_cumulative_ack() {
        let mut inq = in_state(7, &[]);

        let pk = build_ack(&mut inq, 10);

        assert!(pk.flags.contains(Flags::ACK));
        assert!(!pk.flags.contains(Flags::SACK));
        assert_eq!(pk.ack, 7);
        assert_eq!(inq.last_ack, 7);
    }

    #[test]
    fn gaps_upgrade_the_ack_to_a_sack() {
        let mut inq = in_state(7, &[10, 11, 14]);
        inq.last_time_probe = 5; // suppress the probe

        let pk = build_ack(&mut inq, 10);

        assert!(pk.flags.contains(Flags::SACK));
        assert_eq!(pk.ack, 7);
        assert_eq!(pk.seq, 10);

        let bitmap = u64::from_be_bytes(pk.payload[..8].try_into().unwrap());
        assert_eq!(sack::seqs(10, bitmap).collect::<Vec<_>>(), vec![10, 11, 14]);
    }

    #[test]
    fn probe_timestamp_rides_the_payload_tail() {
        let mut inq = in_state(3, &[]);
        inq.last_time_probe = -TIME_PROBE_INTERVAL_MS;

        let pk = build_ack(&mut inq, 1_234);

        assert!(pk.flags.contains(Flags::TIME));
        let ts = u32::from_be_bytes(pk.payload[pk.payload.len() - 4..].try_into().unwrap());
        assert_eq!(ts, 1_234);
    }
}
