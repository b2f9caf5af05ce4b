//! Selective-acknowledgment bitmap.
//!
//! A SACK describes up to 64 out-of-order seqs past the cumulative ack
//! boundary: bit `i` of the bitmap means `base + i` has been received, where
//! `base` travels in the seq field of the SACK frame and the bitmap as the
//! first eight payload bytes, big-endian. `base` itself is always present,
//! so bit 0 is always set.

pub(crate) const WINDOW: u32 = 64;

/// Build the bitmap for the seqs in `present` that fall inside
/// `[base, base + 63]`. The iterator must yield increasing seqs starting at
/// `base`.
pub(crate) fn build(base: u32, present: impl Iterator<Item = u32>) -> u64 {
    let mut bitmap = 0u64;

    for seq in present {
        let offset = seq.wrapping_sub(base);
        if offset >= WINDOW {
            break;
        }
        bitmap |= 1 << offset;
    }

    bitmap
}

/// The seqs described by a bitmap, in increasing order.
pub(crate) fn seqs(base: u32, bitmap: u64) -> impl Iterator<Item = u32> {
    (0..WINDOW).filter_map(move |i| {
        if bitmap & (1 << i) != 0 {
            Some(base.wrapping_add(i))
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;

    #[test]
    fn base_is_always_bit_zero() {
        let bitmap = build(100, [100u32].into_iter());

        assert_eq!(bitmap, 1);
        assert_eq!(seqs(100, bitmap).collect::<Vec<_>>(), vec![100]);
    }

    #[test]
    fn seqs_beyond_the_window_are_ignored() {
        let bitmap = build(100, [100u32, 163, 164, 200].into_iter());

        assert_eq!(seqs(100, bitmap).collect::<Vec<_>>(), vec![100, 163]);
    }

    proptest! {
        #[test]
        fn bitmap_round_trips_any_set_within_the_window(
            base in 1u32..0xFFFF_0000,
            offsets in prop::collection::btree_set(0u32..WINDOW, 1..WINDOW as usize),
        ) {
            let mut present: BTreeSet<u32> = offsets.iter().map(|o| base + o).collect();
            present.insert(base);

            let bitmap = build(base, present.iter().copied());
            let decoded: BTreeSet<u32> = seqs(base, bitmap).collect();

            prop_assert_eq!(decoded, present);
        }
    }
}
