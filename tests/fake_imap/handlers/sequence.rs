//! Sequence-set matching shared by the FETCH, SEARCH, STORE, and COPY
//! handlers.
//!
//! IMAP sequence sets mix single values, ranges, and `*` (the highest
//! existing number). Open-ended ranges like `13:*` always include the
//! highest message even when 13 exceeds it, which is why clients
//! filter the boundary themselves.

use imap_codec::imap_types::sequence::{SeqOrUid, Sequence, SequenceSet};

/// Whether `value` is covered by the set, with `*` resolving to `max`.
pub fn in_set(set: &SequenceSet, value: u32, max: u32) -> bool {
    set.0.as_ref().iter().any(|seq| match seq {
        Sequence::Single(single) => resolve(single, max) == value,
        Sequence::Range(a, b) => {
            let lo = resolve(a, max);
            let hi = resolve(b, max);
            let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
            (lo..=hi).contains(&value)
        }
    })
}

fn resolve(item: &SeqOrUid, max: u32) -> u32 {
    match item {
        SeqOrUid::Value(v) => v.get(),
        SeqOrUid::Asterisk => max,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::num::NonZeroU32;

    fn set(parts: &[(u32, Option<u32>)]) -> SequenceSet {
        let items: Vec<Sequence> = parts
            .iter()
            .map(|(a, b)| match b {
                None => Sequence::Single(SeqOrUid::Value(NonZeroU32::new(*a).unwrap())),
                Some(b) => Sequence::Range(
                    SeqOrUid::Value(NonZeroU32::new(*a).unwrap()),
                    SeqOrUid::Value(NonZeroU32::new(*b).unwrap()),
                ),
            })
            .collect();
        SequenceSet(items.try_into().unwrap())
    }

    #[test]
    fn single_value_matches_exactly() {
        let s = set(&[(5, None)]);
        assert!(in_set(&s, 5, 10));
        assert!(!in_set(&s, 6, 10));
    }

    #[test]
    fn range_is_inclusive() {
        let s = set(&[(2, Some(4))]);
        assert!(in_set(&s, 2, 10));
        assert!(in_set(&s, 4, 10));
        assert!(!in_set(&s, 5, 10));
    }

    #[test]
    fn open_range_includes_highest() {
        // "13:*" with max 5 behaves like 5:13.
        let s = SequenceSet(
            vec![Sequence::Range(
                SeqOrUid::Value(NonZeroU32::new(13).unwrap()),
                SeqOrUid::Asterisk,
            )]
            .try_into()
            .unwrap(),
        );
        assert!(in_set(&s, 5, 5));
        assert!(in_set(&s, 13, 5));
        assert!(!in_set(&s, 4, 5));
    }
}
