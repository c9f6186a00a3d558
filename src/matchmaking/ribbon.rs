//! Interval-overlap ("ribbon") pairing
//!
//! Every waiting player contributes a start marker at `low` and an end marker
//! at `high`. Markers are scanned in ascending order with a single open slot:
//! a start marker either opens the slot or pairs with the player holding it,
//! an end marker closes the slot. Equal values put starts before ends, so
//! intervals that only touch still overlap.

use std::cmp::Ordering;

/// Closed interval on the skill axis
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Interval {
    pub low: f64,
    pub high: f64,
}

impl Interval {
    pub fn new(low: f64, high: f64) -> Self {
        Self { low, high }
    }

    pub fn width(&self) -> f64 {
        self.high - self.low
    }

    pub fn overlaps(&self, other: &Interval) -> bool {
        self.low <= other.high && other.low <= self.high
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Edge {
    Start,
    End,
}

#[derive(Debug, Clone, Copy)]
struct Marker {
    value: f64,
    edge: Edge,
    entry: usize,
}

impl Marker {
    fn order(&self, other: &Marker) -> Ordering {
        self.value
            .total_cmp(&other.value)
            .then(self.edge.cmp(&other.edge))
            .then(self.entry.cmp(&other.entry))
    }
}

/// Pair up entries by index. Each pair is `(earlier opener, later opener)`.
///
/// Entries are identified by their position in `intervals`; the result only
/// depends on the intervals and that order.
pub fn resolve_ribbon(intervals: &[Interval]) -> Vec<(usize, usize)> {
    let mut markers: Vec<Marker> = intervals
        .iter()
        .enumerate()
        .flat_map(|(entry, interval)| {
            [
                Marker {
                    value: interval.low,
                    edge: Edge::Start,
                    entry,
                },
                Marker {
                    value: interval.high,
                    edge: Edge::End,
                    entry,
                },
            ]
        })
        .collect();
    markers.sort_unstable_by(Marker::order);

    let mut resolved = vec![false; intervals.len()];
    let mut open: Option<usize> = None;
    let mut pairs = Vec::new();

    for marker in markers {
        if resolved[marker.entry] {
            continue;
        }
        match marker.edge {
            Edge::Start => match open.take() {
                None => open = Some(marker.entry),
                Some(waiting) => {
                    resolved[waiting] = true;
                    resolved[marker.entry] = true;
                    pairs.push((waiting, marker.entry));
                }
            },
            Edge::End => open = None,
        }
    }

    pairs
}
