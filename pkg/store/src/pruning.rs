use std::cmp::Ordering;

use ranking::compare_reward_recency;
use schema::Record;

/// Eviction policies. Each one computes the retain set from the current
/// records and removes its complement, so running the same policy twice on
/// unchanged records removes nothing the second time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PrunePolicy {
    /// Remove every record with `timestamp < cutoff_ms`.
    OlderThan(i64),
    /// Keep the `n` most recent records; among equal timestamps the
    /// later-inserted record survives.
    KeepNewest(usize),
    /// Keep the `n` highest-reward records; ties go to the more recent, then
    /// the earlier-inserted record.
    KeepHighestReward(usize),
}

impl PrunePolicy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::OlderThan(_) => "older_than",
            Self::KeepNewest(_) => "keep_newest",
            Self::KeepHighestReward(_) => "keep_highest_reward",
        }
    }

    /// One flag per record, `true` meaning evict. `None` when nothing
    /// qualifies, so callers can skip persistence for a no-op.
    pub fn removal_mask(&self, records: &[Record]) -> Option<Vec<bool>> {
        let mask = match *self {
            Self::OlderThan(cutoff_ms) => records
                .iter()
                .map(|record| record.timestamp < cutoff_ms)
                .collect(),
            Self::KeepNewest(n) => {
                if records.len() <= n {
                    return None;
                }
                mask_outside_top(records, n, |(a_pos, a), (b_pos, b)| {
                    b.timestamp
                        .cmp(&a.timestamp)
                        .then_with(|| b_pos.cmp(&a_pos))
                })
            }
            Self::KeepHighestReward(n) => {
                if records.len() <= n {
                    return None;
                }
                mask_outside_top(records, n, |(a_pos, a), (b_pos, b)| {
                    compare_reward_recency(
                        (a.reward, a.timestamp, a_pos),
                        (b.reward, b.timestamp, b_pos),
                    )
                })
            }
        };
        mask.contains(&true).then_some(mask)
    }
}

/// Sort positions best-first with `order` and flag everything past `keep`.
fn mask_outside_top<F>(records: &[Record], keep: usize, order: F) -> Vec<bool>
where
    F: Fn((usize, &Record), (usize, &Record)) -> Ordering,
{
    let mut positions: Vec<usize> = (0..records.len()).collect();
    positions.sort_by(|&a, &b| order((a, &records[a]), (b, &records[b])));
    let mut mask = vec![true; records.len()];
    for &position in positions.iter().take(keep) {
        mask[position] = false;
    }
    mask
}
