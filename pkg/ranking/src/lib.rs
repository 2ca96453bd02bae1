use std::{cmp::Ordering, collections::BinaryHeap};

use schema::{QueryHit, QueryOptions, Record};

/// Cosine similarity; `0.0` when either side has zero norm or the lengths
/// disagree, so callers never see NaN. Sums run in `f64` so very small and
/// very large magnitudes keep self-similarity at `1.0`.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    let score = dot / (norm_a.sqrt() * norm_b.sqrt());
    if score.is_finite() {
        score.clamp(-1.0, 1.0) as f32
    } else {
        0.0
    }
}

/// Orders finite floats; `-0.0` and `0.0` compare equal.
pub fn compare_f32(a: f32, b: f32) -> Ordering {
    a.partial_cmp(&b).unwrap_or(Ordering::Equal)
}

/// Retention order shared by ranking and reward-based eviction: higher reward
/// first, then more recent, then earlier insertion.
pub fn compare_reward_recency(
    (reward_a, timestamp_a, position_a): (f32, i64, usize),
    (reward_b, timestamp_b, position_b): (f32, i64, usize),
) -> Ordering {
    compare_f32(reward_b, reward_a)
        .then_with(|| timestamp_b.cmp(&timestamp_a))
        .then_with(|| position_a.cmp(&position_b))
}

#[derive(Debug, Clone, Copy)]
struct ScoredCandidate {
    position: usize,
    score: f32,
    reward: f32,
    timestamp: i64,
}

impl ScoredCandidate {
    /// `Ordering::Less` means `self` ranks ahead of `other`.
    fn rank_cmp(&self, other: &Self) -> Ordering {
        compare_f32(other.score, self.score).then_with(|| {
            compare_reward_recency(
                (self.reward, self.timestamp, self.position),
                (other.reward, other.timestamp, other.position),
            )
        })
    }
}

impl PartialEq for ScoredCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.rank_cmp(other) == Ordering::Equal
    }
}

impl Eq for ScoredCandidate {}

impl PartialOrd for ScoredCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// Max-heap top is the worst-ranked candidate, which is what a bounded top-k
// evicts.
impl Ord for ScoredCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rank_cmp(other)
    }
}

/// Exact linear-scan top-k over `records` (insertion order). Records that
/// fail `opts` are skipped before scoring. The caller is responsible for
/// checking `query.len()` against the store dimension.
pub fn rank_records(records: &[Record], query: &[f32], opts: &QueryOptions) -> Vec<QueryHit> {
    if opts.top_k == 0 {
        return Vec::new();
    }

    // top_k comes straight from callers; never size the heap beyond the input.
    let mut heap: BinaryHeap<ScoredCandidate> =
        BinaryHeap::with_capacity(opts.top_k.min(records.len()));
    for (position, record) in records.iter().enumerate() {
        if !opts.matches(record) {
            continue;
        }
        let candidate = ScoredCandidate {
            position,
            score: cosine_similarity(&record.embedding, query),
            reward: record.reward,
            timestamp: record.timestamp,
        };
        if heap.len() < opts.top_k {
            heap.push(candidate);
        } else if let Some(worst) = heap.peek()
            && candidate.rank_cmp(worst) == Ordering::Less
        {
            heap.pop();
            heap.push(candidate);
        }
    }

    heap.into_sorted_vec()
        .into_iter()
        .map(|candidate| {
            let record = &records[candidate.position];
            QueryHit {
                task_id: record.task_id.clone(),
                reward: record.reward,
                timestamp: record.timestamp,
                score: candidate.score,
                embedding: opts.include_embedding.then(|| record.embedding.clone()),
            }
        })
        .collect()
}
