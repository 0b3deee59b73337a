//! Pure ranking math for the retrieval pipeline: reciprocal-rank fusion,
//! score blending, the strong-signal shortcut, and near-duplicate
//! detection. No I/O; everything here is deterministic and unit-tested.

use std::collections::{HashMap, HashSet};

/// Tunable constants of the retrieval pipeline. The defaults are
/// load-bearing for result quality; callers may override per engine.
#[derive(Debug, Clone)]
pub struct SearchTuning {
    /// RRF smoothing constant.
    pub rrf_k: f64,
    /// Weight of the first two input lists (original BM25 + original vector).
    pub original_list_weight: f64,
    /// Weight of every expanded list.
    pub expanded_list_weight: f64,
    /// Bonus for a best input rank of 0.
    pub top_rank_bonus: f64,
    /// Bonus for a best input rank of 1 or 2.
    pub near_top_rank_bonus: f64,
    /// Candidates forwarded to the reranker.
    pub rerank_doc_limit: usize,
    /// Chunks selected per candidate document.
    pub rerank_chunks_per_doc: usize,
    /// Blend weights by RRF rank bucket.
    pub blend_weight_top3: f64,
    pub blend_weight_top10: f64,
    pub blend_weight_rest: f64,
    /// Bigram Jaccard similarity at or above which results merge.
    pub dedup_similarity: f64,
    /// Strong-signal shortcut thresholds.
    pub shortcut_top_score: f64,
    pub shortcut_gap: f64,
    /// Per-sub-search result cap (larger when `--all`).
    pub fanout_limit: usize,
}

impl Default for SearchTuning {
    fn default() -> Self {
        Self {
            rrf_k: 60.0,
            original_list_weight: 2.0,
            expanded_list_weight: 1.0,
            top_rank_bonus: 0.05,
            near_top_rank_bonus: 0.02,
            rerank_doc_limit: 40,
            rerank_chunks_per_doc: 3,
            blend_weight_top3: 0.75,
            blend_weight_top10: 0.60,
            blend_weight_rest: 0.40,
            dedup_similarity: 0.90,
            shortcut_top_score: 0.85,
            shortcut_gap: 0.15,
            fanout_limit: 20,
        }
    }
}

impl SearchTuning {
    /// The strong-signal shortcut: skip query expansion when the top BM25
    /// hit is high and well separated from the runner-up.
    pub fn is_strong_signal(&self, top: f64, second: Option<f64>) -> bool {
        top >= self.shortcut_top_score
            && (top - second.unwrap_or(0.0)) >= self.shortcut_gap
    }

    /// Blend the RRF position with the rerank score: high RRF ranks trust
    /// fusion more, deep ranks trust the reranker.
    pub fn blend_score(&self, rrf_rank: usize, rerank_score: f64) -> f64 {
        let rank = rrf_rank.max(1);
        let w = if rank <= 3 {
            self.blend_weight_top3
        } else if rank <= 10 {
            self.blend_weight_top10
        } else {
            self.blend_weight_rest
        };
        w * (1.0 / rank as f64) + (1.0 - w) * rerank_score
    }
}

/// One ranked input list for fusion: document keys, best first.
#[derive(Debug, Clone)]
pub struct RankedList {
    pub weight: f64,
    pub keys: Vec<String>,
}

/// A fused document with its RRF score and 1-based fused rank.
#[derive(Debug, Clone)]
pub struct FusedDoc {
    pub key: String,
    pub score: f64,
    pub rrf_rank: usize,
}

/// Reciprocal-rank fusion: `score(d) = Σ weight / (k + rank)` with
/// 1-based ranks, plus a bonus for documents whose best input rank was
/// very high. Ties break by first appearance across the input lists, so
/// the output is deterministic for a fixed set and order of inputs.
pub fn reciprocal_rank_fusion(lists: &[RankedList], tuning: &SearchTuning) -> Vec<FusedDoc> {
    let mut scores: HashMap<String, f64> = HashMap::new();
    let mut best_rank: HashMap<String, usize> = HashMap::new();
    let mut first_seen: HashMap<String, usize> = HashMap::new();
    let mut order = 0usize;

    for list in lists {
        for (rank0, key) in list.keys.iter().enumerate() {
            *scores.entry(key.clone()).or_insert(0.0) +=
                list.weight / (tuning.rrf_k + (rank0 + 1) as f64);
            best_rank
                .entry(key.clone())
                .and_modify(|r| *r = (*r).min(rank0))
                .or_insert(rank0);
            first_seen.entry(key.clone()).or_insert_with(|| {
                order += 1;
                order
            });
        }
    }

    for (key, rank) in &best_rank {
        let bonus = match rank {
            0 => tuning.top_rank_bonus,
            1 | 2 => tuning.near_top_rank_bonus,
            _ => 0.0,
        };
        if bonus > 0.0 {
            *scores.get_mut(key).expect("scored key") += bonus;
        }
    }

    let mut fused: Vec<(String, f64, usize)> = scores
        .into_iter()
        .map(|(key, score)| {
            let seen = first_seen[&key];
            (key, score, seen)
        })
        .collect();
    fused.sort_by(|a, b| {
        b.1.partial_cmp(&a.1)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.2.cmp(&b.2))
    });

    fused
        .into_iter()
        .enumerate()
        .map(|(i, (key, score, _))| FusedDoc {
            key,
            score,
            rrf_rank: i + 1,
        })
        .collect()
}

/// Jaccard similarity over character bigrams of whitespace-normalized
/// text. `1.0` for identical normalized strings, `0.0` for disjoint.
pub fn bigram_jaccard(a: &str, b: &str) -> f64 {
    let a = normalize_whitespace(a);
    let b = normalize_whitespace(b);
    if a == b {
        return 1.0;
    }
    let sa = bigrams(&a);
    let sb = bigrams(&b);
    if sa.is_empty() || sb.is_empty() {
        return 0.0;
    }
    let intersection = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    intersection / union
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn bigrams(s: &str) -> HashSet<(char, char)> {
    let chars: Vec<char> = s.chars().collect();
    chars.windows(2).map(|w| (w[0], w[1])).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(weight: f64, keys: &[&str]) -> RankedList {
        RankedList {
            weight,
            keys: keys.iter().map(|k| k.to_string()).collect(),
        }
    }

    #[test]
    fn rrf_sums_weight_over_rank() {
        let tuning = SearchTuning {
            top_rank_bonus: 0.0,
            near_top_rank_bonus: 0.0,
            ..SearchTuning::default()
        };
        let fused = reciprocal_rank_fusion(
            &[list(2.0, &["a", "b"]), list(1.0, &["b", "a"])],
            &tuning,
        );
        // a: 2/61 + 1/62, b: 2/62 + 1/61, so a wins on the weighted list.
        assert_eq!(fused[0].key, "a");
        assert_eq!(fused[0].rrf_rank, 1);
        let expected_a = 2.0 / 61.0 + 1.0 / 62.0;
        assert!((fused[0].score - expected_a).abs() < 1e-12);
    }

    #[test]
    fn rrf_rank_bonus() {
        let tuning = SearchTuning::default();
        let fused = reciprocal_rank_fusion(&[list(1.0, &["a", "b", "c", "d", "e"])], &tuning);
        let by_key: HashMap<&str, f64> =
            fused.iter().map(|f| (f.key.as_str(), f.score)).collect();

        let base = |rank1: f64| 1.0 / (60.0 + rank1);
        assert!((by_key["a"] - (base(1.0) + 0.05)).abs() < 1e-12);
        assert!((by_key["b"] - (base(2.0) + 0.02)).abs() < 1e-12);
        assert!((by_key["c"] - (base(3.0) + 0.02)).abs() < 1e-12);
        assert!((by_key["d"] - base(4.0)).abs() < 1e-12);
    }

    #[test]
    fn rrf_is_invariant_to_equal_weight_list_order() {
        let tuning = SearchTuning::default();
        let l1 = list(1.0, &["a", "b", "c"]);
        let l2 = list(1.0, &["c", "b", "x"]);
        let fused_ab = reciprocal_rank_fusion(&[l1.clone(), l2.clone()], &tuning);
        let fused_ba = reciprocal_rank_fusion(&[l2, l1], &tuning);

        let score = |fused: &[FusedDoc], key: &str| {
            fused.iter().find(|f| f.key == key).unwrap().score
        };
        for key in ["a", "b", "c", "x"] {
            assert!((score(&fused_ab, key) - score(&fused_ba, key)).abs() < 1e-12);
        }
    }

    #[test]
    fn blend_weights_by_rank_bucket() {
        let tuning = SearchTuning::default();
        // rank 1: 0.75·1 + 0.25·0.8
        assert!((tuning.blend_score(1, 0.8) - (0.75 + 0.25 * 0.8)).abs() < 1e-12);
        // rank 5: 0.60·(1/5) + 0.40·0.8
        assert!((tuning.blend_score(5, 0.8) - (0.60 / 5.0 + 0.40 * 0.8)).abs() < 1e-12);
        // rank 20: 0.40·(1/20) + 0.60·0.8
        assert!((tuning.blend_score(20, 0.8) - (0.40 / 20.0 + 0.60 * 0.8)).abs() < 1e-12);
    }

    #[test]
    fn strong_signal_boundaries() {
        let tuning = SearchTuning::default();
        assert!(tuning.is_strong_signal(0.85, Some(0.70)));
        assert!(tuning.is_strong_signal(0.9, None));
        assert!(!tuning.is_strong_signal(0.84, Some(0.10)), "top below threshold");
        assert!(!tuning.is_strong_signal(0.9, Some(0.80)), "gap too small");
        assert!(tuning.is_strong_signal(0.9, Some(0.75)));
    }

    #[test]
    fn jaccard_identity_and_whitespace() {
        assert_eq!(bigram_jaccard("pasta water", "pasta water"), 1.0);
        assert_eq!(bigram_jaccard("pasta   water", "pasta water\n"), 1.0);
        assert_eq!(bigram_jaccard("", ""), 1.0);
        assert_eq!(bigram_jaccard("abc", ""), 0.0);
    }

    #[test]
    fn jaccard_near_duplicates_cross_the_threshold() {
        let a = "The pasta water binds the sauce to the noodles when emulsified properly.";
        let b = "The pasta water binds the sauce to the noodles when emulsified properly!";
        assert!(bigram_jaccard(a, b) >= 0.90);

        let c = "Completely different text about git branches and rebasing workflows.";
        assert!(bigram_jaccard(a, c) < 0.90);
    }
}
