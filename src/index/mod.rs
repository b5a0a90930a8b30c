pub mod dynamic;
pub mod flash;
pub mod metadata;
pub mod repository;
pub mod storage;

use std::cmp::Ordering;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use itertools::Itertools;
use serde::{Deserialize, Serialize};

use crate::data::spectrum::{MetadataMap, Peak};
use crate::error::Result;

/// The four similarity-search modes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SearchMethod {
    Identity,
    Open,
    NeutralLoss,
    Hybrid,
}

impl SearchMethod {
    pub fn all() -> [SearchMethod; 4] {
        [
            SearchMethod::Identity,
            SearchMethod::Open,
            SearchMethod::NeutralLoss,
            SearchMethod::Hybrid,
        ]
    }

    pub fn name(&self) -> &'static str {
        match self {
            SearchMethod::Identity => "identity",
            SearchMethod::Open => "open",
            SearchMethod::NeutralLoss => "neutral_loss",
            SearchMethod::Hybrid => "hybrid",
        }
    }

    /// Key under which a joined metadata record carries this method's score.
    pub fn score_key(&self) -> String {
        format!("{}_search_entropy_similarity", self.name())
    }
}

/// A query spectrum. `precursor_mz` is required for identity, neutral-loss
/// and hybrid searches.
#[derive(Clone, Debug)]
pub struct SearchQuery {
    pub peaks: Vec<Peak>,
    pub precursor_mz: Option<f32>,
}

impl SearchQuery {
    pub fn new(peaks: Vec<Peak>) -> Self {
        SearchQuery {
            peaks,
            precursor_mz: None,
        }
    }

    pub fn with_precursor_mz(mut self, precursor_mz: f32) -> Self {
        self.precursor_mz = Some(precursor_mz);
        self
    }
}

/// Search configuration
#[derive(Clone, Debug)]
pub struct SearchParams {
    /// Methods to run (default: open only)
    pub methods: Vec<SearchMethod>,
    /// Precursor tolerance for identity search in Da (default: 0.01)
    pub ms1_tolerance_in_da: f32,
    /// Fragment tolerance in Da (default: 0.02)
    pub ms2_tolerance_in_da: f32,
    /// Strip query peaks above `precursor_mz` minus this window (default: 1.6)
    pub precursor_ions_removal_da: Option<f32>,
    /// Relative noise cutoff used when cleaning the query (default: 0.01)
    pub noise_threshold: f32,
    /// Merge spacing used when cleaning the query (default: 0.05)
    pub min_ms2_difference_in_da: f32,
    /// Keep only this many query peaks after cleaning (default: None)
    pub max_peak_num: Option<usize>,
    /// Number of matches for top-N search; None returns all (default: 3)
    pub topn: Option<usize>,
    /// Join top-N results to stored metadata records (default: false)
    pub need_metadata: bool,
    /// Clean the query before searching (default: true)
    pub clean: bool,
    /// Cooperative cancellation flag, polled between query peaks and
    /// between buckets
    pub cancel: Option<Arc<AtomicBool>>,
}

impl Default for SearchParams {
    fn default() -> Self {
        SearchParams {
            methods: vec![SearchMethod::Open],
            ms1_tolerance_in_da: 0.01,
            ms2_tolerance_in_da: 0.02,
            precursor_ions_removal_da: Some(1.6),
            noise_threshold: 0.01,
            min_ms2_difference_in_da: 0.05,
            max_peak_num: None,
            topn: Some(3),
            need_metadata: false,
            clean: true,
            cancel: None,
        }
    }
}

/// One ranked match from a top-N search. `record` is populated only when
/// metadata joining was requested.
#[derive(Clone, Debug)]
pub struct TopMatch {
    pub global_idx: u64,
    pub score: f32,
    pub record: Option<MetadataMap>,
}

/// Shared search capability of the compact and dynamic library variants.
pub trait SearchEngine {
    fn n_spectra(&self) -> usize;

    /// Dense similarity vector over all spectra for one method.
    fn search(
        &self,
        method: SearchMethod,
        query: &SearchQuery,
        params: &SearchParams,
    ) -> Result<Vec<f32>>;

    /// Ranked `(global_idx, score)` pairs for one method.
    fn search_topn(
        &self,
        method: SearchMethod,
        query: &SearchQuery,
        params: &SearchParams,
    ) -> Result<Vec<(u64, f32)>> {
        let scores = self.search(method, query, params)?;
        Ok(rank_topn(&scores, params.topn))
    }
}

/// Rank a dense score vector into `(global_idx, score)` pairs, descending
/// by score with ties broken by smaller index. `topn = None` ranks all.
pub fn rank_topn(scores: &[f32], topn: Option<usize>) -> Vec<(u64, f32)> {
    struct Ranked {
        score: f32,
        idx: u64,
    }
    impl PartialEq for Ranked {
        fn eq(&self, other: &Self) -> bool {
            self.cmp(other) == Ordering::Equal
        }
    }
    impl Eq for Ranked {}
    impl PartialOrd for Ranked {
        fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
            Some(self.cmp(other))
        }
    }
    impl Ord for Ranked {
        fn cmp(&self, other: &Self) -> Ordering {
            // greater = better: higher score, then smaller index
            self.score
                .total_cmp(&other.score)
                .then_with(|| other.idx.cmp(&self.idx))
        }
    }

    match topn {
        None => scores
            .iter()
            .enumerate()
            .sorted_by(|a, b| b.1.total_cmp(a.1).then_with(|| a.0.cmp(&b.0)))
            .map(|(idx, &score)| (idx as u64, score))
            .collect(),
        Some(k) => {
            let mut heap = std::collections::BinaryHeap::with_capacity(k + 1);
            for (idx, &score) in scores.iter().enumerate() {
                heap.push(std::cmp::Reverse(Ranked {
                    score,
                    idx: idx as u64,
                }));
                if heap.len() > k {
                    heap.pop();
                }
            }
            heap.into_sorted_vec()
                .into_iter()
                .map(|std::cmp::Reverse(r)| (r.idx, r.score))
                .collect()
        }
    }
}
