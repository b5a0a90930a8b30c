use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::algorithm::clean::{clean_peaks, CleanParams};
use crate::algorithm::entropy::{peak_pair_contribution, weight_peaks};
use crate::data::spectrum::Peak;
use crate::error::{Error, Result};
use crate::index::{SearchEngine, SearchMethod, SearchParams, SearchQuery};

/// Build-time configuration of one compact group.
#[derive(Clone, Copy, Debug)]
pub struct IndexParams {
    /// Build the neutral-loss arrays alongside the fragment arrays
    pub index_for_neutral_loss: bool,
    /// Entropy-weight intensities before indexing
    pub intensity_weight: bool,
}

impl Default for IndexParams {
    fn default() -> Self {
        IndexParams {
            index_for_neutral_loss: true,
            intensity_weight: true,
        }
    }
}

/// One cleaned spectrum ready for indexing.
#[derive(Clone, Debug)]
pub struct IndexedSpectrum {
    pub precursor_mz: f32,
    pub peaks: Vec<Peak>,
}

/// All peaks of a group sorted along one alignment axis (fragment m/z, or
/// precursor minus fragment m/z for the neutral-loss axis).
#[derive(Clone, Debug, Default)]
pub(crate) struct PeakAxis {
    pub(crate) mz: Vec<f32>,
    pub(crate) intensity: Vec<f32>,
    pub(crate) spec_idx: Vec<u64>,
    pub(crate) ion_idx: Vec<u32>,
}

impl PeakAxis {
    fn from_entries(mut entries: Vec<(f32, f32, u64, u32)>) -> Self {
        // ties in the axis value are broken by (spectrum, ion) so builds
        // are deterministic
        entries.sort_unstable_by(|a, b| {
            a.0.partial_cmp(&b.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.2.cmp(&b.2))
                .then(a.3.cmp(&b.3))
        });
        let mut axis = PeakAxis {
            mz: Vec::with_capacity(entries.len()),
            intensity: Vec::with_capacity(entries.len()),
            spec_idx: Vec::with_capacity(entries.len()),
            ion_idx: Vec::with_capacity(entries.len()),
        };
        for (mz, intensity, spec_idx, ion_idx) in entries {
            axis.mz.push(mz);
            axis.intensity.push(intensity);
            axis.spec_idx.push(spec_idx);
            axis.ion_idx.push(ion_idx);
        }
        axis
    }

    pub(crate) fn len(&self) -> usize {
        self.mz.len()
    }
}

/// Locate the index range of values within `[lo, hi]` in a sorted slice.
fn range_bounds(sorted: &[f32], lo: f32, hi: f32) -> (usize, usize) {
    let start = sorted.partition_point(|&v| v < lo);
    let end = sorted.partition_point(|&v| v <= hi);
    (start, end)
}

/// Immutable inverted index over the fragment peaks of one group of
/// spectra, supporting the four entropy-similarity search modes.
#[derive(Clone, Debug)]
pub struct FlashIndex {
    /// CSR offsets: spectrum `s` owns peaks `[peak_start[s], peak_start[s+1])`
    pub(crate) peak_start: Vec<u64>,
    pub(crate) products: PeakAxis,
    pub(crate) losses: Option<PeakAxis>,
    /// Precursor m/z by spectrum index
    pub(crate) precursor_mz: Vec<f32>,
    pub(crate) precursor_sorted: Vec<f32>,
    pub(crate) precursor_order: Vec<u64>,
    pub(crate) intensity_weighted: bool,
}

struct ScanChannels {
    product: bool,
    loss_precursor: Option<f32>,
}

impl FlashIndex {
    /// Build the index from cleaned spectra.
    ///
    /// Intensities must already be normalized to sum to 1 per spectrum;
    /// entropy weighting is applied here when configured.
    pub fn build(spectra: &[IndexedSpectrum], params: &IndexParams) -> FlashIndex {
        let mut peak_start = Vec::with_capacity(spectra.len() + 1);
        peak_start.push(0u64);
        let mut total = 0u64;
        for spec in spectra {
            total += spec.peaks.len() as u64;
            peak_start.push(total);
        }

        let mut weighted: Vec<Vec<Peak>> = spectra.iter().map(|s| s.peaks.clone()).collect();
        if params.intensity_weight {
            for peaks in &mut weighted {
                weight_peaks(peaks);
            }
        }

        let mut product_entries = Vec::with_capacity(total as usize);
        for (spec_idx, peaks) in weighted.iter().enumerate() {
            for (ion_idx, peak) in peaks.iter().enumerate() {
                product_entries.push((peak.mz, peak.intensity, spec_idx as u64, ion_idx as u32));
            }
        }
        let products = PeakAxis::from_entries(product_entries);

        let losses = if params.index_for_neutral_loss {
            let mut loss_entries = Vec::with_capacity(total as usize);
            for (spec_idx, peaks) in weighted.iter().enumerate() {
                let precursor_mz = spectra[spec_idx].precursor_mz;
                for (ion_idx, peak) in peaks.iter().enumerate() {
                    loss_entries.push((
                        precursor_mz - peak.mz,
                        peak.intensity,
                        spec_idx as u64,
                        ion_idx as u32,
                    ));
                }
            }
            Some(PeakAxis::from_entries(loss_entries))
        } else {
            None
        };

        let precursor_mz: Vec<f32> = spectra.iter().map(|s| s.precursor_mz).collect();
        let (precursor_sorted, precursor_order) = sort_precursors(&precursor_mz);

        FlashIndex {
            peak_start,
            products,
            losses,
            precursor_mz,
            precursor_sorted,
            precursor_order,
            intensity_weighted: params.intensity_weight,
        }
    }

    /// Reassemble an index from its stored arrays, rebuilding the sorted
    /// precursor axis.
    pub(crate) fn from_parts(
        peak_start: Vec<u64>,
        products: PeakAxis,
        losses: Option<PeakAxis>,
        precursor_mz: Vec<f32>,
        intensity_weighted: bool,
    ) -> FlashIndex {
        let (precursor_sorted, precursor_order) = sort_precursors(&precursor_mz);
        FlashIndex {
            peak_start,
            products,
            losses,
            precursor_mz,
            precursor_sorted,
            precursor_order,
            intensity_weighted,
        }
    }

    pub fn n_spectra(&self) -> usize {
        self.precursor_mz.len()
    }

    pub fn n_peaks(&self) -> usize {
        self.products.len()
    }

    pub fn has_neutral_loss(&self) -> bool {
        self.losses.is_some()
    }

    pub fn intensity_weighted(&self) -> bool {
        self.intensity_weighted
    }

    /// Clean and entropy-weight a query the same way the index side was
    /// prepared. Low-level search methods expect their input in this form.
    pub fn prepare_query(&self, query: &SearchQuery, params: &SearchParams) -> Vec<Peak> {
        let mut peaks = if params.clean {
            let clean_params = CleanParams {
                max_mz: query
                    .precursor_mz
                    .and_then(|p| params.precursor_ions_removal_da.map(|da| p - da)),
                noise_threshold: params.noise_threshold,
                min_ms2_difference_in_da: params.min_ms2_difference_in_da,
                max_peak_num: params.max_peak_num,
            };
            clean_peaks(&query.peaks, &clean_params)
        } else {
            query.peaks.clone()
        };
        if self.intensity_weighted {
            weight_peaks(&mut peaks);
        }
        peaks
    }

    /// Open search: direct fragment alignment within `ms2_tolerance_in_da`,
    /// no precursor constraint.
    pub fn search_open(
        &self,
        peaks: &[Peak],
        ms2_tolerance_in_da: f32,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<f32>> {
        self.scan(
            peaks,
            ms2_tolerance_in_da,
            ScanChannels {
                product: true,
                loss_precursor: None,
            },
            None,
            cancel,
        )
    }

    /// Identity search: open search restricted to reference spectra whose
    /// precursor m/z lies within `ms1_tolerance_in_da` of the query's.
    pub fn search_identity(
        &self,
        peaks: &[Peak],
        precursor_mz: f32,
        ms1_tolerance_in_da: f32,
        ms2_tolerance_in_da: f32,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<f32>> {
        self.require_neutral_loss(SearchMethod::Identity)?;
        let (lo, hi) = range_bounds(
            &self.precursor_sorted,
            precursor_mz - ms1_tolerance_in_da,
            precursor_mz + ms1_tolerance_in_da,
        );
        let mut candidates = vec![false; self.n_spectra()];
        for &spec_idx in &self.precursor_order[lo..hi] {
            candidates[spec_idx as usize] = true;
        }
        self.scan(
            peaks,
            ms2_tolerance_in_da,
            ScanChannels {
                product: true,
                loss_precursor: None,
            },
            Some(&candidates),
            cancel,
        )
    }

    /// Neutral-loss search: alignment of `precursor - fragment` values.
    pub fn search_neutral_loss(
        &self,
        peaks: &[Peak],
        precursor_mz: f32,
        ms2_tolerance_in_da: f32,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<f32>> {
        self.require_neutral_loss(SearchMethod::NeutralLoss)?;
        self.scan(
            peaks,
            ms2_tolerance_in_da,
            ScanChannels {
                product: false,
                loss_precursor: Some(precursor_mz),
            },
            None,
            cancel,
        )
    }

    /// Hybrid search: per reference peak, the better of its direct and
    /// neutral-loss alignment, never both.
    pub fn search_hybrid(
        &self,
        peaks: &[Peak],
        precursor_mz: f32,
        ms2_tolerance_in_da: f32,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<f32>> {
        self.require_neutral_loss(SearchMethod::Hybrid)?;
        self.scan(
            peaks,
            ms2_tolerance_in_da,
            ScanChannels {
                product: true,
                loss_precursor: Some(precursor_mz),
            },
            None,
            cancel,
        )
    }

    /// High-level entry point: prepares the query per `params` and
    /// dispatches to the requested mode.
    pub fn search_method(
        &self,
        method: SearchMethod,
        query: &SearchQuery,
        params: &SearchParams,
    ) -> Result<Vec<f32>> {
        let peaks = self.prepare_query(query, params);
        let cancel = params.cancel.as_deref();
        match method {
            SearchMethod::Open => self.search_open(&peaks, params.ms2_tolerance_in_da, cancel),
            SearchMethod::Identity => {
                let precursor_mz = require_precursor(query, method)?;
                self.search_identity(
                    &peaks,
                    precursor_mz,
                    params.ms1_tolerance_in_da,
                    params.ms2_tolerance_in_da,
                    cancel,
                )
            }
            SearchMethod::NeutralLoss => {
                let precursor_mz = require_precursor(query, method)?;
                self.search_neutral_loss(&peaks, precursor_mz, params.ms2_tolerance_in_da, cancel)
            }
            SearchMethod::Hybrid => {
                let precursor_mz = require_precursor(query, method)?;
                self.search_hybrid(&peaks, precursor_mz, params.ms2_tolerance_in_da, cancel)
            }
        }
    }

    fn require_neutral_loss(&self, method: SearchMethod) -> Result<()> {
        if self.losses.is_none() {
            return Err(Error::ConfigMismatch(format!(
                "{} search requires an index built with neutral-loss arrays",
                method.name()
            )));
        }
        Ok(())
    }

    fn scan(
        &self,
        peaks: &[Peak],
        ms2_tolerance_in_da: f32,
        channels: ScanChannels,
        candidates: Option<&[bool]>,
        cancel: Option<&AtomicBool>,
    ) -> Result<Vec<f32>> {
        let mut scores = vec![0.0f32; self.n_spectra()];
        // best contribution credited so far, keyed by the reference peak's
        // global position; realizes the at-most-once-per-reference-peak rule
        let mut credited: HashMap<u64, f32> = HashMap::new();

        for peak in peaks {
            if let Some(flag) = cancel {
                if flag.load(Ordering::Relaxed) {
                    return Err(Error::Cancelled);
                }
            }
            if channels.product {
                self.accumulate(
                    &self.products,
                    peak.mz,
                    peak.intensity,
                    ms2_tolerance_in_da,
                    candidates,
                    &mut credited,
                    &mut scores,
                );
            }
            if let Some(precursor_mz) = channels.loss_precursor {
                if let Some(losses) = &self.losses {
                    self.accumulate(
                        losses,
                        precursor_mz - peak.mz,
                        peak.intensity,
                        ms2_tolerance_in_da,
                        candidates,
                        &mut credited,
                        &mut scores,
                    );
                }
            }
        }
        Ok(scores)
    }

    #[allow(clippy::too_many_arguments)]
    fn accumulate(
        &self,
        axis: &PeakAxis,
        center: f32,
        query_intensity: f32,
        tolerance: f32,
        candidates: Option<&[bool]>,
        credited: &mut HashMap<u64, f32>,
        scores: &mut [f32],
    ) {
        let (lo, hi) = range_bounds(&axis.mz, center - tolerance, center + tolerance);
        for hit in lo..hi {
            let spec_idx = axis.spec_idx[hit] as usize;
            if let Some(mask) = candidates {
                if !mask[spec_idx] {
                    continue;
                }
            }
            let contribution = peak_pair_contribution(query_intensity, axis.intensity[hit]);
            if contribution <= 0.0 {
                continue;
            }
            // the same reference peak has the same global position on the
            // fragment and neutral-loss axes
            let key = self.peak_start[spec_idx] + axis.ion_idx[hit] as u64;
            let best = credited.entry(key).or_insert(0.0);
            if contribution > *best {
                scores[spec_idx] += contribution - *best;
                *best = contribution;
            }
        }
    }
}

impl SearchEngine for FlashIndex {
    fn n_spectra(&self) -> usize {
        self.n_spectra()
    }

    fn search(
        &self,
        method: SearchMethod,
        query: &SearchQuery,
        params: &SearchParams,
    ) -> Result<Vec<f32>> {
        self.search_method(method, query, params)
    }
}

fn require_precursor(query: &SearchQuery, method: SearchMethod) -> Result<f32> {
    query.precursor_mz.ok_or_else(|| {
        Error::Input(format!(
            "{} search requires a query precursor m/z",
            method.name()
        ))
    })
}

fn sort_precursors(precursor_mz: &[f32]) -> (Vec<f32>, Vec<u64>) {
    let mut order: Vec<u64> = (0..precursor_mz.len() as u64).collect();
    order.sort_by(|&a, &b| {
        precursor_mz[a as usize]
            .partial_cmp(&precursor_mz[b as usize])
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let sorted = order.iter().map(|&i| precursor_mz[i as usize]).collect();
    (sorted, order)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::clean::clean_peaks;

    fn spectrum(precursor_mz: f32, peaks: &[(f32, f32)]) -> IndexedSpectrum {
        let raw: Vec<Peak> = peaks.iter().map(|&(mz, i)| Peak::new(mz, i)).collect();
        let params = CleanParams::default().with_precursor_removal(precursor_mz, Some(1.6));
        IndexedSpectrum {
            precursor_mz,
            peaks: clean_peaks(&raw, &params),
        }
    }

    fn reference_spectra() -> Vec<IndexedSpectrum> {
        vec![
            spectrum(150.0, &[(100.0, 1.0), (101.0, 1.0), (103.0, 1.0)]),
            spectrum(200.0, &[(100.0, 1.0), (101.0, 1.0), (102.0, 1.0)]),
            spectrum(250.0, &[(200.0, 1.0), (101.0, 1.0), (202.0, 1.0)]),
            spectrum(350.0, &[(100.0, 1.0), (101.0, 1.0), (302.0, 1.0)]),
        ]
    }

    fn reference_index(index_for_neutral_loss: bool) -> FlashIndex {
        FlashIndex::build(
            &reference_spectra(),
            &IndexParams {
                index_for_neutral_loss,
                intensity_weight: true,
            },
        )
    }

    fn query(precursor_mz: f32, peaks: &[(f32, f32)]) -> SearchQuery {
        SearchQuery::new(peaks.iter().map(|&(mz, i)| Peak::new(mz, i)).collect())
            .with_precursor_mz(precursor_mz)
    }

    #[test]
    fn test_build_arrays_are_sorted_csr() {
        let index = reference_index(true);
        assert_eq!(index.n_spectra(), 4);
        assert_eq!(index.n_peaks(), 12);
        assert_eq!(index.peak_start, vec![0, 3, 6, 9, 12]);
        assert!(index.products.mz.windows(2).all(|w| w[0] <= w[1]));
        let losses = index.losses.as_ref().unwrap();
        assert!(losses.mz.windows(2).all(|w| w[0] <= w[1]));
        assert_eq!(losses.len(), 12);
    }

    #[test]
    fn test_open_search_exact_match_scores_one() {
        let index = reference_index(true);
        let scores = index
            .search_method(
                SearchMethod::Open,
                &query(250.0, &[(200.0, 1.0), (101.0, 1.0), (202.0, 1.0)]),
                &SearchParams::default(),
            )
            .unwrap();
        // the query equals the third spectrum; every other spectrum shares
        // exactly one of three peaks
        assert!((scores[2] - 1.0).abs() < 1e-6);
        for &s in &[scores[0], scores[1], scores[3]] {
            assert!((s - 1.0 / 3.0).abs() < 1e-6);
        }
    }

    #[test]
    fn test_open_search_with_zero_peak_placeholders() {
        let mut spectra = reference_spectra();
        spectra.push(IndexedSpectrum {
            precursor_mz: 400.0,
            peaks: vec![],
        });
        spectra.push(IndexedSpectrum {
            precursor_mz: 500.0,
            peaks: vec![],
        });
        let index = FlashIndex::build(&spectra, &IndexParams::default());

        let scores = index
            .search_method(
                SearchMethod::Open,
                &query(150.0, &[(100.0, 1.0), (101.0, 1.0), (102.0, 1.0)]),
                &SearchParams::default(),
            )
            .unwrap();
        // two of three peaks shared with the first and fourth spectra, all
        // three with the second, one with the third; empty spectra never
        // score
        assert!((scores[0] - 2.0 / 3.0).abs() < 1e-6);
        assert!((scores[1] - 1.0).abs() < 1e-6);
        assert!((scores[2] - 1.0 / 3.0).abs() < 1e-6);
        assert!((scores[3] - 2.0 / 3.0).abs() < 1e-6);
        assert!(scores[4].abs() < 1e-7);
        assert!(scores[5].abs() < 1e-7);
    }

    #[test]
    fn test_scores_stay_in_range() {
        let index = reference_index(true);
        for method in SearchMethod::all() {
            let scores = index
                .search_method(
                    method,
                    &query(250.0, &[(200.0, 1.0), (101.0, 1.0), (202.0, 1.0)]),
                    &SearchParams::default(),
                )
                .unwrap();
            for &s in &scores {
                assert!(s >= 0.0 && s <= 1.0 + 1e-6);
            }
        }
    }

    #[test]
    fn test_identity_search_restricts_to_precursor_window() {
        let index = reference_index(true);
        let scores = index
            .search_method(
                SearchMethod::Identity,
                &query(150.0, &[(100.0, 1.0), (101.0, 1.0), (103.0, 1.0)]),
                &SearchParams::default(),
            )
            .unwrap();
        // only the first spectrum has a precursor within 0.01 Da
        assert!((scores[0] - 1.0).abs() < 1e-6);
        assert!(scores[1].abs() < 1e-7);
        assert!(scores[2].abs() < 1e-7);
        assert!(scores[3].abs() < 1e-7);
    }

    #[test]
    fn test_identity_requires_query_precursor() {
        let index = reference_index(true);
        let no_precursor = SearchQuery::new(vec![Peak::new(100.0, 1.0)]);
        let err = index
            .search_method(SearchMethod::Identity, &no_precursor, &SearchParams::default())
            .unwrap_err();
        assert!(matches!(err, Error::Input(_)));
    }

    #[test]
    fn test_neutral_loss_search() {
        let index = reference_index(true);
        let scores = index
            .search_method(
                SearchMethod::NeutralLoss,
                &query(250.0, &[(200.0, 1.0), (101.0, 1.0), (202.0, 1.0)]),
                &SearchParams::default(),
            )
            .unwrap();
        // the third spectrum matches all losses; the first shares the
        // 50 Da loss, the fourth the 48 Da loss, the second none
        assert!((scores[2] - 1.0).abs() < 1e-6);
        assert!((scores[0] - 1.0 / 3.0).abs() < 1e-6);
        assert!(scores[1].abs() < 1e-7);
        assert!((scores[3] - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_hybrid_search_credits_each_reference_peak_once() {
        let index = reference_index(true);
        let q = query(250.0, &[(200.0, 1.0), (101.0, 1.0), (202.0, 1.0)]);
        let hybrid = index
            .search_method(SearchMethod::Hybrid, &q, &SearchParams::default())
            .unwrap();
        // the self-match hits every reference peak on both axes but is
        // credited once per peak
        assert!((hybrid[2] - 1.0).abs() < 1e-6);
        // the first spectrum matches 101 directly and the 50 Da loss via
        // its 100 peak, so hybrid beats both single-channel scores
        assert!((hybrid[0] - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_open_dedup_two_query_peaks_one_reference_peak() {
        let reference = vec![IndexedSpectrum {
            precursor_mz: 500.0,
            peaks: vec![Peak::new(100.03, 1.0)],
        }];
        let index = FlashIndex::build(&reference, &IndexParams::default());

        let q = SearchQuery::new(vec![Peak::new(100.0, 0.5), Peak::new(100.06, 0.5)]);
        let params = SearchParams {
            ms2_tolerance_in_da: 0.1,
            ..SearchParams::default()
        };
        let scores = index.search_method(SearchMethod::Open, &q, &params).unwrap();
        // both query peaks fall within tolerance of the single reference
        // peak; it is credited once, not twice
        let single_pair = peak_pair_contribution(0.5, 1.0);
        assert!((scores[0] - single_pair).abs() < 1e-6);
    }

    #[test]
    fn test_methods_other_than_open_need_neutral_loss_arrays() {
        let index = reference_index(false);
        let q = query(250.0, &[(200.0, 1.0)]);
        for method in [
            SearchMethod::Identity,
            SearchMethod::NeutralLoss,
            SearchMethod::Hybrid,
        ] {
            let err = index
                .search_method(method, &q, &SearchParams::default())
                .unwrap_err();
            assert!(matches!(err, Error::ConfigMismatch(_)));
        }
        assert!(index
            .search_method(SearchMethod::Open, &q, &SearchParams::default())
            .is_ok());
    }

    #[test]
    fn test_cancellation_flag_stops_search() {
        let index = reference_index(true);
        let cancel = std::sync::Arc::new(AtomicBool::new(true));
        let params = SearchParams {
            cancel: Some(cancel),
            ..SearchParams::default()
        };
        let err = index
            .search_method(
                SearchMethod::Open,
                &query(250.0, &[(200.0, 1.0)]),
                &params,
            )
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[test]
    fn test_empty_query_scores_zero_everywhere() {
        let index = reference_index(true);
        let scores = index
            .search_method(
                SearchMethod::Open,
                &SearchQuery::new(vec![]),
                &SearchParams::default(),
            )
            .unwrap();
        assert_eq!(scores.len(), 4);
        assert!(scores.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_unweighted_index_prepares_unweighted_queries() {
        let spectra = reference_spectra();
        let index = FlashIndex::build(
            &spectra,
            &IndexParams {
                index_for_neutral_loss: true,
                intensity_weight: false,
            },
        );
        assert!(!index.intensity_weighted());
        // a self match still scores 1 when both sides skip weighting
        let scores = index
            .search_method(
                SearchMethod::Open,
                &query(250.0, &[(200.0, 1.0), (101.0, 1.0), (202.0, 1.0)]),
                &SearchParams::default(),
            )
            .unwrap();
        assert!((scores[2] - 1.0).abs() < 1e-6);
    }
}
