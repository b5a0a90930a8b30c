use serde::{Deserialize, Serialize};

use crate::data::spectrum::Peak;

/// Configuration for peak-list cleaning
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CleanParams {
    /// Drop peaks above this m/z, typically `precursor_mz - 1.6` (default: None)
    pub max_mz: Option<f32>,
    /// Relative intensity cutoff against the base peak (default: 0.01)
    pub noise_threshold: f32,
    /// Minimum m/z spacing between peaks; closer peaks are merged (default: 0.05)
    pub min_ms2_difference_in_da: f32,
    /// Maximum number of peaks to keep after filtering (default: None)
    pub max_peak_num: Option<usize>,
}

impl Default for CleanParams {
    fn default() -> Self {
        CleanParams {
            max_mz: None,
            noise_threshold: 0.01,
            min_ms2_difference_in_da: 0.05,
            max_peak_num: None,
        }
    }
}

impl CleanParams {
    /// Derive the `max_mz` cutoff from a precursor m/z and a removal window
    /// (the window is typically 1.6 Da).
    pub fn with_precursor_removal(mut self, precursor_mz: f32, removal_da: Option<f32>) -> Self {
        self.max_mz = removal_da.map(|da| precursor_mz - da);
        self
    }
}

/// Normalize a raw peak list into its canonical form.
///
/// The pipeline runs in a fixed order: drop invalid peaks, apply the m/z
/// cutoff, sort by m/z, merge peaks closer than `min_ms2_difference_in_da`
/// into their intensity-weighted centroid, drop peaks below the relative
/// noise threshold, optionally keep only the most intense peaks, and
/// normalize intensities to sum to 1.
///
/// # Arguments
///
/// * `peaks` - Raw peak list; order and scaling are arbitrary.
/// * `params` - Cleaning configuration.
///
/// # Returns
///
/// The canonical peak list. Empty input (or input where no peak survives)
/// yields an empty list, never an error.
pub fn clean_peaks(peaks: &[Peak], params: &CleanParams) -> Vec<Peak> {
    // drop non-finite and non-positive peaks, then apply the m/z cutoff
    let mut kept: Vec<Peak> = peaks
        .iter()
        .copied()
        .filter(|p| p.is_valid())
        .filter(|p| params.max_mz.map_or(true, |max_mz| p.mz <= max_mz))
        .collect();

    if kept.is_empty() {
        return kept;
    }

    // stable sort by m/z
    kept.sort_by(|a, b| a.mz.partial_cmp(&b.mz).unwrap_or(std::cmp::Ordering::Equal));

    // merge runs of peaks closer than the minimum spacing; the run grows
    // while the next peak is within the spacing of the run's current
    // intensity-weighted centroid
    let mut merged: Vec<Peak> = Vec::with_capacity(kept.len());
    for peak in kept {
        match merged.last_mut() {
            Some(last) if peak.mz - last.mz < params.min_ms2_difference_in_da => {
                let total = last.intensity + peak.intensity;
                last.mz = (last.mz * last.intensity + peak.mz * peak.intensity) / total;
                last.intensity = total;
            }
            _ => merged.push(peak),
        }
    }
    // merging adjacent sorted peaks cannot disturb the order
    debug_assert!(merged.windows(2).all(|w| w[0].mz <= w[1].mz));

    // relative noise filter against the base peak
    let base = merged.iter().map(|p| p.intensity).fold(0.0f32, f32::max);
    let threshold = params.noise_threshold * base;
    merged.retain(|p| p.intensity >= threshold);

    // keep the top-N most intense peaks, ties broken by smaller m/z
    if let Some(top_n) = params.max_peak_num {
        if merged.len() > top_n {
            merged.sort_by(|a, b| {
                b.intensity
                    .partial_cmp(&a.intensity)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.mz.partial_cmp(&b.mz).unwrap_or(std::cmp::Ordering::Equal))
            });
            merged.truncate(top_n);
            merged.sort_by(|a, b| a.mz.partial_cmp(&b.mz).unwrap_or(std::cmp::Ordering::Equal));
        }
    }

    // normalize intensities to sum to 1
    let sum: f32 = merged.iter().map(|p| p.intensity).sum();
    if sum > 0.0 {
        for peak in &mut merged {
            peak.intensity /= sum;
        }
    }

    merged
}
