use crate::data::spectrum::Peak;

/// Spectra with an entropy below this value get their intensities
/// reweighted before indexing and scoring. The cutoff and the weight
/// formula are part of the on-disk contract with stored indexes.
pub const ENTROPY_WEIGHT_CUTOFF: f32 = 3.0;

const LN_4: f32 = std::f32::consts::LN_2 * 2.0;

#[inline]
fn xlnx(x: f32) -> f32 {
    if x > 0.0 {
        x * x.ln()
    } else {
        0.0
    }
}

/// Shannon entropy of an intensity vector in natural-log units. Zero
/// entries contribute nothing.
pub fn spectral_entropy(intensity: &[f32]) -> f32 {
    -intensity.iter().map(|&p| xlnx(p)).sum::<f32>()
}

/// Reweight a normalized peak list by its spectral entropy.
///
/// For an entropy `H` below [`ENTROPY_WEIGHT_CUTOFF`], each intensity is
/// raised to the power `0.25 + 0.25 * H` and the list is renormalized to
/// sum to 1. Spectra at or above the cutoff are left untouched.
///
/// Applied once per spectrum at insertion and once per query at search
/// time; an index and its queries must agree on whether weighting is on.
pub fn weight_peaks(peaks: &mut [Peak]) {
    let entropy = spectral_entropy_of(peaks);
    if entropy >= ENTROPY_WEIGHT_CUTOFF {
        return;
    }
    let weight = 0.25 + 0.25 * entropy;
    let mut sum = 0.0f32;
    for peak in peaks.iter_mut() {
        peak.intensity = peak.intensity.powf(weight);
        sum += peak.intensity;
    }
    if sum > 0.0 {
        for peak in peaks.iter_mut() {
            peak.intensity /= sum;
        }
    }
}

fn spectral_entropy_of(peaks: &[Peak]) -> f32 {
    -peaks.iter().map(|p| xlnx(p.intensity)).sum::<f32>()
}

/// Merged-entropy contribution of one aligned intensity pair.
///
/// For intensities `a` and `b` drawn from two unit-normalized spectra the
/// contribution is `(f(a + b) - f(a) - f(b)) / ln 4` with `f(x) = x ln x`.
/// Summing this over a full alignment of two identical spectra gives 1.
#[inline]
pub fn peak_pair_contribution(a: f32, b: f32) -> f32 {
    (xlnx(a + b) - xlnx(a) - xlnx(b)) / LN_4
}

/// Entropy similarity of two cleaned, weighted peak lists.
///
/// Peaks are aligned greedily in m/z order within `ms2_tolerance_in_da`;
/// every aligned pair adds its merged-entropy contribution. The result
/// lies in `[0, 1]` and is symmetric in its arguments.
pub fn entropy_similarity(a: &[Peak], b: &[Peak], ms2_tolerance_in_da: f32) -> f32 {
    let mut similarity = 0.0f32;
    let mut i = 0;
    let mut j = 0;
    while i < a.len() && j < b.len() {
        let delta = a[i].mz - b[j].mz;
        if delta.abs() <= ms2_tolerance_in_da {
            similarity += peak_pair_contribution(a[i].intensity, b[j].intensity);
            i += 1;
            j += 1;
        } else if delta < 0.0 {
            i += 1;
        } else {
            j += 1;
        }
    }
    similarity
}

#[cfg(test)]
mod tests {
    use super::*;

    fn uniform(n: usize) -> Vec<Peak> {
        (0..n)
            .map(|k| Peak::new(100.0 + 10.0 * k as f32, 1.0 / n as f32))
            .collect()
    }

    #[test]
    fn test_entropy_of_uniform_vector() {
        let intensity = vec![0.25; 4];
        assert!((spectral_entropy(&intensity) - (4.0f32).ln()).abs() < 1e-6);
    }

    #[test]
    fn test_entropy_ignores_zero_entries() {
        assert!((spectral_entropy(&[0.5, 0.5, 0.0]) - spectral_entropy(&[0.5, 0.5])).abs() < 1e-7);
    }

    #[test]
    fn test_weighting_below_cutoff() {
        let mut peaks = vec![Peak::new(100.0, 0.8), Peak::new(200.0, 0.2)];
        let entropy = spectral_entropy(&[0.8, 0.2]);
        let weight = 0.25 + 0.25 * entropy;
        weight_peaks(&mut peaks);

        let raw = [0.8f32.powf(weight), 0.2f32.powf(weight)];
        let sum = raw[0] + raw[1];
        assert!((peaks[0].intensity - raw[0] / sum).abs() < 1e-6);
        assert!((peaks[1].intensity - raw[1] / sum).abs() < 1e-6);
        let total: f32 = peaks.iter().map(|p| p.intensity).sum();
        assert!((total - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_weighting_above_cutoff_is_identity() {
        // 25 uniform peaks have entropy ln(25) > 3
        let mut peaks = uniform(25);
        let before = peaks.clone();
        weight_peaks(&mut peaks);
        for (a, b) in peaks.iter().zip(before.iter()) {
            assert!((a.intensity - b.intensity).abs() < 1e-7);
        }
    }

    #[test]
    fn test_single_peak_weights_to_one() {
        let mut peaks = vec![Peak::new(250.0, 1.0)];
        weight_peaks(&mut peaks);
        assert!((peaks[0].intensity - 1.0).abs() < 1e-7);
    }

    #[test]
    fn test_pair_contribution_with_zero_side() {
        // f(0) = 0 by convention, so a pair with a zero side contributes
        // nothing beyond the shared term
        assert!((peak_pair_contribution(0.0, 0.0)).abs() < 1e-7);
        assert!(peak_pair_contribution(0.5, 0.0).abs() < 1e-7);
    }

    #[test]
    fn test_identical_pair_contribution() {
        // aligned identical intensities a = b = p contribute 2 p ln 2 / ln 4 = p
        assert!((peak_pair_contribution(1.0 / 3.0, 1.0 / 3.0) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn test_self_similarity_is_one() {
        let mut peaks = uniform(3);
        weight_peaks(&mut peaks);
        assert!((entropy_similarity(&peaks, &peaks, 0.02) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_single_peak_self_similarity() {
        let mut peaks = vec![Peak::new(321.1, 1.0)];
        weight_peaks(&mut peaks);
        assert!((entropy_similarity(&peaks, &peaks, 0.02) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_similarity_symmetric() {
        let mut a = vec![Peak::new(100.0, 0.7), Peak::new(250.0, 0.3)];
        let mut b = vec![Peak::new(100.01, 0.4), Peak::new(180.0, 0.6)];
        weight_peaks(&mut a);
        weight_peaks(&mut b);
        let ab = entropy_similarity(&a, &b, 0.02);
        let ba = entropy_similarity(&b, &a, 0.02);
        assert!((ab - ba).abs() < 1e-7);
        assert!(ab >= 0.0 && ab <= 1.0 + 1e-6);
    }

    #[test]
    fn test_disjoint_spectra_score_zero() {
        let a = uniform(3);
        let b: Vec<Peak> = uniform(3)
            .into_iter()
            .map(|p| Peak::new(p.mz + 500.0, p.intensity))
            .collect();
        assert!(entropy_similarity(&a, &b, 0.02).abs() < 1e-7);
    }
}
