use std::collections::BTreeMap;

use bincode::{Decode, Encode};
use serde::{Deserialize, Serialize};

/// A single fragment peak, an `(m/z, intensity)` pair.
///
/// After cleaning, peaks within a spectrum are sorted by `mz` ascending and
/// their intensities sum to 1.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct Peak {
    pub mz: f32,
    pub intensity: f32,
}

impl Peak {
    pub fn new(mz: f32, intensity: f32) -> Self {
        Peak { mz, intensity }
    }

    /// A peak is valid when both fields are finite and strictly positive.
    pub fn is_valid(&self) -> bool {
        self.mz.is_finite() && self.intensity.is_finite() && self.mz > 0.0 && self.intensity > 0.0
    }
}

/// Value type for the opaque per-spectrum metadata table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub enum MetadataValue {
    Null,
    Int(i64),
    Float(f64),
    Text(String),
}

pub type MetadataMap = BTreeMap<String, MetadataValue>;

/// An input spectrum as handed to the library by a caller.
///
/// `precursor_mz` and `peaks` are required; `charge` is required only by the
/// charge-partitioned repository preset. Everything in `metadata` is opaque
/// to the index and returned verbatim with search results.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct RawSpectrum {
    pub precursor_mz: f32,
    pub peaks: Vec<Peak>,
    pub charge: Option<i8>,
    pub scan: u64,
    pub metadata: MetadataMap,
}

impl RawSpectrum {
    pub fn new(precursor_mz: f32, peaks: Vec<Peak>) -> Self {
        RawSpectrum {
            precursor_mz,
            peaks,
            charge: None,
            scan: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_charge(mut self, charge: i8) -> Self {
        self.charge = Some(charge);
        self
    }

    pub fn with_scan(mut self, scan: u64) -> Self {
        self.scan = scan;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: MetadataValue) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    /// Whether the spectrum passes per-item input validation. Invalid
    /// spectra are skipped at insert and reported in the insert summary.
    pub fn is_valid(&self) -> bool {
        self.precursor_mz.is_finite() && self.precursor_mz > 0.0
    }
}

/// A spectrum as stored by the library: cleaned peaks plus the metadata the
/// caller supplied. This is what `get_spectrum` returns.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, Encode, Decode)]
pub struct SpectrumRecord {
    pub precursor_mz: f32,
    pub charge: Option<i8>,
    pub scan: u64,
    pub peaks: Vec<Peak>,
    pub metadata: MetadataMap,
}

impl SpectrumRecord {
    /// Flatten the record into a metadata map, inlining the well-known keys
    /// so results can be joined uniformly.
    pub fn to_metadata_map(&self) -> MetadataMap {
        let mut map = self.metadata.clone();
        map.insert(
            "precursor_mz".to_string(),
            MetadataValue::Float(self.precursor_mz as f64),
        );
        map.insert("scan".to_string(), MetadataValue::Int(self.scan as i64));
        if let Some(charge) = self.charge {
            map.insert("charge".to_string(), MetadataValue::Int(charge as i64));
        }
        map
    }
}
