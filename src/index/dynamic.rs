use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::algorithm::clean::{clean_peaks, CleanParams};
use crate::algorithm::entropy::weight_peaks;
use crate::data::spectrum::{MetadataValue, Peak, RawSpectrum, SpectrumRecord};
use crate::error::{Error, Result};
use crate::index::flash::{FlashIndex, IndexParams, IndexedSpectrum};
use crate::index::metadata::RecordStore;
use crate::index::storage::{read_group, write_atomic, write_group};
use crate::index::{rank_topn, SearchEngine, SearchMethod, SearchParams, SearchQuery, TopMatch};

pub const DEFAULT_BUCKET_CAPACITY: usize = 100_000;

const LIBRARY_META_VERSION: u32 = 1;
const CONFIG_FILE: &str = "config.json";

/// Library-wide configuration, frozen at the first insert.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LibraryConfig {
    /// Bucket capacity; reaching it freezes the bucket to compact form
    pub capacity: usize,
    /// Build neutral-loss arrays; when off only open search may run
    pub index_for_neutral_loss: bool,
    /// Entropy-weight intensities on both the index and query side
    pub intensity_weight: bool,
}

impl Default for LibraryConfig {
    fn default() -> Self {
        LibraryConfig {
            capacity: DEFAULT_BUCKET_CAPACITY,
            index_for_neutral_loss: true,
            intensity_weight: true,
        }
    }
}

/// Configuration for one insert batch
#[derive(Clone, Debug)]
pub struct InsertParams {
    /// Clean incoming peak lists (default: true)
    pub clean: bool,
    /// Strip peaks above `precursor_mz` minus this window (default: 1.6)
    pub precursor_ions_removal_da: Option<f32>,
    /// Relative noise cutoff (default: 0.01)
    pub noise_threshold: f32,
    /// Merge spacing in Da (default: 0.05)
    pub min_ms2_difference_in_da: f32,
    /// Keep only this many peaks per spectrum (default: None)
    pub max_peak_num: Option<usize>,
    /// Promote a bucket to compact form when it reaches capacity (default: true)
    pub convert_to_flash: bool,
}

impl Default for InsertParams {
    fn default() -> Self {
        InsertParams {
            clean: true,
            precursor_ions_removal_da: Some(1.6),
            noise_threshold: 0.01,
            min_ms2_difference_in_da: 0.05,
            max_peak_num: None,
            convert_to_flash: true,
        }
    }
}

/// Per-batch insert summary. Spectra failing input validation are skipped,
/// not fatal.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct InsertReport {
    pub inserted: usize,
    pub skipped: usize,
}

#[derive(Clone, Debug)]
struct Bucket {
    records: RecordStore,
    index: Option<FlashIndex>,
    /// Number of records covered by `index`
    built_count: usize,
    compact: bool,
}

impl Bucket {
    fn new() -> Self {
        Bucket {
            records: RecordStore::new(),
            index: None,
            built_count: 0,
            compact: false,
        }
    }

    fn len(&self) -> usize {
        self.records.len()
    }

    /// A bucket is stale while it holds records its index does not cover.
    fn is_stale(&self) -> bool {
        self.built_count < self.len()
    }

    fn build(&mut self, config: &LibraryConfig) {
        let spectra: Vec<IndexedSpectrum> = self
            .records
            .records()
            .iter()
            .map(|r| IndexedSpectrum {
                precursor_mz: r.precursor_mz,
                peaks: r.peaks.clone(),
            })
            .collect();
        self.index = Some(FlashIndex::build(
            &spectra,
            &IndexParams {
                index_for_neutral_loss: config.index_for_neutral_loss,
                intensity_weight: config.intensity_weight,
            },
        ));
        self.built_count = self.len();
    }
}

#[derive(Serialize, Deserialize)]
struct BucketMeta {
    n_records: u64,
    built: bool,
    compact: bool,
}

#[derive(Serialize, Deserialize)]
struct LibraryMeta {
    version: u32,
    config: LibraryConfig,
    group_start: Vec<u64>,
    buckets: Vec<BucketMeta>,
}

/// Incrementally updatable spectral library: a sequence of buckets, each
/// either open (awaiting build), built with slack, or compact. Presents
/// the union of all buckets as one logical index with contiguous global
/// indices.
#[derive(Clone, Debug, Default)]
pub struct DynamicIndex {
    config: LibraryConfig,
    config_frozen: bool,
    buckets: Vec<Bucket>,
}

impl DynamicIndex {
    pub fn new(config: LibraryConfig) -> Self {
        DynamicIndex {
            config,
            config_frozen: false,
            buckets: Vec::new(),
        }
    }

    pub fn config(&self) -> &LibraryConfig {
        &self.config
    }

    /// Replace the configuration. Fails once the first spectrum has been
    /// inserted; the weighting and neutral-loss modes are part of the
    /// index contents.
    pub fn set_config(&mut self, config: LibraryConfig) -> Result<()> {
        if self.config_frozen {
            return Err(Error::ConfigMismatch(
                "library configuration is frozen after the first insert".to_string(),
            ));
        }
        self.config = config;
        Ok(())
    }

    pub fn n_buckets(&self) -> usize {
        self.buckets.len()
    }

    pub fn n_spectra(&self) -> usize {
        self.buckets.iter().map(|b| b.len()).sum()
    }

    /// Prefix sums of bucket sizes; `group_start[b]` shifts bucket-local
    /// indices into the global index space.
    pub fn group_start(&self) -> Vec<u64> {
        let mut starts = Vec::with_capacity(self.buckets.len() + 1);
        let mut total = 0u64;
        starts.push(0);
        for bucket in &self.buckets {
            total += bucket.len() as u64;
            starts.push(total);
        }
        starts
    }

    /// Clean, weight and append spectra to the current open bucket,
    /// promoting it to compact form whenever it reaches capacity.
    pub fn add_new_spectra(
        &mut self,
        spectra: Vec<RawSpectrum>,
        params: &InsertParams,
    ) -> Result<InsertReport> {
        self.config_frozen = true;

        let prepared: Vec<Option<SpectrumRecord>> = spectra
            .into_par_iter()
            .map(|raw| {
                if !raw.is_valid() {
                    return None;
                }
                let RawSpectrum {
                    precursor_mz,
                    peaks,
                    charge,
                    scan,
                    metadata,
                } = raw;
                let peaks = if params.clean {
                    let clean_params = CleanParams {
                        max_mz: params.precursor_ions_removal_da.map(|da| precursor_mz - da),
                        noise_threshold: params.noise_threshold,
                        min_ms2_difference_in_da: params.min_ms2_difference_in_da,
                        max_peak_num: params.max_peak_num,
                    };
                    clean_peaks(&peaks, &clean_params)
                } else {
                    peaks
                };
                Some(SpectrumRecord {
                    precursor_mz,
                    charge,
                    scan,
                    peaks,
                    metadata,
                })
            })
            .collect();

        let mut report = InsertReport::default();
        for record in prepared {
            match record {
                None => report.skipped += 1,
                Some(record) => {
                    report.inserted += 1;
                    self.append_record(record, params.convert_to_flash);
                }
            }
        }
        debug!(
            inserted = report.inserted,
            skipped = report.skipped,
            n_buckets = self.buckets.len(),
            "added spectra"
        );
        Ok(report)
    }

    fn append_record(&mut self, record: SpectrumRecord, convert_to_flash: bool) {
        // the append bucket is the trailing non-compact one
        if self.buckets.last().map_or(true, |b| b.compact) {
            self.buckets.push(Bucket::new());
        }
        let bucket_id = self.buckets.len() - 1;
        let capacity = self.config.capacity;
        let bucket = &mut self.buckets[bucket_id];
        bucket.records.push(record);
        if bucket.len() >= capacity && convert_to_flash {
            bucket.build(&self.config);
            bucket.compact = true;
            info!(
                bucket = bucket_id,
                n_spectra = bucket.len(),
                "bucket reached capacity, promoted to compact"
            );
        }
    }

    /// Build every stale bucket so queries may run; non-full buckets keep
    /// their slack and remain appendable.
    pub fn build_index(&mut self) {
        for (bucket_id, bucket) in self.buckets.iter_mut().enumerate() {
            if !bucket.compact && bucket.is_stale() {
                bucket.build(&self.config);
                debug!(bucket = bucket_id, n_spectra = bucket.len(), "built bucket");
            }
        }
    }

    /// Repack buckets into slack-free compact form. With `bucket_id` the
    /// promotion targets one bucket and refuses an already-compact one;
    /// without, every non-compact bucket is promoted.
    pub fn promote_to_compact(&mut self, bucket_id: Option<usize>) -> Result<()> {
        match bucket_id {
            Some(id) => self.promote_one(id),
            None => {
                for id in 0..self.buckets.len() {
                    if !self.buckets[id].compact {
                        self.promote_one(id)?;
                    }
                }
                Ok(())
            }
        }
    }

    fn promote_one(&mut self, bucket_id: usize) -> Result<()> {
        let config = self.config.clone();
        let bucket = self
            .buckets
            .get_mut(bucket_id)
            .ok_or_else(|| Error::Input(format!("bucket {bucket_id} does not exist")))?;
        if bucket.compact {
            return Err(Error::State(format!("bucket {bucket_id} is already compact")));
        }
        if bucket.is_stale() || bucket.index.is_none() {
            bucket.build(&config);
        }
        bucket.compact = true;
        info!(bucket = bucket_id, n_spectra = bucket.len(), "promoted bucket");
        Ok(())
    }

    fn ensure_built(&self) -> Result<()> {
        for (bucket_id, bucket) in self.buckets.iter().enumerate() {
            if bucket.is_stale() {
                return Err(Error::State(format!(
                    "bucket {bucket_id} has unindexed spectra; call build_index first"
                )));
            }
        }
        Ok(())
    }

    fn prepare_query(&self, query: &SearchQuery, params: &SearchParams) -> Vec<Peak> {
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
        if self.config.intensity_weight {
            weight_peaks(&mut peaks);
        }
        peaks
    }

    /// Run one method across all buckets and concatenate the per-bucket
    /// score vectors in global-index order.
    fn search_dense(
        &self,
        method: SearchMethod,
        query: &SearchQuery,
        params: &SearchParams,
    ) -> Result<Vec<f32>> {
        self.ensure_built()?;

        let precursor_mz = match method {
            SearchMethod::Open => query.precursor_mz.unwrap_or(0.0),
            _ => query.precursor_mz.ok_or_else(|| {
                Error::Input(format!("{} search requires a query precursor m/z", method.name()))
            })?,
        };
        let prepared = self.prepare_query(query, params);
        let ms1 = params.ms1_tolerance_in_da;
        let ms2 = params.ms2_tolerance_in_da;
        let cancel = params.cancel.as_deref();

        let partials: Vec<Vec<f32>> = self
            .buckets
            .par_iter()
            .map(|bucket| {
                if let Some(flag) = cancel {
                    if flag.load(std::sync::atomic::Ordering::Relaxed) {
                        return Err(Error::Cancelled);
                    }
                }
                match &bucket.index {
                    None => Ok(Vec::new()),
                    Some(index) => match method {
                        SearchMethod::Open => index.search_open(&prepared, ms2, cancel),
                        SearchMethod::Identity => {
                            index.search_identity(&prepared, precursor_mz, ms1, ms2, cancel)
                        }
                        SearchMethod::NeutralLoss => {
                            index.search_neutral_loss(&prepared, precursor_mz, ms2, cancel)
                        }
                        SearchMethod::Hybrid => {
                            index.search_hybrid(&prepared, precursor_mz, ms2, cancel)
                        }
                    },
                }
            })
            .collect::<Result<Vec<_>>>()?;

        let mut scores = Vec::with_capacity(self.n_spectra());
        for partial in partials {
            scores.extend(partial);
        }
        Ok(scores)
    }

    /// Dense score vectors for every requested method.
    pub fn search_many(
        &self,
        query: &SearchQuery,
        params: &SearchParams,
    ) -> Result<BTreeMap<SearchMethod, Vec<f32>>> {
        let mut results = BTreeMap::new();
        for &method in &params.methods {
            results.insert(method, self.search_dense(method, query, params)?);
        }
        Ok(results)
    }

    /// Top-K matches for one method, optionally joined with the stored
    /// metadata records.
    pub fn search_topn_matches(
        &self,
        method: SearchMethod,
        query: &SearchQuery,
        params: &SearchParams,
    ) -> Result<Vec<TopMatch>> {
        let scores = self.search_dense(method, query, params)?;
        rank_topn(&scores, params.topn)
            .into_iter()
            .map(|(global_idx, score)| {
                let record = if params.need_metadata {
                    let spectrum = self.get_spectrum(global_idx)?;
                    let mut map = spectrum.to_metadata_map();
                    map.insert(method.score_key(), MetadataValue::Float(score as f64));
                    Some(map)
                } else {
                    None
                };
                Ok(TopMatch {
                    global_idx,
                    score,
                    record,
                })
            })
            .collect()
    }

    /// Fetch the stored record behind a global index.
    pub fn get_spectrum(&self, global_idx: u64) -> Result<SpectrumRecord> {
        let group_start = self.group_start();
        let total = *group_start.last().unwrap_or(&0);
        if global_idx >= total {
            return Err(Error::Input(format!(
                "spectrum index {global_idx} out of range for {total} spectra"
            )));
        }
        let bucket_id = group_start.partition_point(|&s| s <= global_idx) - 1;
        let local_idx = (global_idx - group_start[bucket_id]) as usize;
        self.buckets[bucket_id]
            .records
            .get(local_idx)
            .cloned()
            .ok_or_else(|| Error::Input(format!("spectrum index {global_idx} not found")))
    }

    /// Persist the library: `config.json` at the root, one directory per
    /// bucket. Buckets whose index lags behind their records store only
    /// records and are rebuilt after reading.
    pub fn write(&self, root: &Path) -> Result<()> {
        fs::create_dir_all(root)?;

        let mut bucket_metas = Vec::with_capacity(self.buckets.len());
        for (bucket_id, bucket) in self.buckets.iter().enumerate() {
            let dir = root.join(bucket_id.to_string());
            bucket.records.write(&dir)?;
            let built = bucket.index.is_some() && !bucket.is_stale();
            if built {
                if let Some(index) = &bucket.index {
                    write_group(&dir, index)?;
                }
            }
            bucket_metas.push(BucketMeta {
                n_records: bucket.len() as u64,
                built,
                compact: bucket.compact,
            });
        }

        let meta = LibraryMeta {
            version: LIBRARY_META_VERSION,
            config: self.config.clone(),
            group_start: self.group_start(),
            buckets: bucket_metas,
        };
        let meta_bytes =
            serde_json::to_vec_pretty(&meta).map_err(|e| Error::Corrupt(e.to_string()))?;
        // the config file is written last; its presence marks a complete write
        write_atomic(&root.join(CONFIG_FILE), &meta_bytes)?;
        info!(path = %root.display(), n_buckets = self.buckets.len(), "wrote library");
        Ok(())
    }

    pub fn read(root: &Path) -> Result<DynamicIndex> {
        let meta_bytes = fs::read(root.join(CONFIG_FILE))?;
        let meta: LibraryMeta =
            serde_json::from_slice(&meta_bytes).map_err(|e| Error::Corrupt(e.to_string()))?;
        if meta.version != LIBRARY_META_VERSION {
            return Err(Error::Corrupt(format!(
                "unsupported library version {}",
                meta.version
            )));
        }

        let mut buckets = Vec::with_capacity(meta.buckets.len());
        for (bucket_id, bucket_meta) in meta.buckets.iter().enumerate() {
            let dir = root.join(bucket_id.to_string());
            let records = RecordStore::read(&dir)?;
            if records.len() as u64 != bucket_meta.n_records {
                return Err(Error::Corrupt(format!(
                    "bucket {bucket_id}: expected {} records, found {}",
                    bucket_meta.n_records,
                    records.len()
                )));
            }
            let index = if bucket_meta.built {
                let index = read_group(&dir)?;
                if index.n_spectra() != records.len() {
                    return Err(Error::Corrupt(format!(
                        "bucket {bucket_id}: index covers {} spectra but {} records stored",
                        index.n_spectra(),
                        records.len()
                    )));
                }
                Some(index)
            } else {
                None
            };
            let built_count = if index.is_some() { records.len() } else { 0 };
            buckets.push(Bucket {
                records,
                index,
                built_count,
                compact: bucket_meta.compact,
            });
        }

        let library = DynamicIndex {
            config: meta.config,
            config_frozen: true,
            buckets,
        };
        if library.group_start() != meta.group_start {
            return Err(Error::Corrupt(
                "stored group offsets do not match bucket contents".to_string(),
            ));
        }
        info!(path = %root.display(), n_buckets = library.buckets.len(), "read library");
        Ok(library)
    }
}

impl SearchEngine for DynamicIndex {
    fn n_spectra(&self) -> usize {
        self.n_spectra()
    }

    fn search(
        &self,
        method: SearchMethod,
        query: &SearchQuery,
        params: &SearchParams,
    ) -> Result<Vec<f32>> {
        self.search_dense(method, query, params)
    }
}
