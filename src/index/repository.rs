use std::collections::btree_map::Entry;
use std::collections::BTreeMap;
use std::path::PathBuf;

use tracing::debug;

use crate::data::spectrum::{RawSpectrum, SpectrumRecord};
use crate::error::{Error, Result};
use crate::index::dynamic::{DynamicIndex, InsertParams, InsertReport, LibraryConfig};
use crate::index::{SearchMethod, SearchParams, SearchQuery, TopMatch};

/// Repository-style search: one dynamic sub-library per precursor charge,
/// stored under `<root>/charge_<c>/` and loaded lazily. Only singly
/// charged spectra are indexed.
pub struct RepositorySearch {
    root: PathBuf,
    config: LibraryConfig,
    engines: BTreeMap<i8, DynamicIndex>,
}

impl RepositorySearch {
    pub fn new(root: impl Into<PathBuf>, config: LibraryConfig) -> Self {
        RepositorySearch {
            root: root.into(),
            config,
            engines: BTreeMap::new(),
        }
    }

    pub fn charges(&self) -> Vec<i8> {
        self.engines.keys().copied().collect()
    }

    /// Partition spectra by charge and insert them into the matching
    /// sub-library. Spectra without a charge, or with |charge| != 1, are
    /// skipped and counted in the report.
    pub fn add_spectra(
        &mut self,
        spectra: Vec<RawSpectrum>,
        params: &InsertParams,
    ) -> Result<InsertReport> {
        let mut by_charge: BTreeMap<i8, Vec<RawSpectrum>> = BTreeMap::new();
        let mut report = InsertReport::default();
        for spectrum in spectra {
            match spectrum.charge {
                Some(charge) if charge.abs() == 1 => {
                    by_charge.entry(charge).or_default().push(spectrum)
                }
                _ => report.skipped += 1,
            }
        }
        for (charge, charge_spectra) in by_charge {
            debug!(charge, n = charge_spectra.len(), "routing spectra to charge library");
            let engine = self.engine_mut(charge)?;
            let charge_report = engine.add_new_spectra(charge_spectra, params)?;
            report.inserted += charge_report.inserted;
            report.skipped += charge_report.skipped;
        }
        Ok(report)
    }

    /// Build indices of every loaded sub-library.
    pub fn build_index(&mut self) {
        for engine in self.engines.values_mut() {
            engine.build_index();
        }
    }

    /// Top-N matches in the sub-library of the given charge. The
    /// sub-library is read from disk on first use.
    pub fn search_topn_matches(
        &mut self,
        method: SearchMethod,
        charge: i8,
        query: &SearchQuery,
        params: &SearchParams,
    ) -> Result<Vec<TopMatch>> {
        self.load_charge(charge)?
            .search_topn_matches(method, query, params)
    }

    /// Fetch a stored spectrum by charge and sub-library index.
    pub fn get_spectrum(&mut self, charge: i8, spec_idx: u64) -> Result<SpectrumRecord> {
        self.load_charge(charge)?.get_spectrum(spec_idx)
    }

    /// Persist every loaded sub-library under its charge directory.
    pub fn write(&self) -> Result<()> {
        for (charge, engine) in &self.engines {
            engine.write(&self.root.join(format!("charge_{charge}")))?;
        }
        Ok(())
    }

    fn engine_mut(&mut self, charge: i8) -> Result<&mut DynamicIndex> {
        let dir = self.root.join(format!("charge_{charge}"));
        match self.engines.entry(charge) {
            Entry::Occupied(entry) => Ok(entry.into_mut()),
            Entry::Vacant(entry) => {
                let engine = if dir.is_dir() {
                    DynamicIndex::read(&dir)?
                } else {
                    DynamicIndex::new(self.config.clone())
                };
                Ok(entry.insert(engine))
            }
        }
    }

    fn load_charge(&mut self, charge: i8) -> Result<&DynamicIndex> {
        if !self.engines.contains_key(&charge) {
            let dir = self.root.join(format!("charge_{charge}"));
            if !dir.is_dir() {
                return Err(Error::Input(format!(
                    "charge state {charge} not found in the repository"
                )));
            }
            self.engines.insert(charge, DynamicIndex::read(&dir)?);
        }
        Ok(&self.engines[&charge])
    }
}
