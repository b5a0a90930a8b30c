pub mod algorithm;
pub mod data;
pub mod error;
pub mod index;

pub use {
    algorithm::clean::clean_peaks,
    algorithm::clean::CleanParams,

    algorithm::entropy::entropy_similarity,
    algorithm::entropy::spectral_entropy,
    algorithm::entropy::weight_peaks,

    data::spectrum::MetadataMap,
    data::spectrum::MetadataValue,
    data::spectrum::Peak,
    data::spectrum::RawSpectrum,
    data::spectrum::SpectrumRecord,

    error::Error,
    error::Result,

    index::dynamic::DynamicIndex,
    index::dynamic::InsertParams,
    index::dynamic::InsertReport,
    index::dynamic::LibraryConfig,

    index::flash::FlashIndex,
    index::flash::IndexParams,
    index::flash::IndexedSpectrum,

    index::metadata::RecordStore,

    index::repository::RepositorySearch,

    index::rank_topn,
    index::SearchEngine,
    index::SearchMethod,
    index::SearchParams,
    index::SearchQuery,
    index::TopMatch,
};
