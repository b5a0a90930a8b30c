use std::fs;
use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Error, Result};
use crate::index::flash::{FlashIndex, PeakAxis};

pub(crate) const GROUP_STORE_VERSION: u32 = 1;

const META_FILE: &str = "meta.json";
const PEAKS_MZ_FILE: &str = "peaks_mz.bin";
const PEAKS_INTENSITY_FILE: &str = "peaks_intensity.bin";
const PEAKS_SPEC_IDX_FILE: &str = "peaks_spec_idx.bin";
const PEAKS_ION_IDX_FILE: &str = "peaks_ion_idx.bin";
const SPEC_IDX_START_FILE: &str = "spec_idx_start.bin";
const PRECURSOR_MZ_FILE: &str = "precursor_mz.bin";
const NL_MZ_FILE: &str = "nl_mz.bin";
const NL_INTENSITY_FILE: &str = "nl_intensity.bin";
const NL_SPEC_IDX_FILE: &str = "nl_spec_idx.bin";
const NL_ION_IDX_FILE: &str = "nl_ion_idx.bin";

#[derive(Debug, Serialize, Deserialize)]
struct GroupMeta {
    version: u32,
    n_spectra: u64,
    n_peaks: u64,
    has_neutral_loss: bool,
    intensity_weighted: bool,
}

/// Write `bytes` to `path` through a temporary sibling and an atomic
/// rename, so a failed write never replaces existing data.
pub(crate) fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

fn encode_f32(values: &[f32]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for &v in values {
        buf.write_f32::<LittleEndian>(v)?;
    }
    Ok(buf)
}

fn encode_u64(values: &[u64]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(values.len() * 8);
    for &v in values {
        buf.write_u64::<LittleEndian>(v)?;
    }
    Ok(buf)
}

fn encode_u32(values: &[u32]) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(values.len() * 4);
    for &v in values {
        buf.write_u32::<LittleEndian>(v)?;
    }
    Ok(buf)
}

fn decode_f32(dir: &Path, name: &str, expected: usize) -> Result<Vec<f32>> {
    let bytes = fs::read(dir.join(name))?;
    if bytes.len() != expected * 4 {
        return Err(Error::Corrupt(format!(
            "{name}: expected {} entries, found {} bytes",
            expected,
            bytes.len()
        )));
    }
    let mut values = vec![0.0f32; expected];
    Cursor::new(bytes).read_f32_into::<LittleEndian>(&mut values)?;
    Ok(values)
}

fn decode_u64(dir: &Path, name: &str, expected: usize) -> Result<Vec<u64>> {
    let bytes = fs::read(dir.join(name))?;
    if bytes.len() != expected * 8 {
        return Err(Error::Corrupt(format!(
            "{name}: expected {} entries, found {} bytes",
            expected,
            bytes.len()
        )));
    }
    let mut values = vec![0u64; expected];
    Cursor::new(bytes).read_u64_into::<LittleEndian>(&mut values)?;
    Ok(values)
}

fn decode_u32(dir: &Path, name: &str, expected: usize) -> Result<Vec<u32>> {
    let bytes = fs::read(dir.join(name))?;
    if bytes.len() != expected * 4 {
        return Err(Error::Corrupt(format!(
            "{name}: expected {} entries, found {} bytes",
            expected,
            bytes.len()
        )));
    }
    let mut values = vec![0u32; expected];
    Cursor::new(bytes).read_u32_into::<LittleEndian>(&mut values)?;
    Ok(values)
}

fn write_axis(dir: &Path, axis: &PeakAxis, files: [&str; 4]) -> Result<()> {
    write_atomic(&dir.join(files[0]), &encode_f32(&axis.mz)?)?;
    write_atomic(&dir.join(files[1]), &encode_f32(&axis.intensity)?)?;
    write_atomic(&dir.join(files[2]), &encode_u64(&axis.spec_idx)?)?;
    write_atomic(&dir.join(files[3]), &encode_u32(&axis.ion_idx)?)?;
    Ok(())
}

fn read_axis(dir: &Path, n_peaks: usize, files: [&str; 4]) -> Result<PeakAxis> {
    Ok(PeakAxis {
        mz: decode_f32(dir, files[0], n_peaks)?,
        intensity: decode_f32(dir, files[1], n_peaks)?,
        spec_idx: decode_u64(dir, files[2], n_peaks)?,
        ion_idx: decode_u32(dir, files[3], n_peaks)?,
    })
}

/// Persist one compact group as packed little-endian arrays plus a JSON
/// metadata record.
pub(crate) fn write_group(dir: &Path, index: &FlashIndex) -> Result<()> {
    fs::create_dir_all(dir)?;

    let meta = GroupMeta {
        version: GROUP_STORE_VERSION,
        n_spectra: index.n_spectra() as u64,
        n_peaks: index.n_peaks() as u64,
        has_neutral_loss: index.has_neutral_loss(),
        intensity_weighted: index.intensity_weighted(),
    };
    let meta_bytes =
        serde_json::to_vec_pretty(&meta).map_err(|e| Error::Corrupt(e.to_string()))?;
    write_atomic(&dir.join(META_FILE), &meta_bytes)?;

    write_atomic(&dir.join(SPEC_IDX_START_FILE), &encode_u64(&index.peak_start)?)?;
    write_atomic(&dir.join(PRECURSOR_MZ_FILE), &encode_f32(&index.precursor_mz)?)?;
    write_axis(
        dir,
        &index.products,
        [
            PEAKS_MZ_FILE,
            PEAKS_INTENSITY_FILE,
            PEAKS_SPEC_IDX_FILE,
            PEAKS_ION_IDX_FILE,
        ],
    )?;
    if let Some(losses) = &index.losses {
        write_axis(
            dir,
            losses,
            [NL_MZ_FILE, NL_INTENSITY_FILE, NL_SPEC_IDX_FILE, NL_ION_IDX_FILE],
        )?;
    }

    debug!(
        path = %dir.display(),
        n_spectra = meta.n_spectra,
        n_peaks = meta.n_peaks,
        "wrote group store"
    );
    Ok(())
}

/// Load one compact group written by [`write_group`]. The sorted precursor
/// axis is rebuilt rather than stored.
pub(crate) fn read_group(dir: &Path) -> Result<FlashIndex> {
    let meta_bytes = fs::read(dir.join(META_FILE))?;
    let meta: GroupMeta =
        serde_json::from_slice(&meta_bytes).map_err(|e| Error::Corrupt(e.to_string()))?;
    if meta.version != GROUP_STORE_VERSION {
        return Err(Error::Corrupt(format!(
            "unsupported group store version {}",
            meta.version
        )));
    }

    let n_spectra = meta.n_spectra as usize;
    let n_peaks = meta.n_peaks as usize;

    let peak_start = decode_u64(dir, SPEC_IDX_START_FILE, n_spectra + 1)?;
    if peak_start.last().copied() != Some(n_peaks as u64) {
        return Err(Error::Corrupt(
            "peak offsets do not cover the peak arrays".to_string(),
        ));
    }
    let precursor_mz = decode_f32(dir, PRECURSOR_MZ_FILE, n_spectra)?;
    let products = read_axis(
        dir,
        n_peaks,
        [
            PEAKS_MZ_FILE,
            PEAKS_INTENSITY_FILE,
            PEAKS_SPEC_IDX_FILE,
            PEAKS_ION_IDX_FILE,
        ],
    )?;
    let losses = if meta.has_neutral_loss {
        Some(read_axis(
            dir,
            n_peaks,
            [NL_MZ_FILE, NL_INTENSITY_FILE, NL_SPEC_IDX_FILE, NL_ION_IDX_FILE],
        )?)
    } else {
        None
    };

    debug!(path = %dir.display(), n_spectra, n_peaks, "read group store");
    Ok(FlashIndex::from_parts(
        peak_start,
        products,
        losses,
        precursor_mz,
        meta.intensity_weighted,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::clean::{clean_peaks, CleanParams};
    use crate::data::spectrum::Peak;
    use crate::index::flash::{IndexParams, IndexedSpectrum};
    use crate::index::{SearchMethod, SearchParams, SearchQuery};

    fn sample_index() -> FlashIndex {
        let spectra: Vec<IndexedSpectrum> = [
            (150.0f32, vec![(100.0, 1.0), (101.0, 2.0), (103.0, 1.0)]),
            (250.0, vec![(200.0, 1.0), (101.0, 1.0), (202.0, 3.0)]),
        ]
        .into_iter()
        .map(|(precursor_mz, peaks)| {
            let raw: Vec<Peak> = peaks.iter().map(|&(mz, i)| Peak::new(mz, i)).collect();
            IndexedSpectrum {
                precursor_mz,
                peaks: clean_peaks(&raw, &CleanParams::default()),
            }
        })
        .collect();
        FlashIndex::build(&spectra, &IndexParams::default())
    }

    #[test]
    fn test_roundtrip_preserves_scores() {
        let dir = tempfile::tempdir().unwrap();
        let index = sample_index();
        write_group(dir.path(), &index).unwrap();
        let reloaded = read_group(dir.path()).unwrap();

        let query = SearchQuery::new(vec![
            Peak::new(101.0, 1.0),
            Peak::new(200.0, 1.0),
            Peak::new(202.0, 1.0),
        ])
        .with_precursor_mz(250.0);
        for method in SearchMethod::all() {
            let before = index
                .search_method(method, &query, &SearchParams::default())
                .unwrap();
            let after = reloaded
                .search_method(method, &query, &SearchParams::default())
                .unwrap();
            assert_eq!(before, after);
        }
    }

    #[test]
    fn test_roundtrip_without_neutral_loss() {
        let dir = tempfile::tempdir().unwrap();
        let spectra = vec![IndexedSpectrum {
            precursor_mz: 300.0,
            peaks: vec![Peak::new(100.0, 1.0)],
        }];
        let index = FlashIndex::build(
            &spectra,
            &IndexParams {
                index_for_neutral_loss: false,
                intensity_weight: true,
            },
        );
        write_group(dir.path(), &index).unwrap();
        let reloaded = read_group(dir.path()).unwrap();
        assert!(!reloaded.has_neutral_loss());
        assert_eq!(reloaded.n_peaks(), 1);
    }

    #[test]
    fn test_truncated_array_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        write_group(dir.path(), &sample_index()).unwrap();
        let mz_file = dir.path().join(PEAKS_MZ_FILE);
        let bytes = std::fs::read(&mz_file).unwrap();
        std::fs::write(&mz_file, &bytes[..bytes.len() - 4]).unwrap();

        let err = read_group(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_version_mismatch_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        write_group(dir.path(), &sample_index()).unwrap();
        let meta_file = dir.path().join(META_FILE);
        let text = std::fs::read_to_string(&meta_file).unwrap();
        std::fs::write(&meta_file, text.replace("\"version\": 1", "\"version\": 99")).unwrap();

        let err = read_group(dir.path()).unwrap_err();
        assert!(matches!(err, Error::Corrupt(_)));
    }

    #[test]
    fn test_missing_directory_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = read_group(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, Error::Io(_)));
    }
}
