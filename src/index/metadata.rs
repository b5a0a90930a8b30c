use std::fs;
use std::io::Cursor;
use std::path::Path;

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use crate::data::spectrum::SpectrumRecord;
use crate::error::{Error, Result};
use crate::index::storage::write_atomic;

const RECORDS_FILE: &str = "records.bin";
const OFFSETS_FILE: &str = "record_offsets.bin";

/// Record-oriented store of the spectra behind one bucket, keyed by local
/// index. Holds the cleaned peaks plus caller metadata, and persists as a
/// concatenated binary blob with a byte-offset table.
#[derive(Clone, Debug, Default)]
pub struct RecordStore {
    records: Vec<SpectrumRecord>,
}

impl RecordStore {
    pub fn new() -> Self {
        RecordStore::default()
    }

    pub fn push(&mut self, record: SpectrumRecord) {
        self.records.push(record);
    }

    pub fn get(&self, local_idx: usize) -> Option<&SpectrumRecord> {
        self.records.get(local_idx)
    }

    pub fn records(&self) -> &[SpectrumRecord] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn write(&self, dir: &Path) -> Result<()> {
        fs::create_dir_all(dir)?;
        let mut blob: Vec<u8> = Vec::new();
        let mut offsets: Vec<u8> = Vec::with_capacity(self.records.len() * 8);
        for record in &self.records {
            offsets.write_u64::<LittleEndian>(blob.len() as u64)?;
            let encoded = bincode::encode_to_vec(record, bincode::config::standard())
                .map_err(|e| Error::Corrupt(e.to_string()))?;
            blob.extend_from_slice(&encoded);
        }
        write_atomic(&dir.join(RECORDS_FILE), &blob)?;
        write_atomic(&dir.join(OFFSETS_FILE), &offsets)?;
        Ok(())
    }

    pub fn read(dir: &Path) -> Result<RecordStore> {
        let offset_bytes = fs::read(dir.join(OFFSETS_FILE))?;
        if offset_bytes.len() % 8 != 0 {
            return Err(Error::Corrupt("record offset table is truncated".to_string()));
        }
        let mut offsets = vec![0u64; offset_bytes.len() / 8];
        Cursor::new(offset_bytes).read_u64_into::<LittleEndian>(&mut offsets)?;

        let blob = fs::read(dir.join(RECORDS_FILE))?;
        let mut records = Vec::with_capacity(offsets.len());
        for &offset in &offsets {
            let offset = offset as usize;
            if offset >= blob.len() && !(offset == 0 && blob.is_empty()) {
                return Err(Error::Corrupt(format!(
                    "record offset {offset} outside data of {} bytes",
                    blob.len()
                )));
            }
            let (record, _) = bincode::decode_from_slice::<SpectrumRecord, _>(
                &blob[offset..],
                bincode::config::standard(),
            )
            .map_err(|e| Error::Corrupt(e.to_string()))?;
            records.push(record);
        }
        Ok(RecordStore { records })
    }
}
