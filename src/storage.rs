use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{Local, NaiveDateTime};
use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::scraper::FlightRecord;

pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const UTF8_BOM: &[u8] = b"\xEF\xBB\xBF";

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("failed to write {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
    #[error("failed to serialize observation: {0}")]
    Csv(#[from] csv::Error),
}

/// One stored row: a flight record plus the time its batch was captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Observation {
    pub flight_number: String,
    pub departure_time: String,
    pub arrival_time: String,
    pub departure_port: String,
    pub arrival_port: String,
    pub price: u32,
    pub source_website: String,
    #[serde(with = "timestamp")]
    pub scrape_timestamp: NaiveDateTime,
}

impl Observation {
    pub fn new(record: &FlightRecord, captured_at: NaiveDateTime) -> Self {
        Self {
            flight_number: record.flight_number.clone(),
            departure_time: record.departure_time.clone(),
            arrival_time: record.arrival_time.clone(),
            departure_port: record.departure_port.clone(),
            arrival_port: record.arrival_port.clone(),
            price: record.price,
            source_website: record.source_website.clone(),
            scrape_timestamp: captured_at,
        }
    }
}

mod timestamp {
    use chrono::NaiveDateTime;
    use serde::{Deserialize, Deserializer, Serializer};

    use super::TIMESTAMP_FORMAT;

    pub fn serialize<S: Serializer>(ts: &NaiveDateTime, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(&ts.format(TIMESTAMP_FORMAT))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<NaiveDateTime, D::Error> {
        let raw = String::deserialize(d)?;
        NaiveDateTime::parse_from_str(raw.trim(), TIMESTAMP_FORMAT)
            .map_err(|e| serde::de::Error::custom(format!("bad timestamp `{raw}`: {e}")))
    }
}

/// Append-only history of observations.
pub trait ObservationStore {
    /// Stores a batch under one shared capture time and returns how many rows were written.
    fn append(&self, records: &[FlightRecord]) -> Result<usize, StoreError>;
}

/// BOM-prefixed UTF-8 CSV file with a header row written once.
pub struct CsvStore {
    path: PathBuf,
}

impl CsvStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append_at(
        &self,
        records: &[FlightRecord],
        captured_at: NaiveDateTime,
    ) -> Result<usize, StoreError> {
        if records.is_empty() {
            warn!("No flights to store, leaving {} untouched", self.path.display());
            return Ok(0);
        }

        let io_err = |source| StoreError::Io {
            path: self.path.clone(),
            source,
        };

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(io_err)?;
        }

        let is_new = !self.path.exists();
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(io_err)?;
        if is_new {
            file.write_all(UTF8_BOM).map_err(io_err)?;
        }

        let mut writer = csv::WriterBuilder::new()
            .has_headers(is_new)
            .from_writer(file);
        for record in records {
            writer.serialize(Observation::new(record, captured_at))?;
        }
        writer.flush().map_err(io_err)?;

        info!("Stored {} flights in {}", records.len(), self.path.display());
        Ok(records.len())
    }
}

impl ObservationStore for CsvStore {
    fn append(&self, records: &[FlightRecord]) -> Result<usize, StoreError> {
        self.append_at(records, Local::now().naive_local())
    }
}

/// Reads every stored observation in file order.
pub fn load_history(path: &Path) -> Result<Vec<Observation>, csv::Error> {
    let raw = fs::read(path)?;
    let body = raw.strip_prefix(UTF8_BOM).unwrap_or(&raw);
    csv::Reader::from_reader(body).deserialize().collect()
}
