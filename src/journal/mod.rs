//! Work journal: on-disk layout, `work.json`, and the shared `index.csv`.
//!
//! Layout per work:
//!
//! ```text
//! <output_root>/<entry_id>_<title_slug>[_<creator_slug>][_<year>]/
//!   work.json
//!   metadata/<entry_id>_<title_slug>_<provider_key>[_<n>].json
//!   objects/<entry_id>_<title_slug>_<provider_key>[_<n>].<ext>
//!   objects/<entry_id>_<title_slug>_<provider_key>_image_<NNN>.<ext>
//! ```
//!
//! `work.json` is written via temp-then-rename. `index.csv` holds exactly one
//! row per work (appends update in place on replay) and is only mutated under
//! a process-wide mutex plus an advisory file lock, so concurrent processes
//! sharing an output root cannot interleave writes.

pub mod naming;

pub use naming::{ArtifactNamer, slugify, work_dir_name};

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use fs2::FileExt;
use thiserror::Error;
use tracing::{debug, instrument};

use crate::config::NamingSettings;
use crate::work::{InputRecord, Work};

/// `index.csv` column order.
pub const INDEX_COLUMNS: [&str; 12] = [
    "work_id",
    "entry_id",
    "work_dir",
    "title",
    "creator",
    "selected_provider",
    "selected_provider_key",
    "selected_source_id",
    "selected_dir",
    "work_json",
    "item_url",
    "status",
];

/// Errors from journal operations.
#[derive(Debug, Error)]
pub enum JournalError {
    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot (de)serialize {path}: {source}")]
    Serde {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("CSV error at {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },
}

impl JournalError {
    fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// The journal for one output root.
#[derive(Debug)]
pub struct WorkJournal {
    output_root: PathBuf,
    naming: NamingSettings,
    /// Serializes `index.csv` mutations within this process; the advisory
    /// file lock covers other processes.
    index_mutex: Mutex<()>,
}

impl WorkJournal {
    /// Creates the journal, ensuring the output root exists.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError::Io`] when the output root cannot be created.
    pub fn new(output_root: impl Into<PathBuf>, naming: NamingSettings) -> Result<Self, JournalError> {
        let output_root = output_root.into();
        fs::create_dir_all(&output_root).map_err(|e| JournalError::io(&output_root, e))?;
        Ok(Self {
            output_root,
            naming,
            index_mutex: Mutex::new(()),
        })
    }

    /// The output root this journal writes under.
    #[must_use]
    pub fn output_root(&self) -> &Path {
        &self.output_root
    }

    /// The naming settings in effect.
    #[must_use]
    pub fn naming(&self) -> &NamingSettings {
        &self.naming
    }

    /// Deterministic work directory for an input record.
    #[must_use]
    pub fn work_dir_for(&self, record: &InputRecord) -> PathBuf {
        self.output_root.join(work_dir_name(record, &self.naming))
    }

    /// Artifact namer for a work.
    #[must_use]
    pub fn namer_for(&self, work: &Work) -> ArtifactNamer {
        ArtifactNamer::for_record(&work.work_dir, &work.input, &self.naming)
    }

    /// Path of the shared index file.
    #[must_use]
    pub fn index_path(&self) -> PathBuf {
        self.output_root.join("index.csv")
    }

    /// Persists `work.json` atomically (write temp, then rename).
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] on serialization or filesystem failure.
    #[instrument(skip(self, work), fields(work_id = %work.work_id))]
    pub fn write_work(&self, work: &Work) -> Result<(), JournalError> {
        fs::create_dir_all(&work.work_dir).map_err(|e| JournalError::io(&work.work_dir, e))?;
        let path = work.work_dir.join("work.json");
        let bytes = serde_json::to_vec_pretty(work).map_err(|source| JournalError::Serde {
            path: path.clone(),
            source,
        })?;
        let tmp = work.work_dir.join(".work.json.tmp");
        fs::write(&tmp, &bytes).map_err(|e| JournalError::io(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| JournalError::io(&path, e))?;
        debug!(path = %path.display(), "persisted work.json");
        Ok(())
    }

    /// Loads `work.json` from a work directory, if present.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] when the file exists but cannot be read or
    /// parsed.
    pub fn load_work(&self, work_dir: &Path) -> Result<Option<Work>, JournalError> {
        let path = work_dir.join("work.json");
        if !path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&path).map_err(|e| JournalError::io(&path, e))?;
        let work = serde_json::from_slice(&bytes).map_err(|source| JournalError::Serde {
            path: path.clone(),
            source,
        })?;
        Ok(Some(work))
    }

    /// True when the work's `objects/` directory holds at least one regular
    /// file (resume check).
    #[must_use]
    pub fn has_objects(work_dir: &Path) -> bool {
        let objects = work_dir.join("objects");
        let Ok(entries) = fs::read_dir(objects) else {
            return false;
        };
        entries
            .flatten()
            .any(|entry| entry.file_type().is_ok_and(|t| t.is_file()))
    }

    /// Writes or replaces this work's row in `index.csv`.
    ///
    /// A header is written when the file does not exist; extra columns in an
    /// existing header are tolerated (our rows leave them empty). Exactly one
    /// row per `work_id` survives.
    ///
    /// # Errors
    ///
    /// Returns [`JournalError`] on lock, parse, or write failures.
    #[instrument(skip(self, work), fields(work_id = %work.work_id, status = work.status.as_str()))]
    pub fn upsert_index(&self, work: &Work) -> Result<(), JournalError> {
        let _guard = match self.index_mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        let path = self.index_path();

        let lock_file = fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(|e| JournalError::io(&path, e))?;
        lock_file
            .lock_exclusive()
            .map_err(|e| JournalError::io(&path, e))?;
        let result = self.upsert_index_locked(&path, work);
        let _ = fs2::FileExt::unlock(&lock_file);
        result
    }

    fn upsert_index_locked(&self, path: &Path, work: &Work) -> Result<(), JournalError> {
        let metadata = fs::metadata(path).map_err(|e| JournalError::io(path, e))?;
        let (header, mut rows) = if metadata.len() == 0 {
            (INDEX_COLUMNS.iter().map(|s| (*s).to_string()).collect::<Vec<_>>(), Vec::new())
        } else {
            let mut reader = csv::ReaderBuilder::new()
                .flexible(true)
                .from_path(path)
                .map_err(|source| JournalError::Csv {
                    path: path.to_path_buf(),
                    source,
                })?;
            let header: Vec<String> = reader
                .headers()
                .map_err(|source| JournalError::Csv {
                    path: path.to_path_buf(),
                    source,
                })?
                .iter()
                .map(str::to_string)
                .collect();
            let mut rows = Vec::new();
            for record in reader.records() {
                let record = record.map_err(|source| JournalError::Csv {
                    path: path.to_path_buf(),
                    source,
                })?;
                rows.push(record.iter().map(str::to_string).collect::<Vec<_>>());
            }
            (header, rows)
        };

        let new_row = self.index_row(&header, work);
        let id_column = header.iter().position(|h| h == "work_id").unwrap_or(0);
        match rows
            .iter_mut()
            .find(|row| row.get(id_column).map(String::as_str) == Some(work.work_id.as_str()))
        {
            Some(existing) => *existing = new_row,
            None => rows.push(new_row),
        }

        // Stage next to the index and swap in atomically.
        let tmp = path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp).map_err(|source| JournalError::Csv {
                path: tmp.clone(),
                source,
            })?;
            writer.write_record(&header).map_err(|source| JournalError::Csv {
                path: tmp.clone(),
                source,
            })?;
            for row in &rows {
                writer.write_record(row).map_err(|source| JournalError::Csv {
                    path: tmp.clone(),
                    source,
                })?;
            }
            writer.flush().map_err(|e| JournalError::io(&tmp, e))?;
        }
        fs::rename(&tmp, path).map_err(|e| JournalError::io(path, e))?;
        Ok(())
    }

    /// Builds a row matching `header`, with known columns filled in.
    fn index_row(&self, header: &[String], work: &Work) -> Vec<String> {
        let selected = work.selected.as_ref().map(|s| &s.primary.candidate);
        let namer = self.namer_for(work);
        header
            .iter()
            .map(|column| match column.as_str() {
                "work_id" => work.work_id.clone(),
                "entry_id" => work.input.entry_id.clone(),
                "work_dir" => work.work_dir.display().to_string(),
                "title" => work.input.title.clone(),
                "creator" => work.input.creator.clone().unwrap_or_default(),
                "selected_provider" => selected
                    .map(|c| c.provider_display_name.clone())
                    .unwrap_or_default(),
                "selected_provider_key" => {
                    selected.map(|c| c.provider_key.clone()).unwrap_or_default()
                }
                "selected_source_id" => selected.map(|c| c.source_id.clone()).unwrap_or_default(),
                "selected_dir" => namer.objects_dir().display().to_string(),
                "work_json" => work.work_dir.join("work.json").display().to_string(),
                "item_url" => selected
                    .and_then(|c| c.item_url.clone())
                    .unwrap_or_default(),
                "status" => work.status.as_str().to_string(),
                _ => String::new(),
            })
            .collect()
    }
}
