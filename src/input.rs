//! The user-facing input CSV.
//!
//! Required columns: `entry_id` plus a title column (`short_title` or
//! `Title`). Optional: a creator column (`main_author` or `Creator`),
//! `year`, `retrievable`, `link`. Every other column is carried through
//! untouched. At the end of each work the driver updates `retrievable` and
//! `link` in place; the rewrite stages to a sibling temp file and renames so
//! a crash can never corrupt the original.

use std::collections::BTreeMap;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

use crate::work::InputRecord;

/// Column aliases for the title, in lookup order.
const TITLE_COLUMNS: [&str; 3] = ["short_title", "Title", "title"];
/// Column aliases for the creator, in lookup order.
const CREATOR_COLUMNS: [&str; 3] = ["main_author", "Creator", "creator"];
/// Column aliases for the year, in lookup order.
const YEAR_COLUMNS: [&str; 2] = ["year", "Year"];

/// Errors reading or rewriting the input file.
#[derive(Debug, Error)]
pub enum InputError {
    #[error("cannot read input file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot parse input file {path}: {source}")]
    Csv {
        path: PathBuf,
        #[source]
        source: csv::Error,
    },

    #[error("input file {path} is missing required column `{column}`")]
    MissingColumn { path: PathBuf, column: String },

    #[error("duplicate entry_id `{entry_id}` in input file {path}")]
    DuplicateEntryId { path: PathBuf, entry_id: String },
}

/// The parsed input file: header order plus one record per usable row.
#[derive(Debug, Clone)]
pub struct InputFile {
    path: PathBuf,
    headers: Vec<String>,
    pub records: Vec<InputRecord>,
    /// Rows skipped because entry id or title was empty.
    pub skipped_rows: usize,
}

impl InputFile {
    /// Reads and validates the input file.
    ///
    /// Rows without an entry id or title are skipped with a warning;
    /// duplicate entry ids are an error.
    ///
    /// # Errors
    ///
    /// Returns [`InputError`] on IO/CSV failures, a missing required column,
    /// or duplicate entry ids.
    pub fn read(path: &Path) -> Result<Self, InputError> {
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(path)
            .map_err(|source| InputError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
        let headers: Vec<String> = reader
            .headers()
            .map_err(|source| InputError::Csv {
                path: path.to_path_buf(),
                source,
            })?
            .iter()
            .map(str::to_string)
            .collect();

        if !headers.iter().any(|h| h == "entry_id") {
            return Err(InputError::MissingColumn {
                path: path.to_path_buf(),
                column: "entry_id".to_string(),
            });
        }
        let title_column = first_present(&headers, &TITLE_COLUMNS).ok_or_else(|| {
            InputError::MissingColumn {
                path: path.to_path_buf(),
                column: "short_title".to_string(),
            }
        })?;
        let creator_column = first_present(&headers, &CREATOR_COLUMNS);
        let year_column = first_present(&headers, &YEAR_COLUMNS);

        let mut records = Vec::new();
        let mut seen = HashSet::new();
        let mut skipped_rows = 0usize;
        for (row_index, row) in reader.records().enumerate() {
            let row = row.map_err(|source| InputError::Csv {
                path: path.to_path_buf(),
                source,
            })?;
            let mut fields = BTreeMap::new();
            for (header, value) in headers.iter().zip(row.iter()) {
                fields.insert(header.clone(), value.to_string());
            }

            let entry_id = fields.get("entry_id").cloned().unwrap_or_default();
            let title = fields.get(&title_column).cloned().unwrap_or_default();
            if entry_id.trim().is_empty() || title.trim().is_empty() {
                warn!(row = row_index + 2, "skipping row without entry_id or title");
                skipped_rows += 1;
                continue;
            }
            if !seen.insert(entry_id.clone()) {
                return Err(InputError::DuplicateEntryId {
                    path: path.to_path_buf(),
                    entry_id,
                });
            }

            let creator = creator_column
                .as_ref()
                .and_then(|c| fields.get(c))
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string);
            let year = year_column
                .as_ref()
                .and_then(|c| fields.get(c))
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(str::to_string);

            records.push(InputRecord {
                entry_id: entry_id.trim().to_string(),
                title: title.trim().to_string(),
                creator,
                year,
                fields,
            });
        }

        debug!(
            records = records.len(),
            skipped = skipped_rows,
            "parsed input file"
        );
        Ok(Self {
            path: path.to_path_buf(),
            headers,
            records,
            skipped_rows,
        })
    }

    /// The original file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Updates a record's `retrievable` and `link` columns in memory.
    pub fn set_result(&mut self, entry_id: &str, retrievable: bool, link: Option<&str>) {
        let Some(record) = self.records.iter_mut().find(|r| r.entry_id == entry_id) else {
            return;
        };
        record.fields.insert(
            "retrievable".to_string(),
            if retrievable { "True" } else { "False" }.to_string(),
        );
        if let Some(link) = link {
            record.fields.insert("link".to_string(), link.to_string());
        }
    }

    /// Rewrites the original file in place (stage to temp, then rename).
    ///
    /// `retrievable` and `link` columns are appended to the header when the
    /// original file lacked them; all other columns keep their order and
    /// content.
    ///
    /// # Errors
    ///
    /// Returns [`InputError`] on write failures.
    pub fn rewrite(&self) -> Result<(), InputError> {
        let mut headers = self.headers.clone();
        for required in ["retrievable", "link"] {
            if !headers.iter().any(|h| h == required) {
                headers.push(required.to_string());
            }
        }

        let tmp = self.path.with_extension("csv.tmp");
        {
            let mut writer = csv::Writer::from_path(&tmp).map_err(|source| InputError::Csv {
                path: tmp.clone(),
                source,
            })?;
            writer
                .write_record(&headers)
                .map_err(|source| InputError::Csv {
                    path: tmp.clone(),
                    source,
                })?;
            for record in &self.records {
                let row: Vec<&str> = headers
                    .iter()
                    .map(|h| record.fields.get(h).map_or("", String::as_str))
                    .collect();
                writer.write_record(&row).map_err(|source| InputError::Csv {
                    path: tmp.clone(),
                    source,
                })?;
            }
            writer.flush().map_err(|source| InputError::Io {
                path: tmp.clone(),
                source,
            })?;
        }
        fs::rename(&tmp, &self.path).map_err(|source| InputError::Io {
            path: self.path.clone(),
            source,
        })?;
        Ok(())
    }
}

fn first_present(headers: &[String], aliases: &[&str]) -> Option<String> {
    aliases
        .iter()
        .find(|alias| headers.iter().any(|h| h == *alias))
        .map(|alias| (*alias).to_string())
}
