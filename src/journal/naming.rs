//! Deterministic slugs and artifact file names.
//!
//! Slug rules: NFKD fold (diacritics stripped), lowercase, every run of
//! characters outside `[a-z0-9]` becomes a single `_`, leading/trailing `_`
//! trimmed, length capped. Two inputs produce the same slug only when at
//! least one was truncated.

use std::path::{Path, PathBuf};

use unicode_normalization::UnicodeNormalization;
use unicode_normalization::char::is_combining_mark;

use crate::config::NamingSettings;
use crate::work::InputRecord;

/// Slugifies a string for use in directory and file names.
#[must_use]
pub fn slugify(text: &str, max_len: usize) -> String {
    let folded: String = text
        .nfkd()
        .filter(|c| !is_combining_mark(*c))
        .collect::<String>()
        .to_lowercase();

    let mut out = String::with_capacity(folded.len().min(max_len));
    let mut pending_sep = false;
    for c in folded.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_sep && !out.is_empty() {
                out.push('_');
            }
            pending_sep = false;
            out.push(c);
        } else {
            pending_sep = true;
        }
        if out.len() >= max_len {
            break;
        }
    }
    out.truncate(max_len);
    out.trim_matches('_').to_string()
}

/// Makes an entry id safe as a path segment without changing its case.
#[must_use]
pub fn safe_segment(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if c.is_alphanumeric() || matches!(c, '-' | '_' | '.') {
            out.push(c);
        } else {
            out.push('_');
        }
    }
    out.trim_matches('_').to_string()
}

/// Directory name for a work:
/// `<entry_id>_<title_slug>[_<creator_slug>][_<year>]`.
#[must_use]
pub fn work_dir_name(record: &InputRecord, naming: &NamingSettings) -> String {
    let mut name = format!(
        "{}_{}",
        safe_segment(&record.entry_id),
        slugify(&record.title, naming.title_slug_max_len)
    );
    if let Some(creator) = &record.creator {
        let slug = slugify(creator, naming.creator_slug_max_len);
        if !slug.is_empty() {
            name.push('_');
            name.push_str(&slug);
        }
    }
    if let Some(year) = &record.year {
        let slug = slugify(year, 16);
        if !slug.is_empty() {
            name.push('_');
            name.push_str(&slug);
        }
    }
    name
}

/// Generates the deterministic artifact paths for one work.
///
/// Non-image artifacts get `_2`, `_3`, ... suffixes only when a file of the
/// same name already exists; image counters are zero-padded to three digits.
#[derive(Debug, Clone)]
pub struct ArtifactNamer {
    work_dir: PathBuf,
    stem: String,
}

impl ArtifactNamer {
    /// Creates a namer for a work directory.
    #[must_use]
    pub fn new(work_dir: &Path, entry_id: &str, title_slug: &str) -> Self {
        Self {
            work_dir: work_dir.to_path_buf(),
            stem: format!("{}_{title_slug}", safe_segment(entry_id)),
        }
    }

    /// Builds a namer from an input record and naming settings.
    #[must_use]
    pub fn for_record(work_dir: &Path, record: &InputRecord, naming: &NamingSettings) -> Self {
        Self::new(
            work_dir,
            &record.entry_id,
            &slugify(&record.title, naming.title_slug_max_len),
        )
    }

    /// The `objects/` directory of the work.
    #[must_use]
    pub fn objects_dir(&self) -> PathBuf {
        self.work_dir.join("objects")
    }

    /// The `metadata/` directory of the work.
    #[must_use]
    pub fn metadata_dir(&self) -> PathBuf {
        self.work_dir.join("metadata")
    }

    /// Path for a non-image artifact:
    /// `objects/<stem>_<provider>[_<n>].<ext>`.
    #[must_use]
    pub fn object_path(&self, provider_key: &str, extension: &str) -> PathBuf {
        unique_path(
            &self.objects_dir(),
            &format!("{}_{provider_key}", self.stem),
            extension,
        )
    }

    /// Path for a page image:
    /// `objects/<stem>_<provider>_image_<NNN>.<ext>`.
    #[must_use]
    pub fn image_path(&self, provider_key: &str, index: usize, extension: &str) -> PathBuf {
        self.objects_dir().join(format!(
            "{}_{provider_key}_image_{index:03}.{extension}",
            self.stem
        ))
    }

    /// Path for a provider metadata document:
    /// `metadata/<stem>_<provider>[_<n>].json`.
    #[must_use]
    pub fn metadata_path(&self, provider_key: &str) -> PathBuf {
        unique_path(
            &self.metadata_dir(),
            &format!("{}_{provider_key}", self.stem),
            "json",
        )
    }
}

/// First free path for `<base>.<ext>`, trying `_2`, `_3`, ... on collision.
fn unique_path(dir: &Path, base: &str, extension: &str) -> PathBuf {
    let plain = dir.join(format!("{base}.{extension}"));
    if !plain.exists() {
        return plain;
    }
    for n in 2u32.. {
        let candidate = dir.join(format!("{base}_{n}.{extension}"));
        if !candidate.exists() {
            return candidate;
        }
    }
    unreachable!("suffix search is unbounded")
}
