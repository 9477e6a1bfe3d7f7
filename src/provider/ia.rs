//! Internet Archive adapter.
//!
//! Search uses the advanced-search JSON API; download prefers the bundled
//! PDF named in the candidate's download hint and falls back to IIIF page
//! images when the bundle is missing or images are preferred.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::budget::ContentClass;
use crate::net::{FetchError, HttpExecutor};
use crate::provider::{
    Candidate, DownloadContext, DownloadOutcome, ProviderAdapter, ProviderInfo, SearchQuery,
    iiif, write_metadata_file,
};

const DEFAULT_BASE_URL: &str = "https://archive.org";
const DEFAULT_IIIF_BASE_URL: &str = "https://iiif.archive.org";

const INFO: ProviderInfo = ProviderInfo {
    key: "ia",
    display_name: "Internet Archive",
};

/// Adapter for the Internet Archive.
#[derive(Debug)]
pub struct InternetArchiveAdapter {
    executor: Arc<HttpExecutor>,
    base_url: String,
    iiif_base_url: String,
}

impl InternetArchiveAdapter {
    /// Creates the adapter; `endpoint` overrides both API and IIIF base URLs
    /// (used by tests against a mock server).
    #[must_use]
    pub fn new(executor: Arc<HttpExecutor>, endpoint: Option<&str>) -> Self {
        let (base_url, iiif_base_url) = match endpoint {
            Some(base) => {
                let base = base.trim_end_matches('/').to_string();
                (base.clone(), base)
            }
            None => (DEFAULT_BASE_URL.to_string(), DEFAULT_IIIF_BASE_URL.to_string()),
        };
        Self {
            executor,
            base_url,
            iiif_base_url,
        }
    }

    fn search_url(&self, query: &SearchQuery, max_results: usize) -> String {
        let mut q = format!("title:\"{}\"", query.title);
        if let Some(creator) = &query.creator {
            q.push_str(&format!(" AND creator:\"{creator}\""));
        }
        q.push_str(" AND mediatype:texts");
        format!(
            "{}/advancedsearch.php?q={}&fl[]=identifier&fl[]=title&fl[]=creator&fl[]=date&rows={}&page=1&output=json",
            self.base_url,
            urlencoding::encode(&q),
            max_results
        )
    }

    fn candidate_from_doc(&self, doc: &Value) -> Option<Candidate> {
        let identifier = doc.get("identifier").and_then(Value::as_str)?.to_string();
        let title = string_or_first(doc.get("title"))?;
        let creators = strings(doc.get("creator"));
        let date = string_or_first(doc.get("date"));
        Some(Candidate {
            provider_key: INFO.key.to_string(),
            provider_display_name: INFO.display_name.to_string(),
            title,
            creators,
            date,
            item_url: Some(format!("{}/details/{identifier}", self.base_url)),
            iiif_manifest_url: Some(format!(
                "{}/iiif/{identifier}/manifest.json",
                self.iiif_base_url
            )),
            download_hint: serde_json::json!({
                "pdf_url": format!("{}/download/{identifier}/{identifier}.pdf", self.base_url),
            }),
            raw_metadata: doc.clone(),
            source_id: identifier,
        })
    }

    /// Fetches the bundled PDF named in the download hint.
    async fn download_pdf(
        &self,
        candidate: &Candidate,
        pdf_url: &str,
        ctx: &DownloadContext<'_>,
    ) -> Result<DownloadOutcome, FetchError> {
        let mut outcome = DownloadOutcome::default();
        if !ctx
            .options
            .allowed_object_extensions
            .iter()
            .any(|ext| ext.eq_ignore_ascii_case("pdf"))
        {
            outcome.skipped_reason = Some("pdf-extension-not-allowed".to_string());
            return Ok(outcome);
        }
        let dest = ctx.namer.object_path(&candidate.provider_key, "pdf");
        if dest.exists() && !ctx.options.overwrite_existing {
            outcome.skipped_reason = Some("already-downloaded".to_string());
            return Ok(outcome);
        }
        let bytes = self
            .executor
            .fetch_to_file(
                &candidate.provider_key,
                pdf_url,
                &dest,
                ContentClass::Pdf,
                ctx.work_id,
                ctx.cancel,
            )
            .await?;
        outcome.files_written.push(dest);
        outcome.bytes_written = bytes;
        Ok(outcome)
    }
}

#[async_trait]
impl ProviderAdapter for InternetArchiveAdapter {
    fn info(&self) -> ProviderInfo {
        INFO
    }

    #[instrument(skip(self, cancel), fields(title = %query.title))]
    async fn search(
        &self,
        query: &SearchQuery,
        max_results: usize,
        work_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Candidate>, FetchError> {
        let url = self.search_url(query, max_results);
        let payload = self.executor.get_json(INFO.key, &url, work_id, cancel).await?;
        let docs = payload
            .get("response")
            .and_then(|r| r.get("docs"))
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::protocol(&url, "missing response.docs"))?;

        let candidates: Vec<Candidate> = docs
            .iter()
            .filter_map(|doc| self.candidate_from_doc(doc))
            .take(max_results)
            .collect();
        debug!(count = candidates.len(), "search returned candidates");
        Ok(candidates)
    }

    #[instrument(skip(self, candidate, ctx), fields(source_id = %candidate.source_id))]
    async fn download(
        &self,
        candidate: &Candidate,
        ctx: &DownloadContext<'_>,
    ) -> Result<DownloadOutcome, FetchError> {
        let mut outcome = DownloadOutcome::default();
        if ctx.options.include_metadata {
            if let Some(path) =
                write_metadata_file(self.executor.budget(), ctx, &candidate.provider_key, &candidate.raw_metadata)?
            {
                outcome.files_written.push(path);
            }
        }

        let pdf_url = candidate
            .download_hint
            .get("pdf_url")
            .and_then(Value::as_str)
            .map(str::to_string);

        if ctx.options.prefer_pdf_over_images {
            if let Some(pdf_url) = &pdf_url {
                match self.download_pdf(candidate, pdf_url, ctx).await {
                    Ok(pdf_outcome) => {
                        if pdf_outcome.wrote_anything() || pdf_outcome.skipped_reason.is_some() {
                            outcome.files_written.extend(pdf_outcome.files_written);
                            outcome.bytes_written += pdf_outcome.bytes_written;
                            outcome.skipped_reason = pdf_outcome.skipped_reason;
                            return Ok(outcome);
                        }
                    }
                    // The item has no bundled PDF; page images may still exist.
                    Err(FetchError::ClientError { status, .. })
                        if candidate.iiif_manifest_url.is_some() =>
                    {
                        warn!(status, "no bundled PDF, falling back to page images");
                    }
                    Err(error) => return Err(error),
                }
            }
        }

        if let Some(manifest_url) = &candidate.iiif_manifest_url {
            let manifest_outcome =
                iiif::download_from_manifest(&self.executor, candidate, manifest_url, ctx).await?;
            outcome.files_written.extend(manifest_outcome.files_written);
            outcome.bytes_written += manifest_outcome.bytes_written;
            outcome.skipped_reason = manifest_outcome.skipped_reason;
            return Ok(outcome);
        }

        if !outcome.wrote_anything() {
            outcome.skipped_reason = Some("no-downloadable-artifact".to_string());
        }
        Ok(outcome)
    }
}

fn string_or_first(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => Some(s.clone()),
        Value::Array(items) => items.first().and_then(Value::as_str).map(str::to_string),
        _ => None,
    }
}

fn strings(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}
