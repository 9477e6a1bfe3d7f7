//! Wellcome Collection adapter.
//!
//! Search uses the catalogue v2 JSON API; downloads are IIIF-only, driven by
//! the presentation manifest referenced from the work's item locations.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument};

use crate::net::{FetchError, HttpExecutor};
use crate::provider::{
    Candidate, DownloadContext, DownloadOutcome, ProviderAdapter, ProviderInfo, SearchQuery,
    iiif, write_metadata_file,
};

const DEFAULT_BASE_URL: &str = "https://api.wellcomecollection.org";
const DEFAULT_SITE_URL: &str = "https://wellcomecollection.org";

const INFO: ProviderInfo = ProviderInfo {
    key: "wellcome",
    display_name: "Wellcome Collection",
};

/// Adapter for the Wellcome Collection catalogue.
#[derive(Debug)]
pub struct WellcomeAdapter {
    executor: Arc<HttpExecutor>,
    base_url: String,
    site_url: String,
}

impl WellcomeAdapter {
    /// Creates the adapter; `endpoint` overrides the API and site base URLs.
    #[must_use]
    pub fn new(executor: Arc<HttpExecutor>, endpoint: Option<&str>) -> Self {
        let (base_url, site_url) = match endpoint {
            Some(base) => {
                let base = base.trim_end_matches('/').to_string();
                (base.clone(), base)
            }
            None => (DEFAULT_BASE_URL.to_string(), DEFAULT_SITE_URL.to_string()),
        };
        Self {
            executor,
            base_url,
            site_url,
        }
    }

    fn search_url(&self, query: &SearchQuery, max_results: usize) -> String {
        let mut terms = query.title.clone();
        if let Some(creator) = &query.creator {
            terms.push(' ');
            terms.push_str(creator);
        }
        format!(
            "{}/catalogue/v2/works?query={}&pageSize={}&include=items,contributors,production",
            self.base_url,
            urlencoding::encode(&terms),
            max_results
        )
    }

    fn candidate_from_result(&self, result: &Value) -> Option<Candidate> {
        let id = result.get("id").and_then(Value::as_str)?.to_string();
        let title = result.get("title").and_then(Value::as_str)?.to_string();

        let creators = result
            .get("contributors")
            .and_then(Value::as_array)
            .map(|contributors| {
                contributors
                    .iter()
                    .filter_map(|c| c.get("agent")?.get("label")?.as_str())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let date = result
            .get("production")
            .and_then(Value::as_array)
            .and_then(|p| p.first())
            .and_then(|p| p.get("dates"))
            .and_then(Value::as_array)
            .and_then(|dates| dates.first())
            .and_then(|d| d.get("label"))
            .and_then(Value::as_str)
            .map(str::to_string);

        Some(Candidate {
            provider_key: INFO.key.to_string(),
            provider_display_name: INFO.display_name.to_string(),
            title,
            creators,
            date,
            item_url: Some(format!("{}/works/{id}", self.site_url)),
            iiif_manifest_url: iiif_presentation_url(result),
            download_hint: Value::Null,
            raw_metadata: result.clone(),
            source_id: id,
        })
    }
}

#[async_trait]
impl ProviderAdapter for WellcomeAdapter {
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
        let results = payload
            .get("results")
            .and_then(Value::as_array)
            .ok_or_else(|| FetchError::protocol(&url, "missing results"))?;

        let candidates: Vec<Candidate> = results
            .iter()
            .filter_map(|result| self.candidate_from_result(result))
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

        let Some(manifest_url) = &candidate.iiif_manifest_url else {
            outcome.skipped_reason = Some("no-iiif-manifest".to_string());
            return Ok(outcome);
        };

        let manifest_outcome =
            iiif::download_from_manifest(&self.executor, candidate, manifest_url, ctx).await?;
        outcome.files_written.extend(manifest_outcome.files_written);
        outcome.bytes_written += manifest_outcome.bytes_written;
        outcome.skipped_reason = manifest_outcome.skipped_reason;
        Ok(outcome)
    }
}

/// Walks `items[].locations[]` for a `iiif-presentation` location URL.
fn iiif_presentation_url(result: &Value) -> Option<String> {
    let items = result.get("items").and_then(Value::as_array)?;
    for item in items {
        let Some(locations) = item.get("locations").and_then(Value::as_array) else {
            continue;
        };
        for location in locations {
            let location_type = location
                .get("locationType")
                .and_then(|t| t.get("id"))
                .and_then(Value::as_str);
            if location_type == Some("iiif-presentation") {
                if let Some(url) = location.get("url").and_then(Value::as_str) {
                    return Some(url.to_string());
                }
            }
        }
    }
    None
}
