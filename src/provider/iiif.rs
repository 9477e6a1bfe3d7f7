//! Minimal IIIF Presentation manifest support.
//!
//! Understands just enough of Presentation API v2 and v3 to extract page
//! image URLs and bundled renderings (PDF/EPUB) from a manifest, plus a
//! shared download routine both IIIF-capable adapters use.

use serde_json::Value;
use tracing::{debug, instrument};

use crate::budget::ContentClass;
use crate::net::{FetchError, HttpExecutor};
use crate::provider::{Candidate, DownloadContext, DownloadOutcome, extension_from_mime, extension_from_url};

/// A bundled artifact referenced from a manifest (typically PDF or EPUB).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestRendering {
    pub url: String,
    pub mime: Option<String>,
}

/// A page image reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageImage {
    pub url: String,
    pub mime: Option<String>,
}

/// The fields of a IIIF manifest this system relies on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IiifManifest {
    pub page_images: Vec<PageImage>,
    pub renderings: Vec<ManifestRendering>,
}

impl IiifManifest {
    /// Parses a v2 or v3 manifest, tolerating missing sections.
    #[must_use]
    pub fn parse(value: &Value) -> Self {
        let mut manifest = Self::default();

        // v2: sequences[].canvases[].images[].resource
        if let Some(sequences) = value.get("sequences").and_then(Value::as_array) {
            for sequence in sequences {
                collect_renderings(sequence.get("rendering"), &mut manifest.renderings);
                let Some(canvases) = sequence.get("canvases").and_then(Value::as_array) else {
                    continue;
                };
                for canvas in canvases {
                    let image = canvas
                        .get("images")
                        .and_then(Value::as_array)
                        .and_then(|images| images.first())
                        .and_then(|image| image.get("resource"));
                    if let Some(resource) = image {
                        if let Some(url) = string_field(resource, &["@id", "id"]) {
                            manifest.page_images.push(PageImage {
                                url,
                                mime: string_field(resource, &["format"]),
                            });
                        }
                    }
                }
            }
        }

        // v3: items[] (canvases) -> items[] (annotation pages) -> items[] -> body
        if manifest.page_images.is_empty() {
            if let Some(canvases) = value.get("items").and_then(Value::as_array) {
                for canvas in canvases {
                    let body = canvas
                        .get("items")
                        .and_then(Value::as_array)
                        .and_then(|pages| pages.first())
                        .and_then(|page| page.get("items"))
                        .and_then(Value::as_array)
                        .and_then(|annotations| annotations.first())
                        .and_then(|annotation| annotation.get("body"));
                    if let Some(body) = body {
                        if let Some(url) = string_field(body, &["id", "@id"]) {
                            manifest.page_images.push(PageImage {
                                url,
                                mime: string_field(body, &["format"]),
                            });
                        }
                    }
                }
            }
        }

        collect_renderings(value.get("rendering"), &mut manifest.renderings);
        manifest
    }
}

/// Accepts a rendering section that is either a single object or an array.
fn collect_renderings(section: Option<&Value>, out: &mut Vec<ManifestRendering>) {
    let Some(section) = section else { return };
    let entries: Vec<&Value> = match section {
        Value::Array(items) => items.iter().collect(),
        Value::Object(_) => vec![section],
        _ => return,
    };
    for entry in entries {
        if let Some(url) = string_field(entry, &["@id", "id"]) {
            out.push(ManifestRendering {
                url,
                mime: string_field(entry, &["format"]),
            });
        }
    }
}

fn string_field(value: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .find_map(|key| value.get(*key))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Downloads a candidate's artifacts from its IIIF manifest: bundled
/// renderings first (when enabled and whitelisted), then page images unless
/// a rendering satisfied a PDF-preferring configuration.
///
/// # Errors
///
/// Returns the first [`FetchError`] encountered; artifacts downloaded before
/// the failure remain on disk and accounted.
#[instrument(skip(executor, candidate, ctx), fields(provider = %candidate.provider_key))]
pub(crate) async fn download_from_manifest(
    executor: &HttpExecutor,
    candidate: &Candidate,
    manifest_url: &str,
    ctx: &DownloadContext<'_>,
) -> Result<DownloadOutcome, FetchError> {
    let provider = &candidate.provider_key;
    let value = executor
        .get_json(provider, manifest_url, ctx.work_id, ctx.cancel)
        .await?;
    let manifest = IiifManifest::parse(&value);
    debug!(
        pages = manifest.page_images.len(),
        renderings = manifest.renderings.len(),
        "parsed manifest"
    );

    let mut outcome = DownloadOutcome::default();

    if ctx.options.include_metadata {
        if let Some(path) = super::write_metadata_file(executor.budget(), ctx, provider, &value)? {
            outcome.files_written.push(path);
        }
    }

    if ctx.options.download_manifest_renderings {
        let whitelisted = manifest
            .renderings
            .iter()
            .filter(|r| {
                r.mime
                    .as_deref()
                    .is_some_and(|mime| ctx.options.rendering_mime_whitelist.iter().any(|w| w == mime))
            })
            .take(ctx.options.max_renderings_per_manifest);
        for rendering in whitelisted {
            let ext = rendering
                .mime
                .as_deref()
                .and_then(extension_from_mime)
                .map(str::to_string)
                .or_else(|| extension_from_url(&rendering.url))
                .unwrap_or_else(|| "pdf".to_string());
            if !extension_allowed(ctx, &ext) {
                debug!(ext, "skipping rendering with disallowed extension");
                continue;
            }
            let dest = ctx.namer.object_path(provider, &ext);
            if dest.exists() && !ctx.options.overwrite_existing {
                debug!(path = %dest.display(), "rendering already present");
                continue;
            }
            let bytes = executor
                .fetch_to_file(
                    provider,
                    &rendering.url,
                    &dest,
                    ContentClass::from_extension(&ext),
                    ctx.work_id,
                    ctx.cancel,
                )
                .await?;
            outcome.add(dest, bytes);
        }
    }

    let have_bundle = outcome
        .files_written
        .iter()
        .any(|p| matches!(ContentClass::from_extension(&extension_of(p)), ContentClass::Pdf));
    let want_images = !(ctx.options.prefer_pdf_over_images && have_bundle);

    if want_images {
        let limit = if ctx.options.max_pages == 0 {
            manifest.page_images.len()
        } else {
            ctx.options.max_pages.min(manifest.page_images.len())
        };
        for (index, page) in manifest.page_images.iter().take(limit).enumerate() {
            let ext = page
                .mime
                .as_deref()
                .and_then(extension_from_mime)
                .map(str::to_string)
                .or_else(|| extension_from_url(&page.url))
                .unwrap_or_else(|| "jpg".to_string());
            if !extension_allowed(ctx, &ext) {
                continue;
            }
            let dest = ctx.namer.image_path(provider, index + 1, &ext);
            if dest.exists() && !ctx.options.overwrite_existing {
                continue;
            }
            let bytes = executor
                .fetch_to_file(
                    provider,
                    &page.url,
                    &dest,
                    ContentClass::Image,
                    ctx.work_id,
                    ctx.cancel,
                )
                .await?;
            outcome.add(dest, bytes);
        }
    }

    if !outcome.wrote_anything() && outcome.skipped_reason.is_none() {
        outcome.skipped_reason = Some("manifest-has-no-usable-content".to_string());
    }
    Ok(outcome)
}

fn extension_allowed(ctx: &DownloadContext<'_>, ext: &str) -> bool {
    ctx.options
        .allowed_object_extensions
        .iter()
        .any(|allowed| allowed.eq_ignore_ascii_case(ext))
}

fn extension_of(path: &std::path::Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_string()
}
