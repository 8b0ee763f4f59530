//! Request-to-file pipeline.
//!
//! `fetch` walks validate → build target → probe → download → locate →
//! verify → name → stream. Every download gets its own directory under the
//! configured work dir, owned by an [`ArtifactGuard`]; the directory is gone
//! before an error response is produced, and on success it is removed when
//! the response body finishes or is dropped.

use std::{
    future::Future,
    io::ErrorKind,
    path::{Path, PathBuf},
    sync::Arc,
    time::{Duration, SystemTime},
};

use axum::body::Body;
use chrono::{DateTime, Local};
use futures_util::StreamExt;
use serde::Deserialize;
use tokio::{fs::File, io::AsyncReadExt, time::timeout};
use tokio_util::io::ReaderStream;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    config::Config,
    error::{ApiError, FailureKind, classify_extraction_failure},
    extractor::{ExtractOptions, ExtractionClient, ExtractionError, RawInfo},
    metadata::{MediaMetadata, project},
};

/// mp4 video+audio pair, any pair, single-file mp4, anything.
pub const FORMAT_PREFERENCE: &str =
    "bestvideo[ext=mp4]+bestaudio[ext=m4a]/bestvideo+bestaudio/best[ext=mp4]/best";
pub const OUTPUT_CONTAINER: &str = "mp4";

const MIN_ARTIFACT_BYTES: u64 = 1024;
const SNIFF_BYTES: u64 = 1024;
const MAX_OUTWARD_NAME_CHARS: usize = 200;
const ALTERNATE_EXTENSIONS: [&str; 7] = ["mp4", "webm", "mkv", "m4a", "mp3", "flv", "avi"];
const HOSTILE_FILENAME_CHARS: [char; 9] = ['<', '>', ':', '"', '/', '\\', '|', '?', '*'];
const DEFAULT_LABEL: &str = "media";
const DEFAULT_QUALITY: &str = "best";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MediaRequest {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default, rename = "solidarity")]
    pub label: Option<String>,
    #[serde(default)]
    pub quality: Option<String>,
}

impl MediaRequest {
    pub fn url(&self) -> Option<&str> {
        self.url.as_deref().map(str::trim).filter(|url| !url.is_empty())
    }

    pub fn label(&self) -> &str {
        self.label.as_deref().unwrap_or(DEFAULT_LABEL)
    }

    /// Accepted for compatibility; the format preference order is fixed.
    pub fn quality(&self) -> &str {
        self.quality.as_deref().unwrap_or(DEFAULT_QUALITY)
    }
}

#[derive(Debug)]
pub enum PipelineEvent<'a> {
    Started {
        url: &'a str,
        label: &'a str,
        quality: &'a str,
    },
    Probing {
        url: &'a str,
    },
    FormatsFound {
        count: usize,
    },
    Downloading {
        template: &'a str,
    },
    Downloaded {
        declared: &'a Path,
    },
    AlternateExtension {
        path: &'a Path,
    },
    Verified {
        path: &'a Path,
        size: u64,
    },
    Sending {
        filename: &'a str,
        content_type: &'a str,
    },
    Failed {
        kind: FailureKind,
        message: &'a str,
    },
    CleanedUp {
        path: &'a Path,
    },
    CleanupFailed {
        path: &'a Path,
        error: &'a std::io::Error,
    },
}

/// Receives progress events. Telemetry only; observers cannot alter the run.
pub trait PipelineObserver: Send + Sync {
    fn on_event(&self, event: &PipelineEvent<'_>);
}

pub struct TracingObserver;

impl PipelineObserver for TracingObserver {
    fn on_event(&self, event: &PipelineEvent<'_>) {
        match event {
            PipelineEvent::Started {
                url,
                label,
                quality,
            } => info!("Starting download for {url} (label {label:?}, quality {quality:?})"),
            PipelineEvent::Probing { url } => info!("Fetching metadata for {url}"),
            PipelineEvent::FormatsFound { count } => info!("Found {count} formats"),
            PipelineEvent::Downloading { template } => info!("Downloading to {template}"),
            PipelineEvent::Downloaded { declared } => info!("Downloaded file: {:?}", declared),
            PipelineEvent::AlternateExtension { path } => {
                info!("Found file with alternative extension: {:?}", path)
            }
            PipelineEvent::Verified { path, size } => {
                debug!("Verified {:?} ({size} bytes)", path)
            }
            PipelineEvent::Sending {
                filename,
                content_type,
            } => info!("Sending {filename} as {content_type}"),
            PipelineEvent::Failed { kind, message } => {
                warn!("Download failed [{}]: {message}", kind.code())
            }
            PipelineEvent::CleanedUp { path } => debug!("Cleaned up {:?}", path),
            PipelineEvent::CleanupFailed { path, error } => {
                warn!("Could not clean up {:?}: {error}", path)
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub work_dir: PathBuf,
    pub deadline: Duration,
    pub probe_options: ExtractOptions,
    pub download_options: ExtractOptions,
}

impl PipelineSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            work_dir: config.work_dir.clone(),
            deadline: config.extraction_timeout,
            probe_options: config.probe_options(),
            download_options: config.download_options(),
        }
    }
}

pub struct PreparedDownload {
    pub body: Body,
    pub filename: String,
    pub content_type: &'static str,
    pub content_length: u64,
}

struct ReadyArtifact {
    path: PathBuf,
    size: u64,
    head: Vec<u8>,
    file: File,
}

pub struct DownloadPipeline {
    client: Arc<dyn ExtractionClient>,
    settings: PipelineSettings,
    observer: Arc<dyn PipelineObserver>,
}

impl DownloadPipeline {
    pub fn new(client: Arc<dyn ExtractionClient>, settings: PipelineSettings) -> Self {
        Self {
            client,
            settings,
            observer: Arc::new(TracingObserver),
        }
    }

    #[cfg(test)]
    pub fn with_observer(mut self, observer: Arc<dyn PipelineObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub async fn metadata(&self, request: &MediaRequest) -> Result<MediaMetadata, ApiError> {
        let url = request
            .url()
            .ok_or_else(|| ApiError::invalid_request("URL is required"))?;

        self.observer.on_event(&PipelineEvent::Probing { url });
        let info = self
            .with_deadline(self.client.probe(url, &self.settings.probe_options))
            .await
            .map_err(|error| ApiError::internal(error.to_string()))?;

        Ok(project(&info, url, request.label()))
    }

    pub async fn fetch(&self, request: &MediaRequest) -> Result<PreparedDownload, ApiError> {
        let url = request
            .url()
            .ok_or_else(|| ApiError::invalid_request("URL is required"))?;
        let label = sanitize_label(request.label());
        self.observer.on_event(&PipelineEvent::Started {
            url,
            label: &label,
            quality: request.quality(),
        });

        let job_dir = self
            .settings
            .work_dir
            .join(Uuid::new_v4().simple().to_string());
        tokio::fs::create_dir_all(&job_dir).await.map_err(|error| {
            ApiError::internal(format!("Could not prepare temporary storage: {error}"))
        })?;
        let guard = ArtifactGuard::new(job_dir.clone(), Arc::clone(&self.observer));
        let template = job_dir.join(output_file_template(&label, Local::now()));

        match self.prepare(url, &job_dir, &template).await {
            Ok(artifact) => Ok(self.stream_artifact(artifact, &label, guard)),
            Err(error) => {
                self.observer.on_event(&PipelineEvent::Failed {
                    kind: error.kind,
                    message: &error.message,
                });
                guard.dispose().await;
                Err(error)
            }
        }
    }

    async fn prepare(
        &self,
        url: &str,
        job_dir: &Path,
        template: &Path,
    ) -> Result<ReadyArtifact, ApiError> {
        self.observer.on_event(&PipelineEvent::Probing { url });
        let info = self
            .with_deadline(self.client.probe(url, &self.settings.probe_options))
            .await
            .map_err(|error| classify_extraction_failure(&error))?;
        ensure_downloadable(&info)?;
        self.observer.on_event(&PipelineEvent::FormatsFound {
            count: info.format_count(),
        });

        let template = template.to_string_lossy().into_owned();
        let options = ExtractOptions {
            output_template: Some(template.clone()),
            format: Some(FORMAT_PREFERENCE.to_string()),
            merge_output_format: Some(OUTPUT_CONTAINER.to_string()),
            recode_video: Some(OUTPUT_CONTAINER.to_string()),
            ..self.settings.download_options.clone()
        };
        self.observer.on_event(&PipelineEvent::Downloading {
            template: &template,
        });
        let (_, declared) = self
            .with_deadline(self.client.download(url, &options))
            .await
            .map_err(|error| classify_extraction_failure(&error))?;
        self.observer
            .on_event(&PipelineEvent::Downloaded { declared: &declared });

        let path = locate_artifact(job_dir, &declared).await?.ok_or_else(|| {
            ApiError::new(FailureKind::FileMissing, "Download failed - file not created")
        })?;
        if path.file_name() != declared.file_name() {
            self.observer
                .on_event(&PipelineEvent::AlternateExtension { path: &path });
        }

        let (size, head) = verify_artifact(&path).await?;
        self.observer.on_event(&PipelineEvent::Verified { path: &path, size });

        let file = File::open(&path).await.map_err(|error| {
            ApiError::internal(format!("Could not read the downloaded file: {error}"))
        })?;

        Ok(ReadyArtifact {
            path,
            size,
            head,
            file,
        })
    }

    fn stream_artifact(
        &self,
        artifact: ReadyArtifact,
        label: &str,
        guard: ArtifactGuard,
    ) -> PreparedDownload {
        let filename = outward_filename(label, &artifact.path);
        let content_type = content_type_for(&artifact.path, &artifact.head);
        self.observer.on_event(&PipelineEvent::Sending {
            filename: &filename,
            content_type,
        });

        // The guard rides along with the stream and is dropped with the body.
        let guard = guard.in_background();
        let stream = ReaderStream::new(artifact.file).map(move |chunk| {
            let _artifact = &guard;
            chunk
        });

        PreparedDownload {
            body: Body::from_stream(stream),
            filename,
            content_type,
            content_length: artifact.size,
        }
    }

    async fn with_deadline<T>(
        &self,
        call: impl Future<Output = Result<T, ExtractionError>>,
    ) -> Result<T, ExtractionError> {
        timeout(self.settings.deadline, call)
            .await
            .map_err(|_| ExtractionError::Timeout(self.settings.deadline))?
    }
}

/// Owns a per-request work directory and removes it exactly once.
///
/// A guard dropped while the request is still being prepared (cancellation)
/// removes the directory inline. Once moved into a response body it hands
/// the removal to the blocking pool instead.
struct ArtifactGuard {
    dir: Option<PathBuf>,
    observer: Arc<dyn PipelineObserver>,
    background: bool,
}

impl ArtifactGuard {
    fn new(dir: PathBuf, observer: Arc<dyn PipelineObserver>) -> Self {
        Self {
            dir: Some(dir),
            observer,
            background: false,
        }
    }

    fn in_background(mut self) -> Self {
        self.background = true;
        self
    }

    async fn dispose(mut self) {
        if let Some(dir) = self.dir.take() {
            let result = tokio::fs::remove_dir_all(&dir).await;
            report_cleanup(self.observer.as_ref(), &dir, result);
        }
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        let Some(dir) = self.dir.take() else {
            return;
        };

        if self.background {
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                let observer = Arc::clone(&self.observer);
                handle.spawn_blocking(move || {
                    let result = std::fs::remove_dir_all(&dir);
                    report_cleanup(observer.as_ref(), &dir, result);
                });
                return;
            }
        }

        let result = std::fs::remove_dir_all(&dir);
        report_cleanup(self.observer.as_ref(), &dir, result);
    }
}

fn report_cleanup(observer: &dyn PipelineObserver, dir: &Path, result: std::io::Result<()>) {
    match result {
        Ok(()) => observer.on_event(&PipelineEvent::CleanedUp { path: dir }),
        Err(error) if error.kind() == ErrorKind::NotFound => {}
        Err(error) => observer.on_event(&PipelineEvent::CleanupFailed {
            path: dir,
            error: &error,
        }),
    }
}

fn ensure_downloadable(info: &RawInfo) -> Result<(), ApiError> {
    if info.format_count() == 0 {
        return Err(ApiError::new(
            FailureKind::NoFormats,
            "No downloadable formats found for this video",
        ));
    }
    if info.is_live == Some(true) {
        return Err(ApiError::new(
            FailureKind::Unavailable,
            "Live streams cannot be downloaded",
        ));
    }

    match info.availability.as_deref() {
        Some("premium_only" | "subscriber_only") => Err(ApiError::new(
            FailureKind::Unavailable,
            "This content requires a premium subscription",
        )),
        Some("needs_auth") => Err(ApiError::new(
            FailureKind::Unavailable,
            "This content requires authentication",
        )),
        _ => Ok(()),
    }
}

/// Keeps `[A-Za-z0-9 _-]`; an empty result becomes `"media"`.
pub fn sanitize_label(label: &str) -> String {
    let kept: String = label
        .chars()
        .filter(|character| {
            character.is_ascii_alphanumeric() || matches!(character, ' ' | '-' | '_')
        })
        .collect();
    let trimmed = kept.trim();

    if trimmed.is_empty() {
        DEFAULT_LABEL.to_string()
    } else {
        trimmed.to_string()
    }
}

/// `<label>_<YYYYmmdd_HHMMSS>_<title≤50>.<ext>` in extractor template syntax.
pub fn output_file_template(label: &str, now: DateTime<Local>) -> String {
    format!("{label}_{}_%(title).50s.%(ext)s", now.format("%Y%m%d_%H%M%S"))
}

/// The declared path wins; otherwise the same stem with a known media
/// extension. Candidates outside `job_dir` are ignored.
async fn locate_artifact(job_dir: &Path, declared: &Path) -> Result<Option<PathBuf>, ApiError> {
    let canonical_job_dir = tokio::fs::canonicalize(job_dir).await.map_err(|error| {
        ApiError::internal(format!("Could not resolve temporary storage: {error}"))
    })?;
    let declared = if declared.is_absolute() {
        declared.to_path_buf()
    } else {
        job_dir.join(declared)
    };

    let mut candidates = vec![declared.clone()];
    candidates.extend(
        ALTERNATE_EXTENSIONS
            .iter()
            .map(|extension| declared.with_extension(extension)),
    );

    for candidate in candidates {
        if let Some(path) = resolve_candidate(&canonical_job_dir, &candidate).await? {
            return Ok(Some(path));
        }
    }

    Ok(None)
}

async fn resolve_candidate(
    canonical_job_dir: &Path,
    candidate: &Path,
) -> Result<Option<PathBuf>, ApiError> {
    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => {
            return Err(ApiError::internal(format!(
                "Could not inspect the downloaded file: {error}"
            )));
        }
    };
    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical = tokio::fs::canonicalize(candidate).await.map_err(|error| {
        ApiError::internal(format!("Could not resolve the downloaded file: {error}"))
    })?;
    if !canonical.starts_with(canonical_job_dir) {
        warn!(
            "Ignoring a file outside the request directory: {:?}",
            canonical
        );
        return Ok(None);
    }

    Ok(Some(canonical))
}

/// Rejects undersized files and disguised HTML error pages. The read handle
/// is closed before returning.
async fn verify_artifact(path: &Path) -> Result<(u64, Vec<u8>), ApiError> {
    let size = tokio::fs::metadata(path)
        .await
        .map_err(|error| {
            ApiError::internal(format!("Could not inspect the downloaded file: {error}"))
        })?
        .len();

    if size < MIN_ARTIFACT_BYTES {
        return Err(ApiError::new(
            FailureKind::CorruptDownload,
            "Download failed - file too small (possible HTML error page)",
        ));
    }

    let mut head = Vec::with_capacity(SNIFF_BYTES as usize);
    {
        let file = File::open(path).await.map_err(|error| {
            ApiError::internal(format!("Could not read the downloaded file: {error}"))
        })?;
        file.take(SNIFF_BYTES)
            .read_to_end(&mut head)
            .await
            .map_err(|error| {
                ApiError::internal(format!("Could not read the downloaded file: {error}"))
            })?;
    }

    if looks_like_html(&head) {
        return Err(ApiError::new(
            FailureKind::CorruptDownload,
            "Download failed - received HTML instead of video. The video may be geo-blocked, age-restricted, or require login.",
        ));
    }

    Ok((size, head))
}

fn looks_like_html(head: &[u8]) -> bool {
    contains_bytes(head, b"<!DOCTYPE") || contains_bytes(head, b"<html")
}

fn contains_bytes(haystack: &[u8], needle: &[u8]) -> bool {
    haystack
        .windows(needle.len())
        .any(|window| window == needle)
}

/// `<label>_<artifact name>`, hostile characters replaced, capped at 200
/// characters with the extension kept.
pub fn outward_filename(label: &str, artifact: &Path) -> String {
    let base = artifact
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| format!("download.{OUTPUT_CONTAINER}"));
    let replaced: String = format!("{label}_{base}")
        .chars()
        .map(|character| {
            if HOSTILE_FILENAME_CHARS.contains(&character) || character.is_control() {
                '_'
            } else {
                character
            }
        })
        .collect();

    cap_filename(&replaced, MAX_OUTWARD_NAME_CHARS)
}

fn cap_filename(name: &str, max_chars: usize) -> String {
    if name.chars().count() <= max_chars {
        return name.to_string();
    }

    let (stem, extension) = match name.rfind('.') {
        Some(index) if index > 0 => name.split_at(index),
        _ => (name, ""),
    };
    let extension_chars = extension.chars().count();
    if extension_chars >= max_chars {
        return name.chars().take(max_chars).collect();
    }

    let stem: String = stem.chars().take(max_chars - extension_chars).collect();
    format!("{stem}{extension}")
}

/// Extension map first, then a magic-byte sniff, then `video/mp4`.
pub fn content_type_for(path: &Path, head: &[u8]) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.to_ascii_lowercase())
        .unwrap_or_default();

    match extension.as_str() {
        "mp4" => return "video/mp4",
        "webm" => return "video/webm",
        "mkv" => return "video/x-matroska",
        "mov" => return "video/quicktime",
        "flv" => return "video/x-flv",
        "avi" => return "video/x-msvideo",
        "mp3" => return "audio/mpeg",
        "m4a" => return "audio/mp4",
        "aac" => return "audio/aac",
        "wav" => return "audio/wav",
        "ogg" | "opus" => return "audio/ogg",
        "flac" => return "audio/flac",
        _ => {}
    }

    if head.get(4..8) == Some(b"ftyp".as_slice()) {
        "video/mp4"
    } else if head.starts_with(&[0x1A, 0x45, 0xDF, 0xA3]) {
        "video/webm"
    } else if head.starts_with(b"ID3") {
        "audio/mpeg"
    } else if head.starts_with(b"FLV") {
        "video/x-flv"
    } else if head.starts_with(b"RIFF") && head.get(8..12) == Some(b"AVI ".as_slice()) {
        "video/x-msvideo"
    } else {
        "video/mp4"
    }
}

/// Removes work-dir entries older than `older_than_secs`. Zero disables.
pub async fn sweep_stale_artifacts(work_dir: &Path, older_than_secs: u64) {
    if older_than_secs == 0 {
        return;
    }

    let mut entries = match tokio::fs::read_dir(work_dir).await {
        Ok(entries) => entries,
        Err(error) => {
            if error.kind() != ErrorKind::NotFound {
                warn!("Could not open work directory for cleanup: {error}");
            }
            return;
        }
    };

    let max_age = Duration::from_secs(older_than_secs);
    let now = SystemTime::now();

    loop {
        let entry = match entries.next_entry().await {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(error) => {
                warn!("Could not walk work directory for cleanup: {error}");
                break;
            }
        };

        let path = entry.path();
        let metadata = match entry.metadata().await {
            Ok(metadata) => metadata,
            Err(error) => {
                warn!("Could not read metadata of {:?}: {error}", path);
                continue;
            }
        };
        let age = metadata
            .modified()
            .ok()
            .and_then(|modified_at| now.duration_since(modified_at).ok())
            .unwrap_or_default();
        if age < max_age {
            continue;
        }

        let removed = if metadata.is_dir() {
            tokio::fs::remove_dir_all(&path).await
        } else {
            tokio::fs::remove_file(&path).await
        };
        match removed {
            Ok(()) => info!("Removed stale artifact {:?}", path),
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => warn!("Could not remove stale artifact {:?}: {error}", path),
        }
    }
}
