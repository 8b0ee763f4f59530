//! Extraction client boundary.
//!
//! The service never parses media pages itself. It hands a URL and an
//! [`ExtractOptions`] bundle to an [`ExtractionClient`], which resolves
//! metadata and performs the actual fetch/transcode. [`YtDlpClient`] drives
//! the `yt-dlp` binary.

use std::{
    path::{Path, PathBuf},
    process::Output,
    time::Duration,
};

use async_trait::async_trait;
use serde::{Deserialize, Deserializer, de::IgnoredAny};
use serde_json::Value;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

pub const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

/// Raw info dict as reported by the extractor. Every field is optional, and
/// numeric fields holding an unexpected value read as absent.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawInfo {
    pub title: Option<String>,
    pub uploader: Option<String>,
    pub channel: Option<String>,
    pub creator: Option<String>,
    pub description: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub duration: Option<f64>,
    #[serde(deserialize_with = "lenient_u64")]
    pub view_count: Option<u64>,
    #[serde(deserialize_with = "lenient_u64")]
    pub like_count: Option<u64>,
    pub thumbnail: Option<String>,
    pub extractor_key: Option<String>,
    pub extractor: Option<String>,
    pub ext: Option<String>,
    #[serde(deserialize_with = "lenient_f64")]
    pub filesize: Option<f64>,
    #[serde(deserialize_with = "lenient_f64")]
    pub filesize_approx: Option<f64>,
    pub upload_date: Option<String>,
    pub availability: Option<String>,
    #[serde(deserialize_with = "lenient_u32")]
    pub width: Option<u32>,
    #[serde(deserialize_with = "lenient_u32")]
    pub height: Option<u32>,
    #[serde(deserialize_with = "lenient_f64")]
    pub fps: Option<f64>,
    pub format_note: Option<String>,
    pub is_live: Option<bool>,
    pub formats: Option<Vec<IgnoredAny>>,
    pub filepath: Option<String>,
    #[serde(rename = "_filename")]
    pub filename: Option<String>,
}

impl RawInfo {
    pub fn format_count(&self) -> usize {
        self.formats.as_ref().map_or(0, Vec::len)
    }

    /// Final on-disk path reported after post-processing.
    pub fn reported_path(&self) -> Option<PathBuf> {
        self.filepath
            .as_deref()
            .or(self.filename.as_deref())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(PathBuf::from)
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value
        .as_ref()
        .and_then(Value::as_f64)
        .filter(|number| number.is_finite()))
}

fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_f64(deserializer)?
        .filter(|number| *number >= 0.0)
        .map(|number| number.round() as u64))
}

fn lenient_u32<'de, D>(deserializer: D) -> Result<Option<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(lenient_u64(deserializer)?.and_then(|number| u32::try_from(number).ok()))
}

/// Options understood by every extraction client.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractOptions {
    pub user_agent: Option<String>,
    pub headers: Vec<(String, String)>,
    pub socket_timeout_seconds: Option<u64>,
    pub retries: Option<u32>,
    pub fragment_retries: Option<u32>,
    pub no_check_certificates: bool,
    pub geo_bypass: bool,
    pub prefer_ipv4: bool,
    pub cookies_file: Option<PathBuf>,
    /// Output path with `%(title)s`-style substitutions.
    pub output_template: Option<String>,
    pub format: Option<String>,
    pub merge_output_format: Option<String>,
    pub recode_video: Option<String>,
}

impl ExtractOptions {
    /// Renders the options as `yt-dlp` flags.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec!["--no-playlist".to_string()];

        if let Some(user_agent) = &self.user_agent {
            args.push("--user-agent".to_string());
            args.push(user_agent.clone());
        }
        for (name, value) in &self.headers {
            args.push("--add-header".to_string());
            args.push(format!("{name}:{value}"));
        }
        if let Some(seconds) = self.socket_timeout_seconds {
            args.push("--socket-timeout".to_string());
            args.push(seconds.to_string());
        }
        if let Some(retries) = self.retries {
            args.push("--retries".to_string());
            args.push(retries.to_string());
        }
        if let Some(retries) = self.fragment_retries {
            args.push("--fragment-retries".to_string());
            args.push(retries.to_string());
        }
        if self.no_check_certificates {
            args.push("--no-check-certificates".to_string());
        }
        if self.geo_bypass {
            args.push("--geo-bypass".to_string());
        }
        if self.prefer_ipv4 {
            args.push("--force-ipv4".to_string());
        }
        if let Some(cookies) = &self.cookies_file {
            args.push("--cookies".to_string());
            args.push(cookies.to_string_lossy().into_owned());
        }
        if let Some(template) = &self.output_template {
            args.push("-o".to_string());
            args.push(template.clone());
        }
        if let Some(format) = &self.format {
            args.push("-f".to_string());
            args.push(format.clone());
        }
        if let Some(container) = &self.merge_output_format {
            args.push("--merge-output-format".to_string());
            args.push(container.clone());
        }
        if let Some(container) = &self.recode_video {
            args.push("--recode-video".to_string());
            args.push(container.clone());
        }

        args
    }
}

#[derive(Debug, Error)]
pub enum ExtractionError {
    #[error("network error: {0}")]
    Network(String),

    #[error("blocked by upstream: {0}")]
    Blocked(String),

    #[error("forbidden: {0}")]
    Forbidden(String),

    #[error("{0}")]
    Extractor(String),

    #[error("extraction timed out after {0:?}")]
    Timeout(Duration),

    #[error("could not run extractor: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("unreadable extractor output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("extractor did not report an output file")]
    MissingOutput,
}

impl ExtractionError {
    /// Sorts a raw failure line into the client's failure kinds.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_ascii_lowercase();

        if lower.contains("sign in to confirm") || lower.contains("http error 429") {
            Self::Blocked(message)
        } else if lower.contains("http error 403") {
            Self::Forbidden(message)
        } else if lower.contains("timed out")
            || lower.contains("connection reset")
            || lower.contains("connection refused")
            || lower.contains("name or service not known")
        {
            Self::Network(message)
        } else {
            Self::Extractor(message)
        }
    }
}

#[async_trait]
pub trait ExtractionClient: Send + Sync {
    /// Metadata-only call; nothing is written to disk.
    async fn probe(&self, url: &str, options: &ExtractOptions) -> Result<RawInfo, ExtractionError>;

    /// Downloads the media and returns the final info dict and output path.
    async fn download(
        &self,
        url: &str,
        options: &ExtractOptions,
    ) -> Result<(RawInfo, PathBuf), ExtractionError>;
}

pub struct YtDlpClient {
    binary: PathBuf,
}

impl YtDlpClient {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, args: Vec<String>) -> Result<Output, ExtractionError> {
        debug!("yt-dlp {:?}", args);
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(ExtractionError::Spawn)?;

        if !output.status.success() {
            return Err(ExtractionError::from_message(last_line(
                &output.stderr,
                "yt-dlp could not complete the operation",
            )));
        }

        Ok(output)
    }

    pub fn binary(&self) -> &Path {
        &self.binary
    }

    pub async fn is_available(&self) -> bool {
        Command::new(&self.binary)
            .arg("--version")
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

#[async_trait]
impl ExtractionClient for YtDlpClient {
    async fn probe(&self, url: &str, options: &ExtractOptions) -> Result<RawInfo, ExtractionError> {
        let mut args = options.to_args();
        args.push("--dump-single-json".to_string());
        args.push(url.to_string());

        let output = self.run(args).await?;
        Ok(serde_json::from_slice(&output.stdout)?)
    }

    async fn download(
        &self,
        url: &str,
        options: &ExtractOptions,
    ) -> Result<(RawInfo, PathBuf), ExtractionError> {
        let mut args = options.to_args();
        args.push("--no-simulate".to_string());
        args.push("--print".to_string());
        args.push("after_move:%()j".to_string());
        args.push(url.to_string());

        let output = self.run(args).await?;
        let printed = last_line(&output.stdout, "");
        if printed.is_empty() {
            return Err(ExtractionError::MissingOutput);
        }

        let info: RawInfo = serde_json::from_str(&printed)?;
        let path = info.reported_path().ok_or(ExtractionError::MissingOutput)?;
        Ok((info, path))
    }
}

fn last_line(bytes: &[u8], fallback: &str) -> String {
    String::from_utf8_lossy(bytes)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or(fallback)
        .to_string()
}
