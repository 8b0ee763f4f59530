use serde::Serialize;

use crate::extractor::RawInfo;

const DESCRIPTION_LIMIT: usize = 500;
const ELLIPSIS: &str = "...";

/// Public metadata schema returned by `/api/metadata`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaMetadata {
    pub title: String,
    pub uploader: String,
    pub url: String,
    pub description: String,
    pub duration: Option<f64>,
    pub view_count: Option<u64>,
    pub like_count: Option<u64>,
    pub thumbnail: Option<String>,
    pub platform: String,
    pub extension: String,
    pub size: Option<u64>,
    pub mime_type: String,
    pub upload_date: Option<String>,
    pub availability: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub fps: Option<f64>,
    pub format_note: Option<String>,
    #[serde(rename = "solidarity")]
    pub label: String,
}

/// Projects a raw info dict onto [`MediaMetadata`]. Never fails: absent
/// fields take their documented fallback.
pub fn project(raw: &RawInfo, url: &str, label: &str) -> MediaMetadata {
    let extension = first_text([raw.ext.as_deref()]).unwrap_or_else(|| "mp4".to_string());

    MediaMetadata {
        title: first_text([raw.title.as_deref()]).unwrap_or_else(|| "Untitled".to_string()),
        uploader: first_text([
            raw.uploader.as_deref(),
            raw.channel.as_deref(),
            raw.creator.as_deref(),
        ])
        .unwrap_or_else(|| "Unknown".to_string()),
        url: url.to_string(),
        description: truncate_description(raw.description.as_deref().unwrap_or_default()),
        duration: raw.duration,
        view_count: raw.view_count,
        like_count: raw.like_count,
        thumbnail: first_text([raw.thumbnail.as_deref()]),
        platform: platform_of(raw),
        mime_type: format!("video/{extension}"),
        extension,
        size: raw
            .filesize
            .or(raw.filesize_approx)
            .filter(|bytes| bytes.is_finite() && *bytes >= 0.0)
            .map(|bytes| bytes.round() as u64),
        upload_date: first_text([raw.upload_date.as_deref()]),
        availability: first_text([raw.availability.as_deref()]),
        width: raw.width,
        height: raw.height,
        fps: raw.fps,
        format_note: first_text([raw.format_note.as_deref()]),
        label: label.to_string(),
    }
}

/// Lower-case platform identifier, `"unknown"` when the extractor is silent.
pub fn platform_of(raw: &RawInfo) -> String {
    first_text([raw.extractor_key.as_deref(), raw.extractor.as_deref()])
        .map(|value| value.to_lowercase())
        .unwrap_or_else(|| "unknown".to_string())
}

pub fn truncate_description(description: &str) -> String {
    if description.chars().count() <= DESCRIPTION_LIMIT {
        return description.to_string();
    }

    let mut truncated: String = description.chars().take(DESCRIPTION_LIMIT).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

fn first_text<const N: usize>(candidates: [Option<&str>; N]) -> Option<String> {
    candidates
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(ToString::to_string)
}
