use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::extractor::ExtractionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    InvalidRequest,
    Blocked,
    Private,
    AgeRestricted,
    Unavailable,
    Copyright,
    NoFormats,
    CorruptDownload,
    FileMissing,
    Unknown,
}

impl FailureKind {
    pub fn status(self) -> StatusCode {
        match self {
            Self::CorruptDownload | Self::FileMissing | Self::Unknown => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            _ => StatusCode::BAD_REQUEST,
        }
    }

    pub fn code(self) -> &'static str {
        match self {
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::Blocked => "BLOCKED",
            Self::Private => "PRIVATE",
            Self::AgeRestricted => "AGE_RESTRICTED",
            Self::Unavailable => "UNAVAILABLE",
            Self::Copyright => "COPYRIGHT",
            Self::NoFormats => "NO_FORMATS",
            Self::CorruptDownload => "CORRUPT_DOWNLOAD",
            Self::FileMissing => "FILE_MISSING",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

#[derive(Debug)]
pub struct ApiError {
    pub kind: FailureKind,
    pub message: String,
}

impl ApiError {
    pub fn new(kind: FailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::new(FailureKind::InvalidRequest, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(FailureKind::Unknown, message)
    }

    pub fn status(&self) -> StatusCode {
        self.kind.status()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let body = Json(ErrorBody {
            error: self.message,
            code: self.kind.code(),
        });

        (status, body).into_response()
    }
}

/// Maps a client failure onto the public taxonomy.
///
/// Structured variants win; everything else is matched on the lower-cased
/// description. Age gates are recognised before the sign-in rule because
/// they share its wording, and bot/sign-in detection must stay ahead of the
/// generic "not available" rule.
pub fn classify_extraction_failure(error: &ExtractionError) -> ApiError {
    match error {
        ExtractionError::Blocked(_) => blocked(),
        ExtractionError::Timeout(_) => ApiError::internal(format!("Download failed: {error}")),
        ExtractionError::Spawn(source) if source.kind() == std::io::ErrorKind::NotFound => {
            ApiError::internal("yt-dlp is not installed on the server")
        }
        _ => classify_failure_message(&error.to_string()),
    }
}

/// Wording platforms use when they suspect automation. URLs often appear in
/// failure text, so bare fragments like "bot" are not enough.
const BOT_CHECK_PHRASES: [&str; 4] = [
    "sign in to confirm",
    "not a bot",
    "bot detection",
    "automated requests",
];

pub fn classify_failure_message(message: &str) -> ApiError {
    let lower = message.to_lowercase();

    if lower.contains("confirm your age")
        || lower.contains("age-restricted")
        || lower.contains("age restricted")
        || lower.contains("inappropriate for some users")
    {
        ApiError::new(
            FailureKind::AgeRestricted,
            "This video is age-restricted and cannot be downloaded",
        )
    } else if BOT_CHECK_PHRASES.iter().any(|phrase| lower.contains(phrase)) {
        blocked()
    } else if lower.contains("private video") || lower.contains("registered users") {
        ApiError::new(FailureKind::Private, "This video is private")
    } else if lower.contains("not available") {
        unavailable_in_region()
    } else if lower.contains("copyright") {
        ApiError::new(
            FailureKind::Copyright,
            "This video has been removed due to copyright",
        )
    } else if lower.contains("unavailable")
        || lower.contains("geo restrict")
        || lower.contains("has been removed")
    {
        unavailable_in_region()
    } else {
        ApiError::internal(format!("Download failed: {message}"))
    }
}

fn blocked() -> ApiError {
    ApiError::new(
        FailureKind::Blocked,
        "The platform is blocking automated requests right now. Please try again later.",
    )
}

fn unavailable_in_region() -> ApiError {
    ApiError::new(
        FailureKind::Unavailable,
        "This video is not available in your region",
    )
}
