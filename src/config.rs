use std::{path::PathBuf, str::FromStr, time::Duration};

use tracing::warn;

use crate::extractor::{BROWSER_USER_AGENT, ExtractOptions};

const DEFAULT_PORT: u16 = 5000;
const DEFAULT_EXTRACTION_TIMEOUT_SECONDS: u64 = 300;
const DEFAULT_SOCKET_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_RETRIES: u32 = 3;
const DEFAULT_STALE_ARTIFACT_SECONDS: u64 = 2 * 60 * 60;

/// Header and cookie strategy presented to upstream platforms.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvasionProfile {
    Plain,
    #[default]
    Browser,
    Hardened,
}

impl FromStr for EvasionProfile {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "plain" => Ok(Self::Plain),
            "browser" => Ok(Self::Browser),
            "hardened" => Ok(Self::Hardened),
            other => Err(format!("unknown evasion profile {other:?}")),
        }
    }
}

impl EvasionProfile {
    pub fn headers(self) -> Vec<(String, String)> {
        let mut headers = Vec::new();
        if self == Self::Plain {
            return headers;
        }

        headers.push((
            "Accept".to_string(),
            "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".to_string(),
        ));
        headers.push(("Accept-Language".to_string(), "en-us,en;q=0.5".to_string()));
        headers.push(("Sec-Fetch-Mode".to_string(), "navigate".to_string()));

        if self == Self::Hardened {
            headers.push(("Sec-Fetch-Dest".to_string(), "document".to_string()));
            headers.push(("Sec-Fetch-Site".to_string(), "none".to_string()));
            headers.push(("Sec-Fetch-User".to_string(), "?1".to_string()));
            headers.push(("Upgrade-Insecure-Requests".to_string(), "1".to_string()));
        }

        headers
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub work_dir: PathBuf,
    pub yt_dlp_bin: PathBuf,
    pub extraction_timeout: Duration,
    pub socket_timeout_seconds: u64,
    pub retries: u32,
    pub evasion_profile: EvasionProfile,
    pub cookies_file: Option<PathBuf>,
    pub stale_artifact_seconds: u64,
}

impl Config {
    pub fn from_env() -> Self {
        let evasion_profile = match std::env::var("EVASION_PROFILE") {
            Ok(value) => value.parse::<EvasionProfile>().unwrap_or_else(|error| {
                warn!("EVASION_PROFILE ignored: {error}. Using browser profile.");
                EvasionProfile::default()
            }),
            Err(_) => EvasionProfile::default(),
        };

        Self {
            bind_addr: resolve_bind_addr(),
            work_dir: read_string_env("MEDIA_WORK_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| std::env::temp_dir().join("solidarity-media")),
            yt_dlp_bin: read_string_env("YT_DLP_BIN")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("yt-dlp")),
            extraction_timeout: Duration::from_secs(
                read_u64_env("EXTRACTION_TIMEOUT_SECONDS")
                    .filter(|value| *value > 0)
                    .unwrap_or(DEFAULT_EXTRACTION_TIMEOUT_SECONDS),
            ),
            socket_timeout_seconds: read_u64_env("SOCKET_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_SOCKET_TIMEOUT_SECONDS),
            retries: read_u64_env("EXTRACTION_RETRIES")
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(DEFAULT_RETRIES),
            evasion_profile,
            cookies_file: read_string_env("YT_DLP_COOKIES").map(PathBuf::from),
            stale_artifact_seconds: read_u64_env("STALE_ARTIFACT_SECONDS")
                .unwrap_or(DEFAULT_STALE_ARTIFACT_SECONDS),
        }
    }

    /// Options for metadata-only calls: user agent, nothing else.
    pub fn probe_options(&self) -> ExtractOptions {
        ExtractOptions {
            user_agent: Some(BROWSER_USER_AGENT.to_string()),
            socket_timeout_seconds: Some(self.socket_timeout_seconds),
            no_check_certificates: true,
            ..ExtractOptions::default()
        }
    }

    /// Options for download calls, shaped by the evasion profile.
    /// The output template and format are filled in per request.
    pub fn download_options(&self) -> ExtractOptions {
        let cookies_file = match self.evasion_profile {
            EvasionProfile::Hardened => self.cookies_file.clone(),
            _ => None,
        };

        ExtractOptions {
            user_agent: Some(BROWSER_USER_AGENT.to_string()),
            headers: self.evasion_profile.headers(),
            socket_timeout_seconds: Some(self.socket_timeout_seconds),
            retries: Some(self.retries),
            fragment_retries: Some(self.retries),
            no_check_certificates: true,
            geo_bypass: true,
            prefer_ipv4: true,
            cookies_file,
            ..ExtractOptions::default()
        }
    }
}

fn read_string_env(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_u64_env(name: &str) -> Option<u64> {
    let value = read_string_env(name)?;
    match value.parse::<u64>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!("{name}={value:?} is not a valid number, using default");
            None
        }
    }
}

fn resolve_bind_addr() -> String {
    if let Some(configured) = read_string_env("APP_ADDR") {
        return configured;
    }

    let port = read_string_env("PORT")
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(DEFAULT_PORT);

    format!("0.0.0.0:{port}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with(profile: EvasionProfile) -> Config {
        Config {
            bind_addr: "127.0.0.1:0".to_string(),
            work_dir: PathBuf::from("/tmp/media"),
            yt_dlp_bin: PathBuf::from("yt-dlp"),
            extraction_timeout: Duration::from_secs(5),
            socket_timeout_seconds: 30,
            retries: 3,
            evasion_profile: profile,
            cookies_file: Some(PathBuf::from("/etc/cookies.txt")),
            stale_artifact_seconds: 0,
        }
    }

    #[test]
    fn parses_profiles_case_insensitively() {
        assert_eq!("Plain".parse::<EvasionProfile>(), Ok(EvasionProfile::Plain));
        assert_eq!(" hardened ".parse::<EvasionProfile>(), Ok(EvasionProfile::Hardened));
        assert!("stealth".parse::<EvasionProfile>().is_err());
    }

    #[test]
    fn plain_profile_sends_no_extra_headers() {
        let options = config_with(EvasionProfile::Plain).download_options();
        assert!(options.headers.is_empty());
        assert!(options.cookies_file.is_none());
        assert_eq!(options.user_agent.as_deref(), Some(BROWSER_USER_AGENT));
    }

    #[test]
    fn only_hardened_profile_uses_cookies() {
        let browser = config_with(EvasionProfile::Browser).download_options();
        assert!(browser.cookies_file.is_none());
        assert!(browser.headers.iter().any(|(name, _)| name == "Sec-Fetch-Mode"));

        let hardened = config_with(EvasionProfile::Hardened).download_options();
        assert_eq!(hardened.cookies_file, Some(PathBuf::from("/etc/cookies.txt")));
        assert!(hardened.headers.iter().any(|(name, _)| name == "Sec-Fetch-User"));
    }

    #[test]
    fn probe_options_stay_minimal() {
        let options = config_with(EvasionProfile::Hardened).probe_options();
        assert!(options.headers.is_empty());
        assert!(options.no_check_certificates);
        assert!(options.output_template.is_none());
    }
}
