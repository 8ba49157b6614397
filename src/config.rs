use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::retry::RetryConfig;
use crate::types::{FailedPolicy, Tracking};

pub const DEFAULT_CONFIG_PATH: &str = "~/.bucket-mirror/config.yaml";
const DEFAULT_DATABASE_PATH: &str = "~/.bucket-mirror/ledger.db";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read settings from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse settings in {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    #[error("Invalid settings: {0}")]
    Invalid(String),
}

/// Access key pair taken from the settings file.
#[derive(Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StaticCredentials {
    pub access_key: String,
    pub secret_key: String,
}

impl std::fmt::Debug for StaticCredentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StaticCredentials")
            .field("access_key", &self.access_key)
            .field("secret_key", &"<redacted>")
            .finish()
    }
}

/// Settings file as written on disk, before validation.
#[derive(Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawSettings {
    bucket_name: Option<String>,
    region: String,
    endpoint_url: Option<String>,
    credentials: Option<StaticCredentials>,
    destination_root: Option<String>,
    included_paths: Vec<String>,
    max_downloads: usize,
    polling_interval_secs: u64,
    debug_mode: bool,
    database_path: String,
    tracking: Tracking,
    failed_policy: FailedPolicy,
    reconcile_local: bool,
    temp_suffix: String,
    list_retry: RetryConfig,
    no_progress_bar: bool,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            bucket_name: None,
            region: "us-east-1".to_string(),
            endpoint_url: None,
            credentials: None,
            destination_root: None,
            included_paths: Vec::new(),
            max_downloads: 4,
            polling_interval_secs: 30,
            debug_mode: false,
            database_path: DEFAULT_DATABASE_PATH.to_string(),
            tracking: Tracking::default(),
            failed_policy: FailedPolicy::default(),
            reconcile_local: true,
            temp_suffix: ".part".to_string(),
            list_retry: RetryConfig::default(),
            no_progress_bar: false,
        }
    }
}

/// Validated, read-only process settings.
#[derive(Clone)]
pub struct Settings {
    pub bucket_name: String,
    pub region: String,
    pub endpoint_url: Option<String>,
    /// `None` means the SDK's default provider chain.
    pub credentials: Option<StaticCredentials>,
    pub destination_root: PathBuf,
    pub included_paths: Vec<String>,
    pub database_path: PathBuf,
    pub temp_suffix: String,
    pub polling_interval: Duration,
    pub max_downloads: usize,
    pub list_retry: RetryConfig,
    pub tracking: Tracking,
    pub failed_policy: FailedPolicy,
    pub debug_mode: bool,
    pub reconcile_local: bool,
    pub no_progress_bar: bool,
}

impl std::fmt::Debug for Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settings")
            .field("bucket_name", &self.bucket_name)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("credentials", &self.credentials)
            .field("destination_root", &self.destination_root)
            .field("included_paths", &self.included_paths)
            .field("database_path", &self.database_path)
            .field("max_downloads", &self.max_downloads)
            .field("tracking", &self.tracking)
            .field("failed_policy", &self.failed_policy)
            .finish_non_exhaustive()
    }
}

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml(&text, path)
    }

    /// Parse and validate settings text. `origin` is only used in errors.
    pub fn from_yaml(text: &str, origin: &Path) -> Result<Self, ConfigError> {
        let raw: RawSettings = serde_yaml::from_str(text).map_err(|source| ConfigError::Parse {
            path: origin.to_path_buf(),
            source,
        })?;
        Self::validate(raw)
    }

    fn validate(raw: RawSettings) -> Result<Self, ConfigError> {
        let bucket_name = raw
            .bucket_name
            .map(|b| b.trim().to_string())
            .filter(|b| !b.is_empty())
            .ok_or_else(|| ConfigError::Invalid("bucket_name is required".into()))?;
        let destination_root = raw
            .destination_root
            .filter(|d| !d.trim().is_empty())
            .map(|d| expand_tilde(d.trim()))
            .ok_or_else(|| ConfigError::Invalid("destination_root is required".into()))?;

        if raw.max_downloads < 1 {
            return Err(ConfigError::Invalid(
                "max_downloads must be at least 1".into(),
            ));
        }
        if raw.polling_interval_secs < 1 {
            return Err(ConfigError::Invalid(
                "polling_interval_secs must be at least 1".into(),
            ));
        }
        if raw.temp_suffix.is_empty() {
            return Err(ConfigError::Invalid("temp_suffix must not be empty".into()));
        }
        if let Some(creds) = &raw.credentials {
            if creds.access_key.is_empty() || creds.secret_key.is_empty() {
                return Err(ConfigError::Invalid(
                    "credentials need both access_key and secret_key".into(),
                ));
            }
        }
        if raw.database_path.trim().is_empty() {
            return Err(ConfigError::Invalid("database_path must not be empty".into()));
        }

        Ok(Self {
            bucket_name,
            region: raw.region,
            endpoint_url: raw.endpoint_url.filter(|e| !e.is_empty()),
            credentials: raw.credentials,
            destination_root,
            included_paths: raw.included_paths,
            database_path: expand_tilde(&raw.database_path),
            temp_suffix: raw.temp_suffix,
            polling_interval: Duration::from_secs(raw.polling_interval_secs),
            max_downloads: raw.max_downloads,
            list_retry: raw.list_retry,
            tracking: raw.tracking,
            failed_policy: raw.failed_policy,
            debug_mode: raw.debug_mode,
            reconcile_local: raw.reconcile_local,
            no_progress_bar: raw.no_progress_bar,
        })
    }

    /// One line per setting, for the startup log.
    pub fn summarize(&self) -> String {
        let credentials = if self.credentials.is_some() {
            "STATIC"
        } else {
            "DEFAULT_CHAIN"
        };
        let included = if self.included_paths.is_empty() {
            "(all)".to_string()
        } else {
            self.included_paths.join(", ")
        };
        [
            format!("bucket_name: {}", self.bucket_name),
            format!("region: {}", self.region),
            format!(
                "endpoint_url: {}",
                self.endpoint_url.as_deref().unwrap_or("(default)")
            ),
            format!("credentials: {credentials}"),
            format!("destination_root: {}", self.destination_root.display()),
            format!("included_paths: {included}"),
            format!("database_path: {}", self.database_path.display()),
            format!("max_downloads: {}", self.max_downloads),
            format!("polling_interval_secs: {}", self.polling_interval.as_secs()),
            format!("tracking: {:?}", self.tracking),
            format!("failed_policy: {:?}", self.failed_policy),
            format!("reconcile_local: {}", self.reconcile_local),
            format!("debug_mode: {}", self.debug_mode),
        ]
        .join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Settings, ConfigError> {
        Settings::from_yaml(text, Path::new("test.yaml"))
    }

    const MINIMAL: &str = "bucket_name: my-bucket\ndestination_root: /srv/mirror\n";

    #[test]
    fn test_minimal_settings_use_defaults() {
        let settings = parse(MINIMAL).unwrap();
        assert_eq!(settings.bucket_name, "my-bucket");
        assert_eq!(settings.region, "us-east-1");
        assert_eq!(settings.destination_root, PathBuf::from("/srv/mirror"));
        assert_eq!(settings.max_downloads, 4);
        assert_eq!(settings.polling_interval, Duration::from_secs(30));
        assert_eq!(settings.temp_suffix, ".part");
        assert_eq!(settings.tracking, Tracking::Ledger);
        assert_eq!(settings.failed_policy, FailedPolicy::Manual);
        assert!(settings.reconcile_local);
        assert!(settings.credentials.is_none());
        assert_eq!(settings.list_retry, RetryConfig::default());
    }

    #[test]
    fn test_full_settings() {
        let text = r#"
bucket_name: photos
region: eu-west-1
endpoint_url: http://localhost:9000
credentials:
  access_key: AKIA
  secret_key: hunter2
destination_root: /data
included_paths: [camera, scans/]
max_downloads: 8
polling_interval_secs: 5
debug_mode: true
database_path: /var/lib/mirror.db
tracking: snapshot
failed_policy: next-cycle
reconcile_local: false
temp_suffix: .tmp
list_retry: { max_retries: 4, base_delay_secs: 2, max_delay_secs: 10 }
no_progress_bar: true
"#;
        let settings = parse(text).unwrap();
        assert_eq!(settings.region, "eu-west-1");
        assert_eq!(settings.endpoint_url.as_deref(), Some("http://localhost:9000"));
        assert_eq!(settings.included_paths, vec!["camera", "scans/"]);
        assert_eq!(settings.max_downloads, 8);
        assert_eq!(settings.database_path, PathBuf::from("/var/lib/mirror.db"));
        assert_eq!(settings.tracking, Tracking::Snapshot);
        assert_eq!(settings.failed_policy, FailedPolicy::NextCycle);
        assert_eq!(settings.list_retry.max_retries, 4);
        assert!(settings.debug_mode);
        assert!(!settings.reconcile_local);
        assert!(settings.no_progress_bar);
    }

    #[test]
    fn test_missing_bucket_rejected() {
        let err = parse("destination_root: /srv\n").unwrap_err();
        assert!(err.to_string().contains("bucket_name"));
    }

    #[test]
    fn test_missing_destination_rejected() {
        let err = parse("bucket_name: b\n").unwrap_err();
        assert!(err.to_string().contains("destination_root"));
    }

    #[test]
    fn test_zero_downloads_rejected() {
        let err = parse(&format!("{MINIMAL}max_downloads: 0\n")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("max_downloads")));
    }

    #[test]
    fn test_zero_interval_rejected() {
        let err = parse(&format!("{MINIMAL}polling_interval_secs: 0\n")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(msg) if msg.contains("polling_interval")));
    }

    #[test]
    fn test_empty_temp_suffix_rejected() {
        let err = parse(&format!("{MINIMAL}temp_suffix: \"\"\n")).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let err = parse(&format!("{MINIMAL}max_dowloads: 3\n")).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_tilde_expanded() {
        let settings = parse("bucket_name: b\ndestination_root: ~/mirror\n").unwrap();
        if let Some(home) = dirs::home_dir() {
            assert_eq!(settings.destination_root, home.join("mirror"));
            assert_eq!(
                settings.database_path,
                home.join(".bucket-mirror").join("ledger.db")
            );
        }
    }

    #[test]
    fn test_debug_redacts_secret() {
        let text = format!("{MINIMAL}credentials: {{ access_key: AKIA, secret_key: hunter2 }}\n");
        let settings = parse(&text).unwrap();
        let debug = format!("{settings:?}");
        assert!(debug.contains("AKIA"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_summarize_hides_credentials() {
        let text = format!("{MINIMAL}credentials: {{ access_key: AKIA, secret_key: hunter2 }}\n");
        let summary = parse(&text).unwrap().summarize();
        assert!(summary.contains("credentials: STATIC"));
        assert!(!summary.contains("hunter2"));
        assert!(!summary.contains("AKIA"));

        let summary = parse(MINIMAL).unwrap().summarize();
        assert!(summary.contains("credentials: DEFAULT_CHAIN"));
        assert!(summary.contains("included_paths: (all)"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = Settings::load(Path::new("/nonexistent/settings.yaml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.yaml");
        std::fs::write(&path, MINIMAL).unwrap();
        assert_eq!(Settings::load(&path).unwrap().bucket_name, "my-bucket");
    }
}
