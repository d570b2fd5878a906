//! Configuration resolution.
//!
//! Every value is resolved once per invocation with the precedence
//! CLI flag > environment variable > TOML config file > built-in default.
//! The environment is captured into a plain map first (after `.env` loading),
//! so resolution itself never touches process state.

use crate::archive::codec::CodecKind;
use crate::cli::{ConsulArgs, DirArgs, EtcdArgs, FileArgs, GlobalArgs};
use crate::utils::errors::{BackupError, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const DEFAULT_REGION: &str = "us-east-1";
pub const DEFAULT_CONSUL_ADDRESS: &str = "http://127.0.0.1:8500";
pub const DEFAULT_ETCD_ENDPOINT: &str = "http://127.0.0.1:2379";
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Snapshot of the process environment.
pub type EnvMap = HashMap<String, String>;

/// Load `.env` (the given file, else `./.env` if present) into the process
/// environment and capture the result. Returns the file that was loaded.
pub fn load_env(env_file: Option<&Path>) -> (EnvMap, Option<PathBuf>) {
    let loaded = match env_file {
        Some(path) => dotenvy::from_path(path).ok().map(|_| path.to_path_buf()),
        None => dotenvy::dotenv().ok(),
    };
    (std::env::vars().collect(), loaded)
}

/// Optional TOML configuration file.
///
/// ```toml
/// [log]
/// level = "debug"
///
/// [backup]
/// compress = "gzip"
/// dirs = ["/etc", "/srv/app"]
/// exclude = ["*.log", "cache/"]
///
/// [oss]
/// endpoint = "oss-cn-hangzhou.aliyuncs.com"
/// bucket = "backups"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub log: LogSection,
    pub backup: BackupSection,
    pub oss: OssSection,
    pub etcd: EtcdSection,
    pub consul: ConsulSection,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct LogSection {
    pub level: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct BackupSection {
    pub compress: Option<String>,
    pub work_dir: Option<PathBuf>,
    pub dirs: Option<Vec<String>>,
    pub files: Option<Vec<String>>,
    pub exclude: Option<Vec<String>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OssSection {
    pub endpoint: Option<String>,
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub bucket: Option<String>,
    pub prefix: Option<String>,
    pub region: Option<String>,
    pub path_style: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct EtcdSection {
    pub endpoints: Option<Vec<String>>,
    pub cacert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dial_timeout: Option<String>,
    pub command_timeout: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ConsulSection {
    pub address: Option<String>,
    pub token: Option<String>,
    pub stale: Option<bool>,
}

impl FileConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            BackupError::Config(format!("cannot read config file {}: {}", path.display(), e))
        })?;
        toml::from_str(&content).map_err(|e| {
            BackupError::Config(format!("invalid config file {}: {}", path.display(), e))
        })
    }
}

/// Settings shared by every subcommand.
#[derive(Debug, Clone)]
pub struct Settings {
    pub codec: CodecKind,
    pub oss: OssSettings,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OssSettings {
    /// Host, URL, or `file://<dir>` for a local bucket
    pub endpoint: String,
    pub access_key: String,
    pub secret_key: String,
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    pub path_style: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirSettings {
    pub paths: Vec<PathBuf>,
    pub excludes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSettings {
    pub paths: Vec<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EtcdSettings {
    pub endpoints: Vec<String>,
    pub cacert: Option<PathBuf>,
    pub cert: Option<PathBuf>,
    pub key: Option<PathBuf>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub dial_timeout: Duration,
    /// No deadline when `None`
    pub command_timeout: Option<Duration>,
}

impl Default for EtcdSettings {
    fn default() -> Self {
        Self {
            endpoints: vec![DEFAULT_ETCD_ENDPOINT.to_string()],
            cacert: None,
            cert: None,
            key: None,
            user: None,
            password: None,
            dial_timeout: DEFAULT_DIAL_TIMEOUT,
            command_timeout: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsulSettings {
    pub address: String,
    pub token: Option<String>,
    pub stale: bool,
}

impl Default for ConsulSettings {
    fn default() -> Self {
        Self {
            address: DEFAULT_CONSUL_ADDRESS.to_string(),
            token: None,
            stale: false,
        }
    }
}

/// Applies the precedence rules over one environment snapshot and one file.
pub struct Resolver<'a> {
    env: &'a EnvMap,
    file: &'a FileConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(env: &'a EnvMap, file: &'a FileConfig) -> Self {
        Self { env, file }
    }

    fn env(&self, key: &str) -> Option<&'a str> {
        self.env
            .get(key)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }

    /// First non-blank value of flag, environment, file.
    fn pick(&self, cli: Option<&str>, key: &str, file: Option<&str>) -> Option<String> {
        cli.map(str::trim)
            .filter(|v| !v.is_empty())
            .or_else(|| self.env(key))
            .or_else(|| file.map(str::trim).filter(|v| !v.is_empty()))
            .map(str::to_string)
    }

    /// Comma-separated flag or environment value, else the file's list.
    fn pick_list(&self, cli: Option<&str>, key: &str, file: Option<&Vec<String>>) -> Vec<String> {
        let from_text = cli
            .map(split_list)
            .filter(|l| !l.is_empty())
            .or_else(|| self.env(key).map(split_list).filter(|l| !l.is_empty()));

        from_text.unwrap_or_else(|| {
            file.map(|l| {
                l.iter()
                    .map(|s| s.trim().to_string())
                    .filter(|s| !s.is_empty())
                    .collect()
            })
            .unwrap_or_default()
        })
    }

    fn pick_bool(&self, cli: bool, key: &str, file: Option<bool>) -> Result<bool> {
        if cli {
            return Ok(true);
        }
        match self.env(key) {
            Some(text) => parse_bool(text).map_err(|e| BackupError::Config(format!("{}: {}", key, e))),
            None => Ok(file.unwrap_or(false)),
        }
    }

    pub fn log_level(&self, cli: Option<&str>) -> String {
        self.pick(cli, "LOG_LEVEL", self.file.log.level.as_deref())
            .unwrap_or_else(|| DEFAULT_LOG_LEVEL.to_string())
    }

    pub fn settings(&self, args: &GlobalArgs) -> Result<Settings> {
        let oss = &self.file.oss;

        let codec: CodecKind = self
            .pick(args.compress.as_deref(), "COMPRESS_METHOD", self.file.backup.compress.as_deref())
            .unwrap_or_default()
            .parse()?;

        let endpoint = self.pick(args.endpoint.as_deref(), "OSS_ENDPOINT", oss.endpoint.as_deref());
        let access_key = self.pick(args.access_key.as_deref(), "OSS_ACCESS_KEY", oss.access_key.as_deref());
        let secret_key = self.pick(args.secret_key.as_deref(), "OSS_SECRET_KEY", oss.secret_key.as_deref());
        let bucket = self.pick(args.bucket.as_deref(), "OSS_BUCKET", oss.bucket.as_deref());

        let endpoint = required(endpoint, "object storage endpoint", "--endpoint", "OSS_ENDPOINT")?;
        let local = endpoint.starts_with("file://");
        let (access_key, secret_key) = if local {
            (access_key.unwrap_or_default(), secret_key.unwrap_or_default())
        } else {
            (
                required(access_key, "object storage access key", "--access-key", "OSS_ACCESS_KEY")?,
                required(secret_key, "object storage secret key", "--secret-key", "OSS_SECRET_KEY")?,
            )
        };
        let bucket = required(bucket, "bucket", "--bucket", "OSS_BUCKET")?;

        let work_dir = args
            .work_dir
            .clone()
            .or_else(|| self.env("BACKUP_WORK_DIR").map(PathBuf::from))
            .or_else(|| self.file.backup.work_dir.clone())
            .unwrap_or_else(std::env::temp_dir);

        Ok(Settings {
            codec,
            oss: OssSettings {
                endpoint,
                access_key,
                secret_key,
                bucket,
                prefix: self
                    .pick(args.prefix.as_deref(), "OSS_OBJECT_PREFIX", oss.prefix.as_deref())
                    .unwrap_or_default(),
                region: self
                    .pick(args.region.as_deref(), "OSS_REGION", oss.region.as_deref())
                    .unwrap_or_else(|| DEFAULT_REGION.to_string()),
                path_style: self.pick_bool(args.path_style, "OSS_PATH_STYLE", oss.path_style)?,
            },
            work_dir,
        })
    }

    pub fn dir(&self, args: &DirArgs) -> Result<DirSettings> {
        let paths = self.pick_list(args.path.as_deref(), "DIRS_TO_BACKUP", self.file.backup.dirs.as_ref());
        if paths.is_empty() {
            return Err(BackupError::Config(
                "no directories to back up: use --path or DIRS_TO_BACKUP".to_string(),
            ));
        }

        Ok(DirSettings {
            paths: paths.into_iter().map(PathBuf::from).collect(),
            excludes: self.pick_list(
                args.exclude.as_deref(),
                "EXCLUDE_PATTERNS",
                self.file.backup.exclude.as_ref(),
            ),
        })
    }

    pub fn file(&self, args: &FileArgs) -> Result<FileSettings> {
        let paths = self.pick_list(args.path.as_deref(), "FILES_TO_BACKUP", self.file.backup.files.as_ref());
        if paths.is_empty() {
            return Err(BackupError::Config(
                "no files to back up: use --path or FILES_TO_BACKUP".to_string(),
            ));
        }

        Ok(FileSettings {
            paths: paths.into_iter().map(PathBuf::from).collect(),
        })
    }

    pub fn etcd(&self, args: &EtcdArgs) -> Result<EtcdSettings> {
        let file = &self.file.etcd;

        let mut endpoints = self.pick_list(args.etcd_endpoints.as_deref(), "ETCD_ENDPOINTS", file.endpoints.as_ref());
        if endpoints.is_empty() {
            endpoints.push(DEFAULT_ETCD_ENDPOINT.to_string());
        }

        let path = |cli: &Option<PathBuf>, key: &str, file: &Option<PathBuf>| {
            cli.clone()
                .or_else(|| self.env(key).map(PathBuf::from))
                .or_else(|| file.clone())
        };

        let dial_timeout = match self.pick(args.dial_timeout.as_deref(), "ETCD_DIAL_TIMEOUT", file.dial_timeout.as_deref()) {
            Some(text) => parse_duration(&text)?,
            None => DEFAULT_DIAL_TIMEOUT,
        };
        let command_timeout = match self.pick(
            args.command_timeout.as_deref(),
            "ETCD_COMMAND_TIMEOUT",
            file.command_timeout.as_deref(),
        ) {
            Some(text) => Some(parse_duration(&text)?).filter(|d| !d.is_zero()),
            None => None,
        };

        Ok(EtcdSettings {
            endpoints,
            cacert: path(&args.cacert, "ETCD_CACERT", &file.cacert),
            cert: path(&args.cert, "ETCD_CERT", &file.cert),
            key: path(&args.key, "ETCD_KEY", &file.key),
            user: self.pick(args.user.as_deref(), "ETCD_USER", file.user.as_deref()),
            password: self.pick(args.password.as_deref(), "ETCD_PASSWORD", file.password.as_deref()),
            dial_timeout,
            command_timeout,
        })
    }

    pub fn consul(&self, args: &ConsulArgs) -> Result<ConsulSettings> {
        let file = &self.file.consul;
        Ok(ConsulSettings {
            address: self
                .pick(args.address.as_deref(), "CONSUL_ADDRESS", file.address.as_deref())
                .unwrap_or_else(|| DEFAULT_CONSUL_ADDRESS.to_string()),
            token: self.pick(args.token.as_deref(), "CONSUL_TOKEN", file.token.as_deref()),
            stale: self.pick_bool(args.stale, "CONSUL_STALE", file.stale)?,
        })
    }
}

fn required(value: Option<String>, what: &str, flag: &str, env: &str) -> Result<String> {
    value.ok_or_else(|| BackupError::Config(format!("missing {}: use {} or {}", what, flag, env)))
}

/// Split on commas, trim, drop blanks.
pub fn split_list(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_bool(text: &str) -> Result<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(BackupError::Config(format!("invalid boolean '{}'", other))),
    }
}

/// Parse Go-style durations: `500ms`, `5s`, `1m30s`, `1.5h`, `0`.
pub fn parse_duration(text: &str) -> Result<Duration> {
    let invalid = || BackupError::Config(format!("invalid duration '{}'", text));
    let s = text.trim();

    if s == "0" {
        return Ok(Duration::ZERO);
    }
    if s.is_empty() {
        return Err(invalid());
    }

    let mut total = 0f64;
    let mut rest = s;
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(invalid)?;
        if number_len == 0 {
            return Err(invalid());
        }
        let value: f64 = rest[..number_len].parse().map_err(|_| invalid())?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds_per_unit = match &rest[..unit_len] {
            "ns" => 1e-9,
            "us" | "µs" => 1e-6,
            "ms" => 1e-3,
            "s" => 1.0,
            "m" => 60.0,
            "h" => 3600.0,
            _ => return Err(invalid()),
        };
        rest = &rest[unit_len..];
        total += value * seconds_per_unit;
    }

    Duration::try_from_secs_f64(total).map_err(|_| invalid())
}
