//! Command-line surface.
//!
//! Every flag is optional here; missing values fall back to the environment,
//! then the config file, then defaults (see [`crate::config`]).

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Back up etcd, Consul and filesystem paths to object storage", long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Args, Debug, Clone, Default)]
pub struct GlobalArgs {
    /// Path to a .env file (default: ./.env when present)
    #[arg(long, global = true, value_name = "FILE")]
    pub env_file: Option<PathBuf>,

    /// Path to a TOML configuration file
    #[arg(short, long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    /// Compression method: zstd (default), gzip or store
    #[arg(long, global = true, value_name = "METHOD")]
    pub compress: Option<String>,

    /// Object storage endpoint (env: OSS_ENDPOINT)
    #[arg(long, global = true)]
    pub endpoint: Option<String>,

    /// Object storage access key (env: OSS_ACCESS_KEY)
    #[arg(long, global = true)]
    pub access_key: Option<String>,

    /// Object storage secret key (env: OSS_SECRET_KEY)
    #[arg(long, global = true)]
    pub secret_key: Option<String>,

    /// Bucket name (env: OSS_BUCKET)
    #[arg(long, global = true)]
    pub bucket: Option<String>,

    /// Object key prefix (env: OSS_OBJECT_PREFIX)
    #[arg(long, global = true)]
    pub prefix: Option<String>,

    /// Bucket region (env: OSS_REGION, default us-east-1)
    #[arg(long, global = true)]
    pub region: Option<String>,

    /// Use path-style bucket addressing, needed by MinIO (env: OSS_PATH_STYLE)
    #[arg(long, global = true)]
    pub path_style: bool,

    /// Directory for temporary artifacts (env: BACKUP_WORK_DIR)
    #[arg(long, global = true, value_name = "DIR")]
    pub work_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Archive one or more directories, one artifact per directory
    Dir(DirArgs),

    /// Compress one file, or pack several files into one archive
    File(FileArgs),

    /// Take an etcd v3 snapshot
    Etcd(EtcdArgs),

    /// Take a Consul snapshot
    Consul(ConsulArgs),
}

#[derive(Args, Debug, Clone, Default)]
pub struct DirArgs {
    /// Comma-separated directories (env: DIRS_TO_BACKUP)
    #[arg(short, long, value_name = "PATHS")]
    pub path: Option<String>,

    /// Comma-separated exclusion patterns (env: EXCLUDE_PATTERNS)
    #[arg(short, long, value_name = "PATTERNS")]
    pub exclude: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct FileArgs {
    /// Comma-separated files (env: FILES_TO_BACKUP)
    #[arg(short, long, value_name = "PATHS")]
    pub path: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct EtcdArgs {
    /// Comma-separated endpoints (env: ETCD_ENDPOINTS, default http://127.0.0.1:2379)
    #[arg(long, alias = "endpoints", value_name = "URLS")]
    pub etcd_endpoints: Option<String>,

    /// CA certificate, PEM (env: ETCD_CACERT)
    #[arg(long, value_name = "FILE")]
    pub cacert: Option<PathBuf>,

    /// Client certificate, PEM (env: ETCD_CERT)
    #[arg(long, value_name = "FILE")]
    pub cert: Option<PathBuf>,

    /// Client private key, PEM (env: ETCD_KEY)
    #[arg(long, value_name = "FILE")]
    pub key: Option<PathBuf>,

    /// Username (env: ETCD_USER)
    #[arg(long)]
    pub user: Option<String>,

    /// Password (env: ETCD_PASSWORD)
    #[arg(long)]
    pub password: Option<String>,

    /// Connect timeout such as 20s (env: ETCD_DIAL_TIMEOUT, default 5s)
    #[arg(long, value_name = "DURATION")]
    pub dial_timeout: Option<String>,

    /// Overall snapshot deadline such as 60s (env: ETCD_COMMAND_TIMEOUT, default none)
    #[arg(long, value_name = "DURATION")]
    pub command_timeout: Option<String>,
}

#[derive(Args, Debug, Clone, Default)]
pub struct ConsulArgs {
    /// Consul address (env: CONSUL_ADDRESS, default http://127.0.0.1:8500)
    #[arg(long)]
    pub address: Option<String>,

    /// ACL token (env: CONSUL_TOKEN)
    #[arg(long)]
    pub token: Option<String>,

    /// Allow any server to answer, not only the leader (env: CONSUL_STALE)
    #[arg(long)]
    pub stale: bool,
}
