//! CLI arguments and server configuration defaults.

use clap::{Parser, ValueEnum};
use shadow_rs::formatcp;

use crate::build;

const VERSION_INFO: &str = formatcp!(
    r#"{}\ncommit_hash: {}\nbuild_time: {}\nbuild_env: {},{}"#,
    build::PKG_VERSION,
    build::SHORT_COMMIT,
    build::BUILD_TIME,
    build::RUST_VERSION,
    build::RUST_CHANNEL
);

pub const AUTH_COOKIE_NAME: &str = "AXO_BUCKET_SESSION";
pub const UPLOAD_FIELD: &str = "file";
pub const NAMESPACE_FIELD: &str = "name";
pub const DEFAULT_NAMESPACE: &str = "shared";
pub const DEFAULT_ADMIN_NAME: &str = "admin";
pub const DEFAULT_ADMIN_EMAIL: &str = "admin@axo.local";
pub const DEFAULT_SESSION_TTL_SECS: u64 = 24 * 60 * 60;
pub const DEFAULT_LOGIN_MAX_ATTEMPTS: u32 = 5;
pub const DEFAULT_LOGIN_WINDOW_SECS: u64 = 5 * 60;
pub const DEFAULT_LOGIN_LOCKOUT_SECS: u64 = 10 * 60;
pub const DEFAULT_UPLOAD_MAX_SIZE: u64 = 1024 * 1024 * 1024;
pub const DEFAULT_STAGING_TTL_SECS: u64 = 60 * 60;
pub const DEFAULT_STORE_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_ADMIN_CONCURRENCY: usize = 4;
pub const SESSION_PRUNE_INTERVAL_SECS: u64 = 300;
pub const STAGING_CLEAN_INTERVAL_SECS: u64 = 900;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum Backend {
    /// 本地目录
    Fs,
    /// Azure Blob Storage
    Azure,
    /// 进程内存（重启即丢失）
    Memory,
}

/// CLI arguments and environment configuration for the server.
#[derive(Parser, Debug)]
#[command(name = "axo-bucket", version = VERSION_INFO, about = "AxoBucket server")]
pub struct Args {
    #[arg(
        long,
        value_enum,
        env = "AXO_BACKEND",
        default_value = "fs",
        help = "Blob storage backend"
    )]
    pub backend: Backend,
    #[arg(
        short = 's',
        long,
        env = "AXO_STORAGE_DIR",
        default_value = ".axo/storage",
        help = "Root directory for the fs backend"
    )]
    pub storage_dir: String,
    #[arg(
        long,
        env = "AZURE_CONNECTION_STRING",
        hide_env_values = true,
        help = "Azure storage connection string for the azure backend"
    )]
    pub azure_connection_string: Option<String>,
    #[arg(
        long,
        env = "AXO_STAGING_DIR",
        default_value = ".axo/uploads",
        help = "Scratch directory for inbound uploads"
    )]
    pub staging_dir: String,
    #[arg(
        long,
        env = "AXO_DEFAULT_NAMESPACE",
        default_value = DEFAULT_NAMESPACE,
        help = "Shared namespace used when an admin omits one"
    )]
    pub default_namespace: String,
    #[arg(
        long,
        env = "AXO_STORE_TIMEOUT_SECS",
        default_value_t = DEFAULT_STORE_TIMEOUT_SECS,
        help = "Timeout for each storage call in seconds (0 to disable)"
    )]
    pub store_timeout_secs: u64,
    #[arg(
        long,
        env = "AXO_ADMIN_CONCURRENCY",
        default_value_t = DEFAULT_ADMIN_CONCURRENCY,
        help = "Namespaces listed concurrently for the admin view"
    )]
    pub admin_concurrency: usize,
    #[arg(
        long,
        env = "AXO_ADMIN_NAME",
        default_value = DEFAULT_ADMIN_NAME,
        help = "Display name of the bootstrap admin"
    )]
    pub admin_name: String,
    #[arg(
        long,
        env = "AXO_ADMIN_EMAIL",
        default_value = DEFAULT_ADMIN_EMAIL,
        help = "Login email of the bootstrap admin"
    )]
    pub admin_email: String,
    #[arg(
        long,
        env = "AXO_ADMIN_PASS",
        hide_env_values = true,
        help = "Password of the bootstrap admin (no admin is created when unset)"
    )]
    pub admin_pass: Option<String>,
    #[arg(
        short = 'b',
        long,
        env = "AXO_BIND",
        default_value = "0.0.0.0",
        help = "Bind address for HTTP/HTTPS"
    )]
    pub host: String,
    #[arg(
        short = 'p',
        long,
        env = "AXO_HTTP_PORT",
        default_value_t = 3000,
        help = "HTTP port"
    )]
    pub http_port: u16,
    #[arg(
        short = 'P',
        long,
        env = "AXO_HTTPS_PORT",
        help = "HTTPS port (HTTPS disabled when unset)"
    )]
    pub https_port: Option<u16>,
    #[arg(short = 'c', long, env = "AXO_TLS_CERT", help = "TLS cert path")]
    pub tls_cert: Option<String>,
    #[arg(short = 'k', long, env = "AXO_TLS_KEY", help = "TLS key path")]
    pub tls_key: Option<String>,
    #[arg(long, env = "AXO_CORS_ORIGINS", help = "Comma separated CORS origins")]
    pub cors_origins: Option<String>,
    #[arg(
        long,
        env = "AXO_LOG_LEVEL",
        default_value = "info",
        help = "Default log filter when RUST_LOG is unset"
    )]
    pub log_level: String,
    #[arg(
        long,
        env = "AXO_SESSION_TTL_SECS",
        default_value_t = DEFAULT_SESSION_TTL_SECS,
        help = "Session expiration in seconds"
    )]
    pub session_ttl_secs: u64,
    #[arg(
        long,
        env = "AXO_LOGIN_MAX_ATTEMPTS",
        default_value_t = DEFAULT_LOGIN_MAX_ATTEMPTS,
        help = "Max login attempts before lockout"
    )]
    pub login_max_attempts: u32,
    #[arg(
        long,
        env = "AXO_LOGIN_WINDOW_SECS",
        default_value_t = DEFAULT_LOGIN_WINDOW_SECS,
        help = "Login attempt window in seconds"
    )]
    pub login_window_secs: u64,
    #[arg(
        long,
        env = "AXO_LOGIN_LOCKOUT_SECS",
        default_value_t = DEFAULT_LOGIN_LOCKOUT_SECS,
        help = "Login lockout time after max attempts"
    )]
    pub login_lockout_secs: u64,
    #[arg(
        long,
        env = "AXO_UPLOAD_MAX_SIZE",
        default_value_t = DEFAULT_UPLOAD_MAX_SIZE,
        help = "Max upload size in bytes (0 to disable)"
    )]
    pub upload_max_size: u64,
    #[arg(
        long,
        env = "AXO_STAGING_TTL_SECS",
        default_value_t = DEFAULT_STAGING_TTL_SECS,
        help = "Staged file cleanup threshold in seconds (0 to disable)"
    )]
    pub staging_ttl_secs: u64,
}
