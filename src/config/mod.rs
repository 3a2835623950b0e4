// siterestore/src/config/mod.rs
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const MIN_SPEED: u32 = 2;
pub const MAX_SPEED: u32 = 25;
const DEFAULT_SPEED: u32 = 10;
const DEFAULT_FTP_PORT: u16 = 21;
const DEFAULT_SFTP_PORT: u16 = 22;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_INVOCATION_BUDGET_SECS: u64 = 60;
const DEFAULT_RECONNECT_DELAY_MS: u64 = 2000;
const DEFAULT_STATE_DIR: &str = "./restore-state";
const DEFAULT_TEMP_ROOT: &str = "./restore-tmp";

// Structs for deserializing config.json
#[derive(Debug, Clone, Deserialize)]
pub struct JsonS3StorageConfig {
    pub bucket_name: Option<String>,
    pub region: Option<String>,
    pub access_key_id: Option<String>,
    pub secret_access_key: Option<String>,
    pub endpoint_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JsonInstallationConfig {
    pub method: Option<String>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub private_key_path: Option<PathBuf>,
    pub path: Option<String>,
    pub sftp_backend: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub host_key_sha256: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawJsonConfig {
    pub installation: Option<JsonInstallationConfig>,
    pub database_url: Option<String>,
    pub speed: Option<u32>,
    pub state_dir: Option<PathBuf>,
    pub temp_root: Option<PathBuf>,
    pub memory_limit_mb: Option<u64>,
    pub invocation_budget_secs: Option<u64>,
    pub reconnect_delay_ms: Option<u64>,
    pub s3_storage: Option<JsonS3StorageConfig>,
}

/// How the installation target is reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMethod {
    Local,
    Ftp,
    Sftp,
}

/// Which SFTP client to use. `Auto` probes the native libssh2 client first and
/// falls back to the pure-Rust client when the handshake cannot be completed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SftpBackend {
    Auto,
    Native,
    Library,
}

#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub method: TransportMethod,
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub private_key_path: Option<PathBuf>,
    /// Target root. Absolute on the server for ftp/sftp, a local directory for local.
    pub root_path: String,
    pub sftp_backend: SftpBackend,
    pub connect_timeout: Duration,
    /// Pinned SHA-256 digest of the SSH host key, lowercase hex.
    pub host_key_sha256: Option<String>,
}

impl ConnectionConfig {
    /// Convenience constructor for a local-filesystem target.
    pub fn local(root: impl Into<PathBuf>) -> Self {
        ConnectionConfig {
            method: TransportMethod::Local,
            host: String::new(),
            port: 0,
            username: String::new(),
            password: None,
            private_key_path: None,
            root_path: root.into().to_string_lossy().to_string(),
            sftp_backend: SftpBackend::Auto,
            connect_timeout: Duration::from_secs(DEFAULT_CONNECT_TIMEOUT_SECS),
            host_key_sha256: None,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

// Application's internal configuration structs
#[derive(Debug, Clone)]
pub struct SpacesConfig {
    pub endpoint_url: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub connection: ConnectionConfig,
    pub database_url: Option<String>,
    pub speed: u32,
    pub state_dir: PathBuf,
    pub temp_root: PathBuf,
    pub memory_limit_bytes: Option<u64>,
    pub invocation_budget: Duration,
    pub reconnect_delay: Duration,
    pub spaces_config: Option<SpacesConfig>,
}

impl AppConfig {
    /// Reads `config.json`, applies `.env`/environment overrides and validates.
    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        dotenv::dotenv().ok();

        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        let mut raw_json_config: RawJsonConfig = serde_json::from_str(&config_content)
            .with_context(|| {
                format!(
                    "Failed to parse JSON from config file at {}",
                    config_path.display()
                )
            })?;

        apply_env_overrides(&mut raw_json_config)?;
        Self::from_raw(raw_json_config)
    }

    pub fn from_raw(raw: RawJsonConfig) -> Result<Self> {
        let installation = raw
            .installation
            .as_ref()
            .context("installation must be set in config.json")?;
        let connection = load_connection_config(installation)?;

        let database_url = match raw.database_url.as_ref().filter(|s| !s.trim().is_empty()) {
            Some(db_url) => {
                get_db_name_from_url(db_url)?;
                Some(db_url.clone())
            }
            None => None,
        };

        let spaces_config = raw.s3_storage.as_ref().and_then(|s3_raw| {
            if let (Some(bucket), Some(region), Some(key_id), Some(secret), Some(endpoint)) = (
                s3_raw.bucket_name.as_ref().filter(|s| !s.is_empty()),
                s3_raw.region.as_ref().filter(|s| !s.is_empty()),
                s3_raw.access_key_id.as_ref().filter(|s| !s.is_empty()),
                s3_raw.secret_access_key.as_ref().filter(|s| !s.is_empty()),
                s3_raw.endpoint_url.as_ref().filter(|s| !s.is_empty()),
            ) {
                Some(SpacesConfig {
                    bucket_name: bucket.clone(),
                    region: region.clone(),
                    access_key_id: key_id.clone(),
                    secret_access_key: secret.clone(),
                    endpoint_url: endpoint.clone(),
                })
            } else {
                log::warn!(
                    "s3_storage is present in config.json but incomplete; s3:// archive sources are disabled"
                );
                None
            }
        });

        Ok(AppConfig {
            connection,
            database_url,
            speed: clamp_speed(raw.speed.unwrap_or(DEFAULT_SPEED)),
            state_dir: raw.state_dir.unwrap_or_else(|| PathBuf::from(DEFAULT_STATE_DIR)),
            temp_root: raw.temp_root.unwrap_or_else(|| PathBuf::from(DEFAULT_TEMP_ROOT)),
            memory_limit_bytes: raw
                .memory_limit_mb
                .filter(|mb| *mb > 0)
                .map(|mb| mb * 1024 * 1024),
            invocation_budget: Duration::from_secs(
                raw.invocation_budget_secs
                    .unwrap_or(DEFAULT_INVOCATION_BUDGET_SECS),
            ),
            reconnect_delay: Duration::from_millis(
                raw.reconnect_delay_ms.unwrap_or(DEFAULT_RECONNECT_DELAY_MS),
            ),
            spaces_config,
        })
    }
}

pub fn clamp_speed(speed: u32) -> u32 {
    speed.clamp(MIN_SPEED, MAX_SPEED)
}

fn apply_env_overrides(raw: &mut RawJsonConfig) -> Result<()> {
    if let Ok(db_url) = env::var("RESTORE_DATABASE_URL") {
        raw.database_url = Some(db_url);
    }
    if let Ok(password) = env::var("RESTORE_INSTALL_PASSWORD") {
        if let Some(installation) = raw.installation.as_mut() {
            installation.password = Some(password);
        }
    }
    if let Ok(speed) = env::var("RESTORE_SPEED") {
        let speed: u32 = speed
            .trim()
            .parse()
            .with_context(|| format!("RESTORE_SPEED must be an integer, got '{}'", speed))?;
        raw.speed = Some(speed);
    }
    Ok(())
}

fn parse_method(method: &str) -> Result<TransportMethod> {
    match method.trim().to_ascii_lowercase().as_str() {
        "local" => Ok(TransportMethod::Local),
        "ftp" => Ok(TransportMethod::Ftp),
        "sftp" => Ok(TransportMethod::Sftp),
        other => Err(anyhow::anyhow!(
            "installation.method must be one of ftp, sftp, local (got '{}')",
            other
        )),
    }
}

fn parse_sftp_backend(backend: Option<&str>) -> Result<SftpBackend> {
    match backend.map(|b| b.trim().to_ascii_lowercase()).as_deref() {
        None | Some("") | Some("auto") => Ok(SftpBackend::Auto),
        Some("native") => Ok(SftpBackend::Native),
        Some("library") => Ok(SftpBackend::Library),
        Some(other) => Err(anyhow::anyhow!(
            "installation.sftp_backend must be auto, native or library (got '{}')",
            other
        )),
    }
}

pub fn load_connection_config(installation: &JsonInstallationConfig) -> Result<ConnectionConfig> {
    let method = parse_method(
        installation
            .method
            .as_deref()
            .context("installation.method must be set in config.json")?,
    )?;

    let root_path = installation
        .path
        .clone()
        .filter(|p| !p.trim().is_empty())
        .context("installation.path must be set in config.json")?;

    let connect_timeout = Duration::from_secs(
        installation
            .connect_timeout_secs
            .unwrap_or(DEFAULT_CONNECT_TIMEOUT_SECS),
    );

    if method == TransportMethod::Local {
        let mut connection = ConnectionConfig::local(root_path);
        connection.connect_timeout = connect_timeout;
        return Ok(connection);
    }

    let host = installation
        .host
        .clone()
        .filter(|h| !h.trim().is_empty())
        .context("installation.host must be set for ftp/sftp targets")?;
    let username = installation
        .username
        .clone()
        .filter(|u| !u.trim().is_empty())
        .context("installation.username must be set for ftp/sftp targets")?;
    let password = installation.password.clone().filter(|p| !p.is_empty());

    if method == TransportMethod::Ftp && password.is_none() {
        return Err(anyhow::anyhow!(
            "installation.password must be set for ftp targets"
        ));
    }
    if method == TransportMethod::Sftp
        && password.is_none()
        && installation.private_key_path.is_none()
    {
        return Err(anyhow::anyhow!(
            "sftp targets need installation.password or installation.private_key_path"
        ));
    }

    let port = installation.port.unwrap_or(match method {
        TransportMethod::Ftp => DEFAULT_FTP_PORT,
        _ => DEFAULT_SFTP_PORT,
    });

    Ok(ConnectionConfig {
        method,
        host,
        port,
        username,
        password,
        private_key_path: installation.private_key_path.clone(),
        root_path,
        sftp_backend: parse_sftp_backend(installation.sftp_backend.as_deref())?,
        connect_timeout,
        host_key_sha256: installation
            .host_key_sha256
            .as_deref()
            .map(parse_host_key_digest)
            .transpose()?,
    })
}

/// Accepts plain hex or colon-separated byte pairs.
fn parse_host_key_digest(value: &str) -> Result<String> {
    let digest: String = value
        .chars()
        .filter(|c| *c != ':' && !c.is_whitespace())
        .collect::<String>()
        .to_lowercase();
    if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(anyhow::anyhow!(
            "installation.host_key_sha256 must be a SHA-256 digest in hex (got '{}')",
            value
        ));
    }
    Ok(digest)
}

/// Extracts the database name from a MySQL connection URL.
pub fn get_db_name_from_url(db_url: &str) -> Result<String> {
    let parsed_url =
        Url::parse(db_url).with_context(|| format!("Invalid database URL format: {}", db_url))?;
    if parsed_url.scheme() != "mysql" && parsed_url.scheme() != "mariadb" {
        return Err(anyhow::anyhow!(
            "Database URL must use the mysql:// scheme: {}",
            db_url
        ));
    }
    let path = parsed_url.path().trim_start_matches('/');
    if path.is_empty() {
        Err(anyhow::anyhow!("Database name not found in URL path: {}", db_url))
    } else {
        Ok(path.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw_from(value: serde_json::Value) -> RawJsonConfig {
        serde_json::from_value(value).expect("valid raw config")
    }

    #[test]
    fn test_local_installation_defaults() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw_from(json!({
            "installation": { "method": "local", "path": "/var/www/site" }
        })))?;

        assert_eq!(config.connection.method, TransportMethod::Local);
        assert_eq!(config.connection.root_path, "/var/www/site");
        assert_eq!(config.speed, DEFAULT_SPEED);
        assert!(config.database_url.is_none());
        assert!(config.spaces_config.is_none());
        Ok(())
    }

    #[test]
    fn test_ftp_installation_requires_password() {
        let result = AppConfig::from_raw(raw_from(json!({
            "installation": {
                "method": "ftp",
                "host": "ftp.example.com",
                "username": "deploy",
                "path": "/public_html"
            }
        })));
        assert!(result.is_err());
    }

    #[test]
    fn test_sftp_defaults_port_and_backend() -> anyhow::Result<()> {
        let config = AppConfig::from_raw(raw_from(json!({
            "installation": {
                "method": "SFTP",
                "host": "ssh.example.com",
                "username": "deploy",
                "password": "secret",
                "path": "/srv/site"
            },
            "database_url": "mysql://root:pw@localhost:3306/site",
            "speed": 99
        })))?;

        assert_eq!(config.connection.method, TransportMethod::Sftp);
        assert_eq!(config.connection.port, 22);
        assert_eq!(config.connection.sftp_backend, SftpBackend::Auto);
        assert_eq!(config.speed, MAX_SPEED);
        assert_eq!(config.database_url.as_deref(), Some("mysql://root:pw@localhost:3306/site"));
        Ok(())
    }

    #[test]
    fn test_invalid_method_and_backend_are_rejected() {
        assert!(parse_method("smb").is_err());
        assert!(parse_sftp_backend(Some("openssh")).is_err());
        assert_eq!(parse_sftp_backend(Some("library")).unwrap(), SftpBackend::Library);
    }

    #[test]
    fn test_host_key_digest_is_normalized() -> anyhow::Result<()> {
        let hex_digest = "AB".repeat(32);
        assert_eq!(parse_host_key_digest(&hex_digest)?, "ab".repeat(32));
        let colons = vec!["0f"; 32].join(":");
        assert_eq!(parse_host_key_digest(&colons)?, "0f".repeat(32));
        assert!(parse_host_key_digest("SHA256:abc").is_err());
        Ok(())
    }

    #[test]
    fn test_db_name_from_url() -> anyhow::Result<()> {
        assert_eq!(get_db_name_from_url("mysql://u:p@db:3306/wordpress")?, "wordpress");
        assert!(get_db_name_from_url("mysql://u:p@db:3306/").is_err());
        assert!(get_db_name_from_url("postgres://u:p@db/app").is_err());
        Ok(())
    }

    #[test]
    fn test_speed_is_clamped() {
        assert_eq!(clamp_speed(0), MIN_SPEED);
        assert_eq!(clamp_speed(12), 12);
        assert_eq!(clamp_speed(100), MAX_SPEED);
    }
}
