#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use serde::Deserialize;
use tracing::info;

use crate::util::secret::SecretString;

/// Default config path: `~/.quadchat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".quadchat").join("config.toml"))
}

/// Load the server config from TOML and env overrides.
pub fn load_server_config_from_path(path: &Path) -> anyhow::Result<ServerConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ServerConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg);

	Ok(cfg)
}

/// Server config (v1).
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
	pub server: ServerSettings,
	pub auth: AuthSettings,
	pub persistence: PersistenceSettings,
}

#[derive(Debug, Clone, Default)]
pub struct ServerSettings {
	/// PEM-encoded certificate path for QUIC/TLS.
	pub tls_cert_path: Option<PathBuf>,
	/// PEM-encoded private key path for QUIC/TLS.
	pub tls_key_path: Option<PathBuf>,
	/// Optional metrics exporter bind address (host:port).
	pub metrics_bind: Option<String>,
	/// Optional health/readiness HTTP bind address (host:port).
	pub health_bind: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AuthSettings {
	/// HMAC secret for access tokens presented at handshake.
	pub access_secret: Option<SecretString>,
	/// HMAC secret for refresh tokens; distinct from the access secret.
	pub refresh_secret: Option<SecretString>,
	/// Lifetime of freshly issued access tokens.
	pub access_token_ttl: Duration,
}

impl Default for AuthSettings {
	fn default() -> Self {
		Self {
			access_secret: None,
			refresh_secret: None,
			access_token_ttl: Duration::from_secs(900),
		}
	}
}

#[derive(Debug, Clone)]
pub struct PersistenceSettings {
	/// Database URL (sqlite:).
	pub database_url: String,
}

impl Default for PersistenceSettings {
	fn default() -> Self {
		Self {
			database_url: "sqlite:quadchat.db?mode=rwc".to_string(),
		}
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	server: FileServerSettings,

	#[serde(default)]
	auth: FileAuthSettings,

	#[serde(default)]
	persistence: FilePersistenceSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileServerSettings {
	tls_cert_path: Option<String>,
	tls_key_path: Option<String>,
	metrics_bind: Option<String>,
	health_bind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileAuthSettings {
	access_secret: Option<String>,
	refresh_secret: Option<String>,
	access_token_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FilePersistenceSettings {
	database_url: Option<String>,
}

impl ServerConfig {
	fn from_file(file: FileConfig) -> Self {
		let defaults = AuthSettings::default();

		Self {
			server: ServerSettings {
				tls_cert_path: file.server.tls_cert_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				tls_key_path: file.server.tls_key_path.filter(|s| !s.trim().is_empty()).map(PathBuf::from),
				metrics_bind: file.server.metrics_bind.filter(|s| !s.trim().is_empty()),
				health_bind: file.server.health_bind.filter(|s| !s.trim().is_empty()),
			},
			auth: AuthSettings {
				access_secret: file.auth.access_secret.filter(|s| !s.trim().is_empty()).map(SecretString::new),
				refresh_secret: file
					.auth
					.refresh_secret
					.filter(|s| !s.trim().is_empty())
					.map(SecretString::new),
				access_token_ttl: file
					.auth
					.access_token_ttl_secs
					.filter(|v| *v > 0)
					.map(Duration::from_secs)
					.unwrap_or(defaults.access_token_ttl),
			},
			persistence: PersistenceSettings {
				database_url: file
					.persistence
					.database_url
					.filter(|s| !s.trim().is_empty())
					.unwrap_or_else(|| PersistenceSettings::default().database_url),
			},
		}
	}
}

fn read_toml_if_exists(path: &Path) -> anyhow::Result<Option<FileConfig>> {
	match fs::read_to_string(path) {
		Ok(s) => {
			let cfg: FileConfig = toml::from_str(&s).context("parse TOML")?;
			Ok(Some(cfg))
		}
		Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
		Err(e) => Err(anyhow!(e).context("read config file")),
	}
}

fn apply_env_overrides(cfg: &mut ServerConfig) {
	if let Ok(v) = std::env::var("QUADCHAT_SERVER_TLS_CERT") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_cert_path = Some(PathBuf::from(v));
			info!("server config: tls_cert_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("QUADCHAT_SERVER_TLS_KEY") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.tls_key_path = Some(PathBuf::from(v));
			info!("server config: tls_key_path overridden by env");
		}
	}

	if let Ok(v) = std::env::var("QUADCHAT_METRICS_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.metrics_bind = Some(v);
			info!("server config: metrics_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("QUADCHAT_HEALTH_BIND") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.server.health_bind = Some(v);
			info!("server config: health_bind overridden by env");
		}
	}

	if let Ok(v) = std::env::var("QUADCHAT_AUTH_ACCESS_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.access_secret = Some(SecretString::new(v));
			info!("auth config: access_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("QUADCHAT_AUTH_REFRESH_SECRET") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.auth.refresh_secret = Some(SecretString::new(v));
			info!("auth config: refresh_secret overridden by env");
		}
	}

	if let Ok(v) = std::env::var("QUADCHAT_AUTH_ACCESS_TOKEN_TTL_SECS")
		&& let Ok(secs) = v.trim().parse::<u64>()
		&& secs > 0
	{
		cfg.auth.access_token_ttl = Duration::from_secs(secs);
		info!(secs, "auth config: access_token_ttl overridden by env");
	}

	if let Ok(v) = std::env::var("QUADCHAT_DATABASE_URL") {
		let v = v.trim().to_string();
		if !v.is_empty() {
			cfg.persistence.database_url = v;
			info!("persistence: database_url overridden by env");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn empty_file_values_fall_back_to_defaults() {
		let file: FileConfig = toml::from_str(
			r#"
			[auth]
			access_secret = "  "
			access_token_ttl_secs = 0

			[persistence]
			database_url = ""
			"#,
		)
		.unwrap();

		let cfg = ServerConfig::from_file(file);
		assert!(cfg.auth.access_secret.is_none());
		assert_eq!(cfg.auth.access_token_ttl, Duration::from_secs(900));
		assert_eq!(cfg.persistence.database_url, "sqlite:quadchat.db?mode=rwc");
	}

	#[test]
	fn file_values_are_picked_up() {
		let file: FileConfig = toml::from_str(
			r#"
			[server]
			metrics_bind = "127.0.0.1:9100"

			[auth]
			access_secret = "a"
			refresh_secret = "r"
			access_token_ttl_secs = 60
			"#,
		)
		.unwrap();

		let cfg = ServerConfig::from_file(file);
		assert_eq!(cfg.server.metrics_bind.as_deref(), Some("127.0.0.1:9100"));
		assert_eq!(cfg.auth.access_secret.unwrap().expose(), "a");
		assert_eq!(cfg.auth.refresh_secret.unwrap().expose(), "r");
		assert_eq!(cfg.auth.access_token_ttl, Duration::from_secs(60));
	}
}
