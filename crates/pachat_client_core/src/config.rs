#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context as _, anyhow};
use pachat_backend::{BackendConfig, SecretString};
use pachat_util::endpoint::{BackendUrl, validate_backend_url};
use serde::Deserialize;
use tracing::{info, warn};

use crate::error::ClientCoreError;

pub const DEFAULT_PAGE_SIZE: usize = 50;
pub const MAX_PAGE_SIZE: usize = 1000;
pub const DEFAULT_ROOMS_REFRESH_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Default config path: `~/.pachat/config.toml`.
pub fn default_config_path() -> anyhow::Result<PathBuf> {
	let home = dirs::home_dir().ok_or_else(|| anyhow!("could not determine home directory"))?;
	Ok(home.join(".pachat").join("config.toml"))
}

/// Load the client config from TOML and env overrides.
pub fn load_client_config() -> anyhow::Result<ClientConfig> {
	let path = default_config_path()?;
	load_client_config_from_path(&path)
}

/// Same as `load_client_config` but with an explicit config path.
pub fn load_client_config_from_path(path: &Path) -> anyhow::Result<ClientConfig> {
	let file_cfg = read_toml_if_exists(path)
		.with_context(|| format!("read config from {}", path.display()))?
		.unwrap_or_default();

	let mut cfg = ClientConfig::from_file(file_cfg);

	apply_env_overrides(&mut cfg, |key| std::env::var(key).ok());

	cfg.validate()?;
	Ok(cfg)
}

/// Client config (v1).
#[derive(Debug, Clone)]
pub struct ClientConfig {
	/// Project base URL (`https://<project>.example.co`).
	pub backend_url: Option<String>,
	/// Public API key.
	pub anon_key: Option<SecretString>,
	/// Privileged key for room administration. Optional; without it room
	/// admin writes go out with the user's own token.
	pub service_role_key: Option<SecretString>,
	/// History page size for chat timelines.
	pub page_size: usize,
	/// Delay before refetching the room list after a membership change.
	pub rooms_refresh_delay: Duration,
	pub request_timeout: Duration,
}

impl Default for ClientConfig {
	fn default() -> Self {
		Self {
			backend_url: None,
			anon_key: None,
			service_role_key: None,
			page_size: DEFAULT_PAGE_SIZE,
			rooms_refresh_delay: DEFAULT_ROOMS_REFRESH_DELAY,
			request_timeout: DEFAULT_REQUEST_TIMEOUT,
		}
	}
}

impl ClientConfig {
	fn from_file(file: FileConfig) -> Self {
		Self {
			backend_url: file.backend.url.filter(|s| !s.trim().is_empty()),
			anon_key: file
				.backend
				.anon_key
				.map(SecretString::new)
				.filter(|k| !k.is_blank()),
			service_role_key: file
				.backend
				.service_role_key
				.map(SecretString::new)
				.filter(|k| !k.is_blank()),
			page_size: file.chat.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
			rooms_refresh_delay: file
				.chat
				.rooms_refresh_delay_ms
				.map(Duration::from_millis)
				.unwrap_or(DEFAULT_ROOMS_REFRESH_DELAY),
			request_timeout: file
				.backend
				.request_timeout_ms
				.filter(|ms| *ms > 0)
				.map(Duration::from_millis)
				.unwrap_or(DEFAULT_REQUEST_TIMEOUT),
		}
	}

	/// Check the backend URL and clamp the page size.
	pub fn validate(&mut self) -> anyhow::Result<()> {
		if let Some(url) = self.backend_url.as_deref() {
			validate_backend_url(url).map_err(|e| anyhow!(e))?;
		}

		if self.page_size == 0 {
			warn!(default = DEFAULT_PAGE_SIZE, "page_size must be positive; using default");
			self.page_size = DEFAULT_PAGE_SIZE;
		} else if self.page_size > MAX_PAGE_SIZE {
			warn!(page_size = self.page_size, max = MAX_PAGE_SIZE, "page_size too large; clamping");
			self.page_size = MAX_PAGE_SIZE;
		}
		Ok(())
	}

	/// Connection settings for [`pachat_backend::Backend`]. Fails when the URL
	/// or anon key is missing.
	pub fn backend_config(&self) -> Result<BackendConfig, ClientCoreError> {
		let url = self.backend_url.as_deref().ok_or_else(|| {
			ClientCoreError::Config("backend url not set (backend.url or PACHAT_BACKEND_URL)".to_string())
		})?;
		let url = BackendUrl::parse(url).map_err(ClientCoreError::Config)?;
		let anon_key = self
			.anon_key
			.clone()
			.ok_or_else(|| ClientCoreError::Config("anon key not set (backend.anon_key or PACHAT_ANON_KEY)".to_string()))?;

		Ok(BackendConfig {
			url,
			anon_key,
			service_role_key: self.service_role_key.clone(),
			request_timeout: self.request_timeout,
		})
	}
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileConfig {
	#[serde(default)]
	backend: FileBackendSettings,

	#[serde(default)]
	chat: FileChatSettings,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileBackendSettings {
	url: Option<String>,
	anon_key: Option<String>,
	service_role_key: Option<String>,
	request_timeout_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
struct FileChatSettings {
	page_size: Option<usize>,
	rooms_refresh_delay_ms: Option<u64>,
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

fn apply_env_overrides(cfg: &mut ClientConfig, env: impl Fn(&str) -> Option<String>) {
	let var = |key: &str| env(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

	if let Some(v) = var("PACHAT_BACKEND_URL") {
		cfg.backend_url = Some(v);
		info!("backend config: url overridden by env");
	}

	if let Some(v) = var("PACHAT_ANON_KEY") {
		cfg.anon_key = Some(SecretString::new(v));
		info!("backend config: anon_key overridden by env");
	}

	if let Some(v) = var("PACHAT_SERVICE_ROLE_KEY") {
		cfg.service_role_key = Some(SecretString::new(v));
		info!("backend config: service_role_key overridden by env");
	}

	if let Some(v) = var("PACHAT_REQUEST_TIMEOUT_MS")
		&& let Ok(ms) = v.parse::<u64>()
		&& ms > 0
	{
		cfg.request_timeout = Duration::from_millis(ms);
		info!(ms, "backend config: request_timeout overridden by env");
	}

	if let Some(v) = var("PACHAT_PAGE_SIZE")
		&& let Ok(page_size) = v.parse::<usize>()
	{
		cfg.page_size = page_size;
		info!(page_size, "chat config: page_size overridden by env");
	}

	if let Some(v) = var("PACHAT_ROOMS_REFRESH_DELAY_MS")
		&& let Ok(ms) = v.parse::<u64>()
	{
		cfg.rooms_refresh_delay = Duration::from_millis(ms);
		info!(ms, "chat config: rooms_refresh_delay overridden by env");
	}
}
