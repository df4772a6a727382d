#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context as _, anyhow};
use pachat_backend::SecretString;
use pachat_backend::auth::{AuthClient, AuthSession, AuthUser};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

/// Refresh this many seconds before the access token expires.
pub const REFRESH_SKEW_SECS: i64 = 60;

pub fn session_dir() -> PathBuf {
	if let Some(cfg) = dirs::config_dir() {
		return cfg.join("pachat");
	}

	if let Some(home) = dirs::home_dir() {
		return home.join(".config").join("pachat");
	}

	PathBuf::from(".").join("pachat")
}

pub fn default_session_path() -> PathBuf {
	session_dir().join("session.json")
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredSession {
	access_token: String,
	refresh_token: String,
	expires_at: i64,
	user: AuthUser,
}

/// Signed-in session persisted between CLI runs.
#[derive(Debug, Clone)]
pub struct SessionStore {
	path: PathBuf,
}

impl SessionStore {
	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self { path: path.into() }
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	pub fn load(&self) -> anyhow::Result<Option<AuthSession>> {
		let data = match fs::read_to_string(&self.path) {
			Ok(d) => d,
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
			Err(e) => return Err(anyhow!(e).context(format!("read {}", self.path.display()))),
		};

		let stored: StoredSession =
			serde_json::from_str(&data).with_context(|| format!("parse {}", self.path.display()))?;
		Ok(Some(AuthSession {
			access_token: SecretString::new(stored.access_token),
			refresh_token: SecretString::new(stored.refresh_token),
			expires_at: stored.expires_at,
			user: stored.user,
		}))
	}

	/// Write via a temp file and rename so a crash never leaves half a session.
	pub fn save(&self, session: &AuthSession) -> anyhow::Result<()> {
		if let Some(parent) = self.path.parent() {
			fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
		}

		let stored = StoredSession {
			access_token: session.access_token.expose().to_string(),
			refresh_token: session.refresh_token.expose().to_string(),
			expires_at: session.expires_at,
			user: session.user.clone(),
		};
		let data = serde_json::to_string_pretty(&stored).context("serialize session")?;

		let tmp = self.path.with_extension("json.tmp");
		fs::write(&tmp, data).with_context(|| format!("write {}", tmp.display()))?;
		restrict_permissions(&tmp)?;
		fs::rename(&tmp, &self.path).with_context(|| format!("rename into {}", self.path.display()))?;

		debug!(path = %self.path.display(), user_id = %session.user.id, "session saved");
		Ok(())
	}

	pub fn clear(&self) -> anyhow::Result<()> {
		match fs::remove_file(&self.path) {
			Ok(()) => {
				info!(path = %self.path.display(), "session cleared");
				Ok(())
			}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
			Err(e) => Err(anyhow!(e).context(format!("remove {}", self.path.display()))),
		}
	}

	/// Load the stored session, refreshing it when the access token is about
	/// to expire. A session that cannot be refreshed is discarded.
	pub async fn restore(&self, auth: &AuthClient, now_unix: i64) -> anyhow::Result<Option<AuthSession>> {
		let Some(session) = self.load()? else {
			return Ok(None);
		};

		if !session.needs_refresh(now_unix, REFRESH_SKEW_SECS) {
			return Ok(Some(session));
		}

		match auth.refresh(&session.refresh_token).await {
			Ok(fresh) => {
				self.save(&fresh)?;
				info!(user_id = %fresh.user.id, "session refreshed");
				Ok(Some(fresh))
			}
			Err(e) => {
				warn!(error = %e, "stored session could not be refreshed; signing out");
				self.clear()?;
				Ok(None)
			}
		}
	}
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) -> anyhow::Result<()> {
	use std::os::unix::fs::PermissionsExt as _;
	fs::set_permissions(path, fs::Permissions::from_mode(0o600)).with_context(|| format!("chmod {}", path.display()))
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) -> anyhow::Result<()> {
	Ok(())
}
