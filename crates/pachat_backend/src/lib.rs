#![forbid(unsafe_code)]

pub mod auth;
pub mod realtime;
pub mod rest;

use std::fmt;
use std::time::Duration;

use pachat_util::endpoint::BackendUrl;
use thiserror::Error;

use crate::auth::AuthClient;
use crate::realtime::{RealtimeClient, RealtimeConfig};
use crate::rest::RestClient;

/// Errors returned by the hosted-platform clients.
#[derive(Debug, Error)]
pub enum BackendError {
	/// Transport failure (DNS, TLS, timeout, connection reset).
	#[error("request failed: {0}")]
	Http(String),

	/// Non-success HTTP status with the platform's error message.
	#[error("backend returned {status}: {message}")]
	Status { status: u16, message: String },

	/// Response body did not match the expected shape.
	#[error("failed to decode response: {0}")]
	Decode(String),

	/// Auth endpoint rejected the request.
	#[error("auth failed: {0}")]
	Auth(String),

	/// Realtime socket/channel failure.
	#[error("realtime: {0}")]
	Realtime(String),
}

impl BackendError {
	pub fn status(&self) -> Option<u16> {
		match self {
			Self::Status { status, .. } => Some(*status),
			_ => None,
		}
	}

	/// Unique-constraint violations surface as 409.
	pub fn is_conflict(&self) -> bool {
		self.status() == Some(409)
	}

	pub fn is_unauthorized(&self) -> bool {
		matches!(self.status(), Some(401) | Some(403))
	}
}

impl From<reqwest::Error> for BackendError {
	fn from(e: reqwest::Error) -> Self {
		if e.is_decode() {
			BackendError::Decode(e.to_string())
		} else {
			BackendError::Http(e.to_string())
		}
	}
}

/// Pull a human-readable message out of an auth or storage error body.
pub(crate) fn error_message(body: &str) -> String {
	let Ok(v) = serde_json::from_str::<serde_json::Value>(body) else {
		return body.trim().chars().take(200).collect();
	};
	for key in ["msg", "message", "error_description", "error"] {
		if let Some(s) = v.get(key).and_then(|x| x.as_str())
			&& !s.trim().is_empty()
		{
			return s.to_string();
		}
	}
	body.trim().chars().take(200).collect()
}

/// Wrapper that redacts in logs.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretString(String);

impl SecretString {
	pub fn new(s: impl Into<String>) -> Self {
		Self(s.into())
	}

	/// Access the inner secret string.
	pub fn expose(&self) -> &str {
		&self.0
	}

	pub fn is_blank(&self) -> bool {
		self.0.trim().is_empty()
	}
}

impl fmt::Debug for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("SecretString(<redacted>)")
	}
}

impl fmt::Display for SecretString {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str("<redacted>")
	}
}

impl From<String> for SecretString {
	fn from(s: String) -> Self {
		Self(s)
	}
}

/// Connection settings for one hosted project.
#[derive(Debug, Clone)]
pub struct BackendConfig {
	pub url: BackendUrl,

	/// Public (anon) API key sent with every request.
	pub anon_key: SecretString,

	/// Privileged key for room administration; bypasses row-level security.
	pub service_role_key: Option<SecretString>,

	pub request_timeout: Duration,
}

/// Auth, storage and realtime clients sharing one HTTP pool.
#[derive(Debug, Clone)]
pub struct Backend {
	pub auth: AuthClient,
	pub rest: RestClient,
	cfg: BackendConfig,
}

impl Backend {
	pub fn new(cfg: BackendConfig) -> Result<Self, BackendError> {
		let client = reqwest::Client::builder()
			.timeout(cfg.request_timeout)
			.user_agent(concat!("pachat/", env!("CARGO_PKG_VERSION")))
			.build()?;

		Ok(Self {
			auth: AuthClient::new(cfg.url.clone(), cfg.anon_key.clone(), client.clone()),
			rest: RestClient::new(cfg.url.clone(), cfg.anon_key.clone(), client),
			cfg,
		})
	}

	pub fn config(&self) -> &BackendConfig {
		&self.cfg
	}

	/// Bearer used for privileged writes: the service-role key when configured,
	/// otherwise the caller's own token.
	pub fn admin_bearer<'a>(&'a self, user_token: &'a SecretString) -> &'a SecretString {
		self.cfg.service_role_key.as_ref().unwrap_or(user_token)
	}

	/// Start a realtime socket authenticated with `access_token`.
	pub fn realtime(&self, access_token: Option<SecretString>) -> RealtimeClient {
		let url = self.cfg.url.realtime_websocket_url(self.cfg.anon_key.expose());
		RealtimeClient::connect(RealtimeConfig {
			access_token,
			..RealtimeConfig::new(url)
		})
	}
}
