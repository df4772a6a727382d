#![forbid(unsafe_code)]

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use pachat_domain::UserId;
use pachat_util::endpoint::BackendUrl;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::{BackendError, SecretString, error_message};

/// Signed-in user as reported by the auth service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthUser {
	pub id: UserId,
	#[serde(default)]
	pub email: Option<String>,
	#[serde(default)]
	pub user_metadata: serde_json::Value,
}

impl AuthUser {
	/// Name from sign-up metadata, falling back to the email local part.
	pub fn display_name(&self) -> String {
		for key in ["name", "full_name", "user_name", "preferred_username"] {
			if let Some(v) = self.user_metadata.get(key).and_then(|v| v.as_str())
				&& !v.trim().is_empty()
			{
				return v.trim().to_string();
			}
		}
		self.email
			.as_deref()
			.and_then(|e| e.split('@').next())
			.filter(|s| !s.is_empty())
			.unwrap_or("anonymous")
			.to_string()
	}

	/// Avatar URL from OAuth/sign-up metadata, if any.
	pub fn avatar_url(&self) -> Option<String> {
		self.user_metadata
			.get("avatar_url")
			.and_then(|v| v.as_str())
			.filter(|s| !s.trim().is_empty())
			.map(str::to_string)
	}
}

/// Tokens for a signed-in user.
#[derive(Debug, Clone)]
pub struct AuthSession {
	pub access_token: SecretString,
	pub refresh_token: SecretString,
	/// Unix seconds.
	pub expires_at: i64,
	pub user: AuthUser,
}

impl AuthSession {
	/// True when the access token expires within `skew_secs` of `now_unix`.
	pub fn needs_refresh(&self, now_unix: i64, skew_secs: i64) -> bool {
		self.expires_at.saturating_sub(skew_secs) <= now_unix
	}
}

/// Result of a sign-up request.
#[derive(Debug, Clone)]
pub enum SignUpOutcome {
	SignedIn(Box<AuthSession>),
	/// Project requires email confirmation before the first sign-in.
	ConfirmationRequired { user: AuthUser },
}

/// Claims read from an access token without verifying it.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TokenClaims {
	pub sub: String,
	#[serde(default)]
	pub exp: Option<i64>,
}

/// Decode the payload segment of a JWT. Signature checks belong to the platform.
pub fn peek_claims(token: &str) -> Option<TokenClaims> {
	let payload = token.split('.').nth(1)?;
	let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
	serde_json::from_slice(&bytes).ok()
}

#[derive(Debug, Clone)]
pub struct AuthClient {
	url: BackendUrl,
	api_key: SecretString,
	client: reqwest::Client,
}

impl AuthClient {
	pub fn new(url: BackendUrl, api_key: SecretString, client: reqwest::Client) -> Self {
		Self { url, api_key, client }
	}

	pub async fn sign_in_with_password(&self, email: &str, password: &str) -> Result<AuthSession, BackendError> {
		let body = serde_json::json!({ "email": email.trim(), "password": password });
		let resp = self
			.client
			.post(self.url.auth_url("token?grant_type=password"))
			.header("apikey", self.api_key.expose())
			.json(&body)
			.send()
			.await?;

		let token: TokenResponse = read_auth_json(resp).await?;
		let session = token.into_session()?;
		info!(user_id = %session.user.id, "signed in");
		Ok(session)
	}

	pub async fn sign_up(&self, email: &str, password: &str, display_name: &str) -> Result<SignUpOutcome, BackendError> {
		let body = serde_json::json!({
			"email": email.trim(),
			"password": password,
			"data": { "name": display_name.trim() },
		});
		let resp = self
			.client
			.post(self.url.auth_url("signup"))
			.header("apikey", self.api_key.expose())
			.json(&body)
			.send()
			.await?;

		let value: serde_json::Value = read_auth_json(resp).await?;
		parse_sign_up(value)
	}

	pub async fn refresh(&self, refresh_token: &SecretString) -> Result<AuthSession, BackendError> {
		let body = serde_json::json!({ "refresh_token": refresh_token.expose() });
		let resp = self
			.client
			.post(self.url.auth_url("token?grant_type=refresh_token"))
			.header("apikey", self.api_key.expose())
			.json(&body)
			.send()
			.await?;

		let token: TokenResponse = read_auth_json(resp).await?;
		let session = token.into_session()?;
		debug!(user_id = %session.user.id, expires_at = session.expires_at, "refreshed session");
		Ok(session)
	}

	/// Resolve the user owning `access_token`.
	pub async fn current_user(&self, access_token: &SecretString) -> Result<AuthUser, BackendError> {
		let resp = self
			.client
			.get(self.url.auth_url("user"))
			.header("apikey", self.api_key.expose())
			.bearer_auth(access_token.expose())
			.send()
			.await?;

		read_auth_json(resp).await
	}

	pub async fn sign_out(&self, access_token: &SecretString) -> Result<(), BackendError> {
		let resp = self
			.client
			.post(self.url.auth_url("logout"))
			.header("apikey", self.api_key.expose())
			.bearer_auth(access_token.expose())
			.send()
			.await?;

		match resp.status() {
			s if s.is_success() => Ok(()),
			// Already-expired sessions are signed out as far as we care.
			StatusCode::UNAUTHORIZED | StatusCode::NOT_FOUND => Ok(()),
			status => {
				let body = resp.text().await.unwrap_or_default();
				Err(BackendError::Status {
					status: status.as_u16(),
					message: error_message(&body),
				})
			}
		}
	}
}

async fn read_auth_json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T, BackendError> {
	let status = resp.status();
	let body = resp.text().await?;
	if !status.is_success() {
		return Err(match status {
			StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED | StatusCode::UNPROCESSABLE_ENTITY => {
				BackendError::Auth(error_message(&body))
			}
			_ => BackendError::Status {
				status: status.as_u16(),
				message: error_message(&body),
			},
		});
	}
	serde_json::from_str(&body).map_err(|e| BackendError::Decode(e.to_string()))
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
	access_token: String,
	refresh_token: String,
	#[serde(default)]
	expires_in: Option<i64>,
	#[serde(default)]
	expires_at: Option<i64>,
	user: AuthUser,
}

impl TokenResponse {
	fn into_session(self) -> Result<AuthSession, BackendError> {
		if self.access_token.trim().is_empty() {
			return Err(BackendError::Auth("empty access token".to_string()));
		}
		let now = pachat_util::time::unix_ms_now() / 1000;
		let expires_at = self
			.expires_at
			.or_else(|| self.expires_in.map(|s| now + s))
			.or_else(|| peek_claims(&self.access_token).and_then(|c| c.exp))
			.unwrap_or(now + 3600);
		Ok(AuthSession {
			access_token: SecretString::new(self.access_token),
			refresh_token: SecretString::new(self.refresh_token),
			expires_at,
			user: self.user,
		})
	}
}

fn parse_sign_up(value: serde_json::Value) -> Result<SignUpOutcome, BackendError> {
	if value.get("access_token").and_then(|v| v.as_str()).is_some() {
		let token: TokenResponse = serde_json::from_value(value).map_err(|e| BackendError::Decode(e.to_string()))?;
		return Ok(SignUpOutcome::SignedIn(Box::new(token.into_session()?)));
	}

	let user_value = value.get("user").cloned().unwrap_or(value);
	let user: AuthUser = serde_json::from_value(user_value).map_err(|e| BackendError::Decode(e.to_string()))?;
	Ok(SignUpOutcome::ConfirmationRequired { user })
}
