#![forbid(unsafe_code)]

pub mod endpoint {
	use url::Url;

	/// Parsed backend project URL (`https://<project>.example.co`).
	#[derive(Debug, Clone, PartialEq, Eq)]
	pub struct BackendUrl {
		base: Url,
	}

	impl BackendUrl {
		/// Parse an `http(s)://host[:port][/prefix]` base URL.
		pub fn parse(s: &str) -> Result<Self, String> {
			let s = s.trim();
			if s.is_empty() {
				return Err("backend url must be non-empty (expected https://host)".to_string());
			}

			let mut base = Url::parse(s).map_err(|e| format!("invalid backend url {s}: {e}"))?;

			match base.scheme() {
				"http" | "https" => {}
				other => {
					return Err(format!("invalid backend url scheme {other} (expected http or https): {s}"));
				}
			}

			if base.host_str().map(str::is_empty).unwrap_or(true) {
				return Err(format!("invalid backend url (missing host): {s}"));
			}

			if base.query().is_some() || base.fragment().is_some() {
				return Err(format!("invalid backend url (query/fragment not allowed): {s}"));
			}

			if !base.username().is_empty() || base.password().is_some() {
				return Err(format!("invalid backend url (credentials not allowed): {s}"));
			}

			let path = base.path().trim_end_matches('/').to_string();
			base.set_path(&path);

			Ok(Self { base })
		}

		/// Base URL without a trailing slash.
		pub fn as_str(&self) -> &str {
			self.base.as_str().trim_end_matches('/')
		}

		pub fn is_secure(&self) -> bool {
			self.base.scheme() == "https"
		}

		/// `<base>/rest/v1/<table>`.
		pub fn rest_url(&self, table: &str) -> String {
			format!("{}/rest/v1/{}", self.as_str(), table.trim_matches('/'))
		}

		/// `<base>/auth/v1/<path>`.
		pub fn auth_url(&self, path: &str) -> String {
			format!("{}/auth/v1/{}", self.as_str(), path.trim_start_matches('/'))
		}

		/// Realtime websocket endpoint: `ws(s)://<host>/realtime/v1/websocket?apikey=..&vsn=1.0.0`.
		pub fn realtime_websocket_url(&self, api_key: &str) -> String {
			let mut ws = self.base.clone();
			// Only http/https reach here, and both have a websocket counterpart.
			let _ = ws.set_scheme(if self.is_secure() { "wss" } else { "ws" });
			let path = format!("{}/realtime/v1/websocket", ws.path().trim_end_matches('/'));
			ws.set_path(&path);
			ws.query_pairs_mut()
				.append_pair("apikey", api_key)
				.append_pair("vsn", "1.0.0");
			ws.to_string()
		}
	}

	/// Validate a backend base URL.
	pub fn validate_backend_url(s: &str) -> Result<(), String> {
		let _ = BackendUrl::parse(s)?;
		Ok(())
	}

}

pub mod time {
	use std::time::{Duration, SystemTime, UNIX_EPOCH};

	/// Current Unix time in milliseconds.
	#[inline]
	pub fn unix_ms_now() -> i64 {
		SystemTime::now()
			.duration_since(UNIX_EPOCH)
			.unwrap_or(Duration::from_secs(0))
			.as_millis() as i64
	}
}
