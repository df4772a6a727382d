#![forbid(unsafe_code)]

//! Storage API client (PostgREST dialect).

use pachat_util::endpoint::BackendUrl;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::{BackendError, SecretString, error_message};

#[derive(Debug, Clone)]
pub struct RestClient {
	url: BackendUrl,
	api_key: SecretString,
	client: reqwest::Client,
}

impl RestClient {
	pub fn new(url: BackendUrl, api_key: SecretString, client: reqwest::Client) -> Self {
		Self { url, api_key, client }
	}

	/// Start a read query against `table`.
	pub fn from<'a>(&'a self, table: &str, bearer: &'a SecretString) -> Query<'a> {
		Query {
			rest: self,
			table: table.to_string(),
			bearer,
			params: Vec::new(),
		}
	}

	/// Insert one row and return its stored representation.
	pub async fn insert<B, T>(&self, table: &str, bearer: &SecretString, body: &B) -> Result<T, BackendError>
	where
		B: Serialize + ?Sized,
		T: DeserializeOwned,
	{
		let resp = self
			.client
			.post(self.url.rest_url(table))
			.header("apikey", self.api_key.expose())
			.bearer_auth(bearer.expose())
			.header("Prefer", "return=representation")
			.json(body)
			.send()
			.await?;

		let mut rows: Vec<T> = read_json(resp).await?;
		if rows.is_empty() {
			return Err(BackendError::Decode(format!("insert into {table} returned no rows")));
		}
		Ok(rows.swap_remove(0))
	}

	/// Insert without reading the row back (for tables the caller cannot select).
	pub async fn insert_minimal<B>(&self, table: &str, bearer: &SecretString, body: &B) -> Result<(), BackendError>
	where
		B: Serialize + ?Sized,
	{
		let resp = self
			.client
			.post(self.url.rest_url(table))
			.header("apikey", self.api_key.expose())
			.bearer_auth(bearer.expose())
			.header("Prefer", "return=minimal")
			.json(body)
			.send()
			.await?;

		check_status(resp).await.map(|_| ())
	}

	/// Delete rows matching every `column = value` filter.
	pub async fn delete(&self, table: &str, bearer: &SecretString, filters: &[(&str, &str)]) -> Result<(), BackendError> {
		if filters.is_empty() {
			return Err(BackendError::Decode(format!("refusing unfiltered delete on {table}")));
		}

		let mut url = parse_url(&self.url.rest_url(table))?;
		{
			let mut pairs = url.query_pairs_mut();
			for (column, value) in filters {
				pairs.append_pair(column, &format!("eq.{value}"));
			}
		}

		let resp = self
			.client
			.delete(url)
			.header("apikey", self.api_key.expose())
			.bearer_auth(bearer.expose())
			.send()
			.await?;

		check_status(resp).await.map(|_| ())
	}
}

/// Read query builder; mirrors the platform's filter grammar.
#[derive(Debug, Clone)]
pub struct Query<'a> {
	rest: &'a RestClient,
	table: String,
	bearer: &'a SecretString,
	params: Vec<(String, String)>,
}

impl<'a> Query<'a> {
	pub fn select(mut self, columns: &str) -> Self {
		self.params.push(("select".to_string(), columns.to_string()));
		self
	}

	pub fn eq(mut self, column: &str, value: impl std::fmt::Display) -> Self {
		self.params.push((column.to_string(), format!("eq.{value}")));
		self
	}

	pub fn is_true(mut self, column: &str) -> Self {
		self.params.push((column.to_string(), "is.true".to_string()));
		self
	}

	/// Logical OR of raw filter expressions, e.g. `created_at.lt."<ts>"`.
	pub fn or(mut self, expressions: &[String]) -> Self {
		self.params.push(("or".to_string(), format!("({})", expressions.join(","))));
		self
	}

	/// Append an ordering term; repeated calls add tie-breakers.
	pub fn order(mut self, column: &str, ascending: bool) -> Self {
		let term = format!("{column}.{}", if ascending { "asc" } else { "desc" });
		if let Some((_, existing)) = self.params.iter_mut().find(|(k, _)| k == "order") {
			existing.push(',');
			existing.push_str(&term);
		} else {
			self.params.push(("order".to_string(), term));
		}
		self
	}

	pub fn limit(mut self, n: usize) -> Self {
		self.params.retain(|(k, _)| k != "limit");
		self.params.push(("limit".to_string(), n.to_string()));
		self
	}

	/// Full request URL; exposed for logging and tests.
	pub fn url(&self) -> Result<url::Url, BackendError> {
		let mut url = parse_url(&self.rest.url.rest_url(&self.table))?;
		if !self.params.is_empty() {
			let mut pairs = url.query_pairs_mut();
			for (k, v) in &self.params {
				pairs.append_pair(k, v);
			}
		}
		Ok(url)
	}

	pub async fn fetch<T: DeserializeOwned>(self) -> Result<Vec<T>, BackendError> {
		let url = self.url()?;
		debug!(table = %self.table, query = url.query().unwrap_or(""), "rest select");

		let resp = self
			.rest
			.client
			.get(url)
			.header("apikey", self.rest.api_key.expose())
			.bearer_auth(self.bearer.expose())
			.send()
			.await?;

		read_json(resp).await
	}

	/// At most one row; zero rows is `None`.
	pub async fn fetch_optional<T: DeserializeOwned>(self) -> Result<Option<T>, BackendError> {
		let mut rows: Vec<T> = self.limit(1).fetch().await?;
		Ok(rows.pop())
	}
}

/// Quote a value for use inside `or=(...)` expressions.
pub fn quote_filter_value(v: &str) -> String {
	format!("\"{}\"", v.replace('\\', "\\\\").replace('"', "\\\""))
}

fn parse_url(s: &str) -> Result<url::Url, BackendError> {
	url::Url::parse(s).map_err(|e| BackendError::Http(format!("invalid url {s}: {e}")))
}

async fn check_status(resp: reqwest::Response) -> Result<String, BackendError> {
	let status = resp.status();
	let body = resp.text().await?;
	if !status.is_success() {
		return Err(BackendError::Status {
			status: status.as_u16(),
			message: error_message(&body),
		});
	}
	Ok(body)
}

async fn read_json<T: DeserializeOwned>(resp: reqwest::Response) -> Result<T, BackendError> {
	let body = check_status(resp).await?;
	serde_json::from_str(&body).map_err(|e| BackendError::Decode(e.to_string()))
}

#[cfg(test)]
mod tests {
	use super::*;

	fn client() -> RestClient {
		RestClient::new(
			BackendUrl::parse("http://localhost:54321").unwrap(),
			SecretString::new("anon"),
			reqwest::Client::new(),
		)
	}

	fn decoded_query(q: &Query<'_>) -> Vec<(String, String)> {
		q.url().unwrap().query_pairs().into_owned().collect()
	}

	#[test]
	fn builds_filtered_ordered_select() {
		let rest = client();
		let token = SecretString::new("jwt");
		let q = rest
			.from("chat_room", &token)
			.select("id, name, chat_room_member (count)")
			.is_true("is_public")
			.order("created_at", true)
			.limit(20);

		assert_eq!(q.url().unwrap().path(), "/rest/v1/chat_room");
		assert_eq!(
			decoded_query(&q),
			vec![
				("select".to_string(), "id, name, chat_room_member (count)".to_string()),
				("is_public".to_string(), "is.true".to_string()),
				("order".to_string(), "created_at.asc".to_string()),
				("limit".to_string(), "20".to_string()),
			]
		);
	}

	#[test]
	fn repeated_order_adds_tie_breaker_and_limit_replaces() {
		let rest = client();
		let token = SecretString::new("jwt");
		let q = rest
			.from("message", &token)
			.eq("chat_room_id", "r1")
			.order("created_at", false)
			.order("id", false)
			.limit(10)
			.limit(5);
		let pairs = decoded_query(&q);
		assert!(pairs.contains(&("order".to_string(), "created_at.desc,id.desc".to_string())));
		assert!(pairs.contains(&("chat_room_id".to_string(), "eq.r1".to_string())));
		assert_eq!(pairs.iter().filter(|(k, _)| k == "limit").count(), 1);
		assert!(pairs.contains(&("limit".to_string(), "5".to_string())));
	}

	#[test]
	fn or_expressions_are_grouped() {
		let rest = client();
		let token = SecretString::new("jwt");
		let ts = quote_filter_value("2025-01-01T00:00:00.000000Z");
		let q = rest.from("message", &token).or(&[
			format!("created_at.lt.{ts}"),
			format!("and(created_at.eq.{ts},id.lt.abc)"),
		]);
		let pairs = decoded_query(&q);
		assert_eq!(
			pairs[0].1,
			r#"(created_at.lt."2025-01-01T00:00:00.000000Z",and(created_at.eq."2025-01-01T00:00:00.000000Z",id.lt.abc))"#
		);
	}

	#[test]
	fn quoting_escapes_specials() {
		assert_eq!(quote_filter_value(r#"a"b\c"#), r#""a\"b\\c""#);
	}
}
