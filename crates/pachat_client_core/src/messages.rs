#![forbid(unsafe_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use pachat_backend::BackendError;
use pachat_backend::rest::{RestClient, quote_filter_value};
use pachat_domain::{Message, MessageId, NewMessage, RoomId, timestamp};
use tracing::debug;

use crate::TokenSource;

pub const MESSAGE_TABLE: &str = "message";

/// Columns selected for timeline rows, with the author profile embedded.
pub const MESSAGE_SELECT: &str = "id, chat_room_id, author_id, text, created_at, author:user_profile (id, name, image_url)";

/// Keyset position: the oldest confirmed message of a timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cursor {
	pub created_at: DateTime<Utc>,
	pub id: MessageId,
}

impl Cursor {
	pub fn of(message: &Message) -> Self {
		Self {
			created_at: message.created_at,
			id: message.id,
		}
	}

	/// Rows strictly older than this cursor under `(created_at, id)` order.
	pub fn older_than_filter(&self) -> Vec<String> {
		let ts = quote_filter_value(&timestamp::format(&self.created_at));
		vec![
			format!("created_at.lt.{ts}"),
			format!("and(created_at.eq.{ts},id.lt.{})", self.id),
		]
	}
}

/// Message persistence used by chat sessions.
#[async_trait]
pub trait MessageStore: Send + Sync {
	/// Up to `limit` messages of `room`, newest first, strictly older than
	/// `before` when given.
	async fn fetch_page(&self, room: &RoomId, before: Option<&Cursor>, limit: usize) -> Result<Vec<Message>, BackendError>;

	/// The stored row for `id`, if it is visible.
	async fn fetch_one(&self, room: &RoomId, id: MessageId) -> Result<Option<Message>, BackendError>;

	/// Store a message and return the stored row.
	async fn insert(&self, message: &NewMessage) -> Result<Message, BackendError>;
}

/// [`MessageStore`] over the storage API.
#[derive(Debug, Clone)]
pub struct RestMessageStore {
	rest: RestClient,
	token: TokenSource,
}

impl RestMessageStore {
	pub fn new(rest: RestClient, token: TokenSource) -> Self {
		Self { rest, token }
	}
}

#[async_trait]
impl MessageStore for RestMessageStore {
	async fn fetch_page(&self, room: &RoomId, before: Option<&Cursor>, limit: usize) -> Result<Vec<Message>, BackendError> {
		let token = self.token.borrow().clone();
		let mut query = self
			.rest
			.from(MESSAGE_TABLE, &token)
			.select(MESSAGE_SELECT)
			.eq("chat_room_id", room);

		if let Some(cursor) = before {
			query = query.or(&cursor.older_than_filter());
		}

		let rows: Vec<Message> = query
			.order("created_at", false)
			.order("id", false)
			.limit(limit)
			.fetch()
			.await?;

		debug!(room_id = %room, rows = rows.len(), paged = before.is_some(), "fetched message page");
		Ok(rows)
	}

	async fn fetch_one(&self, room: &RoomId, id: MessageId) -> Result<Option<Message>, BackendError> {
		let token = self.token.borrow().clone();
		self.rest
			.from(MESSAGE_TABLE, &token)
			.select(MESSAGE_SELECT)
			.eq("chat_room_id", room)
			.eq("id", id)
			.fetch_optional()
			.await
	}

	async fn insert(&self, message: &NewMessage) -> Result<Message, BackendError> {
		let token = self.token.borrow().clone();
		self.rest.insert(MESSAGE_TABLE, &token, message).await
	}
}

#[cfg(test)]
mod tests {
	use chrono::TimeZone;

	use super::*;

	#[test]
	fn cursor_filter_is_strict_keyset() {
		let id: MessageId = "00000000-0000-4000-8000-000000000007".parse().unwrap();
		let cursor = Cursor {
			created_at: Utc.with_ymd_and_hms(2025, 1, 2, 3, 4, 5).unwrap(),
			id,
		};
		assert_eq!(
			cursor.older_than_filter(),
			vec![
				r#"created_at.lt."2025-01-02T03:04:05.000000Z""#.to_string(),
				r#"and(created_at.eq."2025-01-02T03:04:05.000000Z",id.lt.00000000-0000-4000-8000-000000000007)"#
					.to_string(),
			]
		);
	}
}
