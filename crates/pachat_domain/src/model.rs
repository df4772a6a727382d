#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{MessageId, RoomId, UserId};

/// A chat room row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Room {
	pub id: RoomId,
	pub name: String,
	pub is_public: bool,
	#[serde(with = "crate::timestamp")]
	pub created_at: DateTime<Utc>,
}

/// A room as listed to a user, with its membership size.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoomSummary {
	pub id: RoomId,
	pub name: String,
	pub member_count: u64,
}

impl RoomSummary {
	/// `"1 member"` / `"3 members"`.
	pub fn member_label(&self) -> String {
		if self.member_count == 1 {
			"1 member".to_string()
		} else {
			format!("{} members", self.member_count)
		}
	}
}

/// Public profile of a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserProfile {
	pub id: UserId,
	pub name: String,
	#[serde(default)]
	pub image_url: Option<String>,
}

/// A stored chat message.
///
/// The same shape is used for storage rows, broadcast payloads and
/// database-change records; `author` is only present when embedded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
	pub id: MessageId,
	#[serde(rename = "chat_room_id")]
	pub room_id: RoomId,
	pub author_id: UserId,
	pub text: String,
	#[serde(with = "crate::timestamp")]
	pub created_at: DateTime<Utc>,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub author: Option<UserProfile>,
}

/// Insert body for a message row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NewMessage {
	pub id: MessageId,
	#[serde(rename = "chat_room_id")]
	pub room_id: RoomId,
	pub author_id: UserId,
	pub text: String,
}

impl From<&Message> for NewMessage {
	fn from(m: &Message) -> Self {
		Self {
			id: m.id,
			room_id: m.room_id.clone(),
			author_id: m.author_id.clone(),
			text: m.text.clone(),
		}
	}
}

/// Form/user input validation failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{field}: {reason}")]
pub struct ValidationError {
	pub field: &'static str,
	pub reason: &'static str,
}

/// Unvalidated "new room" form data.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateRoomInput {
	pub name: String,
	#[serde(rename = "isPublic", alias = "is_public")]
	pub is_public: bool,
}

/// Room input that passed validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidRoomInput {
	pub name: String,
	pub is_public: bool,
}

impl CreateRoomInput {
	pub fn new(name: impl Into<String>, is_public: bool) -> Self {
		Self {
			name: name.into(),
			is_public,
		}
	}

	/// Trim the name and require at least one character.
	pub fn validate(&self) -> Result<ValidRoomInput, ValidationError> {
		let name = self.name.trim();
		if name.is_empty() {
			return Err(ValidationError {
				field: "name",
				reason: "must not be empty",
			});
		}
		Ok(ValidRoomInput {
			name: name.to_string(),
			is_public: self.is_public,
		})
	}
}

/// Chat input text ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageDraft(String);

impl MessageDraft {
	/// Trim; whitespace-only input is rejected.
	pub fn parse(text: &str) -> Result<Self, ValidationError> {
		let text = text.trim();
		if text.is_empty() {
			return Err(ValidationError {
				field: "text",
				reason: "must not be empty",
			});
		}
		Ok(Self(text.to_string()))
	}

	pub fn as_str(&self) -> &str {
		&self.0
	}

	pub fn into_string(self) -> String {
		self.0
	}
}
