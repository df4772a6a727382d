#![forbid(unsafe_code)]

use core::fmt;
use core::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

mod model;
pub mod timestamp;

pub use model::{
	CreateRoomInput, Message, MessageDraft, NewMessage, Room, RoomSummary, UserProfile, ValidRoomInput, ValidationError,
};

/// Errors for parsing identifiers from strings.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseIdError {
	#[error("empty value")]
	Empty,
	#[error("invalid format: {0}")]
	InvalidFormat(String),
}

macro_rules! string_id {
	($(#[$meta:meta])* $name:ident) => {
		$(#[$meta])*
		#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
		#[serde(transparent)]
		pub struct $name(String);

		impl $name {
			/// Create a non-empty id; surrounding whitespace is dropped.
			pub fn new(id: impl Into<String>) -> Result<Self, ParseIdError> {
				let id = id.into();
				let trimmed = id.trim();
				if trimmed.is_empty() {
					return Err(ParseIdError::Empty);
				}
				if trimmed.len() == id.len() {
					Ok(Self(id))
				} else {
					Ok(Self(trimmed.to_string()))
				}
			}
			pub fn as_str(&self) -> &str {
				&self.0
			}
			pub fn into_string(self) -> String {
				self.0
			}
		}

		impl fmt::Display for $name {
			fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
				f.write_str(&self.0)
			}
		}

		impl FromStr for $name {
			type Err = ParseIdError;

			fn from_str(s: &str) -> Result<Self, Self::Err> {
				$name::new(s.to_string())
			}
		}
	};
}

string_id!(
	/// Backend-assigned chat room identifier.
	RoomId
);

string_id!(
	/// Auth user identifier (also the `user_profile` primary key).
	UserId
);

/// Message identifier. Generated on the client so an optimistic message and
/// its stored row share the same id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(pub uuid::Uuid);

impl MessageId {
	/// Create a new random message id.
	pub fn new_v4() -> Self {
		Self(uuid::Uuid::new_v4())
	}
}

impl fmt::Display for MessageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}", self.0)
	}
}

impl FromStr for MessageId {
	type Err = ParseIdError;

	fn from_str(s: &str) -> Result<Self, Self::Err> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}
		uuid::Uuid::parse_str(s)
			.map(Self)
			.map_err(|e| ParseIdError::InvalidFormat(e.to_string()))
	}
}

/// Realtime topic helpers for a room's message channel.
pub struct RoomTopic;

impl RoomTopic {
	pub const PREFIX: &'static str = "room:";
	pub const SUFFIX: &'static str = ":messages";

	/// Format a room topic (e.g. `room:<id>:messages`).
	pub fn format(room: &RoomId) -> String {
		format!("{}{}{}", Self::PREFIX, room.as_str(), Self::SUFFIX)
	}

	/// Parse a room topic of the form `room:<id>:messages`.
	pub fn parse(s: &str) -> Result<RoomId, ParseIdError> {
		let s = s.trim();
		if s.is_empty() {
			return Err(ParseIdError::Empty);
		}

		let id = s
			.strip_prefix(Self::PREFIX)
			.and_then(|rest| rest.strip_suffix(Self::SUFFIX))
			.ok_or_else(|| ParseIdError::InvalidFormat("expected room:<id>:messages".into()))?;

		RoomId::new(id.to_string())
	}
}

/// Realtime topic for a user's room-membership changes.
pub struct UserRoomsTopic;

impl UserRoomsTopic {
	/// Format `user:<id>:rooms`.
	pub fn format(user: &UserId) -> String {
		format!("user:{}:rooms", user.as_str())
	}
}
