#![forbid(unsafe_code)]

//! Realtime wire frames (Phoenix channels, JSON serializer `vsn=1.0.0`).

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use super::presence::{PresenceDiff, PresenceState};

pub const TOPIC_PREFIX: &str = "realtime:";
pub const PHOENIX_TOPIC: &str = "phoenix";

pub const EVENT_JOIN: &str = "phx_join";
pub const EVENT_LEAVE: &str = "phx_leave";
pub const EVENT_REPLY: &str = "phx_reply";
pub const EVENT_ERROR: &str = "phx_error";
pub const EVENT_CLOSE: &str = "phx_close";
pub const EVENT_HEARTBEAT: &str = "heartbeat";
pub const EVENT_ACCESS_TOKEN: &str = "access_token";
pub const EVENT_BROADCAST: &str = "broadcast";
pub const EVENT_PRESENCE: &str = "presence";
pub const EVENT_PRESENCE_STATE: &str = "presence_state";
pub const EVENT_PRESENCE_DIFF: &str = "presence_diff";
pub const EVENT_POSTGRES_CHANGES: &str = "postgres_changes";
pub const EVENT_SYSTEM: &str = "system";

/// One websocket text frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
	pub topic: String,
	pub event: String,
	#[serde(default)]
	pub payload: Value,
	#[serde(rename = "ref", default)]
	pub reference: Option<String>,
	#[serde(default)]
	pub join_ref: Option<String>,
}

impl Frame {
	pub fn heartbeat(reference: String) -> Self {
		Self {
			topic: PHOENIX_TOPIC.to_string(),
			event: EVENT_HEARTBEAT.to_string(),
			payload: json!({}),
			reference: Some(reference),
			join_ref: None,
		}
	}

	pub fn encode(&self) -> Result<String, serde_json::Error> {
		serde_json::to_string(self)
	}

	pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
		serde_json::from_str(text)
	}
}

/// Wire topic for an application topic.
pub fn wire_topic(topic: &str) -> String {
	if topic.starts_with(TOPIC_PREFIX) {
		topic.to_string()
	} else {
		format!("{TOPIC_PREFIX}{topic}")
	}
}

/// Which row changes a database-change listener wants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeEvent {
	#[serde(rename = "*")]
	All,
	#[serde(rename = "INSERT")]
	Insert,
	#[serde(rename = "UPDATE")]
	Update,
	#[serde(rename = "DELETE")]
	Delete,
}

/// Database-change subscription for one table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostgresChangesFilter {
	pub event: ChangeEvent,
	pub schema: String,
	pub table: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub filter: Option<String>,
}

impl PostgresChangesFilter {
	pub fn new(event: ChangeEvent, table: impl Into<String>) -> Self {
		Self {
			event,
			schema: "public".to_string(),
			table: table.into(),
			filter: None,
		}
	}

	/// Row filter such as `chat_room_id=eq.<id>`.
	pub fn with_filter(mut self, filter: impl Into<String>) -> Self {
		self.filter = Some(filter.into());
		self
	}
}

/// Channel join options.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelConfig {
	/// Receive our own broadcasts.
	pub broadcast_self: bool,
	/// Ask the server to acknowledge broadcasts.
	pub broadcast_ack: bool,
	/// Presence key; `None` lets the server pick one.
	pub presence_key: Option<String>,
	pub postgres_changes: Vec<PostgresChangesFilter>,
	/// Require channel authorization policies.
	pub private: bool,
}

impl ChannelConfig {
	pub fn join_payload(&self, access_token: Option<&str>) -> Value {
		let mut payload = json!({
			"config": {
				"broadcast": { "self": self.broadcast_self, "ack": self.broadcast_ack },
				"presence": { "key": self.presence_key.clone().unwrap_or_default() },
				"postgres_changes": self.postgres_changes,
				"private": self.private,
			}
		});
		if let Some(token) = access_token
			&& let Some(obj) = payload.as_object_mut()
		{
			obj.insert("access_token".to_string(), Value::String(token.to_string()));
		}
		payload
	}
}

pub fn broadcast_payload(event: &str, payload: Value) -> Value {
	json!({ "type": "broadcast", "event": event, "payload": payload })
}

pub fn track_payload(payload: Value) -> Value {
	json!({ "type": "presence", "event": "track", "payload": payload })
}

pub fn untrack_payload() -> Value {
	json!({ "type": "presence", "event": "untrack" })
}

/// A row change delivered on a channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PostgresChange {
	pub event: ChangeEvent,
	pub schema: String,
	pub table: String,
	pub record: Value,
	pub old_record: Value,
	pub commit_timestamp: Option<String>,
}

#[derive(Debug, Deserialize)]
struct PostgresChangesEnvelope {
	data: PostgresChangeData,
}

#[derive(Debug, Deserialize)]
struct PostgresChangeData {
	#[serde(alias = "eventType", rename = "type")]
	event: ChangeEvent,
	schema: String,
	table: String,
	#[serde(default, alias = "new")]
	record: Value,
	#[serde(default, alias = "old")]
	old_record: Value,
	#[serde(default)]
	commit_timestamp: Option<String>,
}

/// Events delivered to a channel's handler.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
	/// Join acknowledged (also after every rejoin).
	Joined,
	JoinFailed {
		reason: String,
	},
	Broadcast {
		event: String,
		payload: Value,
	},
	PostgresChange(PostgresChange),
	PresenceState(PresenceState),
	PresenceDiff(PresenceDiff),
	System {
		status: String,
		message: String,
	},
	/// Channel errored server-side; it will be rejoined.
	Error {
		reason: String,
	},
	/// Socket lost; a reconnect is scheduled.
	Reconnecting {
		attempt: u32,
		retry_in_ms: u64,
	},
	/// Server closed the channel or the client shut down.
	Closed,
}

/// Reply to a push, matched by `ref`.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
	pub ok: bool,
	pub response: Value,
}

impl Reply {
	pub fn from_payload(payload: &Value) -> Self {
		Self {
			ok: payload.get("status").and_then(|s| s.as_str()) == Some("ok"),
			response: payload.get("response").cloned().unwrap_or(Value::Null),
		}
	}

	/// Best-effort human-readable failure reason.
	pub fn reason(&self) -> String {
		self.response
			.get("reason")
			.and_then(|r| r.as_str())
			.map(str::to_string)
			.unwrap_or_else(|| self.response.to_string())
	}
}

/// Decode a server push (anything but `phx_reply`) into a channel event.
pub fn decode_channel_event(frame: &Frame) -> Option<ChannelEvent> {
	match frame.event.as_str() {
		EVENT_BROADCAST => {
			let event = frame.payload.get("event").and_then(|e| e.as_str())?.to_string();
			let payload = frame.payload.get("payload").cloned().unwrap_or(Value::Null);
			Some(ChannelEvent::Broadcast { event, payload })
		}
		EVENT_POSTGRES_CHANGES => {
			let env: PostgresChangesEnvelope = serde_json::from_value(frame.payload.clone()).ok()?;
			Some(ChannelEvent::PostgresChange(PostgresChange {
				event: env.data.event,
				schema: env.data.schema,
				table: env.data.table,
				record: env.data.record,
				old_record: env.data.old_record,
				commit_timestamp: env.data.commit_timestamp,
			}))
		}
		EVENT_PRESENCE_STATE => serde_json::from_value::<PresenceState>(frame.payload.clone())
			.ok()
			.map(ChannelEvent::PresenceState),
		EVENT_PRESENCE_DIFF => serde_json::from_value::<PresenceDiff>(frame.payload.clone())
			.ok()
			.map(ChannelEvent::PresenceDiff),
		EVENT_SYSTEM => Some(ChannelEvent::System {
			status: frame
				.payload
				.get("status")
				.and_then(|s| s.as_str())
				.unwrap_or_default()
				.to_string(),
			message: frame
				.payload
				.get("message")
				.and_then(|s| s.as_str())
				.unwrap_or_default()
				.to_string(),
		}),
		EVENT_ERROR => Some(ChannelEvent::Error {
			reason: frame.payload.to_string(),
		}),
		EVENT_CLOSE => Some(ChannelEvent::Closed),
		_ => None,
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn join_payload_carries_config_and_token() {
		let cfg = ChannelConfig {
			broadcast_self: false,
			broadcast_ack: true,
			presence_key: Some("user-1".to_string()),
			postgres_changes: vec![
				PostgresChangesFilter::new(ChangeEvent::Insert, "message").with_filter("chat_room_id=eq.r1"),
			],
			private: false,
		};
		let p = cfg.join_payload(Some("jwt"));
		assert_eq!(p["access_token"], "jwt");
		assert_eq!(p["config"]["broadcast"]["ack"], true);
		assert_eq!(p["config"]["presence"]["key"], "user-1");
		assert_eq!(p["config"]["postgres_changes"][0]["event"], "INSERT");
		assert_eq!(p["config"]["postgres_changes"][0]["schema"], "public");
		assert_eq!(p["config"]["postgres_changes"][0]["filter"], "chat_room_id=eq.r1");

		let anon = ChannelConfig::default().join_payload(None);
		assert!(anon.get("access_token").is_none());
		assert_eq!(anon["config"]["presence"]["key"], "");
	}

	#[test]
	fn frame_serializes_ref_field() {
		let text = Frame::heartbeat("7".to_string()).encode().unwrap();
		let v: Value = serde_json::from_str(&text).unwrap();
		assert_eq!(v["topic"], "phoenix");
		assert_eq!(v["ref"], "7");
		assert!(v["join_ref"].is_null());
	}

	#[test]
	fn wire_topic_is_prefixed_once() {
		assert_eq!(wire_topic("room:1:messages"), "realtime:room:1:messages");
		assert_eq!(wire_topic("realtime:x"), "realtime:x");
	}

	#[test]
	fn decodes_broadcast_and_postgres_changes() {
		let b = Frame::decode(
			r#"{"topic":"realtime:room:1:messages","event":"broadcast","ref":null,
			"payload":{"type":"broadcast","event":"message","payload":{"text":"hi"}}}"#,
		)
		.unwrap();
		assert_eq!(
			decode_channel_event(&b),
			Some(ChannelEvent::Broadcast {
				event: "message".to_string(),
				payload: json!({"text": "hi"}),
			})
		);

		let pg = Frame::decode(
			r#"{"topic":"realtime:room:1:messages","event":"postgres_changes","ref":null,
			"payload":{"ids":[1],"data":{"type":"INSERT","schema":"public","table":"message",
			"commit_timestamp":"2025-01-01T00:00:00Z","record":{"id":"x"},"errors":null}}}"#,
		)
		.unwrap();
		match decode_channel_event(&pg) {
			Some(ChannelEvent::PostgresChange(c)) => {
				assert_eq!(c.event, ChangeEvent::Insert);
				assert_eq!(c.table, "message");
				assert_eq!(c.record["id"], "x");
				assert!(c.old_record.is_null());
			}
			other => panic!("unexpected: {other:?}"),
		}
	}

	#[test]
	fn reply_reports_status_and_reason() {
		let ok = Reply::from_payload(&json!({"status":"ok","response":{}}));
		assert!(ok.ok);
		let err = Reply::from_payload(&json!({"status":"error","response":{"reason":"unauthorized"}}));
		assert!(!err.ok);
		assert_eq!(err.reason(), "unauthorized");
	}

	#[test]
	fn unknown_events_are_ignored() {
		let f = Frame {
			topic: "realtime:x".into(),
			event: "something_new".into(),
			payload: Value::Null,
			reference: None,
			join_ref: None,
		};
		assert_eq!(decode_channel_event(&f), None);
	}
}
