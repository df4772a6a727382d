#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One tracked connection for a presence key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresenceMeta {
	pub phx_ref: String,
	#[serde(flatten)]
	pub fields: Map<String, Value>,
}

impl PresenceMeta {
	pub fn field_str(&self, key: &str) -> Option<&str> {
		self.fields.get(key).and_then(|v| v.as_str())
	}
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceEntry {
	#[serde(default)]
	pub metas: Vec<PresenceMeta>,
}

/// Full presence snapshot, keyed by presence key (the user id here).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PresenceState(pub BTreeMap<String, PresenceEntry>);

/// Incremental presence change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresenceDiff {
	#[serde(default)]
	pub joins: BTreeMap<String, PresenceEntry>,
	#[serde(default)]
	pub leaves: BTreeMap<String, PresenceEntry>,
}

/// A user currently present in a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineUser {
	pub key: String,
	pub name: Option<String>,
	/// Connections (tabs/devices) this user has open.
	pub connections: usize,
}

impl PresenceState {
	/// Replace everything with a server snapshot.
	pub fn sync_state(&mut self, snapshot: PresenceState) {
		self.0 = snapshot
			.0
			.into_iter()
			.filter(|(_, e)| !e.metas.is_empty())
			.collect();
	}

	/// Apply joins, then leaves. Leaves remove metas by `phx_ref`; keys left
	/// without metas are dropped.
	pub fn sync_diff(&mut self, diff: PresenceDiff) {
		for (key, joined) in diff.joins {
			let entry = self.0.entry(key).or_default();
			for meta in joined.metas {
				if !entry.metas.iter().any(|m| m.phx_ref == meta.phx_ref) {
					entry.metas.push(meta);
				}
			}
		}

		for (key, left) in diff.leaves {
			let Some(entry) = self.0.get_mut(&key) else {
				continue;
			};
			entry
				.metas
				.retain(|m| !left.metas.iter().any(|l| l.phx_ref == m.phx_ref));
			if entry.metas.is_empty() {
				self.0.remove(&key);
			}
		}
	}

	pub fn clear(&mut self) {
		self.0.clear();
	}

	/// Distinct users online.
	pub fn online_count(&self) -> usize {
		self.0.len()
	}

	pub fn online_users(&self) -> Vec<OnlineUser> {
		self.0
			.iter()
			.map(|(key, entry)| OnlineUser {
				key: key.clone(),
				name: entry.metas.iter().find_map(|m| m.field_str("name")).map(str::to_string),
				connections: entry.metas.len(),
			})
			.collect()
	}
}
