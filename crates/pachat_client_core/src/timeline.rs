#![forbid(unsafe_code)]

//! Merged message view of one room.
//!
//! History pages, live events and locally sent messages all land here. The
//! timeline keeps one entry per message id, orders stored messages by
//! `(created_at, id)` and keeps unconfirmed sends after them in send order.

use std::collections::{BTreeMap, HashMap};

use chrono::{DateTime, Utc};
use pachat_domain::{Message, MessageDraft, MessageId, RoomId, UserProfile};
use tracing::debug;

use crate::messages::Cursor;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
	/// Stored by the backend.
	Confirmed,
	/// Sent locally, not yet stored.
	Pending,
	Failed { reason: String },
}

impl Delivery {
	pub fn is_confirmed(&self) -> bool {
		matches!(self, Delivery::Confirmed)
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimelineEntry {
	pub message: Message,
	pub delivery: Delivery,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
	/// Newest page: the initial load.
	Latest,
	/// Page before the current cursor.
	Older,
	/// Refetch after reconnecting, walking back from the newest row until
	/// `since`, the newest row known before the drop.
	CatchUp { since: Option<Cursor> },
}

/// A history fetch issued by the timeline. Hand it back with the rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
	pub seq: u64,
	pub kind: PageKind,
	pub before: Option<Cursor>,
	pub limit: usize,
}

type Key = (DateTime<Utc>, MessageId);

#[derive(Debug, Clone)]
pub struct RoomTimeline {
	room: RoomId,
	page_size: usize,
	confirmed: BTreeMap<Key, Message>,
	/// Confirmed id -> `created_at`, to find its key.
	positions: HashMap<MessageId, DateTime<Utc>>,
	/// Pending and failed sends, oldest send first.
	unconfirmed: Vec<TimelineEntry>,
	loaded: bool,
	has_more: bool,
	older_in_flight: Option<u64>,
	next_seq: u64,
}

impl RoomTimeline {
	pub fn new(room: RoomId, page_size: usize) -> Self {
		Self {
			room,
			page_size: page_size.max(1),
			confirmed: BTreeMap::new(),
			positions: HashMap::new(),
			unconfirmed: Vec::new(),
			loaded: false,
			has_more: true,
			older_in_flight: None,
			next_seq: 0,
		}
	}

	pub fn room(&self) -> &RoomId {
		&self.room
	}

	pub fn page_size(&self) -> usize {
		self.page_size
	}

	fn next_seq(&mut self) -> u64 {
		self.next_seq += 1;
		self.next_seq
	}

	/// Request for the newest page. Always allowed; merging it is idempotent.
	pub fn begin_latest(&mut self) -> PageRequest {
		PageRequest {
			seq: self.next_seq(),
			kind: PageKind::Latest,
			before: None,
			limit: self.page_size,
		}
	}

	/// First page of a catch-up. `since` is [`RoomTimeline::newest`] as it was
	/// when the connection dropped.
	pub fn begin_catch_up(&mut self, since: Option<Cursor>) -> PageRequest {
		PageRequest {
			seq: self.next_seq(),
			kind: PageKind::CatchUp { since },
			before: None,
			limit: self.page_size,
		}
	}

	/// Follow-up after a catch-up page, or `None` once the page reached rows
	/// known before the drop or history ran out. Call before applying `page`.
	pub fn next_catch_up(&mut self, request: &PageRequest, page: &[Message]) -> Option<PageRequest> {
		let PageKind::CatchUp { since } = request.kind else {
			return None;
		};
		let oldest = page.iter().map(|m| (m.created_at, m.id)).min()?;
		if page.len() < request.limit {
			return None;
		}
		match since {
			Some(since) if oldest <= (since.created_at, since.id) => None,
			Some(_) => Some(PageRequest {
				seq: self.next_seq(),
				kind: request.kind,
				before: Some(Cursor {
					created_at: oldest.0,
					id: oldest.1,
				}),
				limit: self.page_size,
			}),
			// Nothing was known before the drop: older rows stay reachable
			// through normal paging.
			None => {
				self.has_more = true;
				None
			}
		}
	}

	/// Request for the page before the cursor, or `None` while the first page
	/// is not loaded, a request is outstanding, or history is exhausted.
	pub fn begin_load_older(&mut self) -> Option<PageRequest> {
		if !self.loaded || !self.has_more || self.older_in_flight.is_some() {
			return None;
		}

		let seq = self.next_seq();
		self.older_in_flight = Some(seq);
		Some(PageRequest {
			seq,
			kind: PageKind::Older,
			before: self.cursor(),
			limit: self.page_size,
		})
	}

	/// The older-page fetch failed; a later trigger may retry.
	pub fn fail_load_older(&mut self, request: &PageRequest) {
		if self.older_in_flight == Some(request.seq) {
			self.older_in_flight = None;
		}
	}

	/// Merge a fetched page. Returns whether the view changed.
	pub fn apply_history_page(&mut self, request: &PageRequest, page: Vec<Message>) -> bool {
		match request.kind {
			PageKind::Older => {
				if self.older_in_flight != Some(request.seq) {
					debug!(room_id = %self.room, seq = request.seq, "ignoring stale history page");
					return false;
				}
				self.older_in_flight = None;
				if page.len() < request.limit {
					self.has_more = false;
				}
			}
			PageKind::Latest | PageKind::CatchUp { .. } => {
				if !self.loaded {
					self.loaded = true;
					if page.len() < request.limit {
						self.has_more = false;
					}
				}
			}
		}

		let mut changed = false;
		for message in page {
			changed |= self.merge_confirmed(message);
		}
		changed
	}

	/// Merge a message from a broadcast or a database change.
	pub fn apply_live(&mut self, message: Message) -> bool {
		self.merge_confirmed(message)
	}

	/// The stored row for a message this client sent.
	pub fn confirm(&mut self, message: Message) -> bool {
		self.merge_confirmed(message)
	}

	/// Add a locally sent message as pending. The id is generated here and is
	/// the id the stored row will carry.
	pub fn push_optimistic(&mut self, author: &UserProfile, draft: MessageDraft, now: DateTime<Utc>) -> Message {
		let message = Message {
			id: MessageId::new_v4(),
			room_id: self.room.clone(),
			author_id: author.id.clone(),
			text: draft.into_string(),
			created_at: now,
			author: Some(author.clone()),
		};
		self.unconfirmed.push(TimelineEntry {
			message: message.clone(),
			delivery: Delivery::Pending,
		});
		message
	}

	/// Mark an unconfirmed send as failed. Confirmed messages are untouched.
	pub fn mark_failed(&mut self, id: MessageId, reason: impl Into<String>) -> bool {
		let Some(entry) = self.unconfirmed.iter_mut().find(|e| e.message.id == id) else {
			return false;
		};
		entry.delivery = Delivery::Failed { reason: reason.into() };
		true
	}

	/// Move a failed send back to pending, at the end of the send order.
	/// Returns the message to send again.
	pub fn retry(&mut self, id: MessageId) -> Option<Message> {
		let pos = self
			.unconfirmed
			.iter()
			.position(|e| e.message.id == id && matches!(e.delivery, Delivery::Failed { .. }))?;
		let mut entry = self.unconfirmed.remove(pos);
		entry.delivery = Delivery::Pending;
		let message = entry.message.clone();
		self.unconfirmed.push(entry);
		Some(message)
	}

	/// Drop a failed send.
	pub fn discard(&mut self, id: MessageId) -> bool {
		let before = self.unconfirmed.len();
		self.unconfirmed
			.retain(|e| !(e.message.id == id && matches!(e.delivery, Delivery::Failed { .. })));
		self.unconfirmed.len() != before
	}

	fn merge_confirmed(&mut self, mut message: Message) -> bool {
		if message.room_id != self.room {
			return false;
		}

		let mut changed = false;
		if let Some(pos) = self.unconfirmed.iter().position(|e| e.message.id == message.id) {
			let local = self.unconfirmed.remove(pos);
			if message.author.is_none() {
				message.author = local.message.author;
			}
			changed = true;
		}

		if let Some(created_at) = self.positions.get(&message.id).copied() {
			let key = (created_at, message.id);
			if let Some(existing) = self.confirmed.get(&key) {
				// Change events carry no embedded author.
				if message.author.is_none() {
					message.author = existing.author.clone();
				}
				if *existing == message {
					return changed;
				}
			}
			self.confirmed.remove(&key);
		}

		self.positions.insert(message.id, message.created_at);
		self.confirmed.insert((message.created_at, message.id), message);
		true
	}

	/// Every entry in display order.
	pub fn entries(&self) -> Vec<TimelineEntry> {
		self.confirmed
			.values()
			.map(|m| TimelineEntry {
				message: m.clone(),
				delivery: Delivery::Confirmed,
			})
			.chain(self.unconfirmed.iter().cloned())
			.collect()
	}

	pub fn delivery(&self, id: MessageId) -> Option<Delivery> {
		if self.positions.contains_key(&id) {
			return Some(Delivery::Confirmed);
		}
		self.unconfirmed
			.iter()
			.find(|e| e.message.id == id)
			.map(|e| e.delivery.clone())
	}

	pub fn len(&self) -> usize {
		self.confirmed.len() + self.unconfirmed.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	pub fn is_loaded(&self) -> bool {
		self.loaded
	}

	/// More history may exist before the cursor.
	pub fn has_more(&self) -> bool {
		self.has_more
	}

	pub fn is_loading_older(&self) -> bool {
		self.older_in_flight.is_some()
	}

	/// Oldest confirmed message.
	pub fn cursor(&self) -> Option<Cursor> {
		self.confirmed.values().next().map(Cursor::of)
	}

	/// Newest confirmed message.
	pub fn newest(&self) -> Option<Cursor> {
		self.confirmed.values().next_back().map(Cursor::of)
	}
}
