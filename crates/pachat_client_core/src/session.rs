#![forbid(unsafe_code)]

use std::sync::Arc;

use chrono::Utc;
use pachat_backend::BackendError;
use pachat_backend::realtime::{
	ChangeEvent, ChannelConfig, ChannelEvent, OnlineUser, PostgresChangesFilter, PresenceState, RealtimeChannel,
	RealtimeClient,
};
use pachat_domain::{Message, MessageDraft, MessageId, NewMessage, RoomId, RoomTopic, UserProfile};
use serde_json::{Value, json};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::error::ClientCoreError;
use crate::messages::{Cursor, MESSAGE_TABLE, MessageStore};
use crate::timeline::{RoomTimeline, TimelineEntry};

/// Broadcast event carrying a stored message row.
pub const MESSAGE_EVENT: &str = "message";

/// Outbound half of a room's realtime channel.
pub trait RoomChannel: Send + Sync {
	fn broadcast(&self, event: &str, payload: Value) -> Result<(), BackendError>;
	fn track(&self, payload: Value) -> Result<(), BackendError>;
}

impl RoomChannel for RealtimeChannel {
	fn broadcast(&self, event: &str, payload: Value) -> Result<(), BackendError> {
		RealtimeChannel::broadcast(self, event, payload)
	}

	fn track(&self, payload: Value) -> Result<(), BackendError> {
		RealtimeChannel::track(self, payload)
	}
}

/// Join options for a room's message channel: others' broadcasts, presence
/// keyed by user id, and inserts into the room's messages.
pub fn room_channel_config(room: &RoomId, user: &UserProfile) -> ChannelConfig {
	ChannelConfig {
		broadcast_self: false,
		broadcast_ack: false,
		presence_key: Some(user.id.to_string()),
		postgres_changes: vec![
			PostgresChangesFilter::new(ChangeEvent::Insert, MESSAGE_TABLE).with_filter(format!("chat_room_id=eq.{room}")),
		],
		private: false,
	}
}

/// What a chat view renders.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
	pub room: RoomId,
	pub entries: Vec<TimelineEntry>,
	pub online_count: usize,
	pub online_users: Vec<OnlineUser>,
	pub has_more: bool,
	pub loading_older: bool,
	/// Channel currently joined.
	pub live: bool,
}

/// One signed-in user's view of one room.
pub struct ChatSession {
	user: UserProfile,
	store: Arc<dyn MessageStore>,
	channel: Box<dyn RoomChannel>,
	events: mpsc::UnboundedReceiver<ChannelEvent>,
	timeline: RoomTimeline,
	presence: PresenceState,
	live: bool,
	reconnecting: bool,
	/// Newest confirmed message when the channel dropped.
	catch_up_since: Option<Cursor>,
	closed: bool,
	updates: watch::Sender<SessionSnapshot>,
}

impl std::fmt::Debug for ChatSession {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ChatSession")
			.field("room", self.timeline.room())
			.field("user", &self.user.id)
			.field("entries", &self.timeline.len())
			.field("live", &self.live)
			.finish_non_exhaustive()
	}
}

impl ChatSession {
	/// Join the room's channel on `realtime`, then load the newest page.
	pub async fn connect(
		realtime: &RealtimeClient,
		store: Arc<dyn MessageStore>,
		room: RoomId,
		user: UserProfile,
		page_size: usize,
	) -> Result<Self, ClientCoreError> {
		let (channel, events) = realtime.channel(RoomTopic::format(&room), room_channel_config(&room, &user));
		Self::open(store, Box::new(channel), events, room, user, page_size).await
	}

	/// Build a session over an already joined (or joining) channel. Events
	/// that arrive while the first page loads are kept and merged later.
	pub async fn open(
		store: Arc<dyn MessageStore>,
		channel: Box<dyn RoomChannel>,
		events: mpsc::UnboundedReceiver<ChannelEvent>,
		room: RoomId,
		user: UserProfile,
		page_size: usize,
	) -> Result<Self, ClientCoreError> {
		let mut timeline = RoomTimeline::new(room.clone(), page_size);
		let request = timeline.begin_latest();
		let page = store
			.fetch_page(&room, None, request.limit)
			.await
			.map_err(ClientCoreError::backend("Failed to load messages"))?;
		timeline.apply_history_page(&request, page);

		channel
			.track(json!({ "name": user.name, "image_url": user.image_url }))
			.map_err(ClientCoreError::backend("Failed to join room"))?;

		let snapshot = SessionSnapshot {
			room: room.clone(),
			entries: timeline.entries(),
			online_count: 0,
			online_users: Vec::new(),
			has_more: timeline.has_more(),
			loading_older: false,
			live: false,
		};
		let (updates, _) = watch::channel(snapshot);

		info!(room_id = %room, user_id = %user.id, messages = timeline.len(), "chat session opened");

		Ok(Self {
			user,
			store,
			channel,
			events,
			timeline,
			presence: PresenceState::default(),
			live: false,
			reconnecting: false,
			catch_up_since: None,
			closed: false,
			updates,
		})
	}

	pub fn room(&self) -> &RoomId {
		self.timeline.room()
	}

	pub fn user(&self) -> &UserProfile {
		&self.user
	}

	pub fn timeline(&self) -> &RoomTimeline {
		&self.timeline
	}

	pub fn is_closed(&self) -> bool {
		self.closed
	}

	pub fn snapshot(&self) -> SessionSnapshot {
		SessionSnapshot {
			room: self.timeline.room().clone(),
			entries: self.timeline.entries(),
			online_count: self.presence.online_count(),
			online_users: self.presence.online_users(),
			has_more: self.timeline.has_more(),
			loading_older: self.timeline.is_loading_older(),
			live: self.live,
		}
	}

	/// Receiver that sees a new snapshot after every change.
	pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
		self.updates.subscribe()
	}

	fn publish(&self) {
		self.updates.send_replace(self.snapshot());
	}

	/// Next channel event; `None` once the channel is gone.
	pub async fn next_event(&mut self) -> Option<ChannelEvent> {
		if self.closed {
			return None;
		}
		self.events.recv().await
	}

	/// Send a message. It shows up as pending at once and is confirmed or
	/// marked failed when the store answers.
	pub async fn send(&mut self, text: &str) -> Result<MessageId, ClientCoreError> {
		let draft = MessageDraft::parse(text).map_err(ClientCoreError::validation("Message cannot be empty"))?;
		let message = self.timeline.push_optimistic(&self.user, draft, Utc::now());
		self.publish();

		let id = message.id;
		self.deliver(message).await?;
		Ok(id)
	}

	/// Send a failed message again with the same id.
	pub async fn retry(&mut self, id: MessageId) -> Result<(), ClientCoreError> {
		let message = self
			.timeline
			.retry(id)
			.ok_or_else(|| ClientCoreError::Other(format!("no failed message {id}")))?;
		self.publish();
		self.deliver(message).await
	}

	/// Drop a failed message.
	pub fn discard(&mut self, id: MessageId) -> bool {
		let removed = self.timeline.discard(id);
		if removed {
			self.publish();
		}
		removed
	}

	async fn deliver(&mut self, message: Message) -> Result<(), ClientCoreError> {
		metrics::counter!("pachat_messages_sent_total").increment(1);

		match self.store.insert(&NewMessage::from(&message)).await {
			Ok(mut row) => {
				if row.author.is_none() {
					row.author = Some(self.user.clone());
				}
				match serde_json::to_value(&row) {
					Ok(payload) => {
						if let Err(e) = self.channel.broadcast(MESSAGE_EVENT, payload) {
							warn!(message_id = %row.id, error = %e, "message stored but broadcast failed");
						}
					}
					Err(e) => warn!(message_id = %row.id, error = %e, "message encode failed"),
				}
				debug!(message_id = %row.id, room_id = %row.room_id, "message stored");
				self.timeline.confirm(row);
				self.publish();
				Ok(())
			}
			// The row already exists: an earlier attempt reached the store.
			// Confirm with the stored row so the entry sorts by server time.
			Err(e) if e.is_conflict() => {
				match self.store.fetch_one(&message.room_id, message.id).await {
					Ok(Some(row)) => {
						debug!(message_id = %row.id, "message already stored");
						self.timeline.confirm(row);
					}
					Ok(None) => debug!(message_id = %message.id, "stored row not visible yet; waiting for its event"),
					Err(e) => warn!(message_id = %message.id, error = %e, "stored row lookup failed; waiting for its event"),
				}
				self.publish();
				Ok(())
			}
			Err(e) => {
				metrics::counter!("pachat_message_send_failures_total").increment(1);
				warn!(message_id = %message.id, error = %e, "message send failed");
				self.timeline.mark_failed(message.id, e.to_string());
				self.publish();
				Err(ClientCoreError::backend("Failed to send message")(e))
			}
		}
	}

	/// Fetch the page before the oldest loaded message. Returns `false` when
	/// nothing was requested (already loading or no more history).
	pub async fn load_older(&mut self) -> Result<bool, ClientCoreError> {
		let Some(request) = self.timeline.begin_load_older() else {
			return Ok(false);
		};
		self.publish();

		let room = self.timeline.room().clone();
		match self.store.fetch_page(&room, request.before.as_ref(), request.limit).await {
			Ok(page) => {
				let rows = page.len();
				self.timeline.apply_history_page(&request, page);
				debug!(room_id = %room, rows, has_more = self.timeline.has_more(), "older page loaded");
				self.publish();
				Ok(true)
			}
			Err(e) => {
				self.timeline.fail_load_older(&request);
				self.publish();
				Err(ClientCoreError::backend("Failed to load older messages")(e))
			}
		}
	}

	/// Fetch what was written while the channel was down, newest page first,
	/// until the pages reach the newest message known before the drop.
	async fn catch_up(&mut self) {
		let since = self.catch_up_since.take();
		let room = self.timeline.room().clone();
		let mut request = self.timeline.begin_catch_up(since);
		let mut pages = 0usize;

		loop {
			let page = match self.store.fetch_page(&room, request.before.as_ref(), request.limit).await {
				Ok(page) => page,
				Err(e) => {
					warn!(room_id = %room, pages, error = %e, "catch-up fetch failed; retrying on next rejoin");
					self.catch_up_since = since;
					self.reconnecting = true;
					return;
				}
			};
			pages += 1;
			let next = self.timeline.next_catch_up(&request, &page);
			self.timeline.apply_history_page(&request, page);
			match next {
				Some(r) => request = r,
				None => break,
			}
		}

		debug!(room_id = %room, pages, "caught up after reconnect");
	}

	fn mark_dropped(&mut self) {
		if !self.reconnecting {
			self.reconnecting = true;
			self.catch_up_since = self.timeline.newest();
		}
	}

	/// Apply one channel event to the view.
	pub async fn handle_event(&mut self, event: ChannelEvent) {
		match event {
			ChannelEvent::Broadcast { event, payload } => {
				if event != MESSAGE_EVENT {
					debug!(%event, "ignoring broadcast");
					return;
				}
				match serde_json::from_value::<Message>(payload) {
					Ok(message) => {
						self.timeline.apply_live(message);
					}
					Err(e) => warn!(error = %e, "undecodable message broadcast"),
				}
			}
			ChannelEvent::PostgresChange(change) => {
				if change.table != MESSAGE_TABLE || change.event != ChangeEvent::Insert {
					return;
				}
				match serde_json::from_value::<Message>(change.record) {
					Ok(message) => {
						self.timeline.apply_live(message);
					}
					Err(e) => warn!(error = %e, "undecodable message change"),
				}
			}
			ChannelEvent::PresenceState(state) => self.presence.sync_state(state),
			ChannelEvent::PresenceDiff(diff) => self.presence.sync_diff(diff),
			ChannelEvent::Joined => {
				self.live = true;
				if std::mem::take(&mut self.reconnecting) {
					self.catch_up().await;
				}
			}
			ChannelEvent::JoinFailed { reason } => {
				warn!(room_id = %self.timeline.room(), %reason, "room channel rejected");
				self.live = false;
			}
			ChannelEvent::Reconnecting { attempt, retry_in_ms } => {
				debug!(attempt, retry_in_ms, "room channel reconnecting");
				self.live = false;
				self.mark_dropped();
				// The server resends the full presence state after rejoining.
				self.presence.clear();
			}
			ChannelEvent::Error { reason } => {
				warn!(room_id = %self.timeline.room(), %reason, "room channel error");
				self.live = false;
				self.mark_dropped();
			}
			ChannelEvent::System { status, message } => {
				debug!(%status, %message, "realtime system message");
				return;
			}
			ChannelEvent::Closed => {
				info!(room_id = %self.timeline.room(), "room channel closed");
				self.live = false;
				self.closed = true;
			}
		}
		self.publish();
	}
}
