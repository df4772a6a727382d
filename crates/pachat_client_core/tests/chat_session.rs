use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use pachat_backend::BackendError;
use pachat_backend::realtime::{ChangeEvent, ChannelEvent, PostgresChange, PresenceDiff, PresenceState};
use pachat_client_core::{ChatSession, ClientCoreError, Cursor, Delivery, MessageStore, RoomChannel};
use pachat_domain::{Message, MessageId, NewMessage, RoomId, UserId, UserProfile};
use serde_json::{Value, json};
use tokio::sync::mpsc;

fn room() -> RoomId {
	RoomId::new("r1").unwrap()
}

fn at(secs: i64) -> DateTime<Utc> {
	Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
}

fn me() -> UserProfile {
	UserProfile {
		id: UserId::new("ann").unwrap(),
		name: "Ann".into(),
		image_url: Some("https://img.example/ann.png".into()),
	}
}

fn row(n: u128, secs: i64) -> Message {
	Message {
		id: MessageId(uuid::Uuid::from_u128(n)),
		room_id: room(),
		author_id: UserId::new("bob").unwrap(),
		text: format!("m{n}"),
		created_at: at(secs),
		author: None,
	}
}

#[derive(Default)]
struct FakeStore {
	rows: Mutex<Vec<Message>>,
	clock: AtomicUsize,
	fail_inserts: AtomicBool,
	fail_fetches: AtomicBool,
	fetches: AtomicUsize,
}

impl FakeStore {
	fn with_rows(rows: Vec<Message>) -> Arc<Self> {
		Arc::new(Self {
			rows: Mutex::new(rows),
			clock: AtomicUsize::new(1000),
			..Self::default()
		})
	}
}

#[async_trait]
impl MessageStore for FakeStore {
	async fn fetch_page(&self, room: &RoomId, before: Option<&Cursor>, limit: usize) -> Result<Vec<Message>, BackendError> {
		self.fetches.fetch_add(1, Ordering::SeqCst);
		if self.fail_fetches.load(Ordering::SeqCst) {
			return Err(BackendError::Http("connection reset".into()));
		}
		let mut rows: Vec<Message> = self
			.rows
			.lock()
			.unwrap()
			.iter()
			.filter(|m| &m.room_id == room)
			.filter(|m| before.map(|c| (m.created_at, m.id) < (c.created_at, c.id)).unwrap_or(true))
			.cloned()
			.collect();
		rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
		rows.truncate(limit);
		Ok(rows)
	}

	async fn fetch_one(&self, room: &RoomId, id: MessageId) -> Result<Option<Message>, BackendError> {
		if self.fail_fetches.load(Ordering::SeqCst) {
			return Err(BackendError::Http("connection reset".into()));
		}
		let rows = self.rows.lock().unwrap();
		Ok(rows.iter().find(|m| &m.room_id == room && m.id == id).cloned())
	}

	async fn insert(&self, message: &NewMessage) -> Result<Message, BackendError> {
		if self.fail_inserts.load(Ordering::SeqCst) {
			return Err(BackendError::Status {
				status: 503,
				message: "unavailable".into(),
			});
		}
		let mut rows = self.rows.lock().unwrap();
		if rows.iter().any(|m| m.id == message.id) {
			return Err(BackendError::Status {
				status: 409,
				message: "duplicate key value violates unique constraint".into(),
			});
		}
		let secs = self.clock.fetch_add(1, Ordering::SeqCst) as i64;
		let stored = Message {
			id: message.id,
			room_id: message.room_id.clone(),
			author_id: message.author_id.clone(),
			text: message.text.clone(),
			created_at: at(secs),
			author: None,
		};
		rows.push(stored.clone());
		Ok(stored)
	}
}

#[derive(Default, Clone)]
struct FakeChannel {
	broadcasts: Arc<Mutex<Vec<(String, Value)>>>,
	tracked: Arc<Mutex<Vec<Value>>>,
}

impl RoomChannel for FakeChannel {
	fn broadcast(&self, event: &str, payload: Value) -> Result<(), BackendError> {
		self.broadcasts.lock().unwrap().push((event.to_string(), payload));
		Ok(())
	}

	fn track(&self, payload: Value) -> Result<(), BackendError> {
		self.tracked.lock().unwrap().push(payload);
		Ok(())
	}
}

async fn open(store: Arc<FakeStore>, page_size: usize) -> (ChatSession, FakeChannel, mpsc::UnboundedSender<ChannelEvent>) {
	let channel = FakeChannel::default();
	let (tx, rx) = mpsc::unbounded_channel();
	let session = ChatSession::open(store, Box::new(channel.clone()), rx, room(), me(), page_size)
		.await
		.unwrap();
	(session, channel, tx)
}

fn texts(session: &ChatSession) -> Vec<String> {
	session.snapshot().entries.into_iter().map(|e| e.message.text).collect()
}

#[tokio::test]
async fn open_loads_newest_page_and_tracks_presence() {
	let store = FakeStore::with_rows((1..=5).map(|n| row(n, n as i64)).collect());
	let (session, channel, _tx) = open(store, 3).await;

	assert_eq!(texts(&session), ["m3", "m4", "m5"]);
	assert!(session.snapshot().has_more);
	assert_eq!(
		channel.tracked.lock().unwrap().as_slice(),
		[json!({"name": "Ann", "image_url": "https://img.example/ann.png"})]
	);
}

#[tokio::test]
async fn send_confirms_and_broadcasts_the_stored_row() {
	let store = FakeStore::with_rows(vec![row(1, 1)]);
	let (mut session, channel, _tx) = open(store.clone(), 10).await;
	let mut updates = session.subscribe();

	let id = session.send("  hello  ").await.unwrap();

	let snap = session.snapshot();
	assert_eq!(snap.entries.len(), 2);
	let sent = &snap.entries[1];
	assert_eq!(sent.message.id, id);
	assert_eq!(sent.message.text, "hello");
	assert_eq!(sent.delivery, Delivery::Confirmed);
	assert_eq!(sent.message.author.as_ref().unwrap().name, "Ann");
	assert!(updates.has_changed().unwrap());
	assert_eq!(updates.borrow_and_update().entries, snap.entries);

	let broadcasts = channel.broadcasts.lock().unwrap();
	assert_eq!(broadcasts.len(), 1);
	assert_eq!(broadcasts[0].0, "message");
	assert_eq!(broadcasts[0].1["id"], id.to_string());
	assert_eq!(broadcasts[0].1["chat_room_id"], "r1");
	drop(broadcasts);

	// The database-change echo of our own insert is absorbed.
	let echo = store.rows.lock().unwrap().last().cloned().unwrap();
	session
		.handle_event(ChannelEvent::PostgresChange(PostgresChange {
			event: ChangeEvent::Insert,
			schema: "public".into(),
			table: "message".into(),
			record: serde_json::to_value(&echo).unwrap(),
			old_record: Value::Null,
			commit_timestamp: None,
		}))
		.await;
	assert_eq!(session.snapshot().entries.len(), 2);
}

#[tokio::test]
async fn blank_messages_are_rejected_without_a_trace() {
	let (mut session, channel, _tx) = open(FakeStore::with_rows(vec![]), 10).await;
	let err = session.send("   ").await.unwrap_err();
	assert!(matches!(err, ClientCoreError::Validation { .. }));
	assert!(session.snapshot().entries.is_empty());
	assert!(channel.broadcasts.lock().unwrap().is_empty());
}

#[tokio::test]
async fn failed_send_can_be_retried_with_the_same_id() {
	let store = FakeStore::with_rows(vec![]);
	let (mut session, _channel, _tx) = open(store.clone(), 10).await;

	store.fail_inserts.store(true, Ordering::SeqCst);
	let err = session.send("hi").await.unwrap_err();
	assert_eq!(err.to_string(), "Failed to send message");

	let entry = session.snapshot().entries.pop().unwrap();
	let id = entry.message.id;
	assert!(matches!(entry.delivery, Delivery::Failed { .. }));

	store.fail_inserts.store(false, Ordering::SeqCst);
	session.retry(id).await.unwrap();
	let entries = session.snapshot().entries;
	assert_eq!(entries.len(), 1);
	assert_eq!(entries[0].message.id, id);
	assert_eq!(entries[0].delivery, Delivery::Confirmed);

	assert!(session.retry(id).await.is_err(), "confirmed messages cannot be retried");
}

async fn failed_send_that_actually_landed(store: &FakeStore, session: &mut ChatSession) -> Message {
	store.fail_inserts.store(true, Ordering::SeqCst);
	let _ = session.send("hi").await;
	let id = session.snapshot().entries.last().unwrap().message.id;

	// The first attempt reached the store; only the response was lost.
	let stored = Message {
		id,
		room_id: room(),
		author_id: me().id,
		text: "hi".into(),
		created_at: at(500),
		author: None,
	};
	store.rows.lock().unwrap().push(stored.clone());
	store.fail_inserts.store(false, Ordering::SeqCst);
	stored
}

#[tokio::test]
async fn retry_after_a_lost_response_confirms_with_the_stored_row() {
	let store = FakeStore::with_rows(vec![row(1, 600)]);
	let (mut session, _channel, _tx) = open(store.clone(), 10).await;
	let stored = failed_send_that_actually_landed(&store, &mut session).await;

	session.retry(stored.id).await.unwrap();
	let entries = session.snapshot().entries;
	assert_eq!(entries.len(), 2);
	assert_eq!(entries[0].message.id, stored.id, "sorted by server time");
	assert_eq!(entries[0].delivery, Delivery::Confirmed);
	assert_eq!(entries[0].message.created_at, stored.created_at);
	assert_eq!(entries[0].message.author.as_ref().map(|a| a.name.as_str()), Some("Ann"));
	assert_eq!(session.timeline().cursor(), Some(Cursor::of(&stored)));
}

#[tokio::test]
async fn conflict_without_a_visible_row_waits_for_the_live_event() {
	let store = FakeStore::with_rows(vec![]);
	let (mut session, _channel, _tx) = open(store.clone(), 10).await;
	let stored = failed_send_that_actually_landed(&store, &mut session).await;

	store.fail_fetches.store(true, Ordering::SeqCst);
	session.retry(stored.id).await.unwrap();
	assert_eq!(session.timeline().delivery(stored.id), Some(Delivery::Pending));
	assert_eq!(session.timeline().cursor(), None, "local clock never becomes the cursor");

	session
		.handle_event(ChannelEvent::Broadcast {
			event: "message".into(),
			payload: serde_json::to_value(&stored).unwrap(),
		})
		.await;
	let entries = session.snapshot().entries;
	assert_eq!(entries.len(), 1);
	assert_eq!(entries[0].delivery, Delivery::Confirmed);
	assert_eq!(entries[0].message.created_at, stored.created_at);
}

#[tokio::test]
async fn failed_messages_can_be_discarded() {
	let store = FakeStore::with_rows(vec![]);
	let (mut session, _channel, _tx) = open(store.clone(), 10).await;
	store.fail_inserts.store(true, Ordering::SeqCst);
	let _ = session.send("oops").await;
	let id = session.snapshot().entries[0].message.id;

	assert!(session.discard(id));
	assert!(!session.discard(id));
	assert!(session.snapshot().entries.is_empty());
}

#[tokio::test]
async fn live_events_merge_and_duplicates_are_ignored() {
	let store = FakeStore::with_rows(vec![row(1, 10), row(2, 20)]);
	let (mut session, _channel, _tx) = open(store, 10).await;

	let mut dup = row(2, 20);
	dup.author = Some(UserProfile {
		id: UserId::new("bob").unwrap(),
		name: "Bob".into(),
		image_url: None,
	});
	session
		.handle_event(ChannelEvent::Broadcast {
			event: "message".into(),
			payload: serde_json::to_value(&dup).unwrap(),
		})
		.await;
	session
		.handle_event(ChannelEvent::Broadcast {
			event: "message".into(),
			payload: serde_json::to_value(row(3, 15)).unwrap(),
		})
		.await;
	session
		.handle_event(ChannelEvent::Broadcast {
			event: "typing".into(),
			payload: json!({"user": "bob"}),
		})
		.await;
	session
		.handle_event(ChannelEvent::Broadcast {
			event: "message".into(),
			payload: json!({"garbage": true}),
		})
		.await;

	assert_eq!(texts(&session), ["m1", "m3", "m2"]);
	assert_eq!(
		session.snapshot().entries[2].message.author.as_ref().map(|a| a.name.clone()),
		Some("Bob".to_string())
	);
}

#[tokio::test]
async fn presence_events_drive_the_online_count() {
	let (mut session, _channel, _tx) = open(FakeStore::with_rows(vec![]), 10).await;

	let state: PresenceState = serde_json::from_value(json!({
		"ann": {"metas": [{"phx_ref": "a1", "name": "Ann"}]},
		"bob": {"metas": [{"phx_ref": "b1", "name": "Bob"}]}
	}))
	.unwrap();
	session.handle_event(ChannelEvent::Joined).await;
	session.handle_event(ChannelEvent::PresenceState(state)).await;
	assert_eq!(session.snapshot().online_count, 2);
	assert!(session.snapshot().live);

	let diff: PresenceDiff = serde_json::from_value(json!({
		"joins": {},
		"leaves": {"bob": {"metas": [{"phx_ref": "b1"}]}}
	}))
	.unwrap();
	session.handle_event(ChannelEvent::PresenceDiff(diff)).await;
	let snap = session.snapshot();
	assert_eq!(snap.online_count, 1);
	assert_eq!(snap.online_users[0].name.as_deref(), Some("Ann"));

	session
		.handle_event(ChannelEvent::Reconnecting {
			attempt: 1,
			retry_in_ms: 500,
		})
		.await;
	let snap = session.snapshot();
	assert!(!snap.live);
	assert_eq!(snap.online_count, 0);
}

#[tokio::test]
async fn rejoin_after_reconnect_fetches_missed_messages() {
	let store = FakeStore::with_rows(vec![row(1, 10)]);
	let (mut session, _channel, _tx) = open(store.clone(), 10).await;
	session.handle_event(ChannelEvent::Joined).await;
	let fetches = store.fetches.load(Ordering::SeqCst);

	session
		.handle_event(ChannelEvent::Reconnecting {
			attempt: 1,
			retry_in_ms: 500,
		})
		.await;
	store.rows.lock().unwrap().push(row(2, 20));
	session.handle_event(ChannelEvent::Joined).await;

	assert_eq!(store.fetches.load(Ordering::SeqCst), fetches + 1);
	assert_eq!(texts(&session), ["m1", "m2"]);

	// A plain rejoin without a drop does not refetch.
	session.handle_event(ChannelEvent::Joined).await;
	assert_eq!(store.fetches.load(Ordering::SeqCst), fetches + 1);
}

#[tokio::test]
async fn long_outage_is_backfilled_page_by_page() {
	let store = FakeStore::with_rows((1..=7).map(|n| row(n, n as i64)).collect());
	let (mut session, _channel, _tx) = open(store.clone(), 3).await;
	session.handle_event(ChannelEvent::Joined).await;
	session
		.handle_event(ChannelEvent::Reconnecting {
			attempt: 1,
			retry_in_ms: 500,
		})
		.await;

	// More than a page was written while offline.
	store
		.rows
		.lock()
		.unwrap()
		.extend((8..=12).map(|n| row(n, n as i64)));
	session.handle_event(ChannelEvent::Joined).await;
	assert_eq!(texts(&session), ["m5", "m6", "m7", "m8", "m9", "m10", "m11", "m12"]);

	while session.load_older().await.unwrap() {}
	let expected: Vec<String> = (1..=12).map(|n| format!("m{n}")).collect();
	assert_eq!(texts(&session), expected);
}

#[tokio::test]
async fn failed_catch_up_is_retried_on_the_next_rejoin() {
	let store = FakeStore::with_rows((1..=3).map(|n| row(n, n as i64)).collect());
	let (mut session, _channel, _tx) = open(store.clone(), 2).await;
	session.handle_event(ChannelEvent::Joined).await;
	session.handle_event(ChannelEvent::Error { reason: "timeout".into() }).await;

	store
		.rows
		.lock()
		.unwrap()
		.extend((4..=8).map(|n| row(n, n as i64)));
	store.fail_fetches.store(true, Ordering::SeqCst);
	session.handle_event(ChannelEvent::Joined).await;
	assert_eq!(texts(&session), ["m2", "m3"]);

	store.fail_fetches.store(false, Ordering::SeqCst);
	session.handle_event(ChannelEvent::Joined).await;
	assert_eq!(texts(&session), ["m2", "m3", "m4", "m5", "m6", "m7", "m8"]);
}

#[tokio::test]
async fn load_older_pages_back_until_history_runs_out() {
	let store = FakeStore::with_rows((1..=7).map(|n| row(n, n as i64)).collect());
	let (mut session, _channel, _tx) = open(store.clone(), 3).await;
	assert_eq!(texts(&session), ["m5", "m6", "m7"]);

	assert!(session.load_older().await.unwrap());
	assert_eq!(texts(&session), ["m2", "m3", "m4", "m5", "m6", "m7"]);
	assert!(session.snapshot().has_more);

	assert!(session.load_older().await.unwrap());
	assert!(!session.snapshot().has_more);
	assert_eq!(session.snapshot().entries.len(), 7);

	let fetches = store.fetches.load(Ordering::SeqCst);
	assert!(!session.load_older().await.unwrap());
	assert_eq!(store.fetches.load(Ordering::SeqCst), fetches);
}

#[tokio::test]
async fn failed_older_fetch_can_be_retried() {
	let store = FakeStore::with_rows((1..=4).map(|n| row(n, n as i64)).collect());
	let (mut session, _channel, _tx) = open(store.clone(), 2).await;

	store.fail_fetches.store(true, Ordering::SeqCst);
	let err = session.load_older().await.unwrap_err();
	assert_eq!(err.to_string(), "Failed to load older messages");
	assert!(!session.snapshot().loading_older);

	store.fail_fetches.store(false, Ordering::SeqCst);
	assert!(session.load_older().await.unwrap());
	assert_eq!(texts(&session), ["m1", "m2", "m3", "m4"]);
}

#[tokio::test]
async fn closed_channel_ends_the_event_stream() {
	let (mut session, _channel, tx) = open(FakeStore::with_rows(vec![]), 10).await;
	tx.send(ChannelEvent::Closed).unwrap();
	let ev = session.next_event().await.unwrap();
	session.handle_event(ev).await;
	assert!(session.is_closed());
	assert!(session.next_event().await.is_none());
}
