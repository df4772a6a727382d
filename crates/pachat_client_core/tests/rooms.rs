use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use pachat_backend::BackendError;
use pachat_backend::realtime::{ChangeEvent, ChannelEvent, PostgresChange};
use pachat_client_core::{ClientCoreError, RoomService, RoomStore, RoomsWatcher};
use pachat_domain::{CreateRoomInput, Room, RoomId, RoomSummary, UserId, UserProfile, ValidRoomInput};
use serde_json::{Value, json};
use tokio::sync::mpsc;

fn uid(s: &str) -> UserId {
	UserId::new(s).unwrap()
}

fn rid(s: &str) -> RoomId {
	RoomId::new(s).unwrap()
}

#[derive(Default)]
struct FakeRooms {
	rooms: Mutex<Vec<Room>>,
	members: Mutex<Vec<(RoomId, UserId)>>,
	profiles: Mutex<Vec<UserProfile>>,
	fail_add_member: AtomicBool,
}

impl FakeRooms {
	fn seeded() -> Arc<Self> {
		let store = Self::default();
		for (id, public) in [("general", true), ("random", true), ("secret", false)] {
			store.rooms.lock().unwrap().push(Room {
				id: rid(id),
				name: id.to_string(),
				is_public: public,
				created_at: Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap(),
			});
		}
		store.members.lock().unwrap().extend([
			(rid("general"), uid("ann")),
			(rid("secret"), uid("ann")),
			(rid("random"), uid("bob")),
		]);
		for (id, name) in [("ann", "Ann"), ("bob", "Bob"), ("cat", "Cat")] {
			store.profiles.lock().unwrap().push(UserProfile {
				id: uid(id),
				name: name.into(),
				image_url: None,
			});
		}
		Arc::new(store)
	}

	fn summary(&self, room: &Room) -> RoomSummary {
		let members = self.members.lock().unwrap();
		RoomSummary {
			id: room.id.clone(),
			name: room.name.clone(),
			member_count: members.iter().filter(|(r, _)| r == &room.id).count() as u64,
		}
	}

	fn conflict() -> BackendError {
		BackendError::Status {
			status: 409,
			message: "duplicate key value violates unique constraint".into(),
		}
	}
}

#[async_trait]
impl RoomStore for FakeRooms {
	async fn joined_rooms(&self, user: &UserId) -> Result<Vec<RoomSummary>, BackendError> {
		let rooms = self.rooms.lock().unwrap().clone();
		let joined: Vec<RoomId> = self
			.members
			.lock()
			.unwrap()
			.iter()
			.filter(|(_, u)| u == user)
			.map(|(r, _)| r.clone())
			.collect();
		let mut out: Vec<RoomSummary> = rooms
			.iter()
			.filter(|r| joined.contains(&r.id))
			.map(|r| self.summary(r))
			.collect();
		out.sort_by(|a, b| a.name.cmp(&b.name));
		Ok(out)
	}

	async fn public_rooms(&self) -> Result<Vec<RoomSummary>, BackendError> {
		let rooms = self.rooms.lock().unwrap().clone();
		Ok(rooms.iter().filter(|r| r.is_public).map(|r| self.summary(r)).collect())
	}

	async fn room(&self, room: &RoomId) -> Result<Option<Room>, BackendError> {
		Ok(self.rooms.lock().unwrap().iter().find(|r| &r.id == room).cloned())
	}

	async fn insert_room(&self, input: &ValidRoomInput) -> Result<RoomId, BackendError> {
		let mut rooms = self.rooms.lock().unwrap();
		let id = rid(&format!("room-{}", rooms.len() + 1));
		rooms.push(Room {
			id: id.clone(),
			name: input.name.clone(),
			is_public: input.is_public,
			created_at: Utc::now(),
		});
		Ok(id)
	}

	async fn insert_member(&self, room: &RoomId, user: &UserId) -> Result<(), BackendError> {
		let mut members = self.members.lock().unwrap();
		if members.iter().any(|(r, u)| r == room && u == user) {
			return Err(Self::conflict());
		}
		members.push((room.clone(), user.clone()));
		Ok(())
	}

	async fn add_member(&self, room: &RoomId, user: &UserId) -> Result<(), BackendError> {
		if self.fail_add_member.load(Ordering::SeqCst) {
			return Err(BackendError::Status {
				status: 500,
				message: "boom".into(),
			});
		}
		self.insert_member(room, user).await
	}

	async fn delete_member(&self, room: &RoomId, user: &UserId) -> Result<(), BackendError> {
		self.members.lock().unwrap().retain(|(r, u)| !(r == room && u == user));
		Ok(())
	}

	async fn is_member(&self, room: &RoomId, user: &UserId) -> Result<bool, BackendError> {
		Ok(self.members.lock().unwrap().iter().any(|(r, u)| r == room && u == user))
	}

	async fn profile(&self, user: &UserId) -> Result<Option<UserProfile>, BackendError> {
		Ok(self.profiles.lock().unwrap().iter().find(|p| &p.id == user).cloned())
	}
}

fn names(rooms: &[RoomSummary]) -> Vec<&str> {
	rooms.iter().map(|r| r.name.as_str()).collect()
}

#[tokio::test]
async fn overview_splits_joined_and_discoverable_rooms() {
	let service = RoomService::new(FakeRooms::seeded());
	let overview = service.overview(&uid("ann")).await.unwrap();
	assert_eq!(names(&overview.joined), ["general", "secret"]);
	assert_eq!(names(&overview.public), ["random"]);

	let newcomer = service.overview(&uid("cat")).await.unwrap();
	assert!(newcomer.joined.is_empty());
	assert_eq!(names(&newcomer.public), ["general", "random"]);
}

#[tokio::test]
async fn create_room_adds_the_creator() {
	let store = FakeRooms::seeded();
	let service = RoomService::new(store.clone());

	let id = service
		.create_room(&uid("cat"), &CreateRoomInput::new("  book club ", false))
		.await
		.unwrap();

	let room = service.open_room(&uid("cat"), &id).await.unwrap();
	assert_eq!(room.name, "book club");
	assert!(!room.is_public);
	assert_eq!(names(&service.list_joined_rooms(&uid("cat")).await.unwrap()), ["book club"]);
}

#[tokio::test]
async fn create_room_rejects_blank_names() {
	let store = FakeRooms::seeded();
	let service = RoomService::new(store.clone());

	let err = service
		.create_room(&uid("cat"), &CreateRoomInput::new("   ", true))
		.await
		.unwrap_err();
	assert!(matches!(err, ClientCoreError::Validation { .. }));
	assert_eq!(err.to_string(), "Invalid room data");
	assert_eq!(store.rooms.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn create_room_reports_failed_creator_membership() {
	let store = FakeRooms::seeded();
	store.fail_add_member.store(true, Ordering::SeqCst);
	let service = RoomService::new(store);

	let err = service
		.create_room(&uid("cat"), &CreateRoomInput::new("orphan", true))
		.await
		.unwrap_err();
	assert_eq!(err.to_string(), "failed to add user to room");
}

#[tokio::test]
async fn open_room_requires_membership() {
	let service = RoomService::new(FakeRooms::seeded());
	assert!(matches!(
		service.open_room(&uid("bob"), &rid("general")).await,
		Err(ClientCoreError::NotAMember)
	));
	assert!(matches!(
		service.open_room(&uid("ann"), &rid("missing")).await,
		Err(ClientCoreError::RoomNotFound)
	));
	assert_eq!(service.open_room(&uid("ann"), &rid("general")).await.unwrap().name, "general");
}

#[tokio::test]
async fn joining_twice_is_fine_and_leaving_removes_membership() {
	let store = FakeRooms::seeded();
	let service = RoomService::new(store.clone());

	service.join_room(&uid("cat"), &rid("random")).await.unwrap();
	service.join_room(&uid("cat"), &rid("random")).await.unwrap();
	assert_eq!(
		store
			.members
			.lock()
			.unwrap()
			.iter()
			.filter(|(r, u)| r == &rid("random") && u == &uid("cat"))
			.count(),
		1
	);

	service.leave_room(&uid("cat"), &rid("random")).await.unwrap();
	assert!(service.list_joined_rooms(&uid("cat")).await.unwrap().is_empty());
}

#[tokio::test]
async fn add_user_to_room_enforces_membership_rules() {
	let service = RoomService::new(FakeRooms::seeded());
	let room = rid("general");

	assert!(matches!(
		service.add_user_to_room(&uid("bob"), &room, &uid("cat")).await,
		Err(ClientCoreError::NotAMember)
	));
	assert!(matches!(
		service.add_user_to_room(&uid("ann"), &room, &uid("nobody")).await,
		Err(ClientCoreError::UserNotFound)
	));

	service.add_user_to_room(&uid("ann"), &room, &uid("cat")).await.unwrap();
	assert!(service.open_room(&uid("cat"), &room).await.is_ok());

	let err = service.add_user_to_room(&uid("ann"), &room, &uid("cat")).await.unwrap_err();
	assert!(matches!(err, ClientCoreError::AlreadyMember));
	assert_eq!(err.to_string(), "User is already a member of this room");
}

fn membership_change(room: &str, user: &str) -> ChannelEvent {
	ChannelEvent::PostgresChange(PostgresChange {
		event: ChangeEvent::Insert,
		schema: "public".into(),
		table: "chat_room_member".into(),
		record: json!({"chat_room_id": room, "member_id": user}),
		old_record: Value::Null,
		commit_timestamp: None,
	})
}

#[tokio::test]
async fn watcher_refetches_after_membership_changes() {
	let store = FakeRooms::seeded();
	let service = RoomService::new(store.clone());
	let (tx, rx) = mpsc::unbounded_channel();

	let watcher = RoomsWatcher::spawn(service, uid("cat"), Duration::from_millis(20), rx)
		.await
		.unwrap();
	assert!(watcher.current().joined.is_empty());
	let mut updates = watcher.subscribe();

	// Someone else adds cat to a room.
	store.members.lock().unwrap().push((rid("general"), uid("cat")));
	tx.send(membership_change("general", "cat")).unwrap();
	tx.send(membership_change("general", "cat")).unwrap();

	tokio::time::timeout(Duration::from_secs(2), updates.changed())
		.await
		.expect("overview update")
		.unwrap();
	let overview = updates.borrow_and_update().clone();
	assert_eq!(names(&overview.joined), ["general"]);
	assert_eq!(names(&overview.public), ["random"]);
}

#[tokio::test]
async fn watcher_refresh_picks_up_local_changes() {
	let store = FakeRooms::seeded();
	let service = RoomService::new(store.clone());
	let (_tx, rx) = mpsc::unbounded_channel();

	let watcher = RoomsWatcher::spawn(service.clone(), uid("cat"), Duration::from_millis(10), rx)
		.await
		.unwrap();
	let mut updates = watcher.subscribe();

	service.join_room(&uid("cat"), &rid("random")).await.unwrap();
	watcher.refresh();

	tokio::time::timeout(Duration::from_secs(2), updates.changed())
		.await
		.expect("overview update")
		.unwrap();
	assert_eq!(names(&watcher.current().joined), ["random"]);
}
