#![forbid(unsafe_code)]

use std::sync::Arc;

use async_trait::async_trait;
use pachat_backend::{Backend, BackendError};
use pachat_domain::{CreateRoomInput, Room, RoomId, RoomSummary, UserId, UserProfile, ValidRoomInput};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::TokenSource;
use crate::error::ClientCoreError;

pub const ROOM_TABLE: &str = "chat_room";
pub const MEMBER_TABLE: &str = "chat_room_member";
pub const PROFILE_TABLE: &str = "user_profile";

/// Room and membership persistence.
#[async_trait]
pub trait RoomStore: Send + Sync {
	/// Rooms `user` belongs to, by name.
	async fn joined_rooms(&self, user: &UserId) -> Result<Vec<RoomSummary>, BackendError>;

	/// Public rooms, oldest first.
	async fn public_rooms(&self) -> Result<Vec<RoomSummary>, BackendError>;

	async fn room(&self, room: &RoomId) -> Result<Option<Room>, BackendError>;

	async fn insert_room(&self, input: &ValidRoomInput) -> Result<RoomId, BackendError>;

	/// Membership written on the member's own behalf.
	async fn insert_member(&self, room: &RoomId, user: &UserId) -> Result<(), BackendError>;

	/// Membership written by room administration (creator, invites).
	async fn add_member(&self, room: &RoomId, user: &UserId) -> Result<(), BackendError>;

	async fn delete_member(&self, room: &RoomId, user: &UserId) -> Result<(), BackendError>;

	async fn is_member(&self, room: &RoomId, user: &UserId) -> Result<bool, BackendError>;

	async fn profile(&self, user: &UserId) -> Result<Option<UserProfile>, BackendError>;
}

#[derive(Debug, Deserialize)]
struct IdRow {
	id: RoomId,
}

#[derive(Debug, Deserialize)]
struct MemberRef {
	member_id: UserId,
}

#[derive(Debug, Deserialize)]
struct JoinedRow {
	id: RoomId,
	name: String,
	#[serde(default)]
	chat_room_member: Vec<MemberRef>,
}

#[derive(Debug, Deserialize)]
struct CountRow {
	count: u64,
}

#[derive(Debug, Deserialize)]
struct CountedRow {
	id: RoomId,
	name: String,
	#[serde(default)]
	chat_room_member: Vec<CountRow>,
}

/// [`RoomStore`] over the storage API. Reads and self-membership use the
/// user's token; room administration uses the backend's admin bearer.
#[derive(Debug, Clone)]
pub struct RestRoomStore {
	backend: Backend,
	token: TokenSource,
}

impl RestRoomStore {
	pub fn new(backend: Backend, token: TokenSource) -> Self {
		Self { backend, token }
	}
}

#[async_trait]
impl RoomStore for RestRoomStore {
	async fn joined_rooms(&self, user: &UserId) -> Result<Vec<RoomSummary>, BackendError> {
		let token = self.token.borrow().clone();
		let rows: Vec<JoinedRow> = self
			.backend
			.rest
			.from(ROOM_TABLE, &token)
			.select("id, name, chat_room_member (member_id)")
			.order("name", true)
			.fetch()
			.await?;

		Ok(rows
			.into_iter()
			.filter(|r| r.chat_room_member.iter().any(|m| &m.member_id == user))
			.map(|r| RoomSummary {
				member_count: r.chat_room_member.len() as u64,
				id: r.id,
				name: r.name,
			})
			.collect())
	}

	async fn public_rooms(&self) -> Result<Vec<RoomSummary>, BackendError> {
		let token = self.token.borrow().clone();
		let rows: Vec<CountedRow> = self
			.backend
			.rest
			.from(ROOM_TABLE, &token)
			.select("id, name, chat_room_member (count)")
			.is_true("is_public")
			.order("created_at", true)
			.fetch()
			.await?;

		Ok(rows
			.into_iter()
			.map(|r| RoomSummary {
				member_count: r.chat_room_member.first().map(|c| c.count).unwrap_or(0),
				id: r.id,
				name: r.name,
			})
			.collect())
	}

	async fn room(&self, room: &RoomId) -> Result<Option<Room>, BackendError> {
		let token = self.token.borrow().clone();
		self.backend
			.rest
			.from(ROOM_TABLE, &token)
			.select("id, name, is_public, created_at")
			.eq("id", room)
			.fetch_optional()
			.await
	}

	async fn insert_room(&self, input: &ValidRoomInput) -> Result<RoomId, BackendError> {
		let token = self.token.borrow().clone();
		let bearer = self.backend.admin_bearer(&token);
		let row: IdRow = self
			.backend
			.rest
			.insert(ROOM_TABLE, bearer, &json!({ "name": input.name, "is_public": input.is_public }))
			.await?;
		Ok(row.id)
	}

	async fn insert_member(&self, room: &RoomId, user: &UserId) -> Result<(), BackendError> {
		let token = self.token.borrow().clone();
		self.backend
			.rest
			.insert_minimal(MEMBER_TABLE, &token, &json!({ "chat_room_id": room, "member_id": user }))
			.await
	}

	async fn add_member(&self, room: &RoomId, user: &UserId) -> Result<(), BackendError> {
		let token = self.token.borrow().clone();
		let bearer = self.backend.admin_bearer(&token);
		self.backend
			.rest
			.insert_minimal(MEMBER_TABLE, bearer, &json!({ "chat_room_id": room, "member_id": user }))
			.await
	}

	async fn delete_member(&self, room: &RoomId, user: &UserId) -> Result<(), BackendError> {
		let token = self.token.borrow().clone();
		self.backend
			.rest
			.delete(
				MEMBER_TABLE,
				&token,
				&[("chat_room_id", room.as_str()), ("member_id", user.as_str())],
			)
			.await
	}

	async fn is_member(&self, room: &RoomId, user: &UserId) -> Result<bool, BackendError> {
		let token = self.token.borrow().clone();
		let bearer = self.backend.admin_bearer(&token);
		let row: Option<MemberRef> = self
			.backend
			.rest
			.from(MEMBER_TABLE, bearer)
			.select("member_id")
			.eq("chat_room_id", room)
			.eq("member_id", user)
			.fetch_optional()
			.await?;
		Ok(row.is_some())
	}

	async fn profile(&self, user: &UserId) -> Result<Option<UserProfile>, BackendError> {
		let token = self.token.borrow().clone();
		self.backend
			.rest
			.from(PROFILE_TABLE, &token)
			.select("id, name, image_url")
			.eq("id", user)
			.fetch_optional()
			.await
	}
}

/// Joined rooms plus public rooms the user has not joined.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoomsOverview {
	pub joined: Vec<RoomSummary>,
	pub public: Vec<RoomSummary>,
}

impl RoomsOverview {
	pub fn new(joined: Vec<RoomSummary>, mut public: Vec<RoomSummary>) -> Self {
		public.retain(|p| !joined.iter().any(|j| j.id == p.id));
		Self { joined, public }
	}

	/// Nothing to show: the user should be offered to create a room.
	pub fn is_empty(&self) -> bool {
		self.joined.is_empty() && self.public.is_empty()
	}
}

/// Room listing and membership rules.
#[derive(Clone)]
pub struct RoomService {
	store: Arc<dyn RoomStore>,
}

impl std::fmt::Debug for RoomService {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("RoomService").finish_non_exhaustive()
	}
}

impl RoomService {
	pub fn new(store: Arc<dyn RoomStore>) -> Self {
		Self { store }
	}

	pub async fn list_joined_rooms(&self, user: &UserId) -> Result<Vec<RoomSummary>, ClientCoreError> {
		self.store
			.joined_rooms(user)
			.await
			.map_err(ClientCoreError::backend("Failed to load rooms"))
	}

	pub async fn list_public_rooms(&self) -> Result<Vec<RoomSummary>, ClientCoreError> {
		self.store
			.public_rooms()
			.await
			.map_err(ClientCoreError::backend("Failed to load rooms"))
	}

	pub async fn overview(&self, user: &UserId) -> Result<RoomsOverview, ClientCoreError> {
		let (joined, public) = tokio::try_join!(self.list_joined_rooms(user), self.list_public_rooms())?;
		Ok(RoomsOverview::new(joined, public))
	}

	/// The room, if `user` is a member of it.
	pub async fn open_room(&self, user: &UserId, room: &RoomId) -> Result<Room, ClientCoreError> {
		let found = self
			.store
			.room(room)
			.await
			.map_err(ClientCoreError::backend("Failed to load room"))?
			.ok_or(ClientCoreError::RoomNotFound)?;

		let member = self
			.store
			.is_member(room, user)
			.await
			.map_err(ClientCoreError::backend("Failed to load room"))?;
		if !member {
			return Err(ClientCoreError::NotAMember);
		}
		Ok(found)
	}

	/// Profile of `user`, if one exists.
	pub async fn profile(&self, user: &UserId) -> Result<Option<UserProfile>, ClientCoreError> {
		self.store
			.profile(user)
			.await
			.map_err(ClientCoreError::backend("Failed to load profile"))
	}

	/// Create a room and make `creator` its first member.
	pub async fn create_room(&self, creator: &UserId, input: &CreateRoomInput) -> Result<RoomId, ClientCoreError> {
		let valid = input.validate().map_err(ClientCoreError::validation("Invalid room data"))?;

		let room = self
			.store
			.insert_room(&valid)
			.await
			.map_err(ClientCoreError::backend("failed to create room"))?;

		if let Err(e) = self.store.add_member(&room, creator).await {
			warn!(room_id = %room, user_id = %creator, error = %e, "room created but creator membership failed");
			return Err(ClientCoreError::backend("failed to add user to room")(e));
		}

		info!(room_id = %room, user_id = %creator, public = valid.is_public, "room created");
		Ok(room)
	}

	/// Join a room. Joining a room twice is not an error.
	pub async fn join_room(&self, user: &UserId, room: &RoomId) -> Result<(), ClientCoreError> {
		match self.store.insert_member(room, user).await {
			Ok(()) => {
				info!(room_id = %room, user_id = %user, "joined room");
				Ok(())
			}
			Err(e) if e.is_conflict() => {
				debug!(room_id = %room, user_id = %user, "already a member");
				Ok(())
			}
			Err(e) => Err(ClientCoreError::backend("Failed to join room")(e)),
		}
	}

	pub async fn leave_room(&self, user: &UserId, room: &RoomId) -> Result<(), ClientCoreError> {
		self.store
			.delete_member(room, user)
			.await
			.map_err(ClientCoreError::backend("Failed to leave room"))?;
		info!(room_id = %room, user_id = %user, "left room");
		Ok(())
	}

	/// Add `target` to `room` on behalf of `current`, who must be a member.
	pub async fn add_user_to_room(&self, current: &UserId, room: &RoomId, target: &UserId) -> Result<(), ClientCoreError> {
		let is_member = self
			.store
			.is_member(room, current)
			.await
			.map_err(ClientCoreError::backend("Failed to add user to room"))?;
		if !is_member {
			return Err(ClientCoreError::NotAMember);
		}

		let profile = self
			.store
			.profile(target)
			.await
			.map_err(ClientCoreError::backend("Failed to add user to room"))?
			.ok_or(ClientCoreError::UserNotFound)?;

		let already = self
			.store
			.is_member(room, &profile.id)
			.await
			.map_err(ClientCoreError::backend("Failed to add user to room"))?;
		if already {
			return Err(ClientCoreError::AlreadyMember);
		}

		match self.store.add_member(room, &profile.id).await {
			Ok(()) => {
				info!(room_id = %room, by = %current, user_id = %profile.id, "user added to room");
				Ok(())
			}
			Err(e) if e.is_conflict() => Err(ClientCoreError::AlreadyMember),
			Err(e) => Err(ClientCoreError::backend("Failed to add user to room")(e)),
		}
	}
}
