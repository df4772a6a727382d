#![forbid(unsafe_code)]

//! Client core: rooms, chat sessions and their merged message timelines.

pub mod config;
pub mod error;
pub mod messages;
pub mod rooms;
pub mod session;
pub mod session_store;
pub mod timeline;
pub mod watcher;

use pachat_backend::SecretString;
use tokio::sync::watch;

pub use config::{ClientConfig, load_client_config, load_client_config_from_path};
pub use error::ClientCoreError;
pub use messages::{Cursor, MessageStore, RestMessageStore};
pub use rooms::{RestRoomStore, RoomService, RoomStore, RoomsOverview};
pub use session::{ChatSession, RoomChannel, SessionSnapshot};
pub use session_store::SessionStore;
pub use timeline::{Delivery, PageKind, PageRequest, RoomTimeline, TimelineEntry};
pub use watcher::RoomsWatcher;

/// The signed-in user's current access token. The sender side replaces it
/// when the session is refreshed.
pub type TokenSource = watch::Receiver<SecretString>;

/// A fixed token, for one-shot commands.
pub fn static_token(token: SecretString) -> TokenSource {
	let (_tx, rx) = watch::channel(token);
	rx
}
