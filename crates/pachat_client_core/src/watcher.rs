#![forbid(unsafe_code)]

use std::time::Duration;

use pachat_backend::realtime::{ChangeEvent, ChannelConfig, ChannelEvent, PostgresChangesFilter, RealtimeChannel, RealtimeClient};
use pachat_domain::{UserId, UserRoomsTopic};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ClientCoreError;
use crate::rooms::{MEMBER_TABLE, RoomService, RoomsOverview};

/// Keeps a user's room overview current.
///
/// Membership changes for the user arrive as database-change events on
/// `user:<id>:rooms`; each burst of changes triggers one refetch after the
/// configured delay.
pub struct RoomsWatcher {
	rx: watch::Receiver<RoomsOverview>,
	refresh_tx: mpsc::UnboundedSender<()>,
	task: JoinHandle<()>,
	_channel: Option<RealtimeChannel>,
}

impl RoomsWatcher {
	pub fn channel_config(user: &UserId) -> ChannelConfig {
		ChannelConfig {
			postgres_changes: vec![
				PostgresChangesFilter::new(ChangeEvent::All, MEMBER_TABLE).with_filter(format!("member_id=eq.{user}")),
			],
			..ChannelConfig::default()
		}
	}

	/// Fetch the overview and subscribe to membership changes.
	pub async fn start(
		service: RoomService,
		realtime: &RealtimeClient,
		user: UserId,
		delay: Duration,
	) -> Result<Self, ClientCoreError> {
		let (channel, events) = realtime.channel(UserRoomsTopic::format(&user), Self::channel_config(&user));
		let mut watcher = Self::spawn(service, user, delay, events).await?;
		watcher._channel = Some(channel);
		Ok(watcher)
	}

	/// Same as [`RoomsWatcher::start`] with an externally supplied event stream.
	pub async fn spawn(
		service: RoomService,
		user: UserId,
		delay: Duration,
		events: mpsc::UnboundedReceiver<ChannelEvent>,
	) -> Result<Self, ClientCoreError> {
		let initial = service.overview(&user).await?;
		let (tx, rx) = watch::channel(initial);
		let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();

		let task = tokio::spawn(watch_loop(service, user, delay, events, refresh_rx, tx));

		Ok(Self {
			rx,
			refresh_tx,
			task,
			_channel: None,
		})
	}

	pub fn current(&self) -> RoomsOverview {
		self.rx.borrow().clone()
	}

	pub fn subscribe(&self) -> watch::Receiver<RoomsOverview> {
		self.rx.clone()
	}

	/// Refetch after the delay, e.g. after this client joined or left a room.
	pub fn refresh(&self) {
		let _ = self.refresh_tx.send(());
	}
}

impl Drop for RoomsWatcher {
	fn drop(&mut self) {
		self.task.abort();
	}
}

#[derive(Debug, Default)]
struct LoopState {
	reconnecting: bool,
	events_closed: bool,
}

impl LoopState {
	/// Whether `event` calls for a refetch.
	fn on_event(&mut self, event: ChannelEvent) -> bool {
		match event {
			ChannelEvent::PostgresChange(change) => {
				debug!(table = %change.table, event = ?change.event, "membership changed");
				true
			}
			ChannelEvent::Reconnecting { .. } | ChannelEvent::Error { .. } => {
				self.reconnecting = true;
				false
			}
			// Changes may have been missed while offline.
			ChannelEvent::Joined => std::mem::take(&mut self.reconnecting),
			ChannelEvent::JoinFailed { reason } => {
				warn!(%reason, "room list subscription rejected");
				false
			}
			ChannelEvent::Closed => {
				self.events_closed = true;
				false
			}
			_ => false,
		}
	}
}

async fn watch_loop(
	service: RoomService,
	user: UserId,
	delay: Duration,
	mut events: mpsc::UnboundedReceiver<ChannelEvent>,
	mut refresh_rx: mpsc::UnboundedReceiver<()>,
	tx: watch::Sender<RoomsOverview>,
) {
	let mut state = LoopState::default();

	loop {
		let triggered = tokio::select! {
			ev = events.recv(), if !state.events_closed => match ev {
				Some(ev) => state.on_event(ev),
				None => {
					state.events_closed = true;
					false
				}
			},
			r = refresh_rx.recv() => match r {
				Some(()) => true,
				None => break,
			},
		};

		if !triggered {
			continue;
		}

		tokio::time::sleep(delay).await;

		// Fold everything that arrived during the delay into this refetch.
		while let Ok(ev) = events.try_recv() {
			state.on_event(ev);
		}
		while refresh_rx.try_recv().is_ok() {}

		match service.overview(&user).await {
			Ok(overview) => {
				let changed = tx.send_if_modified(|current| {
					if *current == overview {
						return false;
					}
					*current = overview;
					true
				});
				debug!(user_id = %user, changed, "room overview refreshed");
			}
			Err(e) => warn!(user_id = %user, error = %e.detail(), "room overview refresh failed"),
		}
	}
}
