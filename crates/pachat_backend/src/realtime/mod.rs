#![forbid(unsafe_code)]

//! Realtime socket client.
//!
//! One websocket per [`RealtimeClient`], owned by a background task. Channels
//! are joined over it and receive [`ChannelEvent`]s on their own queue. The
//! socket reconnects with backoff and rejoins every live channel.

pub mod backoff;
pub mod presence;
pub mod protocol;

use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

pub use presence::{OnlineUser, PresenceDiff, PresenceEntry, PresenceMeta, PresenceState};
pub use protocol::{ChangeEvent, ChannelConfig, ChannelEvent, Frame, PostgresChange, PostgresChangesFilter};

use self::backoff::{RECONNECT_RESET_AFTER, reconnect_delay};
use self::protocol::{
	EVENT_ACCESS_TOKEN, EVENT_BROADCAST, EVENT_JOIN, EVENT_LEAVE, EVENT_PRESENCE, EVENT_REPLY, PHOENIX_TOPIC, Reply,
	broadcast_payload, decode_channel_event, track_payload, untrack_payload, wire_topic,
};
use crate::{BackendError, SecretString};

/// Pushes buffered per channel while it is not joined.
const MAX_QUEUED_PUSHES: usize = 256;

static REALTIME_CHANNEL_ID: AtomicU64 = AtomicU64::new(1);

type WsStream = tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug, Clone)]
pub struct RealtimeConfig {
	/// Full websocket URL including `apikey` and `vsn`.
	pub url: String,
	pub access_token: Option<SecretString>,
	pub heartbeat_interval: Duration,
	pub connect_timeout: Duration,
}

impl RealtimeConfig {
	pub fn new(url: impl Into<String>) -> Self {
		Self {
			url: url.into(),
			access_token: None,
			heartbeat_interval: Duration::from_secs(25),
			connect_timeout: Duration::from_secs(10),
		}
	}
}

/// Handle to the socket task. Cloning shares the socket.
#[derive(Debug, Clone)]
pub struct RealtimeClient {
	command_tx: mpsc::UnboundedSender<Command>,
}

impl RealtimeClient {
	/// Spawn the socket task. Must be called inside a tokio runtime.
	pub fn connect(cfg: RealtimeConfig) -> Self {
		let (command_tx, command_rx) = mpsc::unbounded_channel();
		tokio::spawn(run_socket(cfg, command_rx));
		Self { command_tx }
	}

	/// Join `topic`; events arrive on the returned receiver until the channel
	/// handle is dropped.
	pub fn channel(
		&self,
		topic: impl Into<String>,
		config: ChannelConfig,
	) -> (RealtimeChannel, mpsc::UnboundedReceiver<ChannelEvent>) {
		let topic = topic.into();
		let id = REALTIME_CHANNEL_ID.fetch_add(1, Ordering::Relaxed);
		let (tx, rx) = mpsc::unbounded_channel();

		let _ = self.command_tx.send(Command::Join {
			id,
			topic: topic.clone(),
			config,
			handler: tx,
		});

		(
			RealtimeChannel {
				id,
				topic,
				command_tx: self.command_tx.clone(),
			},
			rx,
		)
	}

	/// Swap the access token used for joins and push it to joined channels.
	pub fn set_auth(&self, token: SecretString) {
		let _ = self.command_tx.send(Command::SetAuth { token });
	}

	/// Leave every channel and close the socket.
	pub fn shutdown(&self) {
		let _ = self.command_tx.send(Command::Shutdown);
	}
}

/// A joined (or joining) channel. Dropping it leaves the channel.
#[derive(Debug)]
pub struct RealtimeChannel {
	id: u64,
	topic: String,
	command_tx: mpsc::UnboundedSender<Command>,
}

impl RealtimeChannel {
	pub fn topic(&self) -> &str {
		&self.topic
	}

	/// Send a broadcast event to other subscribers of this channel.
	pub fn broadcast(&self, event: &str, payload: Value) -> Result<(), BackendError> {
		self.send(Command::Push {
			id: self.id,
			event: EVENT_BROADCAST.to_string(),
			payload: broadcast_payload(event, payload),
		})
	}

	/// Publish this client's presence; re-sent after every rejoin.
	pub fn track(&self, payload: Value) -> Result<(), BackendError> {
		self.send(Command::Track { id: self.id, payload })
	}

	pub fn untrack(&self) -> Result<(), BackendError> {
		self.send(Command::Untrack { id: self.id })
	}

	/// Leave the channel. Dropping the handle does the same.
	pub fn leave(self) {}

	fn send(&self, cmd: Command) -> Result<(), BackendError> {
		self.command_tx
			.send(cmd)
			.map_err(|_| BackendError::Realtime("socket task stopped".to_string()))
	}
}

impl Drop for RealtimeChannel {
	fn drop(&mut self) {
		let _ = self.command_tx.send(Command::Leave { id: self.id });
	}
}

#[derive(Debug)]
enum Command {
	Join {
		id: u64,
		topic: String,
		config: ChannelConfig,
		handler: mpsc::UnboundedSender<ChannelEvent>,
	},
	Leave {
		id: u64,
	},
	Push {
		id: u64,
		event: String,
		payload: Value,
	},
	Track {
		id: u64,
		payload: Value,
	},
	Untrack {
		id: u64,
	},
	SetAuth {
		token: SecretString,
	},
	Shutdown,
}

#[derive(Debug)]
struct ChannelEntry {
	/// Wire topic (`realtime:` prefixed).
	topic: String,
	config: ChannelConfig,
	handler: mpsc::UnboundedSender<ChannelEvent>,
	/// Ref of the outstanding or accepted join.
	join_ref: Option<String>,
	joined: bool,
	/// Join refused; retried on reconnect or new credentials.
	rejected: bool,
	tracked: Option<Value>,
	queued: VecDeque<(String, Value)>,
}

#[derive(Debug, Default)]
struct CommandOutcome {
	frames: Vec<Frame>,
	shutdown: bool,
}

/// Socket-independent channel bookkeeping.
#[derive(Debug, Default)]
struct SocketState {
	channels: BTreeMap<u64, ChannelEntry>,
	ref_counter: u64,
	access_token: Option<SecretString>,
	pending_heartbeat: Option<String>,
	connected: bool,
}

impl SocketState {
	fn new(access_token: Option<SecretString>) -> Self {
		Self {
			access_token,
			..Self::default()
		}
	}

	fn next_ref(&mut self) -> String {
		self.ref_counter = self.ref_counter.wrapping_add(1);
		self.ref_counter.to_string()
	}

	fn join_frame(&mut self, id: u64) -> Option<Frame> {
		let reference = self.next_ref();
		let token = self.access_token.as_ref().map(|t| t.expose().to_string());
		let entry = self.channels.get_mut(&id)?;
		entry.join_ref = Some(reference.clone());
		entry.joined = false;
		Some(Frame {
			topic: entry.topic.clone(),
			event: EVENT_JOIN.to_string(),
			payload: entry.config.join_payload(token.as_deref()),
			reference: Some(reference.clone()),
			join_ref: Some(reference),
		})
	}

	fn push_frame(&mut self, id: u64, event: &str, payload: Value) -> Option<Frame> {
		let reference = self.next_ref();
		let entry = self.channels.get(&id)?;
		Some(Frame {
			topic: entry.topic.clone(),
			event: event.to_string(),
			payload,
			reference: Some(reference),
			join_ref: entry.join_ref.clone(),
		})
	}

	fn can_push(&self, id: u64) -> bool {
		self.connected && self.channels.get(&id).map(|c| c.joined).unwrap_or(false)
	}

	fn handle_command(&mut self, cmd: Command) -> CommandOutcome {
		let mut out = CommandOutcome::default();
		match cmd {
			Command::Join {
				id,
				topic,
				config,
				handler,
			} => {
				self.channels.insert(
					id,
					ChannelEntry {
						topic: wire_topic(&topic),
						config,
						handler,
						join_ref: None,
						joined: false,
						rejected: false,
						tracked: None,
						queued: VecDeque::new(),
					},
				);
				if self.connected {
					out.frames.extend(self.join_frame(id));
				}
			}
			Command::Leave { id } => {
				let Some(entry) = self.channels.remove(&id) else {
					return out;
				};
				if self.connected && entry.join_ref.is_some() {
					let reference = self.next_ref();
					out.frames.push(Frame {
						topic: entry.topic,
						event: EVENT_LEAVE.to_string(),
						payload: json!({}),
						reference: Some(reference),
						join_ref: entry.join_ref,
					});
				}
			}
			Command::Push { id, event, payload } => {
				if self.can_push(id) {
					out.frames.extend(self.push_frame(id, &event, payload));
				} else if let Some(entry) = self.channels.get_mut(&id) {
					if entry.queued.len() >= MAX_QUEUED_PUSHES {
						entry.queued.pop_front();
						warn!(topic = %entry.topic, "realtime push queue full; dropping oldest");
					}
					entry.queued.push_back((event, payload));
				}
			}
			Command::Track { id, payload } => {
				if let Some(entry) = self.channels.get_mut(&id) {
					entry.tracked = Some(payload.clone());
				}
				if self.can_push(id) {
					out.frames.extend(self.push_frame(id, EVENT_PRESENCE, track_payload(payload)));
				}
			}
			Command::Untrack { id } => {
				if let Some(entry) = self.channels.get_mut(&id) {
					entry.tracked = None;
				}
				if self.can_push(id) {
					out.frames.extend(self.push_frame(id, EVENT_PRESENCE, untrack_payload()));
				}
			}
			Command::SetAuth { token } => {
				let raw = token.expose().to_string();
				self.access_token = Some(token);
				if !self.connected {
					for entry in self.channels.values_mut() {
						entry.rejected = false;
					}
					return out;
				}
				let ids: Vec<u64> = self.channels.keys().copied().collect();
				for id in ids {
					let Some(entry) = self.channels.get_mut(&id) else {
						continue;
					};
					if entry.joined {
						out.frames.extend(self.push_frame(
							id,
							EVENT_ACCESS_TOKEN,
							json!({ "access_token": raw }),
						));
					} else if entry.rejected {
						entry.rejected = false;
						out.frames.extend(self.join_frame(id));
					}
				}
			}
			Command::Shutdown => {
				if self.connected {
					let ids: Vec<u64> = self.channels.keys().copied().collect();
					for id in ids {
						if self.channels.get(&id).map(|c| c.joined).unwrap_or(false) {
							out.frames.extend(self.push_frame(id, EVENT_LEAVE, json!({})));
						}
					}
				}
				self.close_all();
				out.shutdown = true;
			}
		}
		out
	}

	fn handle_frame(&mut self, frame: Frame) -> Vec<Frame> {
		if frame.event == EVENT_REPLY {
			return self.handle_reply(frame);
		}

		let Some(event) = decode_channel_event(&frame) else {
			debug!(topic = %frame.topic, event = %frame.event, "realtime: unhandled event");
			return Vec::new();
		};

		let mut dead = Vec::new();
		for (id, entry) in self.channels.iter_mut() {
			if entry.topic != frame.topic {
				continue;
			}
			if let Some(join_ref) = frame.join_ref.as_ref()
				&& entry.join_ref.as_ref() != Some(join_ref)
			{
				continue;
			}

			match &event {
				ChannelEvent::Error { reason } => {
					warn!(topic = %entry.topic, %reason, "realtime channel errored; will rejoin");
					entry.joined = false;
					entry.join_ref = None;
				}
				ChannelEvent::Closed => {
					dead.push(*id);
				}
				_ => {}
			}

			if entry.handler.send(event.clone()).is_err() {
				dead.push(*id);
			}
		}

		let mut frames = Vec::new();
		for id in dead {
			frames.extend(self.handle_command(Command::Leave { id }).frames);
		}
		frames
	}

	fn handle_reply(&mut self, frame: Frame) -> Vec<Frame> {
		let Some(reference) = frame.reference.as_deref() else {
			return Vec::new();
		};

		if frame.topic == PHOENIX_TOPIC {
			if self.pending_heartbeat.as_deref() == Some(reference) {
				self.pending_heartbeat = None;
			}
			return Vec::new();
		}

		let Some(id) = self
			.channels
			.iter()
			.find(|(_, c)| c.topic == frame.topic && c.join_ref.as_deref() == Some(reference))
			.map(|(id, _)| *id)
		else {
			// Reply to a broadcast/presence push.
			return Vec::new();
		};

		let reply = Reply::from_payload(&frame.payload);
		let mut frames = Vec::new();

		let Some(entry) = self.channels.get_mut(&id) else {
			return frames;
		};

		if !reply.ok {
			let reason = reply.reason();
			warn!(topic = %entry.topic, %reason, "realtime join rejected");
			entry.rejected = true;
			entry.join_ref = None;
			let _ = entry.handler.send(ChannelEvent::JoinFailed { reason });
			return frames;
		}

		if entry.joined {
			return frames;
		}
		entry.joined = true;
		info!(topic = %entry.topic, "realtime channel joined");
		let _ = entry.handler.send(ChannelEvent::Joined);

		let tracked = entry.tracked.clone();
		let queued: Vec<(String, Value)> = entry.queued.drain(..).collect();

		if let Some(payload) = tracked {
			frames.extend(self.push_frame(id, EVENT_PRESENCE, track_payload(payload)));
		}
		for (event, payload) in queued {
			frames.extend(self.push_frame(id, &event, payload));
		}
		frames
	}

	/// Next heartbeat plus rejoins for errored channels; `None` when the
	/// previous heartbeat was never answered.
	fn heartbeat(&mut self) -> Option<Vec<Frame>> {
		if self.pending_heartbeat.is_some() {
			return None;
		}
		let reference = self.next_ref();
		self.pending_heartbeat = Some(reference.clone());

		let mut frames = vec![Frame::heartbeat(reference)];
		let rejoin: Vec<u64> = self
			.channels
			.iter()
			.filter(|(_, c)| c.join_ref.is_none() && !c.rejected)
			.map(|(id, _)| *id)
			.collect();
		for id in rejoin {
			frames.extend(self.join_frame(id));
		}
		Some(frames)
	}

	fn on_connected(&mut self) -> Vec<Frame> {
		self.connected = true;
		self.pending_heartbeat = None;
		let ids: Vec<u64> = self.channels.keys().copied().collect();
		let mut frames = Vec::with_capacity(ids.len());
		for id in ids {
			if let Some(entry) = self.channels.get_mut(&id) {
				entry.rejected = false;
			}
			frames.extend(self.join_frame(id));
		}
		frames
	}

	fn on_disconnected(&mut self, attempt: u32, retry_in: Duration) {
		self.connected = false;
		self.pending_heartbeat = None;
		let retry_in_ms = retry_in.as_millis() as u64;
		self.channels.retain(|_, entry| {
			entry.joined = false;
			entry.join_ref = None;
			entry
				.handler
				.send(ChannelEvent::Reconnecting { attempt, retry_in_ms })
				.is_ok()
		});
	}

	fn close_all(&mut self) {
		for entry in self.channels.values() {
			let _ = entry.handler.send(ChannelEvent::Closed);
		}
		self.channels.clear();
	}
}

fn redacted_host(url: &str) -> String {
	url::Url::parse(url)
		.ok()
		.and_then(|u| u.host_str().map(str::to_string))
		.unwrap_or_else(|| "<invalid>".to_string())
}

async fn send_frames(ws: &mut WsStream, frames: Vec<Frame>) -> Result<(), String> {
	for frame in frames {
		let text = frame.encode().map_err(|e| format!("encode frame: {e}"))?;
		ws.send(Message::Text(text.into()))
			.await
			.map_err(|e| format!("send frame: {e}"))?;
	}
	Ok(())
}

/// Sleep out a reconnect delay while still accepting commands.
/// Returns `false` when the client asked to stop.
async fn wait_offline(
	state: &mut SocketState,
	command_rx: &mut mpsc::UnboundedReceiver<Command>,
	delay: Duration,
) -> bool {
	let deadline = tokio::time::sleep(delay);
	tokio::pin!(deadline);
	loop {
		tokio::select! {
			_ = &mut deadline => return true,
			cmd = command_rx.recv() => {
				let Some(cmd) = cmd else {
					state.close_all();
					return false;
				};
				if state.handle_command(cmd).shutdown {
					return false;
				}
			}
		}
	}
}

async fn run_socket(cfg: RealtimeConfig, mut command_rx: mpsc::UnboundedReceiver<Command>) {
	let mut state = SocketState::new(cfg.access_token.clone());
	let host = redacted_host(&cfg.url);
	let mut attempt: u32 = 0;

	loop {
		info!(host = %host, "connecting to realtime");
		let connected = tokio::time::timeout(cfg.connect_timeout, tokio_tungstenite::connect_async(cfg.url.as_str())).await;

		let mut ws = match connected {
			Ok(Ok((ws, _))) => ws,
			Ok(Err(err)) => {
				attempt = attempt.saturating_add(1);
				let delay = reconnect_delay(attempt);
				warn!(error = %err, attempt, retry_in_ms = delay.as_millis() as u64, "realtime connect failed");
				state.on_disconnected(attempt, delay);
				if !wait_offline(&mut state, &mut command_rx, delay).await {
					return;
				}
				continue;
			}
			Err(_) => {
				attempt = attempt.saturating_add(1);
				let delay = reconnect_delay(attempt);
				warn!(timeout = ?cfg.connect_timeout, attempt, "realtime connect timed out");
				state.on_disconnected(attempt, delay);
				if !wait_offline(&mut state, &mut command_rx, delay).await {
					return;
				}
				continue;
			}
		};

		let connected_at = Instant::now();
		let mut heartbeat = tokio::time::interval_at(Instant::now() + cfg.heartbeat_interval, cfg.heartbeat_interval);
		heartbeat.set_missed_tick_behavior(MissedTickBehavior::Skip);

		let joins = state.on_connected();
		let reason: String = match send_frames(&mut ws, joins).await {
			Err(e) => e,
			Ok(()) => loop {
				tokio::select! {
					cmd = command_rx.recv() => {
						let Some(cmd) = cmd else {
							state.close_all();
							let _ = ws.close(None).await;
							return;
						};
						let out = state.handle_command(cmd);
						if let Err(e) = send_frames(&mut ws, out.frames).await {
							break e;
						}
						if out.shutdown {
							let _ = ws.close(None).await;
							info!("realtime socket shut down");
							return;
						}
					}
					_ = heartbeat.tick() => {
						let Some(frames) = state.heartbeat() else {
							break "heartbeat timeout".to_string();
						};
						if let Err(e) = send_frames(&mut ws, frames).await {
							break e;
						}
					}
					msg = ws.next() => {
						let Some(msg) = msg else {
							break "websocket closed".to_string();
						};
						match msg {
							Ok(Message::Text(text)) => {
								metrics::counter!("pachat_realtime_frames_received_total").increment(1);
								match Frame::decode(&text) {
									Ok(frame) => {
										let frames = state.handle_frame(frame);
										if let Err(e) = send_frames(&mut ws, frames).await {
											break e;
										}
									}
									Err(err) => debug!(error = %err, "realtime: undecodable frame"),
								}
							}
							Ok(Message::Close(frame)) => {
								break format!("server closed: {frame:?}");
							}
							Ok(_) => {}
							Err(err) => {
								break format!("websocket error: {err}");
							}
						}
					}
				}
			},
		};

		if connected_at.elapsed() > RECONNECT_RESET_AFTER {
			attempt = 0;
		}
		attempt = attempt.saturating_add(1);
		let delay = reconnect_delay(attempt);
		metrics::counter!("pachat_realtime_reconnects_total").increment(1);
		warn!(%reason, attempt, retry_in_ms = delay.as_millis() as u64, "realtime disconnected");

		state.on_disconnected(attempt, delay);
		if !wait_offline(&mut state, &mut command_rx, delay).await {
			return;
		}
	}
}
