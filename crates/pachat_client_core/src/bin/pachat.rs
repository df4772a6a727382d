#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use pachat_backend::auth::{AuthSession, SignUpOutcome};
use pachat_backend::realtime::RealtimeClient;
use pachat_backend::{Backend, BackendError, SecretString};
use pachat_client_core::session_store::{REFRESH_SKEW_SECS, default_session_path};
use pachat_client_core::{
	ChatSession, ClientConfig, ClientCoreError, Cursor, Delivery, RestMessageStore, RestRoomStore, RoomService, RoomsOverview,
	RoomsWatcher, SessionSnapshot, SessionStore, TimelineEntry, load_client_config, load_client_config_from_path,
	static_token,
};
use pachat_domain::{CreateRoomInput, MessageId, RoomId, UserId, UserProfile};
use tokio::io::{AsyncBufReadExt as _, BufReader};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

fn usage_and_exit() -> ! {
	eprintln!(
		"Usage: pachat [--config path] <command> [args]\n\
\n\
Commands:\n\
	login <email> <password>               Sign in and remember the session\n\
	signup <email> <password> <name...>    Create an account\n\
	logout                                 Sign out and forget the session\n\
	whoami                                 Show the signed-in user\n\
	rooms [--watch]                        List your rooms and public rooms\n\
	create-room <name...> [--public]       Create a room and join it\n\
	join <room_id>                         Join a room\n\
	leave <room_id>                        Leave a room\n\
	invite <room_id> <user_id>             Add a user to a room you belong to\n\
	chat <room_id>                         Open a room's chat\n\
\n\
Chat input:\n\
	<text>            Send a message\n\
	/older            Load earlier messages\n\
	/retry <id>       Resend a failed message\n\
	/discard <id>     Drop a failed message\n\
	/who              List users online\n\
	/quit             Leave the chat\n\
\n\
Options:\n\
	--config    Config file (default: ~/.pachat/config.toml)\n\
	--help      Show this help\n\
\n\
Environment:\n\
	PACHAT_BACKEND_URL, PACHAT_ANON_KEY, PACHAT_SERVICE_ROLE_KEY, PACHAT_PAGE_SIZE,\n\
	PACHAT_ROOMS_REFRESH_DELAY_MS, PACHAT_REQUEST_TIMEOUT_MS override the config file.\n"
	);
	std::process::exit(2)
}

fn init_tracing() {
	let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| "info,pachat_client_core=debug".to_string());
	tracing_subscriber::fmt()
		.with_env_filter(filter)
		.with_target(false)
		.with_writer(std::io::stderr)
		.init();
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
	Login { email: String, password: String },
	Signup { email: String, password: String, name: String },
	Logout,
	WhoAmI,
	Rooms { watch: bool },
	CreateRoom { name: String, public: bool },
	Join(RoomId),
	Leave(RoomId),
	Invite { room: RoomId, user: UserId },
	Chat(RoomId),
}

#[derive(Debug)]
struct Args {
	config_path: Option<PathBuf>,
	command: Command,
}

fn parse_args() -> Args {
	match parse_args_from(std::env::args().skip(1)) {
		Ok(args) => args,
		Err(msg) => {
			if !msg.is_empty() {
				eprintln!("{msg}");
			}
			usage_and_exit()
		}
	}
}

fn parse_args_from(args: impl IntoIterator<Item = String>) -> Result<Args, String> {
	let mut config_path = None;
	let mut positional: Vec<String> = Vec::new();
	let mut public = false;
	let mut watch = false;

	let mut it = args.into_iter();
	while let Some(arg) = it.next() {
		match arg.as_str() {
			"--help" | "-h" => return Err(String::new()),
			"--config" => {
				let v = it.next().ok_or("--config needs a path")?;
				if v.trim().is_empty() {
					return Err("--config must be non-empty".to_string());
				}
				config_path = Some(PathBuf::from(v));
			}
			"--public" => public = true,
			"--watch" => watch = true,
			other if other.starts_with("--") => return Err(format!("Unknown argument: {other}")),
			_ => positional.push(arg),
		}
	}

	let room_arg = |v: Option<&String>| -> Result<RoomId, String> {
		let v = v.ok_or("missing <room_id>")?;
		RoomId::new(v.as_str()).map_err(|e| format!("invalid room id: {e}"))
	};

	let (name, rest) = positional.split_first().ok_or("missing command")?;
	let command = match (name.as_str(), rest) {
		("login", [email, password]) => Command::Login {
			email: email.clone(),
			password: password.clone(),
		},
		("signup", [email, password, name @ ..]) if !name.is_empty() => Command::Signup {
			email: email.clone(),
			password: password.clone(),
			name: name.join(" "),
		},
		("logout", []) => Command::Logout,
		("whoami", []) => Command::WhoAmI,
		("rooms", []) => Command::Rooms { watch },
		("create-room", words) if !words.is_empty() => Command::CreateRoom {
			name: words.join(" "),
			public,
		},
		("join", [_]) => Command::Join(room_arg(rest.first())?),
		("leave", [_]) => Command::Leave(room_arg(rest.first())?),
		("invite", [_, user]) => Command::Invite {
			room: room_arg(rest.first())?,
			user: UserId::new(user.as_str()).map_err(|e| format!("invalid user id: {e}"))?,
		},
		("chat", [_]) => Command::Chat(room_arg(rest.first())?),
		(other, _) => return Err(format!("Unknown command or wrong arguments: {other}")),
	};

	Ok(Args { config_path, command })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	init_tracing();
	let args = parse_args();

	let cfg = match &args.config_path {
		Some(path) => load_client_config_from_path(path)?,
		None => load_client_config()?,
	};
	let backend = Backend::new(cfg.backend_config()?).context("create backend client")?;
	let store = SessionStore::new(default_session_path());

	let result = run(args.command, &cfg, &backend, &store).await;
	if let Err(e) = &result
		&& let Some(core) = e.downcast_ref::<ClientCoreError>()
	{
		warn!(error = %core.detail(), "command failed");
	}
	if let Err(e) = &result
		&& let Some(hint) = login_hint(e)
	{
		eprintln!("{hint}");
	}
	result
}

/// Follow-up advice when the backend rejected the stored credentials.
fn login_hint(err: &anyhow::Error) -> Option<&'static str> {
	let unauthorized = match err.downcast_ref::<ClientCoreError>() {
		Some(core) => core.is_unauthorized(),
		None => err.downcast_ref::<BackendError>().is_some_and(BackendError::is_unauthorized),
	};
	unauthorized.then_some("Your session is missing or expired. Run `pachat login <email> <password>`.")
}

async fn run(command: Command, cfg: &ClientConfig, backend: &Backend, store: &SessionStore) -> anyhow::Result<()> {
	match command {
		Command::Login { email, password } => {
			let session = backend.auth.sign_in_with_password(&email, &password).await?;
			store.save(&session)?;
			println!("Signed in as {} ({})", session.user.display_name(), session.user.id);
		}
		Command::Signup { email, password, name } => match backend.auth.sign_up(&email, &password, &name).await? {
			SignUpOutcome::SignedIn(session) => {
				store.save(&session)?;
				println!("Account created. Signed in as {}", session.user.display_name());
			}
			SignUpOutcome::ConfirmationRequired { user } => {
				println!("Account created for {}. Confirm your email, then run `pachat login`.", user.display_name());
			}
		},
		Command::Logout => {
			if let Some(session) = store.load()?
				&& let Err(e) = backend.auth.sign_out(&session.access_token).await
			{
				warn!(error = %e, "sign out request failed; forgetting the session anyway");
			}
			store.clear()?;
			println!("Signed out");
		}
		Command::WhoAmI => {
			let session = require_session(backend, store).await?;
			let user = backend.auth.current_user(&session.access_token).await?;
			println!("{} ({})", user.display_name(), user.id);
			if let Some(email) = &user.email {
				println!("email: {email}");
			}
		}
		Command::Rooms { watch } => {
			let session = require_session(backend, store).await?;
			let service = room_service(backend, &session);
			if !watch {
				let overview = service.overview(&session.user.id).await?;
				print_overview(&overview);
				return Ok(());
			}

			let realtime = backend.realtime(Some(session.access_token.clone()));
			let watcher = RoomsWatcher::start(service, &realtime, session.user.id.clone(), cfg.rooms_refresh_delay).await?;
			let mut updates = watcher.subscribe();
			print_overview(&watcher.current());
			loop {
				tokio::select! {
					changed = updates.changed() => {
						if changed.is_err() {
							break;
						}
						let overview = updates.borrow_and_update().clone();
						println!();
						print_overview(&overview);
					}
					_ = tokio::signal::ctrl_c() => break,
				}
			}
			realtime.shutdown();
		}
		Command::CreateRoom { name, public } => {
			let session = require_session(backend, store).await?;
			let room = room_service(backend, &session)
				.create_room(&session.user.id, &CreateRoomInput::new(name, public))
				.await?;
			println!("Created room {room}");
		}
		Command::Join(room) => {
			let session = require_session(backend, store).await?;
			room_service(backend, &session).join_room(&session.user.id, &room).await?;
			println!("Joined {room}");
		}
		Command::Leave(room) => {
			let session = require_session(backend, store).await?;
			room_service(backend, &session).leave_room(&session.user.id, &room).await?;
			println!("Left {room}");
		}
		Command::Invite { room, user } => {
			let session = require_session(backend, store).await?;
			room_service(backend, &session)
				.add_user_to_room(&session.user.id, &room, &user)
				.await?;
			println!("User added to room successfully");
		}
		Command::Chat(room) => {
			let session = require_session(backend, store).await?;
			run_chat(cfg, backend, store, session, room).await?;
		}
	}
	Ok(())
}

async fn require_session(backend: &Backend, store: &SessionStore) -> anyhow::Result<AuthSession> {
	let now = pachat_util::time::unix_ms_now() / 1000;
	match store.restore(&backend.auth, now).await? {
		Some(session) => Ok(session),
		None => Err(ClientCoreError::NotAuthenticated.into()),
	}
}

fn room_service(backend: &Backend, session: &AuthSession) -> RoomService {
	let token = static_token(session.access_token.clone());
	RoomService::new(Arc::new(RestRoomStore::new(backend.clone(), token)))
}

fn print_overview(overview: &RoomsOverview) {
	if overview.is_empty() {
		println!("No chat rooms yet. Create one with `pachat create-room <name>`.");
		return;
	}
	for (title, rooms) in [("Your Rooms", &overview.joined), ("Public Rooms", &overview.public)] {
		if rooms.is_empty() {
			continue;
		}
		println!("{title}");
		for room in rooms {
			println!("  {}  {}  ({})", room.id, room.name, room.member_label());
		}
	}
}

/// Refresh the access token ahead of expiry for long-running commands.
fn spawn_token_refresher(
	backend: Backend,
	store: SessionStore,
	mut session: AuthSession,
	token_tx: watch::Sender<SecretString>,
	realtime: RealtimeClient,
) -> JoinHandle<()> {
	tokio::spawn(async move {
		loop {
			let now = pachat_util::time::unix_ms_now() / 1000;
			let wait_secs = (session.expires_at - REFRESH_SKEW_SECS - now).max(5) as u64;
			tokio::time::sleep(Duration::from_secs(wait_secs)).await;

			match backend.auth.refresh(&session.refresh_token).await {
				Ok(fresh) => {
					if let Err(e) = store.save(&fresh) {
						warn!(error = %e, "failed to persist refreshed session");
					}
					token_tx.send_replace(fresh.access_token.clone());
					realtime.set_auth(fresh.access_token.clone());
					info!(expires_at = fresh.expires_at, "access token refreshed");
					session = fresh;
				}
				Err(e) => {
					warn!(error = %e, "token refresh failed; retrying in 30s");
					tokio::time::sleep(Duration::from_secs(30)).await;
				}
			}
		}
	})
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ChatInput {
	Send(String),
	Older,
	Retry(MessageId),
	Discard(MessageId),
	Who,
	Quit,
	Empty,
	Invalid(String),
}

fn parse_chat_input(line: &str) -> ChatInput {
	let line = line.trim();
	if line.is_empty() {
		return ChatInput::Empty;
	}
	let Some(cmd) = line.strip_prefix('/') else {
		return ChatInput::Send(line.to_string());
	};

	let mut parts = cmd.split_whitespace();
	let name = parts.next().unwrap_or_default();
	let id_arg = |arg: Option<&str>| arg.map(str::parse::<MessageId>);
	match name {
		"older" => ChatInput::Older,
		"who" => ChatInput::Who,
		"quit" | "exit" => ChatInput::Quit,
		"retry" => match id_arg(parts.next()) {
			Some(Ok(id)) => ChatInput::Retry(id),
			_ => ChatInput::Invalid("usage: /retry <message id>".to_string()),
		},
		"discard" => match id_arg(parts.next()) {
			Some(Ok(id)) => ChatInput::Discard(id),
			_ => ChatInput::Invalid("usage: /discard <message id>".to_string()),
		},
		other => ChatInput::Invalid(format!("unknown command /{other}")),
	}
}

fn format_entry(entry: &TimelineEntry) -> String {
	let m = &entry.message;
	let author = m.author.as_ref().map(|a| a.name.as_str()).unwrap_or(m.author_id.as_str());
	let time = m.created_at.format("%H:%M");
	match &entry.delivery {
		Delivery::Confirmed => format!("[{time}] {author}: {}", m.text),
		Delivery::Pending => format!("[{time}] {author}: {} (sending)", m.text),
		Delivery::Failed { reason } => {
			format!("[{time}] {author}: {} (failed: {reason}; /retry {} or /discard {})", m.text, m.id, m.id)
		}
	}
}

/// Turns timeline changes into output lines.
#[derive(Debug, Default)]
struct Printer {
	seen: HashMap<MessageId, Delivery>,
	online: Option<usize>,
	live: bool,
	/// Oldest confirmed entry printed so far.
	oldest: Option<Cursor>,
}

impl Printer {
	fn render(&mut self, snapshot: &SessionSnapshot) -> Vec<String> {
		let mut out = Vec::new();
		if snapshot.live != self.live {
			self.live = snapshot.live;
			out.push(format!("-- {} --", if snapshot.live { "connected" } else { "reconnecting" }));
		}
		if snapshot.live && self.online != Some(snapshot.online_count) {
			self.online = Some(snapshot.online_count);
			out.push(format!("-- {} online --", snapshot.online_count));
		}

		let oldest = snapshot
			.entries
			.first()
			.filter(|e| e.delivery.is_confirmed())
			.map(|e| Cursor::of(&e.message));
		if let (Some(before), Some(now)) = (self.oldest, oldest)
			&& (now.created_at, now.id) < (before.created_at, before.id)
		{
			out.push("-- earlier messages --".to_string());
		}
		if oldest.is_some() {
			self.oldest = oldest;
		}

		for entry in &snapshot.entries {
			if self.seen.get(&entry.message.id) == Some(&entry.delivery) {
				continue;
			}
			out.push(format_entry(entry));
			self.seen.insert(entry.message.id, entry.delivery.clone());
		}

		self.seen.retain(|id, _| snapshot.entries.iter().any(|e| e.message.id == *id));
		out
	}

	fn print(&mut self, snapshot: &SessionSnapshot) {
		for line in self.render(snapshot) {
			println!("{line}");
		}
	}
}

async fn run_chat(
	cfg: &ClientConfig,
	backend: &Backend,
	store: &SessionStore,
	session: AuthSession,
	room: RoomId,
) -> anyhow::Result<()> {
	let (token_tx, token_rx) = watch::channel(session.access_token.clone());
	let rooms = RoomService::new(Arc::new(RestRoomStore::new(backend.clone(), token_rx.clone())));

	let user_id = session.user.id.clone();
	let room = rooms.open_room(&user_id, &room).await?;
	let profile = rooms.profile(&user_id).await?.unwrap_or_else(|| UserProfile {
		id: user_id.clone(),
		name: session.user.display_name(),
		image_url: session.user.avatar_url(),
	});

	let realtime = backend.realtime(Some(session.access_token.clone()));
	let refresher = spawn_token_refresher(
		backend.clone(),
		store.clone(),
		session,
		token_tx,
		realtime.clone(),
	);

	let messages = Arc::new(RestMessageStore::new(backend.rest.clone(), token_rx));
	let mut chat = ChatSession::connect(&realtime, messages, room.id.clone(), profile, cfg.page_size).await?;

	println!("# {}", room.name);
	let mut printer = Printer::default();
	printer.print(&chat.snapshot());

	let mut lines = BufReader::new(tokio::io::stdin()).lines();
	loop {
		tokio::select! {
			ev = chat.next_event() => {
				let Some(ev) = ev else {
					println!("-- channel closed --");
					break;
				};
				chat.handle_event(ev).await;
			}
			line = lines.next_line() => {
				let Some(line) = line.context("read stdin")? else {
					break;
				};
				match parse_chat_input(&line) {
					ChatInput::Quit => break,
					ChatInput::Empty => {}
					ChatInput::Invalid(msg) => eprintln!("{msg}"),
					ChatInput::Send(text) => {
						if let Err(e) = chat.send(&text).await {
							eprintln!("! {e}");
						}
					}
					ChatInput::Older => match chat.load_older().await {
						Ok(true) => {}
						Ok(false) if !chat.timeline().has_more() => println!("-- no earlier messages --"),
						Ok(false) => {}
						Err(e) => eprintln!("! {e}"),
					},
					ChatInput::Retry(id) => {
						if let Err(e) = chat.retry(id).await {
							eprintln!("! {e}");
						}
					}
					ChatInput::Discard(id) => {
						if !chat.discard(id) {
							eprintln!("! no failed message {id}");
						}
					}
					ChatInput::Who => {
						let snapshot = chat.snapshot();
						println!("-- {} online --", snapshot.online_count);
						for user in snapshot.online_users {
							let name = user.name.unwrap_or(user.key);
							if user.connections > 1 {
								println!("  {name} ({} connections)", user.connections);
							} else {
								println!("  {name}");
							}
						}
					}
				}
			}
			_ = tokio::signal::ctrl_c() => break,
		}
		printer.print(&chat.snapshot());
	}

	refresher.abort();
	realtime.shutdown();
	Ok(())
}
