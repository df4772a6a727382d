#![forbid(unsafe_code)]

use pachat_backend::BackendError;
use pachat_domain::ValidationError;

/// Errors for client core operations.
///
/// `Display` is the short text shown to the user; the underlying cause is
/// kept as the error source.
#[derive(Debug, thiserror::Error)]
pub enum ClientCoreError {
	#[error("User not logged in")]
	NotAuthenticated,

	/// Input rejected before anything was sent.
	#[error("{context}")]
	Validation {
		context: &'static str,
		#[source]
		source: ValidationError,
	},

	#[error("Current user is not a member of this room")]
	NotAMember,

	#[error("User not found")]
	UserNotFound,

	#[error("User is already a member of this room")]
	AlreadyMember,

	#[error("Room not found")]
	RoomNotFound,

	/// Backend request failed while doing `context`.
	#[error("{context}")]
	Backend {
		context: &'static str,
		#[source]
		source: BackendError,
	},

	#[error("config error: {0}")]
	Config(String),

	#[error("error: {0}")]
	Other(String),
}

impl ClientCoreError {
	/// Adapter for `map_err` that tags a backend failure with what was attempted.
	pub(crate) fn backend(context: &'static str) -> impl FnOnce(BackendError) -> Self {
		move |source| Self::Backend { context, source }
	}

	pub(crate) fn validation(context: &'static str) -> impl FnOnce(ValidationError) -> Self {
		move |source| Self::Validation { context, source }
	}

	/// Detailed text including the cause, for logs and verbose output.
	pub fn detail(&self) -> String {
		match self {
			Self::Validation { context, source } => format!("{context}: {source}"),
			Self::Backend { context, source } => format!("{context}: {source}"),
			other => other.to_string(),
		}
	}

	/// True when the backend rejected the caller's credentials.
	pub fn is_unauthorized(&self) -> bool {
		match self {
			Self::NotAuthenticated => true,
			Self::Backend { source, .. } => source.is_unauthorized(),
			_ => false,
		}
	}
}
