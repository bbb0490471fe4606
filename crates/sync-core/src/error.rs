use std::{fmt, path::Path};

use thiserror::Error;

use super::{
	catalog::{ProductId, TargetStatus},
	platform::{PlatformId, PlatformStatus},
};

/// Coarse classification of every [`Error`], the vocabulary callers use to decide how to surface a
/// failure (toast, badge, retry later) without matching on each variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
	Validation,
	NotFound,
	Conflict,
	Concurrency,
	Throttled,
	PlatformUnavailable,
	Policy,
	InvalidTransition,
	Config,
}

#[derive(Debug, Error)]
pub enum Error {
	#[error("validation failed: {0}")]
	Validation(String),

	#[error("platform not found: {0}")]
	PlatformNotFound(PlatformId),
	#[error("product not found: {0}")]
	ProductNotFound(ProductId),
	#[error("sync target not found <product_id='{product_id}', platform_id='{platform_id}'>")]
	TargetNotFound {
		product_id: ProductId,
		platform_id: PlatformId,
	},

	#[error("platform already registered: {0}")]
	DuplicatePlatform(PlatformId),
	#[error("product already exists: {0}")]
	DuplicateProduct(ProductId),
	#[error("product <id='{product_id}'> already targets platform <id='{platform_id}'>")]
	DuplicateTarget {
		product_id: ProductId,
		platform_id: PlatformId,
	},
	#[error("platform <id='{platform_id}'> is still targeted by {targets} product(s)")]
	PlatformInUse {
		platform_id: PlatformId,
		targets: usize,
	},

	#[error("sync already in progress <product_id='{product_id}', platform_id='{platform_id}'>")]
	SyncInProgress {
		product_id: ProductId,
		platform_id: PlatformId,
	},
	#[error("sync attempt task was aborted <product_id='{product_id}', platform_id='{platform_id}'>")]
	AttemptAborted {
		product_id: ProductId,
		platform_id: PlatformId,
	},
	#[error("platform <id='{platform_id}'> reached its limit of {limit} sync attempts per window")]
	Throttled { platform_id: PlatformId, limit: u32 },
	#[error("platform <id='{platform_id}'> is unavailable: {reason}")]
	PlatformUnavailable {
		platform_id: PlatformId,
		reason: UnavailableReason,
	},
	#[error(
		"sync target <product_id='{product_id}', platform_id='{platform_id}'> failed {failures} \
		 times in a row, manual reset required"
	)]
	FailureCeilingReached {
		product_id: ProductId,
		platform_id: PlatformId,
		failures: u32,
	},
	#[error("invalid sync status transition: {from} -> {to}")]
	InvalidTransition { from: TargetStatus, to: TargetStatus },

	#[error(transparent)]
	FileIO(#[from] FileIOError),
	#[error("failed to (de)serialize config: {0}")]
	ConfigSerde(#[from] serde_json::Error),
	#[error("unknown config version: {0}")]
	UnknownConfigVersion(u32),
}

impl Error {
	#[must_use]
	pub const fn kind(&self) -> ErrorKind {
		match self {
			Self::Validation(_) => ErrorKind::Validation,
			Self::PlatformNotFound(_) | Self::ProductNotFound(_) | Self::TargetNotFound { .. } => {
				ErrorKind::NotFound
			}
			Self::DuplicatePlatform(_)
			| Self::DuplicateProduct(_)
			| Self::DuplicateTarget { .. }
			| Self::PlatformInUse { .. } => ErrorKind::Conflict,
			Self::SyncInProgress { .. } | Self::AttemptAborted { .. } => ErrorKind::Concurrency,
			Self::Throttled { .. } => ErrorKind::Throttled,
			Self::PlatformUnavailable { .. } => ErrorKind::PlatformUnavailable,
			Self::FailureCeilingReached { .. } => ErrorKind::Policy,
			Self::InvalidTransition { .. } => ErrorKind::InvalidTransition,
			Self::FileIO(_) | Self::ConfigSerde(_) | Self::UnknownConfigVersion(_) => {
				ErrorKind::Config
			}
		}
	}

	/// Whether the caller should try again later instead of reporting a hard failure.
	#[must_use]
	pub const fn is_retryable(&self) -> bool {
		matches!(
			self.kind(),
			ErrorKind::Concurrency | ErrorKind::Throttled | ErrorKind::PlatformUnavailable
		)
	}
}

/// Which platform guard refused a new sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnavailableReason {
	Status(PlatformStatus),
	SyncDisabled,
}

impl fmt::Display for UnavailableReason {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Status(status) => write!(f, "platform status is '{status}'"),
			Self::SyncDisabled => write!(f, "sync is disabled"),
		}
	}
}

/// File I/O error that includes the path that caused the error
#[derive(Error, Debug)]
pub struct FileIOError {
	pub path: Box<Path>,
	#[source]
	pub source: std::io::Error,
	pub maybe_context: Option<String>,
}

impl fmt::Display for FileIOError {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"file I/O error{}: {}; path: '{}'",
			self.maybe_context
				.as_ref()
				.map(|ctx| format!(" ({ctx})"))
				.unwrap_or_default(),
			self.source,
			self.path.display()
		)
	}
}

impl FileIOError {
	pub fn from_std_io_err_with_msg(
		path: impl AsRef<Path>,
		source: std::io::Error,
		msg: impl Into<String>,
	) -> Self {
		Self {
			path: path.as_ref().into(),
			source,
			maybe_context: Some(msg.into()),
		}
	}
}

pub type Result<T> = std::result::Result<T, Error>;
