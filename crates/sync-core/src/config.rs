//! Orchestrator configuration, stored as versioned JSON.

use std::{fs, io, path::Path, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{
	catalog::SyncTarget,
	error::{Error, FileIOError, Result},
};

const CURRENT_VERSION: u32 = 1;

/// Version migrations for on-disk configuration.
pub trait Migrate {
	fn current_version(&self) -> u32;

	fn target_version() -> u32;

	fn migrate(&mut self) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
	/// Consecutive failures after which a target is refused until a manual reset, `None` disables
	/// the ceiling.
	pub max_consecutive_failures: Option<u32>,
	pub base_delay_secs: u64,
	pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
	fn default() -> Self {
		Self {
			max_consecutive_failures: Some(3),
			base_delay_secs: 30,
			max_delay_secs: 3600,
		}
	}
}

impl RetryPolicy {
	#[must_use]
	pub fn ceiling_reached(&self, consecutive_failures: u32) -> bool {
		self.max_consecutive_failures
			.is_some_and(|ceiling| consecutive_failures >= ceiling)
	}

	/// Backoff after `consecutive_failures` failures in a row: `base * 2^(failures - 1)` capped at
	/// `max`. `None` once the ceiling is reached.
	#[must_use]
	pub fn delay_for(&self, consecutive_failures: u32) -> Option<TimeDelta> {
		if self.ceiling_reached(consecutive_failures) {
			return None;
		}

		let exponent = consecutive_failures.saturating_sub(1).min(63);
		let secs = self
			.base_delay_secs
			.saturating_mul(1u64.checked_shl(exponent).unwrap_or(u64::MAX))
			.min(self.max_delay_secs);

		TimeDelta::from_std(Duration::from_secs(secs)).ok()
	}

	#[must_use]
	pub fn next_attempt_at(&self, target: &SyncTarget) -> Option<DateTime<Utc>> {
		target.next_retry_at(self)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
	pub version: u32,
	/// Actor recorded on log entries when the caller doesn't name one.
	pub default_actor: String,
	pub rate_window_secs: u64,
	/// Deadline for a single platform client call, no deadline when unset.
	pub client_timeout_ms: Option<u64>,
	pub event_capacity: usize,
	pub retry: RetryPolicy,
}

impl Default for SyncConfig {
	fn default() -> Self {
		Self {
			version: CURRENT_VERSION,
			default_actor: "system".to_string(),
			rate_window_secs: 3600,
			client_timeout_ms: None,
			event_capacity: 1024,
			retry: RetryPolicy::default(),
		}
	}
}

impl SyncConfig {
	#[must_use]
	pub const fn rate_window(&self) -> Duration {
		Duration::from_secs(self.rate_window_secs)
	}

	#[must_use]
	pub fn client_timeout(&self) -> Option<Duration> {
		self.client_timeout_ms.map(Duration::from_millis)
	}

	pub fn validate(&self) -> Result<()> {
		if self.rate_window_secs == 0 {
			return Err(Error::Validation(
				"rate window must be at least one second".to_string(),
			));
		}

		if self.event_capacity == 0 {
			return Err(Error::Validation(
				"event channel capacity must be greater than zero".to_string(),
			));
		}

		if self.default_actor.trim().is_empty() {
			return Err(Error::Validation(
				"default actor must not be empty".to_string(),
			));
		}

		Ok(())
	}

	/// Reads the config file at `path`, migrating and rewriting it when it's outdated.
	pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();

		info!(path = %path.display(), "Loading sync config");

		let json = fs::read_to_string(path).map_err(|e| {
			FileIOError::from_std_io_err_with_msg(path, e, "failed to read sync config")
		})?;
		let mut config = serde_json::from_str::<Self>(&json)?;

		if config.current_version() < Self::target_version() {
			info!(
				from = config.current_version(),
				to = Self::target_version(),
				"Migrating sync config"
			);
			config.migrate()?;
			config.save(path)?;
		} else if config.current_version() > Self::target_version() {
			return Err(Error::UnknownConfigVersion(config.version));
		}

		config.validate()?;

		Ok(config)
	}

	/// Loads the config at `path`, writing the defaults there if the file doesn't exist yet.
	pub fn load_or_create(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();

		match Self::load_from(path) {
			Err(Error::FileIO(FileIOError { source, .. }))
				if source.kind() == io::ErrorKind::NotFound =>
			{
				warn!(path = %path.display(), "No sync config found, creating default");
				let config = Self::default();
				config.save(path)?;

				Ok(config)
			}
			res => res,
		}
	}

	pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
		let path = path.as_ref();

		if let Some(parent) = path.parent() {
			fs::create_dir_all(parent).map_err(|e| {
				FileIOError::from_std_io_err_with_msg(parent, e, "failed to create config directory")
			})?;
		}

		fs::write(path, serde_json::to_vec_pretty(self)?).map_err(|e| {
			FileIOError::from_std_io_err_with_msg(path, e, "failed to write sync config")
		})?;

		info!(path = %path.display(), "Saved sync config");

		Ok(())
	}
}

impl Migrate for SyncConfig {
	fn current_version(&self) -> u32 {
		self.version
	}

	fn target_version() -> u32 {
		CURRENT_VERSION
	}

	fn migrate(&mut self) -> Result<()> {
		match self.version {
			0 => {
				// v0 files had no failure ceiling
				self.retry.max_consecutive_failures = None;
				self.version = 1;
				Ok(())
			}
			1 => Ok(()),
			v => Err(Error::UnknownConfigVersion(v)),
		}
	}
}
