//! Registry of the external storefronts a catalog can be synchronized to.
//!
//! Every platform carries the knobs that gate a sync attempt: its operational status, a sync
//! kill-switch and an hourly rate limit. The registry also keeps track of how many product
//! targets point at each platform, so a platform can't be removed from under a product.

use std::{collections::HashMap, fmt};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};

use super::error::{Error, Result, UnavailableReason};

const DEFAULT_RATE_LIMIT_PER_HOUR: i64 = 1000;

/// Stable identifier of a platform, like `"amazon"` or `"shopify"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlatformId(String);

impl PlatformId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for PlatformId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for PlatformId {
	fn from(id: &str) -> Self {
		Self(id.to_string())
	}
}

impl From<String> for PlatformId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
	strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlatformKind {
	Marketplace,
	Ecommerce,
	Social,
}

/// Operational status of a platform, only `Active` platforms accept new sync attempts.
#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
	strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PlatformStatus {
	Active,
	Maintenance,
	Inactive,
}

/// Opaque handle into the secret storage holding the platform's API credentials.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CredentialRef(String);

impl CredentialRef {
	pub fn new(handle: impl Into<String>) -> Self {
		Self(handle.into())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Platform {
	pub id: PlatformId,
	pub display_name: String,
	pub kind: PlatformKind,
	pub status: PlatformStatus,
	pub sync_enabled: bool,
	pub rate_limit_per_hour: u32,
	pub credential_ref: CredentialRef,
	pub webhook_url: String,
	pub commission_rate: f64,
	pub registered_at: DateTime<Utc>,
	pub last_sync_at: Option<DateTime<Utc>>,
}

impl Platform {
	/// Pure guard check: may a new sync attempt start given how many attempts already happened in
	/// the current rate window?
	#[must_use]
	pub fn can_attempt(&self, window_attempt_count: usize) -> bool {
		self.check_attempt(window_attempt_count).is_ok()
	}

	/// Same as [`Platform::can_attempt`] but tells which guard refused the attempt.
	pub fn check_attempt(&self, window_attempt_count: usize) -> Result<()> {
		if self.status != PlatformStatus::Active {
			return Err(Error::PlatformUnavailable {
				platform_id: self.id.clone(),
				reason: UnavailableReason::Status(self.status),
			});
		}

		if !self.sync_enabled {
			return Err(Error::PlatformUnavailable {
				platform_id: self.id.clone(),
				reason: UnavailableReason::SyncDisabled,
			});
		}

		if window_attempt_count >= self.rate_limit_per_hour as usize {
			return Err(Error::Throttled {
				platform_id: self.id.clone(),
				limit: self.rate_limit_per_hour,
			});
		}

		Ok(())
	}
}

/// Input for [`PlatformRegistry::register`].
///
/// New platforms start `inactive` with sync disabled, an admin has to switch them on explicitly.
#[derive(Debug, Clone)]
pub struct PlatformConfig {
	pub id: PlatformId,
	pub display_name: String,
	pub kind: PlatformKind,
	pub credential_ref: CredentialRef,
	pub rate_limit_per_hour: i64,
	pub status: PlatformStatus,
	pub sync_enabled: bool,
	pub webhook_url: Option<String>,
	pub commission_rate: f64,
}

impl PlatformConfig {
	pub fn new(
		id: impl Into<PlatformId>,
		display_name: impl Into<String>,
		kind: PlatformKind,
		credential_ref: CredentialRef,
	) -> Self {
		Self {
			id: id.into(),
			display_name: display_name.into(),
			kind,
			credential_ref,
			rate_limit_per_hour: DEFAULT_RATE_LIMIT_PER_HOUR,
			status: PlatformStatus::Inactive,
			sync_enabled: false,
			webhook_url: None,
			commission_rate: 0.0,
		}
	}

	#[must_use]
	pub fn with_rate_limit(mut self, rate_limit_per_hour: i64) -> Self {
		self.rate_limit_per_hour = rate_limit_per_hour;
		self
	}

	#[must_use]
	pub fn with_status(mut self, status: PlatformStatus) -> Self {
		self.status = status;
		self
	}

	#[must_use]
	pub fn with_sync_enabled(mut self, sync_enabled: bool) -> Self {
		self.sync_enabled = sync_enabled;
		self
	}

	#[must_use]
	pub fn with_webhook_url(mut self, webhook_url: impl Into<String>) -> Self {
		self.webhook_url = Some(webhook_url.into());
		self
	}

	#[must_use]
	pub fn with_commission_rate(mut self, commission_rate: f64) -> Self {
		self.commission_rate = commission_rate;
		self
	}

	fn validate(&self) -> Result<u32> {
		if self.id.as_str().trim().is_empty() {
			return Err(Error::Validation("platform id must not be empty".to_string()));
		}

		if self.display_name.trim().is_empty() {
			return Err(Error::Validation(format!(
				"platform <id='{}'> must have a display name",
				self.id
			)));
		}

		if self.credential_ref.as_str().trim().is_empty() {
			return Err(Error::Validation(format!(
				"platform <id='{}'> must reference its API credentials",
				self.id
			)));
		}

		if !(0.0..=100.0).contains(&self.commission_rate) {
			return Err(Error::Validation(format!(
				"commission rate must be a percentage between 0 and 100, got {}",
				self.commission_rate
			)));
		}

		validate_rate_limit(self.rate_limit_per_hour)
	}
}

fn validate_rate_limit(rate_limit_per_hour: i64) -> Result<u32> {
	u32::try_from(rate_limit_per_hour).map_err(|_| {
		Error::Validation(format!(
			"rate limit per hour must be a non negative 32 bits integer, got {rate_limit_per_hour}"
		))
	})
}

fn default_webhook_url(display_name: &str) -> String {
	let host = display_name
		.chars()
		.filter(|c| !c.is_whitespace())
		.collect::<String>()
		.to_lowercase();

	format!("https://api.{host}.com/webhook")
}

/// Aggregates shown on the platform administration page.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrySummary {
	pub total: usize,
	pub active: usize,
	pub sync_enabled: usize,
	pub total_rate_limit_per_hour: u64,
}

#[derive(Debug)]
struct Entry {
	platform: Platform,
	attached_targets: usize,
}

#[derive(Debug, Default)]
pub struct PlatformRegistry {
	platforms: RwLock<HashMap<PlatformId, Entry>>,
}

impl PlatformRegistry {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	#[instrument(skip(self, config), fields(platform_id = %config.id), err)]
	pub async fn register(&self, config: PlatformConfig) -> Result<Platform> {
		let rate_limit_per_hour = config.validate()?;

		let mut platforms = self.platforms.write().await;

		if platforms.contains_key(&config.id) {
			return Err(Error::DuplicatePlatform(config.id));
		}

		let platform = Platform {
			webhook_url: config
				.webhook_url
				.unwrap_or_else(|| default_webhook_url(&config.display_name)),
			id: config.id,
			display_name: config.display_name,
			kind: config.kind,
			status: config.status,
			sync_enabled: config.sync_enabled,
			rate_limit_per_hour,
			credential_ref: config.credential_ref,
			commission_rate: config.commission_rate,
			registered_at: Utc::now(),
			last_sync_at: None,
		};

		debug!(status = %platform.status, sync_enabled = platform.sync_enabled, "Registered platform");

		platforms.insert(
			platform.id.clone(),
			Entry {
				platform: platform.clone(),
				attached_targets: 0,
			},
		);

		Ok(platform)
	}

	pub async fn get(&self, id: &PlatformId) -> Result<Platform> {
		self.platforms
			.read()
			.await
			.get(id)
			.map(|entry| entry.platform.clone())
			.ok_or_else(|| Error::PlatformNotFound(id.clone()))
	}

	/// All registered platforms, sorted by id.
	pub async fn list(&self) -> Vec<Platform> {
		let mut platforms = self
			.platforms
			.read()
			.await
			.values()
			.map(|entry| entry.platform.clone())
			.collect::<Vec<_>>();

		platforms.sort_by(|a, b| a.id.cmp(&b.id));

		platforms
	}

	#[instrument(skip(self), err)]
	pub async fn set_sync_enabled(&self, id: &PlatformId, sync_enabled: bool) -> Result<()> {
		self.update(id, |platform| platform.sync_enabled = sync_enabled)
			.await
	}

	#[instrument(skip(self), err)]
	pub async fn set_status(&self, id: &PlatformId, status: PlatformStatus) -> Result<()> {
		self.update(id, |platform| platform.status = status).await
	}

	#[instrument(skip(self), err)]
	pub async fn set_rate_limit(&self, id: &PlatformId, rate_limit_per_hour: i64) -> Result<()> {
		let rate_limit_per_hour = validate_rate_limit(rate_limit_per_hour)?;

		self.update(id, |platform| {
			platform.rate_limit_per_hour = rate_limit_per_hour;
		})
		.await
	}

	/// Looks the platform up and runs the pure [`Platform::can_attempt`] guard on it.
	pub async fn can_attempt(&self, id: &PlatformId, window_attempt_count: usize) -> Result<bool> {
		self.platforms
			.read()
			.await
			.get(id)
			.map(|entry| entry.platform.can_attempt(window_attempt_count))
			.ok_or_else(|| Error::PlatformNotFound(id.clone()))
	}

	/// Removes a platform, refusing while any product still targets it.
	#[instrument(skip(self), err)]
	pub async fn remove(&self, id: &PlatformId) -> Result<Platform> {
		let mut platforms = self.platforms.write().await;

		match platforms.get(id) {
			None => Err(Error::PlatformNotFound(id.clone())),
			Some(entry) if entry.attached_targets > 0 => Err(Error::PlatformInUse {
				platform_id: id.clone(),
				targets: entry.attached_targets,
			}),
			Some(_) => {
				let entry = platforms
					.remove(id)
					.ok_or_else(|| Error::PlatformNotFound(id.clone()))?;

				debug!("Removed platform");

				Ok(entry.platform)
			}
		}
	}

	pub async fn summary(&self) -> RegistrySummary {
		self.platforms.read().await.values().fold(
			RegistrySummary::default(),
			|mut summary, Entry { platform, .. }| {
				summary.total += 1;
				if platform.status == PlatformStatus::Active {
					summary.active += 1;
				}
				if platform.sync_enabled {
					summary.sync_enabled += 1;
				}
				summary.total_rate_limit_per_hour += u64::from(platform.rate_limit_per_hour);

				summary
			},
		)
	}

	pub(crate) async fn attach_target(&self, id: &PlatformId) -> Result<()> {
		let mut platforms = self.platforms.write().await;

		let entry = platforms
			.get_mut(id)
			.ok_or_else(|| Error::PlatformNotFound(id.clone()))?;

		entry.attached_targets += 1;
		trace!(platform_id = %id, attached_targets = entry.attached_targets, "Attached target");

		Ok(())
	}

	pub(crate) async fn detach_targets(&self, ids: impl IntoIterator<Item = &PlatformId>) {
		let mut platforms = self.platforms.write().await;

		for id in ids {
			if let Some(entry) = platforms.get_mut(id) {
				entry.attached_targets = entry.attached_targets.saturating_sub(1);
				trace!(platform_id = %id, attached_targets = entry.attached_targets, "Detached target");
			}
		}
	}

	pub(crate) async fn record_sync(&self, id: &PlatformId, at: DateTime<Utc>) {
		if let Some(entry) = self.platforms.write().await.get_mut(id) {
			entry.platform.last_sync_at = Some(at);
		}
	}

	async fn update(&self, id: &PlatformId, f: impl FnOnce(&mut Platform) + Send) -> Result<()> {
		let mut platforms = self.platforms.write().await;

		let entry = platforms
			.get_mut(id)
			.ok_or_else(|| Error::PlatformNotFound(id.clone()))?;

		f(&mut entry.platform);

		Ok(())
	}
}
