//! Append only ledger of automation attempts.

use std::{collections::BTreeMap, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use tokio::sync::RwLock;
use tracing::trace;
use uuid::Uuid;

use super::{catalog::ProductId, error::Result, platform::PlatformId};

#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	PartialOrd,
	Ord,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
	strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AutomationType {
	Sync,
	Inventory,
	Pricing,
	Order,
}

#[derive(
	Debug,
	Clone,
	Copy,
	PartialEq,
	Eq,
	Hash,
	PartialOrd,
	Ord,
	Serialize,
	Deserialize,
	strum::Display,
	strum::EnumString,
	strum::EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LogStatus {
	Success,
	Warning,
	Error,
	Running,
}

impl LogStatus {
	#[must_use]
	pub const fn is_terminal(self) -> bool {
		!matches!(self, Self::Running)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
	pub id: u64,
	/// Shared by the `running` entry of a sync attempt and its terminal entry.
	pub attempt_id: Option<Uuid>,
	pub timestamp: DateTime<Utc>,
	#[serde(rename = "type")]
	pub kind: AutomationType,
	pub action: String,
	pub platform_id: PlatformId,
	pub product_id: Option<ProductId>,
	pub actor_id: String,
	pub status: LogStatus,
	pub duration_ms: Option<u64>,
	pub items_processed: u64,
	pub error_count: u64,
	pub details: String,
}

/// Everything in a [`LogEntry`] except what the log assigns itself: `id` and `timestamp`.
#[derive(Debug, Clone)]
pub struct NewLogEntry {
	pub attempt_id: Option<Uuid>,
	pub kind: AutomationType,
	pub action: String,
	pub platform_id: PlatformId,
	pub product_id: Option<ProductId>,
	pub actor_id: String,
	pub status: LogStatus,
	pub duration_ms: Option<u64>,
	pub items_processed: u64,
	pub error_count: u64,
	pub details: String,
}

impl NewLogEntry {
	pub fn new(
		kind: AutomationType,
		action: impl Into<String>,
		platform_id: PlatformId,
		actor_id: impl Into<String>,
		status: LogStatus,
	) -> Self {
		Self {
			attempt_id: None,
			kind,
			action: action.into(),
			platform_id,
			product_id: None,
			actor_id: actor_id.into(),
			status,
			duration_ms: None,
			items_processed: 0,
			error_count: 0,
			details: String::new(),
		}
	}

	#[must_use]
	pub const fn attempt(mut self, attempt_id: Uuid) -> Self {
		self.attempt_id = Some(attempt_id);
		self
	}

	#[must_use]
	pub fn product(mut self, product_id: ProductId) -> Self {
		self.product_id = Some(product_id);
		self
	}

	#[must_use]
	pub const fn duration_ms(mut self, duration_ms: u64) -> Self {
		self.duration_ms = Some(duration_ms);
		self
	}

	#[must_use]
	pub const fn counts(mut self, items_processed: u64, error_count: u64) -> Self {
		self.items_processed = items_processed;
		self.error_count = error_count;
		self
	}

	#[must_use]
	pub fn details(mut self, details: impl Into<String>) -> Self {
		self.details = details.into();
		self
	}
}

/// Filters of the automation logs page. Every set field must match.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
	pub status: Option<LogStatus>,
	pub kind: Option<AutomationType>,
	pub platform_id: Option<PlatformId>,
	pub product_id: Option<ProductId>,
	pub attempt_id: Option<Uuid>,
	pub since: Option<DateTime<Utc>>,
	/// Case insensitive match over action, platform and actor.
	pub text: Option<String>,
}

impl LogFilter {
	#[must_use]
	pub const fn status(mut self, status: LogStatus) -> Self {
		self.status = Some(status);
		self
	}

	#[must_use]
	pub const fn kind(mut self, kind: AutomationType) -> Self {
		self.kind = Some(kind);
		self
	}

	#[must_use]
	pub fn platform(mut self, platform_id: impl Into<PlatformId>) -> Self {
		self.platform_id = Some(platform_id.into());
		self
	}

	#[must_use]
	pub fn product(mut self, product_id: impl Into<ProductId>) -> Self {
		self.product_id = Some(product_id.into());
		self
	}

	#[must_use]
	pub const fn attempt(mut self, attempt_id: Uuid) -> Self {
		self.attempt_id = Some(attempt_id);
		self
	}

	#[must_use]
	pub const fn since(mut self, since: DateTime<Utc>) -> Self {
		self.since = Some(since);
		self
	}

	#[must_use]
	pub fn text(mut self, text: impl Into<String>) -> Self {
		self.text = Some(text.into());
		self
	}

	#[must_use]
	pub fn matches(&self, entry: &LogEntry) -> bool {
		self.status.map_or(true, |status| entry.status == status)
			&& self.kind.map_or(true, |kind| entry.kind == kind)
			&& self
				.platform_id
				.as_ref()
				.map_or(true, |platform_id| &entry.platform_id == platform_id)
			&& self
				.product_id
				.as_ref()
				.map_or(true, |product_id| entry.product_id.as_ref() == Some(product_id))
			&& self
				.attempt_id
				.map_or(true, |attempt_id| entry.attempt_id == Some(attempt_id))
			&& self.since.map_or(true, |since| entry.timestamp >= since)
			&& self.text.as_ref().map_or(true, |text| {
				let text = text.to_lowercase();
				entry.action.to_lowercase().contains(&text)
					|| entry.platform_id.as_str().to_lowercase().contains(&text)
					|| entry.actor_id.to_lowercase().contains(&text)
			})
	}
}

/// Lazy iterator over a snapshot of the log taken when the query was made, newest entries first.
#[derive(Debug)]
pub struct LogQuery {
	entries: std::vec::IntoIter<Arc<LogEntry>>,
	filter: LogFilter,
}

impl Iterator for LogQuery {
	type Item = Arc<LogEntry>;

	fn next(&mut self) -> Option<Self::Item> {
		let filter = &self.filter;
		self.entries.rfind(|entry| filter.matches(entry))
	}
}

impl DoubleEndedIterator for LogQuery {
	fn next_back(&mut self) -> Option<Self::Item> {
		let filter = &self.filter;
		self.entries.find(|entry| filter.matches(entry))
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogStats {
	pub total: usize,
	pub by_status: BTreeMap<LogStatus, usize>,
	pub by_kind: BTreeMap<AutomationType, usize>,
	/// `success / total`, zero for an empty log.
	pub success_rate: f64,
}

#[derive(Debug, Default)]
pub struct AutomationLog {
	entries: RwLock<Vec<Arc<LogEntry>>>,
}

impl AutomationLog {
	#[must_use]
	pub fn new() -> Self {
		Self::default()
	}

	/// Appends a new entry, assigning it the next id and the current time.
	pub async fn append(&self, new_entry: NewLogEntry) -> Arc<LogEntry> {
		let mut entries = self.entries.write().await;

		let entry = Arc::new(LogEntry {
			id: entries.len() as u64 + 1,
			attempt_id: new_entry.attempt_id,
			timestamp: Utc::now(),
			kind: new_entry.kind,
			action: new_entry.action,
			platform_id: new_entry.platform_id,
			product_id: new_entry.product_id,
			actor_id: new_entry.actor_id,
			status: new_entry.status,
			duration_ms: new_entry.duration_ms,
			items_processed: new_entry.items_processed,
			error_count: new_entry.error_count,
			details: new_entry.details,
		});

		trace!(id = entry.id, status = %entry.status, platform_id = %entry.platform_id, "Appended log entry");

		entries.push(Arc::clone(&entry));

		entry
	}

	pub async fn query(&self, filter: LogFilter) -> LogQuery {
		LogQuery {
			entries: self.entries.read().await.clone().into_iter(),
			filter,
		}
	}

	pub async fn stats(&self, filter: Option<&LogFilter>) -> LogStats {
		let entries = self.entries.read().await;

		let mut by_status = LogStatus::iter()
			.map(|status| (status, 0))
			.collect::<BTreeMap<_, _>>();
		let mut by_kind = AutomationType::iter()
			.map(|kind| (kind, 0))
			.collect::<BTreeMap<_, _>>();

		let mut total = 0;
		for entry in entries
			.iter()
			.filter(|entry| filter.map_or(true, |filter| filter.matches(entry)))
		{
			total += 1;
			*by_status.entry(entry.status).or_default() += 1;
			*by_kind.entry(entry.kind).or_default() += 1;
		}

		#[allow(clippy::cast_precision_loss)]
		let success_rate = if total == 0 {
			0.0
		} else {
			by_status[&LogStatus::Success] as f64 / total as f64
		};

		LogStats {
			total,
			by_status,
			by_kind,
			success_rate,
		}
	}

	/// Matching entries as a pretty printed JSON array, for the "Export Logs" download.
	pub async fn export_json(&self, filter: LogFilter) -> Result<String> {
		let entries = self.query(filter).await.collect::<Vec<_>>();

		Ok(serde_json::to_string_pretty(
			&entries.iter().map(AsRef::as_ref).collect::<Vec<&LogEntry>>(),
		)?)
	}

	pub async fn len(&self) -> usize {
		self.entries.read().await.len()
	}

	pub async fn is_empty(&self) -> bool {
		self.entries.read().await.is_empty()
	}
}

#[cfg(test)]
mod tests {
	use pretty_assertions::assert_eq;

	use super::*;

	fn entry(kind: AutomationType, platform: &str, status: LogStatus) -> NewLogEntry {
		NewLogEntry::new(kind, "Product Sync", PlatformId::from(platform), "admin", status)
	}

	#[tokio::test]
	async fn query_returns_newest_first() {
		let log = AutomationLog::new();
		assert!(log.is_empty().await);

		let first = log
			.append(entry(AutomationType::Sync, "amazon", LogStatus::Running))
			.await;
		let second = log
			.append(entry(AutomationType::Pricing, "shopify", LogStatus::Success))
			.await;

		assert_eq!((first.id, second.id), (1, 2));
		assert!(first.timestamp <= second.timestamp);

		let ids = log
			.query(LogFilter::default())
			.await
			.map(|entry| entry.id)
			.collect::<Vec<_>>();
		assert_eq!(ids, vec![2, 1]);

		let oldest_first = log
			.query(LogFilter::default())
			.await
			.rev()
			.map(|entry| entry.id)
			.collect::<Vec<_>>();
		assert_eq!(oldest_first, vec![1, 2]);
	}

	#[tokio::test]
	async fn filters_combine() {
		let log = AutomationLog::new();
		let attempt_id = Uuid::new_v4();

		log.append(
			entry(AutomationType::Sync, "amazon", LogStatus::Error)
				.attempt(attempt_id)
				.product(ProductId::from("p1")),
		)
		.await;
		log.append(entry(AutomationType::Sync, "shopify", LogStatus::Success))
			.await;
		log.append(
			NewLogEntry::new(
				AutomationType::Inventory,
				"Stock Update",
				PlatformId::from("flipkart"),
				"system",
				LogStatus::Warning,
			)
			.counts(45, 2),
		)
		.await;

		let count = |filter: LogFilter| {
			let log = &log;
			async move { log.query(filter).await.count() }
		};

		assert_eq!(count(LogFilter::default().status(LogStatus::Error)).await, 1);
		assert_eq!(count(LogFilter::default().kind(AutomationType::Sync)).await, 2);
		assert_eq!(count(LogFilter::default().platform("shopify")).await, 1);
		assert_eq!(count(LogFilter::default().product("p1")).await, 1);
		assert_eq!(count(LogFilter::default().attempt(attempt_id)).await, 1);
		assert_eq!(count(LogFilter::default().text("STOCK")).await, 1);
		assert_eq!(count(LogFilter::default().text("system")).await, 1);
		assert_eq!(count(LogFilter::default().text("flip")).await, 1);
		assert_eq!(
			count(LogFilter {
				text: Some("FlipKart".to_string()),
				..LogFilter::default()
			})
			.await,
			1
		);
		assert_eq!(
			count(
				LogFilter::default()
					.kind(AutomationType::Sync)
					.status(LogStatus::Warning)
			)
			.await,
			0
		);
		assert_eq!(
			count(LogFilter::default().since(Utc::now() + chrono::TimeDelta::hours(1))).await,
			0
		);
	}

	#[tokio::test]
	async fn stats_cover_every_variant() {
		let log = AutomationLog::new();

		let empty = log.stats(None).await;
		assert_eq!(empty.total, 0);
		assert!(empty.success_rate.abs() < f64::EPSILON);
		assert_eq!(empty.by_status.len(), 4);
		assert_eq!(empty.by_kind.len(), 4);

		for status in [
			LogStatus::Success,
			LogStatus::Success,
			LogStatus::Error,
			LogStatus::Warning,
			LogStatus::Running,
		] {
			log.append(entry(AutomationType::Sync, "amazon", status)).await;
		}

		let stats = log.stats(None).await;
		assert_eq!(stats.total, log.query(LogFilter::default()).await.count());
		assert_eq!(stats.by_status[&LogStatus::Success], 2);
		assert_eq!(stats.by_status[&LogStatus::Running], 1);
		assert_eq!(stats.by_kind[&AutomationType::Sync], 5);
		assert_eq!(stats.by_kind[&AutomationType::Order], 0);
		assert!((stats.success_rate - 0.4).abs() < f64::EPSILON);
		assert!((0.0..=1.0).contains(&stats.success_rate));

		let filtered = log
			.stats(Some(&LogFilter::default().status(LogStatus::Error)))
			.await;
		assert_eq!(filtered.total, 1);
		assert!(filtered.success_rate.abs() < f64::EPSILON);
	}

	#[tokio::test]
	async fn query_is_a_snapshot() {
		let log = AutomationLog::new();
		log.append(entry(AutomationType::Sync, "amazon", LogStatus::Running))
			.await;

		let query = log.query(LogFilter::default()).await;
		log.append(entry(AutomationType::Sync, "amazon", LogStatus::Success))
			.await;

		assert_eq!(query.count(), 1);
		assert_eq!(log.len().await, 2);
	}

	#[tokio::test]
	async fn export_uses_wire_names() {
		let log = AutomationLog::new();
		log.append(
			entry(AutomationType::Order, "myntra", LogStatus::Error)
				.details("Order sync failed: payment gateway timeout"),
		)
		.await;

		let json = log.export_json(LogFilter::default()).await.unwrap();
		let value = serde_json::from_str::<serde_json::Value>(&json).unwrap();

		assert_eq!(value[0]["type"], "order");
		assert_eq!(value[0]["status"], "error");
		assert_eq!(value[0]["platform_id"], "myntra");
		assert_eq!(value[0]["id"], 1);
	}
}
