//! Sync attempts of a product on a platform.
//!
//! [`SyncOrchestrator::request_sync`] admits an attempt under the platform guards, moves the target
//! into `syncing` and then runs the injected [`PlatformClient`] on a spawned task. Whatever happens
//! to the client call (error, panic, cancellation, deadline, or the caller dropping the request
//! future) the attempt settles the target and appends a terminal log entry.

use std::{
	any::Any,
	collections::HashMap,
	fmt,
	panic::{resume_unwind, AssertUnwindSafe},
	sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError},
	time::Duration,
};

use async_trait::async_trait;
use chrono::Utc;
use futures::{future::pending, FutureExt};
use futures_concurrency::future::{Join, Race};
use serde::{Deserialize, Serialize};
use tokio::{
	spawn,
	sync::{broadcast, Mutex, Notify},
	time::{sleep, Instant},
};
use tracing::{debug, instrument, trace, warn, Instrument};
use uuid::Uuid;

use super::{
	catalog::{Product, ProductCatalog, ProductId, SyncTarget, TargetStatus},
	config::SyncConfig,
	error::{Error, Result},
	log::{AutomationLog, AutomationType, LogStatus, NewLogEntry},
	platform::{Platform, PlatformId, PlatformRegistry},
};

mod rate_window;

use rate_window::RateWindow;

const SYNC_ACTION: &str = "Product Sync";

/// What the platform client receives for a single attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncRequest {
	pub attempt_id: Uuid,
	pub product: Product,
	pub platform: Platform,
}

/// Result reported by a platform once it processed a sync request.
///
/// `ok = false` with `items_processed > 0` is a partial success: the target still ends `failed`, but
/// the attempt is logged as a warning instead of an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientReport {
	pub ok: bool,
	pub items_processed: u64,
	pub error_count: u64,
	pub message: String,
}

impl ClientReport {
	#[must_use]
	pub fn success(items_processed: u64) -> Self {
		Self {
			ok: true,
			items_processed,
			error_count: 0,
			message: String::new(),
		}
	}

	pub fn failure(items_processed: u64, error_count: u64, message: impl Into<String>) -> Self {
		Self {
			ok: false,
			items_processed,
			error_count,
			message: message.into(),
		}
	}
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
	#[error("platform API error: {0}")]
	Api(String),
	#[error("platform rejected the credentials")]
	Unauthorized,
	#[error("network error: {0}")]
	Network(String),
}

/// Talks to the real marketplace API. Provided by the embedding application.
#[async_trait]
pub trait PlatformClient: Send + Sync + 'static {
	async fn sync(&self, request: &SyncRequest) -> std::result::Result<ClientReport, ClientError>;
}

/// Settled attempt, returned for every attempt that was admitted, including failed ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncOutcome {
	pub attempt_id: Uuid,
	pub product_id: ProductId,
	pub platform_id: PlatformId,
	pub status: TargetStatus,
	pub log_status: LogStatus,
	pub duration_ms: u64,
	pub items_processed: u64,
	pub error_count: u64,
	pub details: String,
	pub target: SyncTarget,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncEvent {
	Started {
		attempt_id: Uuid,
		product_id: ProductId,
		platform_id: PlatformId,
		actor_id: String,
	},
	Finished {
		attempt_id: Uuid,
		product_id: ProductId,
		platform_id: PlatformId,
		status: TargetStatus,
		log_status: LogStatus,
	},
}

type AttemptKey = (ProductId, PlatformId);

#[derive(Debug)]
struct InFlight {
	attempt_id: Uuid,
	cancel: Arc<Notify>,
}

/// An admitted attempt: the target is already `syncing` and counted in the rate window.
#[derive(Debug)]
struct Attempt {
	id: Uuid,
	actor_id: String,
	product: Product,
	platform: Platform,
	cancel: Arc<Notify>,
	started_at: Instant,
}

/// How an attempt settles, derived from whatever ended the client call.
#[derive(Debug)]
struct Settlement {
	status: TargetStatus,
	log_status: LogStatus,
	items_processed: u64,
	error_count: u64,
	details: String,
}

impl Settlement {
	fn from_report(report: ClientReport) -> Self {
		if report.ok {
			return Self {
				status: TargetStatus::Success,
				log_status: LogStatus::Success,
				details: if report.message.is_empty() {
					format!("Synced {} item(s)", report.items_processed)
				} else {
					report.message
				},
				items_processed: report.items_processed,
				error_count: report.error_count,
			};
		}

		Self {
			status: TargetStatus::Failed,
			log_status: if report.items_processed > 0 {
				LogStatus::Warning
			} else {
				LogStatus::Error
			},
			details: if report.message.is_empty() {
				"platform reported a failed sync".to_string()
			} else {
				report.message
			},
			items_processed: report.items_processed,
			error_count: report.error_count.max(1),
		}
	}

	const fn failed(details: String) -> Self {
		Self {
			status: TargetStatus::Failed,
			log_status: LogStatus::Error,
			items_processed: 0,
			error_count: 1,
			details,
		}
	}
}

enum RaceOutput {
	Completed(std::result::Result<std::result::Result<ClientReport, ClientError>, Box<dyn Any + Send>>),
	Canceled,
	TimedOut(Duration),
}

impl From<RaceOutput> for Settlement {
	fn from(output: RaceOutput) -> Self {
		match output {
			RaceOutput::Completed(Ok(Ok(report))) => Self::from_report(report),
			RaceOutput::Completed(Ok(Err(e))) => Self::failed(e.to_string()),
			RaceOutput::Completed(Err(payload)) => Self::failed(format!(
				"platform client panicked: {}",
				panic_message(&*payload)
			)),
			RaceOutput::Canceled => Self::failed("sync cancelled".to_string()),
			RaceOutput::TimedOut(timeout) => Self::failed(format!(
				"platform client timed out after {}ms",
				timeout.as_millis()
			)),
		}
	}
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
	payload
		.downcast_ref::<&str>()
		.copied()
		.or_else(|| payload.downcast_ref::<String>().map(String::as_str))
		.unwrap_or("unknown panic payload")
}

/// Signals cancellation to the attempt task if the request future is dropped before it settled.
struct CancelAttemptOnDrop(Option<Arc<Notify>>);

impl CancelAttemptOnDrop {
	fn disarm(mut self) {
		self.0 = None;
	}
}

impl Drop for CancelAttemptOnDrop {
	fn drop(&mut self) {
		if let Some(cancel) = self.0.take() {
			warn!("Sync request dropped before the attempt settled, cancelling it");
			cancel.notify_one();
		}
	}
}

struct Inner {
	registry: Arc<PlatformRegistry>,
	catalog: Arc<ProductCatalog>,
	log: Arc<AutomationLog>,
	client: Arc<dyn PlatformClient>,
	config: SyncConfig,
	windows: Mutex<HashMap<PlatformId, Arc<Mutex<RateWindow>>>>,
	in_flight: StdMutex<HashMap<AttemptKey, InFlight>>,
	events_tx: broadcast::Sender<SyncEvent>,
}

impl Inner {
	fn in_flight(&self) -> MutexGuard<'_, HashMap<AttemptKey, InFlight>> {
		self.in_flight.lock().unwrap_or_else(PoisonError::into_inner)
	}

	fn holds(&self, key: &AttemptKey, attempt_id: Uuid) -> bool {
		self.in_flight()
			.get(key)
			.is_some_and(|running| running.attempt_id == attempt_id)
	}

	fn emit(&self, event: SyncEvent) {
		// Ignore send errors (no subscribers)
		let _ = self.events_tx.send(event);
	}

	async fn window(&self, platform_id: &PlatformId) -> Arc<Mutex<RateWindow>> {
		Arc::clone(
			self.windows
				.lock()
				.await
				.entry(platform_id.clone())
				.or_insert_with(|| Arc::new(Mutex::new(RateWindow::new(self.config.rate_window())))),
		)
	}

	async fn admit(
		&self,
		actor_id: &str,
		product_id: &ProductId,
		platform_id: &PlatformId,
	) -> Result<Attempt> {
		let target = self.catalog.get_target(product_id, platform_id).await?;
		if target.status == TargetStatus::Syncing {
			return Err(Error::SyncInProgress {
				product_id: product_id.clone(),
				platform_id: platform_id.clone(),
			});
		}

		let rate_window = self.window(platform_id).await;
		let mut window = rate_window.lock().await;
		let now = Instant::now();

		let platform = self.registry.get(platform_id).await?;
		if let Err(e) = platform.check_attempt(window.count(now)) {
			debug!(%e, "Sync attempt refused by platform guards");
			return Err(e);
		}

		let id = Uuid::new_v4();
		let (product, _) = self
			.catalog
			.begin_sync(
				id,
				product_id,
				platform_id,
				self.config.retry.max_consecutive_failures,
				Utc::now(),
			)
			.await?;

		window.record(now);

		let cancel = Arc::new(Notify::new());

		self.in_flight().insert(
			(product_id.clone(), platform_id.clone()),
			InFlight {
				attempt_id: id,
				cancel: Arc::clone(&cancel),
			},
		);

		Ok(Attempt {
			id,
			actor_id: actor_id.to_string(),
			product,
			platform,
			cancel,
			started_at: now,
		})
	}

	async fn run_attempt(self: Arc<Self>, attempt: Attempt) -> Result<SyncOutcome> {
		let Attempt {
			id,
			actor_id,
			product,
			platform,
			cancel,
			started_at,
		} = attempt;

		let product_id = product.id.clone();
		let platform_id = platform.id.clone();

		self.log
			.append(
				NewLogEntry::new(
					AutomationType::Sync,
					SYNC_ACTION,
					platform_id.clone(),
					actor_id.as_str(),
					LogStatus::Running,
				)
				.attempt(id)
				.product(product_id.clone())
				.details(format!(
					"Syncing '{}' to {}",
					product.name, platform.display_name
				)),
			)
			.await;

		self.emit(SyncEvent::Started {
			attempt_id: id,
			product_id: product_id.clone(),
			platform_id: platform_id.clone(),
			actor_id: actor_id.clone(),
		});

		let request = SyncRequest {
			attempt_id: id,
			product,
			platform,
		};
		let timeout = self.config.client_timeout();

		trace!(%id, "Calling platform client");

		let settlement = Settlement::from(
			(
				async {
					RaceOutput::Completed(
						AssertUnwindSafe(self.client.sync(&request))
							.catch_unwind()
							.await,
					)
				},
				async {
					cancel.notified().await;
					RaceOutput::Canceled
				},
				async move {
					if let Some(timeout) = timeout {
						sleep(timeout).await;
						RaceOutput::TimedOut(timeout)
					} else {
						pending().await
					}
				},
			)
				.race()
				.await,
		);

		self.settle(id, &actor_id, &product_id, &platform_id, started_at, settlement)
			.await
	}

	async fn settle(
		&self,
		attempt_id: Uuid,
		actor_id: &str,
		product_id: &ProductId,
		platform_id: &PlatformId,
		started_at: Instant,
		settlement: Settlement,
	) -> Result<SyncOutcome> {
		let at = Utc::now();
		let duration_ms = u64::try_from(started_at.elapsed().as_millis()).unwrap_or(u64::MAX);

		let finished = self
			.catalog
			.finish_sync(
				attempt_id,
				product_id,
				platform_id,
				settlement.status,
				(settlement.status == TargetStatus::Failed).then(|| settlement.details.clone()),
				at,
			)
			.await;

		// No await between settling the target and releasing the in-flight slot
		{
			let mut in_flight = self.in_flight();
			let key = (product_id.clone(), platform_id.clone());
			if in_flight
				.get(&key)
				.is_some_and(|running| running.attempt_id == attempt_id)
			{
				in_flight.remove(&key);
			}
		}

		if let Err(e) = &finished {
			warn!(%attempt_id, %e, "Failed to settle sync target");
		} else if settlement.status == TargetStatus::Success {
			self.registry.record_sync(platform_id, at).await;
		}

		self.log
			.append(
				NewLogEntry::new(
					AutomationType::Sync,
					SYNC_ACTION,
					platform_id.clone(),
					actor_id,
					settlement.log_status,
				)
				.attempt(attempt_id)
				.product(product_id.clone())
				.duration_ms(duration_ms)
				.counts(settlement.items_processed, settlement.error_count)
				.details(settlement.details.as_str()),
			)
			.await;

		debug!(
			%attempt_id,
			status = %settlement.status,
			log_status = %settlement.log_status,
			duration_ms,
			"Sync attempt settled"
		);

		self.emit(SyncEvent::Finished {
			attempt_id,
			product_id: product_id.clone(),
			platform_id: platform_id.clone(),
			status: settlement.status,
			log_status: settlement.log_status,
		});

		let target = finished?;

		Ok(SyncOutcome {
			attempt_id,
			product_id: product_id.clone(),
			platform_id: platform_id.clone(),
			status: settlement.status,
			log_status: settlement.log_status,
			duration_ms,
			items_processed: settlement.items_processed,
			error_count: settlement.error_count,
			details: settlement.details,
			target,
		})
	}
}

#[derive(Clone)]
pub struct SyncOrchestrator {
	inner: Arc<Inner>,
}

impl fmt::Debug for SyncOrchestrator {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.debug_struct("SyncOrchestrator")
			.field("config", &self.inner.config)
			.finish_non_exhaustive()
	}
}

impl SyncOrchestrator {
	/// `catalog` must have been built on top of `registry`, otherwise a [`Error::Validation`] is
	/// returned.
	pub fn new(
		registry: Arc<PlatformRegistry>,
		catalog: Arc<ProductCatalog>,
		log: Arc<AutomationLog>,
		client: Arc<dyn PlatformClient>,
		config: SyncConfig,
	) -> Result<Self> {
		config.validate()?;

		if !Arc::ptr_eq(catalog.registry(), &registry) {
			return Err(Error::Validation(
				"product catalog was built on a different platform registry".to_string(),
			));
		}

		let (events_tx, _) = broadcast::channel(config.event_capacity);

		Ok(Self {
			inner: Arc::new(Inner {
				registry,
				catalog,
				log,
				client,
				config,
				windows: Mutex::default(),
				in_flight: StdMutex::default(),
				events_tx,
			}),
		})
	}

	#[must_use]
	pub fn registry(&self) -> &Arc<PlatformRegistry> {
		&self.inner.registry
	}

	#[must_use]
	pub fn catalog(&self) -> &Arc<ProductCatalog> {
		&self.inner.catalog
	}

	#[must_use]
	pub fn log(&self) -> &Arc<AutomationLog> {
		&self.inner.log
	}

	#[must_use]
	pub fn config(&self) -> &SyncConfig {
		&self.inner.config
	}

	#[must_use]
	pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
		self.inner.events_tx.subscribe()
	}

	/// Syncs a product to a platform on behalf of the configured default actor.
	pub async fn request_sync(
		&self,
		product_id: &ProductId,
		platform_id: &PlatformId,
	) -> Result<SyncOutcome> {
		self.request_sync_by(&self.inner.config.default_actor, product_id, platform_id)
			.await
	}

	/// Syncs a product to a platform.
	///
	/// Refusals (unknown ids, sync already running, platform guards, failure ceiling) are returned
	/// as errors and leave both the target and the log untouched. Once admitted, the attempt always
	/// settles and its outcome is returned as `Ok`, failed client calls included.
	#[instrument(skip(self), err)]
	pub async fn request_sync_by(
		&self,
		actor_id: &str,
		product_id: &ProductId,
		platform_id: &PlatformId,
	) -> Result<SyncOutcome> {
		let attempt = self.inner.admit(actor_id, product_id, platform_id).await?;
		let (attempt_id, started_at) = (attempt.id, attempt.started_at);

		let guard = CancelAttemptOnDrop(Some(Arc::clone(&attempt.cancel)));
		let handle = spawn(
			Arc::clone(&self.inner)
				.run_attempt(attempt)
				.in_current_span(),
		);

		let res = handle.await;
		guard.disarm();

		match res {
			Ok(outcome) => outcome,
			Err(e) if e.is_panic() => resume_unwind(e.into_panic()),
			Err(_) => {
				// The attempt task was aborted (runtime shutdown) before it settled the target
				if self
					.inner
					.holds(&(product_id.clone(), platform_id.clone()), attempt_id)
				{
					warn!(%attempt_id, "Sync attempt aborted, settling it as failed");
					if let Err(e) = self
						.inner
						.settle(
							attempt_id,
							actor_id,
							product_id,
							platform_id,
							started_at,
							Settlement::failed("sync attempt aborted".to_string()),
						)
						.await
					{
						warn!(%attempt_id, %e, "Failed to settle aborted sync attempt");
					}
				}

				Err(Error::AttemptAborted {
					product_id: product_id.clone(),
					platform_id: platform_id.clone(),
				})
			}
		}
	}

	/// Syncs a product to all its platforms concurrently, on behalf of the default actor.
	pub async fn request_sync_all(
		&self,
		product_id: &ProductId,
	) -> Result<Vec<(PlatformId, Result<SyncOutcome>)>> {
		self.request_sync_all_by(&self.inner.config.default_actor, product_id)
			.await
	}

	#[instrument(skip(self), err)]
	pub async fn request_sync_all_by(
		&self,
		actor_id: &str,
		product_id: &ProductId,
	) -> Result<Vec<(PlatformId, Result<SyncOutcome>)>> {
		let platform_ids = self
			.inner
			.catalog
			.get_product(product_id)
			.await?
			.targets
			.into_keys()
			.collect::<Vec<_>>();

		let results = platform_ids
			.iter()
			.map(|platform_id| self.request_sync_by(actor_id, product_id, platform_id))
			.collect::<Vec<_>>()
			.join()
			.await;

		Ok(platform_ids.into_iter().zip(results).collect())
	}

	/// Asks the in-flight attempt of this target to stop, returning whether one was running.
	#[instrument(skip(self), err)]
	pub async fn cancel_sync(&self, product_id: &ProductId, platform_id: &PlatformId) -> Result<bool> {
		let maybe_cancel = self
			.inner
			.in_flight()
			.get(&(product_id.clone(), platform_id.clone()))
			.map(|running| Arc::clone(&running.cancel));

		if let Some(cancel) = maybe_cancel {
			cancel.notify_one();
			return Ok(true);
		}

		self.inner.catalog.get_target(product_id, platform_id).await?;

		Ok(false)
	}

	pub async fn reset_failures(
		&self,
		product_id: &ProductId,
		platform_id: &PlatformId,
	) -> Result<SyncTarget> {
		self.inner
			.catalog
			.reset_failures(product_id, platform_id)
			.await
	}

	/// Failed targets due for a retry under the configured backoff.
	pub async fn retry_candidates(&self) -> Vec<(ProductId, PlatformId)> {
		self.inner
			.catalog
			.retry_candidates(&self.inner.config.retry, Utc::now())
			.await
	}
}
