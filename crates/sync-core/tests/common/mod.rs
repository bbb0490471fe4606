use std::{
	collections::VecDeque,
	sync::{
		atomic::{AtomicUsize, Ordering},
		Arc, Mutex,
	},
};

use async_trait::async_trait;
use storesync_core::{
	AutomationLog, ClientError, ClientReport, CredentialRef, NewProduct, PlatformClient,
	PlatformConfig, PlatformId, PlatformKind, PlatformRegistry, PlatformStatus, ProductCatalog,
	ProductId, SyncConfig, SyncOrchestrator, SyncRequest,
};
use tokio::sync::Notify;

/// Replies with the scripted results in order, then succeeds forever.
#[derive(Debug, Default)]
pub struct ScriptedClient {
	script: Mutex<VecDeque<Result<ClientReport, ClientError>>>,
	calls: AtomicUsize,
}

impl ScriptedClient {
	pub fn new(script: impl IntoIterator<Item = Result<ClientReport, ClientError>>) -> Arc<Self> {
		Arc::new(Self {
			script: Mutex::new(script.into_iter().collect()),
			calls: AtomicUsize::new(0),
		})
	}

	pub fn always_ok() -> Arc<Self> {
		Arc::new(Self::default())
	}

	pub fn calls(&self) -> usize {
		self.calls.load(Ordering::SeqCst)
	}
}

#[async_trait]
impl PlatformClient for ScriptedClient {
	async fn sync(&self, _request: &SyncRequest) -> Result<ClientReport, ClientError> {
		self.calls.fetch_add(1, Ordering::SeqCst);

		self.script
			.lock()
			.unwrap()
			.pop_front()
			.unwrap_or_else(|| Ok(ClientReport::success(1)))
	}
}

/// Hangs on one platform until released, succeeds right away on the others.
#[derive(Debug)]
pub struct BlockingClient {
	platform_id: PlatformId,
	pub started: Notify,
	pub release: Notify,
}

impl BlockingClient {
	pub fn new(platform_id: &str) -> Arc<Self> {
		Arc::new(Self {
			platform_id: PlatformId::from(platform_id),
			started: Notify::new(),
			release: Notify::new(),
		})
	}
}

#[async_trait]
impl PlatformClient for BlockingClient {
	async fn sync(&self, request: &SyncRequest) -> Result<ClientReport, ClientError> {
		if request.platform.id == self.platform_id {
			self.started.notify_one();
			self.release.notified().await;
		}

		Ok(ClientReport::success(10))
	}
}

#[derive(Debug)]
pub struct PanicClient;

#[async_trait]
impl PlatformClient for PanicClient {
	async fn sync(&self, request: &SyncRequest) -> Result<ClientReport, ClientError> {
		panic!("platform {} exploded", request.platform.id);
	}
}

pub struct Harness {
	pub orchestrator: SyncOrchestrator,
	pub p1: ProductId,
	pub amazon: PlatformId,
	pub shopify: PlatformId,
}

/// `amazon` and `shopify`, both active and enabled, and product `p1` targeting both of them.
pub async fn harness(
	client: Arc<dyn PlatformClient>,
	config: SyncConfig,
	amazon_rate_limit: i64,
) -> Harness {
	let registry = Arc::new(PlatformRegistry::new());
	let catalog = Arc::new(ProductCatalog::new(Arc::clone(&registry)));
	let log = Arc::new(AutomationLog::new());

	registry
		.register(
			PlatformConfig::new(
				"amazon",
				"Amazon",
				PlatformKind::Marketplace,
				CredentialRef::new("vault://amazon"),
			)
			.with_status(PlatformStatus::Active)
			.with_sync_enabled(true)
			.with_rate_limit(amazon_rate_limit)
			.with_commission_rate(15.0),
		)
		.await
		.unwrap();

	registry
		.register(
			PlatformConfig::new(
				"shopify",
				"Shopify",
				PlatformKind::Ecommerce,
				CredentialRef::new("vault://shopify"),
			)
			.with_status(PlatformStatus::Active)
			.with_sync_enabled(true),
		)
		.await
		.unwrap();

	catalog
		.add_product(
			NewProduct::new("p1", "Wireless Bluetooth Headphones", 299.99, "Electronics")
				.with_sku("WBH-001")
				.with_tags(["audio", "wireless"])
				.with_targets(["amazon", "shopify"]),
		)
		.await
		.unwrap();

	let orchestrator = SyncOrchestrator::new(registry, catalog, log, client, config).unwrap();

	Harness {
		orchestrator,
		p1: ProductId::from("p1"),
		amazon: PlatformId::from("amazon"),
		shopify: PlatformId::from("shopify"),
	}
}
