//! Products and their per platform synchronization targets.
//!
//! Each product owns one [`SyncTarget`] per platform it is published to. Targets move through
//! `pending -> syncing -> success | failed` and back to `syncing` on every new attempt, the
//! allowed moves are encoded in [`TargetStatus::can_transition_to`].

use std::{
	collections::{BTreeMap, HashMap},
	fmt,
	sync::Arc,
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, instrument, trace};
use uuid::Uuid;

use super::{
	config::RetryPolicy,
	error::{Error, Result},
	platform::{PlatformId, PlatformRegistry},
};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
	pub fn new(id: impl Into<String>) -> Self {
		Self(id.into())
	}

	#[must_use]
	pub fn as_str(&self) -> &str {
		&self.0
	}
}

impl fmt::Display for ProductId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(&self.0)
	}
}

impl From<&str> for ProductId {
	fn from(id: &str) -> Self {
		Self(id.to_string())
	}
}

impl From<String> for ProductId {
	fn from(id: String) -> Self {
		Self(id)
	}
}

/// Synchronization status of a single product on a single platform.
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
pub enum TargetStatus {
	Pending,
	Syncing,
	Success,
	Failed,
}

impl TargetStatus {
	/// Every settled status may start a new attempt, and an attempt may only settle.
	#[must_use]
	pub const fn can_transition_to(self, to: Self) -> bool {
		matches!(
			(self, to),
			(Self::Pending | Self::Success | Self::Failed, Self::Syncing)
				| (Self::Syncing, Self::Success | Self::Failed)
		)
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncTarget {
	pub platform_id: PlatformId,
	pub status: TargetStatus,
	pub last_attempt_at: Option<DateTime<Utc>>,
	pub last_success_at: Option<DateTime<Utc>>,
	pub consecutive_failures: u32,
	pub last_error: Option<String>,
	/// Orchestrator attempt holding the target in `syncing`. Only that attempt may settle it.
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub attempt_id: Option<Uuid>,
}

impl SyncTarget {
	fn new(platform_id: PlatformId) -> Self {
		Self {
			platform_id,
			status: TargetStatus::Pending,
			last_attempt_at: None,
			last_success_at: None,
			consecutive_failures: 0,
			last_error: None,
			attempt_id: None,
		}
	}

	fn ensure_unclaimed(&self, product_id: &ProductId) -> Result<()> {
		if self.attempt_id.is_some() {
			return Err(Error::SyncInProgress {
				product_id: product_id.clone(),
				platform_id: self.platform_id.clone(),
			});
		}

		Ok(())
	}

	fn transition(&mut self, to: TargetStatus, at: DateTime<Utc>) -> Result<()> {
		if !self.status.can_transition_to(to) {
			return Err(Error::InvalidTransition {
				from: self.status,
				to,
			});
		}

		match to {
			TargetStatus::Syncing => self.last_attempt_at = Some(at),
			TargetStatus::Success => {
				self.last_success_at = Some(at);
				self.consecutive_failures = 0;
				self.last_error = None;
			}
			TargetStatus::Failed => {
				self.consecutive_failures = self.consecutive_failures.saturating_add(1);
			}
			// Never a destination, see `can_transition_to`
			TargetStatus::Pending => {}
		}

		trace!(platform_id = %self.platform_id, from = %self.status, %to, "Sync target transition");
		self.status = to;

		Ok(())
	}

	/// When a caller side scheduler may retry this failed target, `None` if the target isn't failed
	/// or already hit the failure ceiling.
	#[must_use]
	pub fn next_retry_at(&self, policy: &RetryPolicy) -> Option<DateTime<Utc>> {
		if self.status != TargetStatus::Failed {
			return None;
		}

		let delay = policy.delay_for(self.consecutive_failures)?;

		self.last_attempt_at
			.map(|last_attempt_at| last_attempt_at + delay)
	}
}

/// Whether a product is listed at all, independent of how its platform copies are doing.
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
pub enum ListingStatus {
	PendingReview,
	Active,
	OutOfStock,
	Suspended,
}

impl ListingStatus {
	/// Listed status of an approved product holding `stock` units.
	#[must_use]
	pub const fn for_stock(stock: u32) -> Self {
		if stock == 0 {
			Self::OutOfStock
		} else {
			Self::Active
		}
	}

	#[must_use]
	pub const fn is_listed(self) -> bool {
		matches!(self, Self::Active | Self::OutOfStock)
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
	pub id: ProductId,
	pub name: String,
	pub description: String,
	pub sku: Option<String>,
	pub price: f64,
	pub category: String,
	pub tags: Vec<String>,
	pub stock: u32,
	pub owner: Option<String>,
	pub listing: ListingStatus,
	pub created_at: DateTime<Utc>,
	pub targets: BTreeMap<PlatformId, SyncTarget>,
}

impl Product {
	#[must_use]
	pub fn target(&self, platform_id: &PlatformId) -> Option<&SyncTarget> {
		self.targets.get(platform_id)
	}

	/// Status of the product as a whole, the "worst" status among its targets.
	#[must_use]
	pub fn overall_status(&self) -> Option<TargetStatus> {
		let statuses = self
			.targets
			.values()
			.map(|target| target.status)
			.collect::<Vec<_>>();

		[
			TargetStatus::Syncing,
			TargetStatus::Failed,
			TargetStatus::Pending,
			TargetStatus::Success,
		]
		.into_iter()
		.find(|status| statuses.contains(status))
	}

	fn matches(&self, filter: &ProductFilter) -> bool {
		if let Some(status) = filter.status {
			if self.overall_status() != Some(status) {
				return false;
			}
		}

		if filter.listing.is_some_and(|listing| self.listing != listing) {
			return false;
		}

		filter.text.as_ref().map_or(true, |text| {
			let text = text.to_lowercase();
			self.name.to_lowercase().contains(&text)
				|| self.category.to_lowercase().contains(&text)
				|| self
					.sku
					.as_ref()
					.is_some_and(|sku| sku.to_lowercase().contains(&text))
		})
	}
}

/// Input for [`ProductCatalog::add_product`].
#[derive(Debug, Clone)]
pub struct NewProduct {
	pub id: ProductId,
	pub name: String,
	pub price: f64,
	pub category: String,
	pub description: String,
	pub sku: Option<String>,
	pub tags: Vec<String>,
	pub stock: u32,
	pub owner: Option<String>,
	pub targets: Vec<PlatformId>,
}

impl NewProduct {
	pub fn new(
		id: impl Into<ProductId>,
		name: impl Into<String>,
		price: f64,
		category: impl Into<String>,
	) -> Self {
		Self {
			id: id.into(),
			name: name.into(),
			price,
			category: category.into(),
			description: String::new(),
			sku: None,
			tags: Vec::new(),
			stock: 0,
			owner: None,
			targets: Vec::new(),
		}
	}

	#[must_use]
	pub fn with_description(mut self, description: impl Into<String>) -> Self {
		self.description = description.into();
		self
	}

	#[must_use]
	pub fn with_sku(mut self, sku: impl Into<String>) -> Self {
		self.sku = Some(sku.into());
		self
	}

	#[must_use]
	pub fn with_tags(mut self, tags: impl IntoIterator<Item = impl Into<String>>) -> Self {
		self.tags = tags.into_iter().map(Into::into).collect();
		self
	}

	#[must_use]
	pub const fn with_stock(mut self, stock: u32) -> Self {
		self.stock = stock;
		self
	}

	#[must_use]
	pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
		self.owner = Some(owner.into());
		self
	}

	#[must_use]
	pub fn with_targets(mut self, targets: impl IntoIterator<Item = impl Into<PlatformId>>) -> Self {
		self.targets = targets.into_iter().map(Into::into).collect();
		self
	}

	fn validate(&self) -> Result<()> {
		if self.id.as_str().trim().is_empty() {
			return Err(Error::Validation("product id must not be empty".to_string()));
		}

		if self.name.trim().is_empty() {
			return Err(Error::Validation(format!(
				"product <id='{}'> must have a name",
				self.id
			)));
		}

		if !self.price.is_finite() || self.price < 0.0 {
			return Err(Error::Validation(format!(
				"product <id='{}'> price must be a non negative amount, got {}",
				self.id, self.price
			)));
		}

		Ok(())
	}
}

/// Search criteria of the products page: free text over name, category and sku, the overall sync
/// status and the listing status.
#[derive(Debug, Clone, Default)]
pub struct ProductFilter {
	pub text: Option<String>,
	pub status: Option<TargetStatus>,
	pub listing: Option<ListingStatus>,
}

impl ProductFilter {
	#[must_use]
	pub fn text(mut self, text: impl Into<String>) -> Self {
		self.text = Some(text.into());
		self
	}

	#[must_use]
	pub const fn status(mut self, status: TargetStatus) -> Self {
		self.status = Some(status);
		self
	}

	#[must_use]
	pub const fn listing(mut self, listing: ListingStatus) -> Self {
		self.listing = Some(listing);
		self
	}
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CatalogSummary {
	pub total_products: usize,
	pub total_targets: usize,
	pub targets_by_status: BTreeMap<TargetStatus, usize>,
	pub products_by_listing: BTreeMap<ListingStatus, usize>,
}

#[derive(Debug)]
pub struct ProductCatalog {
	registry: Arc<PlatformRegistry>,
	products: RwLock<HashMap<ProductId, Product>>,
}

impl ProductCatalog {
	#[must_use]
	pub fn new(registry: Arc<PlatformRegistry>) -> Self {
		Self {
			registry,
			products: RwLock::default(),
		}
	}

	#[instrument(skip(self, data), fields(product_id = %data.id), err)]
	pub async fn add_product(&self, data: NewProduct) -> Result<Product> {
		data.validate()?;

		let mut products = self.products.write().await;

		if products.contains_key(&data.id) {
			return Err(Error::DuplicateProduct(data.id));
		}

		let mut targets = BTreeMap::new();
		for platform_id in data.targets {
			if targets.contains_key(&platform_id) {
				continue;
			}

			if let Err(e) = self.registry.attach_target(&platform_id).await {
				self.registry.detach_targets(targets.keys()).await;
				return Err(e);
			}

			targets.insert(platform_id.clone(), SyncTarget::new(platform_id));
		}

		let product = Product {
			id: data.id,
			name: data.name,
			description: data.description,
			sku: data.sku,
			price: data.price,
			category: data.category,
			tags: data.tags,
			stock: data.stock,
			owner: data.owner,
			listing: ListingStatus::PendingReview,
			created_at: Utc::now(),
			targets,
		};

		debug!(targets_count = product.targets.len(), "Added product");

		products.insert(product.id.clone(), product.clone());

		Ok(product)
	}

	pub async fn get_product(&self, id: &ProductId) -> Result<Product> {
		self.products
			.read()
			.await
			.get(id)
			.cloned()
			.ok_or_else(|| Error::ProductNotFound(id.clone()))
	}

	/// Products matching `filter`, sorted by id.
	pub async fn search(&self, filter: &ProductFilter) -> Vec<Product> {
		let mut products = self
			.products
			.read()
			.await
			.values()
			.filter(|product| product.matches(filter))
			.cloned()
			.collect::<Vec<_>>();

		products.sort_by(|a, b| a.id.cmp(&b.id));

		products
	}

	/// Removes a product together with all its targets, refusing while any of them is syncing.
	#[instrument(skip(self), err)]
	pub async fn remove_product(&self, id: &ProductId) -> Result<Product> {
		let mut products = self.products.write().await;

		let product = products
			.get(id)
			.ok_or_else(|| Error::ProductNotFound(id.clone()))?;

		if let Some(target) = product
			.targets
			.values()
			.find(|target| target.status == TargetStatus::Syncing)
		{
			return Err(Error::SyncInProgress {
				product_id: id.clone(),
				platform_id: target.platform_id.clone(),
			});
		}

		let product = products
			.remove(id)
			.ok_or_else(|| Error::ProductNotFound(id.clone()))?;

		self.registry.detach_targets(product.targets.keys()).await;

		debug!("Removed product");

		Ok(product)
	}

	#[instrument(skip(self), err)]
	pub async fn add_target(
		&self,
		product_id: &ProductId,
		platform_id: &PlatformId,
	) -> Result<SyncTarget> {
		let mut products = self.products.write().await;

		let product = products
			.get_mut(product_id)
			.ok_or_else(|| Error::ProductNotFound(product_id.clone()))?;

		if product.targets.contains_key(platform_id) {
			return Err(Error::DuplicateTarget {
				product_id: product_id.clone(),
				platform_id: platform_id.clone(),
			});
		}

		self.registry.attach_target(platform_id).await?;

		let target = SyncTarget::new(platform_id.clone());
		product.targets.insert(platform_id.clone(), target.clone());

		Ok(target)
	}

	#[instrument(skip(self), err)]
	pub async fn remove_target(
		&self,
		product_id: &ProductId,
		platform_id: &PlatformId,
	) -> Result<SyncTarget> {
		let mut products = self.products.write().await;

		let product = products
			.get_mut(product_id)
			.ok_or_else(|| Error::ProductNotFound(product_id.clone()))?;

		match product.targets.get(platform_id) {
			None => {
				return Err(Error::TargetNotFound {
					product_id: product_id.clone(),
					platform_id: platform_id.clone(),
				})
			}
			Some(target) if target.status == TargetStatus::Syncing => {
				return Err(Error::SyncInProgress {
					product_id: product_id.clone(),
					platform_id: platform_id.clone(),
				})
			}
			Some(_) => {}
		}

		let target = product.targets.remove(platform_id).ok_or_else(|| {
			Error::TargetNotFound {
				product_id: product_id.clone(),
				platform_id: platform_id.clone(),
			}
		})?;

		self.registry.detach_targets([platform_id]).await;

		Ok(target)
	}

	pub async fn get_target(
		&self,
		product_id: &ProductId,
		platform_id: &PlatformId,
	) -> Result<SyncTarget> {
		let products = self.products.read().await;

		products
			.get(product_id)
			.ok_or_else(|| Error::ProductNotFound(product_id.clone()))?
			.targets
			.get(platform_id)
			.cloned()
			.ok_or_else(|| Error::TargetNotFound {
				product_id: product_id.clone(),
				platform_id: platform_id.clone(),
			})
	}

	/// Applies a status transition directly, bypassing the platform guards. Targets held by an
	/// orchestrator attempt are refused with [`Error::SyncInProgress`] until the attempt settles.
	#[instrument(skip(self), err)]
	pub async fn update_target_status(
		&self,
		product_id: &ProductId,
		platform_id: &PlatformId,
		new_status: TargetStatus,
	) -> Result<SyncTarget> {
		let mut products = self.products.write().await;
		let target = target_mut(&mut products, product_id, platform_id)?;

		target.ensure_unclaimed(product_id)?;

		if target.status == TargetStatus::Syncing && new_status == TargetStatus::Syncing {
			return Err(Error::SyncInProgress {
				product_id: product_id.clone(),
				platform_id: platform_id.clone(),
			});
		}

		target.transition(new_status, Utc::now())?;

		Ok(target.clone())
	}

	/// Manual override clearing the consecutive failures counter, so a target that hit the failure
	/// ceiling can be synced again.
	#[instrument(skip(self), err)]
	pub async fn reset_failures(
		&self,
		product_id: &ProductId,
		platform_id: &PlatformId,
	) -> Result<SyncTarget> {
		let mut products = self.products.write().await;
		let target = target_mut(&mut products, product_id, platform_id)?;

		if target.status == TargetStatus::Syncing {
			return Err(Error::SyncInProgress {
				product_id: product_id.clone(),
				platform_id: platform_id.clone(),
			});
		}

		target.consecutive_failures = 0;

		Ok(target.clone())
	}

	/// Failed targets whose backoff already elapsed at `now`, sorted by product then platform.
	pub async fn retry_candidates(
		&self,
		policy: &RetryPolicy,
		now: DateTime<Utc>,
	) -> Vec<(ProductId, PlatformId)> {
		let mut candidates = self
			.products
			.read()
			.await
			.values()
			.flat_map(|product| {
				product
					.targets
					.values()
					.filter(|target| {
						target
							.next_retry_at(policy)
							.is_some_and(|retry_at| retry_at <= now)
					})
					.map(|target| (product.id.clone(), target.platform_id.clone()))
			})
			.collect::<Vec<_>>();

		candidates.sort();

		candidates
	}

	pub async fn summary(&self) -> CatalogSummary {
		let products = self.products.read().await;

		let mut targets_by_status = <TargetStatus as strum::IntoEnumIterator>::iter()
			.map(|status| (status, 0))
			.collect::<BTreeMap<_, _>>();

		let mut products_by_listing = <ListingStatus as strum::IntoEnumIterator>::iter()
			.map(|listing| (listing, 0))
			.collect::<BTreeMap<_, _>>();
		for product in products.values() {
			*products_by_listing.entry(product.listing).or_default() += 1;
		}

		let mut total_targets = 0;
		for target in products.values().flat_map(|product| product.targets.values()) {
			total_targets += 1;
			*targets_by_status.entry(target.status).or_default() += 1;
		}

		CatalogSummary {
			total_products: products.len(),
			total_targets,
			targets_by_status,
			products_by_listing,
		}
	}

	/// Approves a product under review, or lists a suspended one again.
	#[instrument(skip(self), err)]
	pub async fn approve_product(&self, id: &ProductId) -> Result<Product> {
		self.update_product(id, |product| {
			if !product.listing.is_listed() {
				product.listing = ListingStatus::for_stock(product.stock);
			}
		})
		.await
	}

	#[instrument(skip(self), err)]
	pub async fn suspend_product(&self, id: &ProductId) -> Result<Product> {
		self.update_product(id, |product| product.listing = ListingStatus::Suspended)
			.await
	}

	/// Sets the units in stock, moving listed products between `active` and `out_of_stock`.
	#[instrument(skip(self), err)]
	pub async fn set_stock(&self, id: &ProductId, stock: u32) -> Result<Product> {
		self.update_product(id, |product| {
			product.stock = stock;
			if product.listing.is_listed() {
				product.listing = ListingStatus::for_stock(stock);
			}
		})
		.await
	}

	async fn update_product(
		&self,
		id: &ProductId,
		update: impl FnOnce(&mut Product),
	) -> Result<Product> {
		let mut products = self.products.write().await;

		let product = products
			.get_mut(id)
			.ok_or_else(|| Error::ProductNotFound(id.clone()))?;

		update(product);
		trace!(listing = %product.listing, stock = product.stock, "Updated product");

		Ok(product.clone())
	}

	pub(crate) const fn registry(&self) -> &Arc<PlatformRegistry> {
		&self.registry
	}

	/// Moves a target into `syncing` if it isn't already there and the failure ceiling allows it.
	/// Returns a snapshot of the product for the platform client.
	pub(crate) async fn begin_sync(
		&self,
		attempt_id: Uuid,
		product_id: &ProductId,
		platform_id: &PlatformId,
		max_consecutive_failures: Option<u32>,
		at: DateTime<Utc>,
	) -> Result<(Product, SyncTarget)> {
		let mut products = self.products.write().await;
		let target = target_mut(&mut products, product_id, platform_id)?;

		match target.status {
			TargetStatus::Syncing => {
				return Err(Error::SyncInProgress {
					product_id: product_id.clone(),
					platform_id: platform_id.clone(),
				})
			}
			TargetStatus::Failed
				if max_consecutive_failures
					.is_some_and(|ceiling| target.consecutive_failures >= ceiling) =>
			{
				return Err(Error::FailureCeilingReached {
					product_id: product_id.clone(),
					platform_id: platform_id.clone(),
					failures: target.consecutive_failures,
				})
			}
			_ => {}
		}

		target.transition(TargetStatus::Syncing, at)?;
		target.attempt_id = Some(attempt_id);
		let target = target.clone();

		let product = products
			.get(product_id)
			.cloned()
			.ok_or_else(|| Error::ProductNotFound(product_id.clone()))?;

		Ok((product, target))
	}

	/// Settles a target held by `attempt_id` into `success` or `failed`.
	pub(crate) async fn finish_sync(
		&self,
		attempt_id: Uuid,
		product_id: &ProductId,
		platform_id: &PlatformId,
		status: TargetStatus,
		error: Option<String>,
		at: DateTime<Utc>,
	) -> Result<SyncTarget> {
		let mut products = self.products.write().await;
		let target = target_mut(&mut products, product_id, platform_id)?;

		if target.attempt_id != Some(attempt_id) {
			return Err(Error::InvalidTransition {
				from: target.status,
				to: status,
			});
		}

		target.transition(status, at)?;
		target.attempt_id = None;
		if error.is_some() {
			target.last_error = error;
		}

		Ok(target.clone())
	}
}

fn target_mut<'products>(
	products: &'products mut HashMap<ProductId, Product>,
	product_id: &ProductId,
	platform_id: &PlatformId,
) -> Result<&'products mut SyncTarget> {
	products
		.get_mut(product_id)
		.ok_or_else(|| Error::ProductNotFound(product_id.clone()))?
		.targets
		.get_mut(platform_id)
		.ok_or_else(|| Error::TargetNotFound {
			product_id: product_id.clone(),
			platform_id: platform_id.clone(),
		})
}
