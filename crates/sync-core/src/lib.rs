//!
//! # Storesync Core
//!
//! State model behind a multi platform product sync dashboard: which marketplaces and storefronts a
//! product is published to, how each of those copies is doing, and a ledger of every automation
//! attempt made against them.
//!
//! - [`PlatformRegistry`] holds the connected platforms and the guards that gate a sync attempt
//!   (operational status, sync switch, hourly rate limit);
//! - [`ProductCatalog`] holds the products and, for each one, a [`SyncTarget`] per platform;
//! - [`SyncOrchestrator`] admits sync attempts and runs them through your [`PlatformClient`];
//! - [`AutomationLog`] records every attempt and derives statistics from the entries;
//!
//! ## Basic example
//!
//! ```
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use storesync_core::{
//! 	AutomationLog, ClientError, ClientReport, CredentialRef, NewProduct, PlatformClient,
//! 	PlatformConfig, PlatformKind, PlatformRegistry, PlatformStatus, ProductCatalog, SyncConfig,
//! 	SyncOrchestrator, SyncRequest, TargetStatus,
//! };
//!
//! struct AlwaysOk;
//!
//! #[async_trait]
//! impl PlatformClient for AlwaysOk {
//! 	async fn sync(&self, _request: &SyncRequest) -> Result<ClientReport, ClientError> {
//! 		Ok(ClientReport::success(1))
//! 	}
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), storesync_core::Error> {
//! 	let registry = Arc::new(PlatformRegistry::new());
//! 	let catalog = Arc::new(ProductCatalog::new(Arc::clone(&registry)));
//! 	let log = Arc::new(AutomationLog::new());
//!
//! 	registry
//! 		.register(
//! 			PlatformConfig::new(
//! 				"amazon",
//! 				"Amazon",
//! 				PlatformKind::Marketplace,
//! 				CredentialRef::new("vault://amazon"),
//! 			)
//! 			.with_status(PlatformStatus::Active)
//! 			.with_sync_enabled(true),
//! 		)
//! 		.await?;
//!
//! 	catalog
//! 		.add_product(
//! 			NewProduct::new("p1", "Wireless Headphones", 299.99, "Electronics")
//! 				.with_targets(["amazon"]),
//! 		)
//! 		.await?;
//!
//! 	let orchestrator = SyncOrchestrator::new(
//! 		registry,
//! 		catalog,
//! 		log,
//! 		Arc::new(AlwaysOk),
//! 		SyncConfig::default(),
//! 	)?;
//!
//! 	let outcome = orchestrator
//! 		.request_sync(&"p1".into(), &"amazon".into())
//! 		.await?;
//!
//! 	assert_eq!(outcome.status, TargetStatus::Success);
//! 	assert_eq!(orchestrator.log().len().await, 2);
//!
//! 	Ok(())
//! }
//! ```

#![warn(
	clippy::all,
	clippy::pedantic,
	clippy::correctness,
	clippy::perf,
	clippy::style,
	clippy::suspicious,
	clippy::complexity,
	clippy::nursery,
	clippy::unwrap_used,
	unused_qualifications,
	rust_2018_idioms,
	trivial_casts,
	trivial_numeric_casts,
	unused_allocation,
	clippy::unnecessary_cast,
	clippy::cast_lossless,
	clippy::cast_possible_truncation,
	clippy::cast_possible_wrap,
	clippy::cast_precision_loss,
	clippy::cast_sign_loss,
	clippy::dbg_macro,
	clippy::deprecated_cfg_attr,
	clippy::separated_literal_suffix,
	deprecated
)]
#![forbid(deprecated_in_future)]
#![allow(clippy::missing_errors_doc, clippy::module_name_repetitions)]

mod catalog;
mod config;
mod error;
mod log;
mod orchestrator;
mod platform;

pub use catalog::{
	CatalogSummary, ListingStatus, NewProduct, Product, ProductCatalog, ProductFilter, ProductId,
	SyncTarget, TargetStatus,
};
pub use config::{Migrate, RetryPolicy, SyncConfig};
pub use error::{Error, ErrorKind, FileIOError, Result, UnavailableReason};
pub use log::{
	AutomationLog, AutomationType, LogEntry, LogFilter, LogQuery, LogStats, LogStatus, NewLogEntry,
};
pub use orchestrator::{
	ClientError, ClientReport, PlatformClient, SyncEvent, SyncOrchestrator, SyncOutcome,
	SyncRequest,
};
pub use platform::{
	CredentialRef, Platform, PlatformConfig, PlatformId, PlatformKind, PlatformStatus,
	PlatformRegistry, RegistrySummary,
};
