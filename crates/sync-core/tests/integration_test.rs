use storesync_core::{
	AutomationLog, ClientError, ClientReport, Error, ErrorKind, LogFilter, LogStatus, NewProduct,
	PlatformId, PlatformRegistry, PlatformStatus, ProductCatalog, ProductId, SyncConfig, SyncEvent,
	SyncOrchestrator, TargetStatus, UnavailableReason,
};

use std::{sync::Arc, time::Duration};

use futures_concurrency::future::Join;
use pretty_assertions::assert_eq;
use tokio::{spawn, time::timeout};
use tracing_test::traced_test;

mod common;

use common::{harness, BlockingClient, PanicClient, ScriptedClient};

#[tokio::test]
#[traced_test]
async fn rate_limit_of_one_throttles_second_sync() {
	let client = ScriptedClient::always_ok();
	let h = harness(client.clone(), SyncConfig::default(), 1).await;
	let orchestrator = &h.orchestrator;

	let pending = orchestrator.catalog().get_target(&h.p1, &h.amazon).await.unwrap();
	assert_eq!(pending.status, TargetStatus::Pending);

	let outcome = orchestrator.request_sync(&h.p1, &h.amazon).await.unwrap();
	assert_eq!(outcome.status, TargetStatus::Success);
	assert_eq!(outcome.log_status, LogStatus::Success);
	assert_eq!(outcome.items_processed, 1);

	let target = orchestrator.catalog().get_target(&h.p1, &h.amazon).await.unwrap();
	assert_eq!(target.status, TargetStatus::Success);
	assert!(target.last_success_at.is_some());
	assert_eq!(target, outcome.target);

	let successes = orchestrator
		.log()
		.query(LogFilter::default().status(LogStatus::Success))
		.await
		.collect::<Vec<_>>();
	assert_eq!(successes.len(), 1);
	assert_eq!(successes[0].platform_id, h.amazon);
	assert_eq!(successes[0].product_id.as_ref(), Some(&h.p1));
	assert_eq!(successes[0].actor_id, "system");
	assert!(successes[0].duration_ms.is_some());
	let entries_after_first = orchestrator.log().len().await;

	let second = orchestrator.request_sync(&h.p1, &h.amazon).await;
	assert!(matches!(
		second,
		Err(Error::Throttled { ref platform_id, limit: 1 }) if platform_id == &h.amazon
	));
	assert!(second.unwrap_err().is_retryable());

	assert_eq!(
		orchestrator.catalog().get_target(&h.p1, &h.amazon).await.unwrap(),
		target
	);
	assert_eq!(orchestrator.log().len().await, entries_after_first);
	assert_eq!(client.calls(), 1);

	// Other platforms keep their own window
	let shopify = orchestrator.request_sync(&h.p1, &h.shopify).await.unwrap();
	assert_eq!(shopify.status, TargetStatus::Success);
}

#[tokio::test]
#[traced_test]
async fn rate_window_frees_up_over_time() {
	let config = SyncConfig {
		rate_window_secs: 1,
		..SyncConfig::default()
	};
	let h = harness(ScriptedClient::always_ok(), config, 1).await;

	h.orchestrator.request_sync(&h.p1, &h.amazon).await.unwrap();
	assert!(matches!(
		h.orchestrator.request_sync(&h.p1, &h.amazon).await,
		Err(Error::Throttled { .. })
	));

	tokio::time::sleep(Duration::from_millis(1100)).await;

	let outcome = h.orchestrator.request_sync(&h.p1, &h.amazon).await.unwrap();
	assert_eq!(outcome.status, TargetStatus::Success);
}

#[tokio::test]
#[traced_test]
async fn failure_ceiling_requires_manual_reset() {
	let client = ScriptedClient::new([
		Err(ClientError::Api("500 Internal Server Error".to_string())),
		Err(ClientError::Network("connection reset".to_string())),
		Ok(ClientReport::failure(0, 3, "invalid product category")),
	]);
	let h = harness(client.clone(), SyncConfig::default(), 1000).await;
	let orchestrator = &h.orchestrator;

	for expected_failures in 1..=3 {
		let outcome = orchestrator.request_sync(&h.p1, &h.amazon).await.unwrap();
		assert_eq!(outcome.status, TargetStatus::Failed);
		assert_eq!(outcome.log_status, LogStatus::Error);
		assert_eq!(outcome.target.consecutive_failures, expected_failures);
	}

	let target = orchestrator.catalog().get_target(&h.p1, &h.amazon).await.unwrap();
	assert_eq!(target.status, TargetStatus::Failed);
	assert_eq!(target.last_error.as_deref(), Some("invalid product category"));

	let entries = orchestrator.log().len().await;
	let refused = orchestrator.request_sync(&h.p1, &h.amazon).await.unwrap_err();
	assert!(matches!(
		refused,
		Error::FailureCeilingReached { failures: 3, .. }
	));
	assert_eq!(refused.kind(), ErrorKind::Policy);
	assert!(!refused.is_retryable());
	assert_eq!(orchestrator.log().len().await, entries);
	assert_eq!(client.calls(), 3);

	// Failed targets past the ceiling are never offered for retry
	assert!(orchestrator.retry_candidates().await.is_empty());

	let reset = orchestrator.reset_failures(&h.p1, &h.amazon).await.unwrap();
	assert_eq!(reset.consecutive_failures, 0);
	assert_eq!(reset.status, TargetStatus::Failed);

	let outcome = orchestrator.request_sync(&h.p1, &h.amazon).await.unwrap();
	assert_eq!(outcome.status, TargetStatus::Success);
	assert_eq!(outcome.target.consecutive_failures, 0);
	assert_eq!(outcome.target.last_error, None);
}

#[tokio::test]
#[traced_test]
async fn unknown_ids_are_refused_without_logging() {
	let h = harness(ScriptedClient::always_ok(), SyncConfig::default(), 1000).await;

	let unknown_product = h
		.orchestrator
		.request_sync(&ProductId::from("nope"), &h.amazon)
		.await
		.unwrap_err();
	assert!(matches!(unknown_product, Error::ProductNotFound(_)));
	assert_eq!(unknown_product.kind(), ErrorKind::NotFound);

	let unknown_target = h
		.orchestrator
		.request_sync(&h.p1, &PlatformId::from("etsy"))
		.await;
	assert!(matches!(unknown_target, Err(Error::TargetNotFound { .. })));

	assert!(matches!(
		h.orchestrator
			.request_sync_all(&ProductId::from("nope"))
			.await,
		Err(Error::ProductNotFound(_))
	));
	assert!(matches!(
		h.orchestrator
			.cancel_sync(&ProductId::from("nope"), &h.amazon)
			.await,
		Err(Error::ProductNotFound(_))
	));

	assert!(h.orchestrator.log().is_empty().await);
}

#[tokio::test]
#[traced_test]
async fn platform_guards_leave_target_untouched() {
	let h = harness(ScriptedClient::always_ok(), SyncConfig::default(), 1000).await;
	let registry = h.orchestrator.registry();

	registry
		.set_status(&h.amazon, PlatformStatus::Maintenance)
		.await
		.unwrap();
	let err = h.orchestrator.request_sync(&h.p1, &h.amazon).await.unwrap_err();
	assert!(matches!(
		err,
		Error::PlatformUnavailable {
			reason: UnavailableReason::Status(PlatformStatus::Maintenance),
			..
		}
	));
	assert_eq!(err.kind(), ErrorKind::PlatformUnavailable);

	registry
		.set_status(&h.amazon, PlatformStatus::Active)
		.await
		.unwrap();
	registry.set_sync_enabled(&h.amazon, false).await.unwrap();
	assert!(matches!(
		h.orchestrator.request_sync(&h.p1, &h.amazon).await,
		Err(Error::PlatformUnavailable {
			reason: UnavailableReason::SyncDisabled,
			..
		})
	));

	registry.set_sync_enabled(&h.amazon, true).await.unwrap();
	registry.set_rate_limit(&h.amazon, 0).await.unwrap();
	assert!(matches!(
		h.orchestrator.request_sync(&h.p1, &h.amazon).await,
		Err(Error::Throttled { limit: 0, .. })
	));

	let target = h
		.orchestrator
		.catalog()
		.get_target(&h.p1, &h.amazon)
		.await
		.unwrap();
	assert_eq!(target.status, TargetStatus::Pending);
	assert_eq!(target.last_attempt_at, None);
	assert!(h.orchestrator.log().is_empty().await);
}

#[tokio::test]
#[traced_test]
async fn one_sync_per_target_while_others_proceed() {
	let client = BlockingClient::new("amazon");
	let h = harness(client.clone(), SyncConfig::default(), 1000).await;

	let running = spawn({
		let orchestrator = h.orchestrator.clone();
		let (p1, amazon) = (h.p1.clone(), h.amazon.clone());
		async move { orchestrator.request_sync(&p1, &amazon).await }
	});

	client.started.notified().await;

	let catalog = h.orchestrator.catalog();
	assert_eq!(
		catalog.get_target(&h.p1, &h.amazon).await.unwrap().status,
		TargetStatus::Syncing
	);

	let double = h.orchestrator.request_sync(&h.p1, &h.amazon).await.unwrap_err();
	assert!(matches!(double, Error::SyncInProgress { .. }));
	assert_eq!(double.kind(), ErrorKind::Concurrency);

	assert!(matches!(
		catalog.remove_target(&h.p1, &h.amazon).await,
		Err(Error::SyncInProgress { .. })
	));
	assert!(matches!(
		catalog.remove_product(&h.p1).await,
		Err(Error::SyncInProgress { .. })
	));
	assert!(matches!(
		h.orchestrator.reset_failures(&h.p1, &h.amazon).await,
		Err(Error::SyncInProgress { .. })
	));

	// Same product, other platform
	let shopify = h.orchestrator.request_sync(&h.p1, &h.shopify).await.unwrap();
	assert_eq!(shopify.status, TargetStatus::Success);

	let running_entries = h
		.orchestrator
		.log()
		.query(LogFilter::default().status(LogStatus::Running))
		.await
		.count();
	assert_eq!(running_entries, 2);

	client.release.notify_one();

	let outcome = running.await.unwrap().unwrap();
	assert_eq!(outcome.status, TargetStatus::Success);
	assert_eq!(outcome.items_processed, 10);
	assert_eq!(
		catalog.get_target(&h.p1, &h.amazon).await.unwrap().status,
		TargetStatus::Success
	);

	let platform = h.orchestrator.registry().get(&h.amazon).await.unwrap();
	assert!(platform.last_sync_at.is_some());
}

#[tokio::test]
#[traced_test]
async fn syncing_target_cannot_be_settled_from_outside() {
	let client = BlockingClient::new("amazon");
	let h = harness(client.clone(), SyncConfig::default(), 1000).await;
	let catalog = h.orchestrator.catalog();

	let running = spawn({
		let orchestrator = h.orchestrator.clone();
		let (p1, amazon) = (h.p1.clone(), h.amazon.clone());
		async move { orchestrator.request_sync(&p1, &amazon).await }
	});

	client.started.notified().await;

	for status in [TargetStatus::Success, TargetStatus::Failed] {
		assert!(matches!(
			catalog.update_target_status(&h.p1, &h.amazon, status).await,
			Err(Error::SyncInProgress { .. })
		));
	}
	assert!(matches!(
		h.orchestrator.request_sync(&h.p1, &h.amazon).await,
		Err(Error::SyncInProgress { .. })
	));

	client.release.notify_one();

	let outcome = running.await.unwrap().unwrap();
	assert_eq!(outcome.status, TargetStatus::Success);
	assert_eq!(outcome.target.attempt_id, None);

	let statuses = h
		.orchestrator
		.log()
		.query(LogFilter::default().attempt(outcome.attempt_id))
		.await
		.map(|entry| entry.status)
		.collect::<Vec<_>>();
	assert_eq!(statuses, vec![LogStatus::Success, LogStatus::Running]);
	assert_eq!(h.orchestrator.log().len().await, 2);

	// Settled targets accept direct transitions again
	catalog
		.update_target_status(&h.p1, &h.amazon, TargetStatus::Syncing)
		.await
		.unwrap();
	catalog
		.update_target_status(&h.p1, &h.amazon, TargetStatus::Failed)
		.await
		.unwrap();
}

#[tokio::test]
#[traced_test]
async fn concurrent_requests_share_the_rate_window() {
	let client = BlockingClient::new("amazon");
	let h = harness(client.clone(), SyncConfig::default(), 1).await;
	let p2 = ProductId::from("p2");

	h.orchestrator
		.catalog()
		.add_product(
			NewProduct::new("p2", "Organic Cotton T-Shirt", 24.99, "Clothing").with_targets(["amazon"]),
		)
		.await
		.unwrap();

	let requests = [h.p1.clone(), p2.clone()].map(|product_id| {
		let orchestrator = h.orchestrator.clone();
		let amazon = h.amazon.clone();
		spawn(async move { orchestrator.request_sync(&product_id, &amazon).await })
	});

	client.started.notified().await;
	client.release.notify_one();

	let [first, second] = requests;
	let (first, second) = (first, second).join().await;
	let results = [first.unwrap(), second.unwrap()];

	let admitted = results.iter().filter(|res| res.is_ok()).count();
	let throttled = results
		.iter()
		.filter(|res| matches!(res, Err(Error::Throttled { limit: 1, .. })))
		.count();
	assert_eq!((admitted, throttled), (1, 1));

	let catalog = h.orchestrator.catalog();
	let mut statuses = vec![
		catalog.get_target(&h.p1, &h.amazon).await.unwrap().status,
		catalog.get_target(&p2, &h.amazon).await.unwrap().status,
	];
	statuses.sort();
	assert_eq!(statuses, vec![TargetStatus::Pending, TargetStatus::Success]);
}

#[tokio::test]
#[traced_test]
async fn orchestrator_rejects_foreign_registry() {
	let catalog = Arc::new(ProductCatalog::new(Arc::new(PlatformRegistry::new())));

	let err = SyncOrchestrator::new(
		Arc::new(PlatformRegistry::new()),
		catalog,
		Arc::new(AutomationLog::new()),
		ScriptedClient::always_ok(),
		SyncConfig::default(),
	)
	.unwrap_err();

	assert!(matches!(err, Error::Validation(_)));
}

#[tokio::test]
#[traced_test]
async fn cancel_ends_attempt_failed() {
	let client = BlockingClient::new("amazon");
	let h = harness(client.clone(), SyncConfig::default(), 1000).await;

	assert!(!h.orchestrator.cancel_sync(&h.p1, &h.amazon).await.unwrap());

	let running = spawn({
		let orchestrator = h.orchestrator.clone();
		let (p1, amazon) = (h.p1.clone(), h.amazon.clone());
		async move { orchestrator.request_sync_by("admin", &p1, &amazon).await }
	});

	client.started.notified().await;
	assert!(h.orchestrator.cancel_sync(&h.p1, &h.amazon).await.unwrap());

	let outcome = running.await.unwrap().unwrap();
	assert_eq!(outcome.status, TargetStatus::Failed);
	assert_eq!(outcome.log_status, LogStatus::Error);
	assert!(outcome.details.contains("cancelled"));
	assert_eq!(outcome.target.consecutive_failures, 1);

	let entries = h
		.orchestrator
		.log()
		.query(LogFilter::default().attempt(outcome.attempt_id))
		.await
		.collect::<Vec<_>>();
	assert_eq!(entries.len(), 2);
	assert_eq!(entries[0].status, LogStatus::Error);
	assert_eq!(entries[0].actor_id, "admin");
	assert_eq!(entries[1].status, LogStatus::Running);

	assert!(!h.orchestrator.cancel_sync(&h.p1, &h.amazon).await.unwrap());
}

#[tokio::test]
#[traced_test]
async fn client_deadline_is_a_failure() {
	let config = SyncConfig {
		client_timeout_ms: Some(50),
		..SyncConfig::default()
	};
	let h = harness(BlockingClient::new("amazon"), config, 1000).await;

	let outcome = h.orchestrator.request_sync(&h.p1, &h.amazon).await.unwrap();
	assert_eq!(outcome.status, TargetStatus::Failed);
	assert!(outcome.details.contains("timed out after 50ms"));
	assert_eq!(
		outcome.target.last_error.as_deref(),
		Some(outcome.details.as_str())
	);
}

#[tokio::test]
#[traced_test]
async fn client_panic_is_contained() {
	let h = harness(Arc::new(PanicClient), SyncConfig::default(), 1000).await;

	let outcome = h.orchestrator.request_sync(&h.p1, &h.amazon).await.unwrap();
	assert_eq!(outcome.status, TargetStatus::Failed);
	assert_eq!(outcome.log_status, LogStatus::Error);
	assert!(outcome.details.contains("platform amazon exploded"));

	let target = h
		.orchestrator
		.catalog()
		.get_target(&h.p1, &h.amazon)
		.await
		.unwrap();
	assert_eq!(target.status, TargetStatus::Failed);
}

#[tokio::test]
#[traced_test]
async fn dropped_request_still_settles() {
	let h = harness(BlockingClient::new("amazon"), SyncConfig::default(), 1000).await;
	let mut events = h.orchestrator.subscribe();

	assert!(timeout(
		Duration::from_millis(50),
		h.orchestrator.request_sync(&h.p1, &h.amazon)
	)
	.await
	.is_err());

	loop {
		match events.recv().await.unwrap() {
			SyncEvent::Finished {
				status, log_status, ..
			} => {
				assert_eq!(status, TargetStatus::Failed);
				assert_eq!(log_status, LogStatus::Error);
				break;
			}
			SyncEvent::Started { .. } => {}
		}
	}

	let target = h
		.orchestrator
		.catalog()
		.get_target(&h.p1, &h.amazon)
		.await
		.unwrap();
	assert_eq!(target.status, TargetStatus::Failed);

	let last = h
		.orchestrator
		.log()
		.query(LogFilter::default())
		.await
		.next()
		.unwrap();
	assert_eq!(last.status, LogStatus::Error);
	assert!(last.details.contains("cancelled"));
}

#[tokio::test]
#[traced_test]
async fn partial_success_logs_warning() {
	let client = ScriptedClient::new([Ok(ClientReport::failure(
		98,
		2,
		"2 variants rejected: missing size chart",
	))]);
	let h = harness(client, SyncConfig::default(), 1000).await;

	let outcome = h.orchestrator.request_sync(&h.p1, &h.amazon).await.unwrap();
	assert_eq!(outcome.status, TargetStatus::Failed);
	assert_eq!(outcome.log_status, LogStatus::Warning);
	assert_eq!(outcome.error_count, 2);

	let ok = h.orchestrator.request_sync(&h.p1, &h.shopify).await.unwrap();
	assert_eq!(ok.status, TargetStatus::Success);

	let log = h.orchestrator.log();
	let stats = log.stats(None).await;
	assert_eq!(stats.total, log.query(LogFilter::default()).await.count());
	assert_eq!(stats.total, 4);
	assert_eq!(stats.by_status[&LogStatus::Warning], 1);
	assert_eq!(stats.by_status[&LogStatus::Success], 1);
	assert_eq!(stats.by_status[&LogStatus::Running], 2);
	assert!((0.0..=1.0).contains(&stats.success_rate));
	assert!((stats.success_rate - 0.25).abs() < f64::EPSILON);

	let amazon_stats = log
		.stats(Some(&LogFilter::default().platform("amazon")))
		.await;
	assert_eq!(amazon_stats.total, 2);
	assert!(amazon_stats.success_rate.abs() < f64::EPSILON);
}

#[tokio::test]
#[traced_test]
async fn sync_all_and_events() {
	let h = harness(ScriptedClient::always_ok(), SyncConfig::default(), 1000).await;
	let mut events = h.orchestrator.subscribe();

	let results = h.orchestrator.request_sync_all(&h.p1).await.unwrap();
	assert_eq!(
		results
			.iter()
			.map(|(platform_id, res)| (platform_id.clone(), res.as_ref().unwrap().status))
			.collect::<Vec<_>>(),
		vec![
			(h.amazon.clone(), TargetStatus::Success),
			(h.shopify.clone(), TargetStatus::Success),
		]
	);

	let mut started = 0;
	let mut finished = 0;
	while let Ok(event) = events.try_recv() {
		match event {
			SyncEvent::Started { actor_id, .. } => {
				assert_eq!(actor_id, "system");
				started += 1;
			}
			SyncEvent::Finished { status, .. } => {
				assert_eq!(status, TargetStatus::Success);
				finished += 1;
			}
		}
	}
	assert_eq!((started, finished), (2, 2));

	let product = h.orchestrator.catalog().get_product(&h.p1).await.unwrap();
	assert_eq!(product.overall_status(), Some(TargetStatus::Success));
}

#[tokio::test]
#[traced_test]
async fn platform_removal_waits_for_detached_targets() {
	let h = harness(ScriptedClient::always_ok(), SyncConfig::default(), 1000).await;
	let registry = h.orchestrator.registry();
	let catalog = h.orchestrator.catalog();

	let err = registry.remove(&h.amazon).await.unwrap_err();
	assert!(matches!(err, Error::PlatformInUse { targets: 1, .. }));
	assert_eq!(err.kind(), ErrorKind::Conflict);

	catalog.remove_target(&h.p1, &h.amazon).await.unwrap();
	let removed = registry.remove(&h.amazon).await.unwrap();
	assert_eq!(removed.id, h.amazon);

	assert!(matches!(
		catalog.add_target(&h.p1, &h.amazon).await,
		Err(Error::PlatformNotFound(_))
	));
	assert_eq!(registry.summary().await.total, 1);
}
