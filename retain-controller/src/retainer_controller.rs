use crate::{
    Configuration,
    error_backoff::ErrorBackoff,
    errors::ControllerError,
    fetcher::fetch_target,
    modes::{self, RetainAction},
    namespace_index::NamespaceIndex,
    predicates::{GenerationPredicate, deleted},
    prometheus_exporter::metric_name,
    resolver::ResourceResolver,
    retainer_modifications::RetainerModifications,
};

use futures::{StreamExt, TryStreamExt, future};
use k8s_openapi::{
    api::core::v1::Namespace,
    chrono::{DateTime, Utc},
};
use kube::{Api, Client, ResourceExt, core::PartialObjectMeta};
use kube_runtime::{
    WatchStreamExt,
    controller::{self, Action, Controller},
    metadata_watcher,
    reflector::{self, ObjectRef},
    watcher,
};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Histogram, Meter},
};
use retain_controller_apis::Retainer;
use std::{future::Future, sync::Arc, time::Instant};
use tokio::time::{Duration, sleep, timeout};

const RETAINER_CONTROLLER: &'static str = "retainer_controller";

/// Reconciles [`Retainer`] objects: follows their target object or TTL and
/// deletes them once retention ends.
pub(crate) struct RetainerController {
    pub configuration: Configuration,
    resolver: ResourceResolver,
    backoff: Arc<ErrorBackoff>,
    reconcile_count: Counter<u64>,
    reconcile_duration: Histogram<u64>,
    reconcile_errors: Counter<u64>,
    retainers_deleted: Counter<u64>,
}

impl RetainerController {
    pub fn new(configuration: Configuration) -> Self {
        let meter: Meter = global::meter(RETAINER_CONTROLLER);
        let reconcile_count = meter
            .u64_counter(metric_name("reconcile_count"))
            .with_description("Count of Retainer reconcile invocations")
            .build();
        let reconcile_duration = meter
            .u64_histogram(metric_name("reconcile_duration_ms"))
            .with_description("Reconcile duration of Retainer objects in milliseconds")
            .with_unit("ms")
            .build();
        let reconcile_errors = meter
            .u64_counter(metric_name("reconcile_errors"))
            .with_description("Count of reconcile invocation errors for Retainer resources")
            .build();
        let retainers_deleted = meter
            .u64_counter(metric_name("retainers_deleted"))
            .with_description("Count of Retainers deleted after their retention ended")
            .build();
        Self {
            resolver: ResourceResolver::new(configuration.client.clone()),
            backoff: Arc::new(ErrorBackoff::new(
                configuration.error_backoff_base,
                configuration.error_backoff_max,
            )),
            configuration,
            reconcile_count,
            reconcile_duration,
            reconcile_errors,
            retainers_deleted,
        }
    }

    fn client(&self) -> Client {
        self.configuration.client.clone()
    }

    /// One pass over the Retainer named `name` as of `now`.
    ///
    /// Returns when to look at the Retainer again, `None` to wait for the
    /// next change.
    async fn reconcile_at(
        &self,
        name: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Duration>, ControllerError> {
        let api: Api<Retainer> = Api::all(self.client());
        let Some(retainer) = api.get_opt(name).await? else {
            debug!("Retainer {} is gone", name);
            return Ok(None);
        };
        if retainer.is_deleted() {
            debug!("Retainer {} is being deleted", name);
            return Ok(None);
        }
        let mode = retainer.spec.mode()?;
        let target = match modes::target_ref(&retainer, mode) {
            Some(target) => {
                let resolved = self.resolver.resolve(&target.gvk).await?;
                Some(
                    fetch_target(
                        self.client(),
                        &resolved,
                        target.reference.namespace.as_str(),
                        target.reference.name.as_str(),
                    )
                    .await,
                )
            }
            None => None,
        };
        let decision = modes::decide(&retainer, mode, target.as_ref(), now);
        let mut event = RetainerModifications::new(retainer);
        match decision.action {
            RetainAction::WriteStatus => {
                event.status = Some(decision.status);
                event.patch_status(self.client()).await?;
            }
            RetainAction::Delete { reason } => {
                info!("Deleting Retainer {}: {}", name, reason);
                event.delete(self.client()).await?;
                self.retainers_deleted
                    .add(1, &[KeyValue::new("mode", mode.as_str())]);
            }
            RetainAction::Nothing => {}
        }
        Ok(decision.requeue_after)
    }

    /// Controller triggers this whenever our main object changed
    async fn reconcile(retainer: Arc<Retainer>, ctx: Arc<Self>) -> Result<Action, ControllerError> {
        let me = ctx.as_ref();
        let name = retainer.name_any();
        let start = Instant::now();
        let result = me.reconcile_at(name.as_str(), Utc::now()).await;
        let labels = &[KeyValue::new("object_name", name.clone())];
        me.reconcile_count.add(1, labels);
        me.reconcile_duration
            .record(start.elapsed().as_millis() as u64, labels);
        let requeue_after = result?;
        me.backoff.reset(name.as_str());
        Ok(match requeue_after {
            Some(after) => Action::requeue(after),
            None => Action::await_change(),
        })
    }

    /// The controller triggers this on reconcile errors
    fn error_policy(retainer: Arc<Retainer>, error: &ControllerError, ctx: Arc<Self>) -> Action {
        let name = retainer.name_any();
        if !error.is_temporary() {
            error!("Retainer {} cannot be reconciled: {}", name, error);
            ctx.backoff.reset(name.as_str());
            return Action::await_change();
        }
        let (failures, delay) = ctx.backoff.failure(name.as_str());
        if error.is_conflict() && failures == 1 {
            debug!("{}", error);
            return Action::requeue(Duration::ZERO);
        }
        warn!(
            "reconcile of Retainer {} failed ({} in a row), retry in {:?}: {}",
            name, failures, delay, error
        );
        Action::requeue(delay)
    }

    /// Run until `shutdown` resolves and in-flight reconciles finished, or
    /// until the Retainer cache failed to sync in time.
    pub async fn run(
        self,
        shutdown: impl Future<Output = ()> + Send + Sync + 'static,
    ) -> Result<(), ControllerError> {
        let client = self.client();
        let concurrency = self.configuration.max_concurrent_reconciles;
        let cache_sync_timeout = self.configuration.cache_sync_timeout;
        let reconcile_errors = self.reconcile_errors.clone();
        let backoff = self.backoff.clone();

        let (reader, writer) = reflector::store::<Retainer>();
        let index = NamespaceIndex::default();
        let index_writer = index.clone();
        let mut predicate = GenerationPredicate::<Retainer>::default();
        let retainers = watcher(Api::<Retainer>::all(client.clone()), watcher::Config::default())
            .default_backoff()
            .reflect(writer)
            .inspect_ok(move |event| {
                index_writer.apply(event);
                backoff.observe(event);
            })
            .try_filter_map(move |event| future::ready(Ok(predicate.admit(event))));
        let namespace_deletions = metadata_watcher(
            Api::<Namespace>::all(client.clone()),
            watcher::Config::default(),
        )
        .default_backoff()
        .try_filter_map(|event| future::ready(Ok(deleted(event))));

        let cache = reader.clone();
        let controller = Controller::for_stream(retainers, reader.clone())
            .with_config(controller::Config::default().concurrency(concurrency))
            .watches_stream(
                namespace_deletions,
                move |namespace: PartialObjectMeta<Namespace>| {
                    index.retainers_to_enqueue(namespace.name_any().as_str(), |name| {
                        cache.get(&ObjectRef::new(name))
                    })
                },
            )
            .graceful_shutdown_on(shutdown)
            .run(Self::reconcile, Self::error_policy, Arc::new(self))
            .for_each(move |res| {
                let reconcile_errors = reconcile_errors.clone();
                async move {
                    match res {
                        Ok(o) => {
                            debug!("reconciled {:?}", o);
                        }
                        Err(e) => {
                            let labels = &[];
                            match e {
                                a @ controller::Error::QueueError { .. } => {
                                    debug!("reconcile failed: {:?}", a);
                                    reconcile_errors.add(1, labels);
                                    // Slow down on errors caused by a missing CRD or permissions.
                                    sleep(Duration::from_secs(30)).await;
                                }
                                a @ controller::Error::ObjectNotFound { .. } => {
                                    debug!("reconcile failed: {:?}", a);
                                }
                                controller::Error::ReconcilerFailed(e, o) if e.is_conflict() => {
                                    debug!("reconcile of {} conflicted: {}", o, e);
                                }
                                e => {
                                    warn!("reconcile failed: {:?}", e);
                                    reconcile_errors.add(1, labels);
                                }
                            };
                        }
                    }
                }
            });

        let cache_synced = async move {
            match timeout(cache_sync_timeout, reader.wait_until_ready()).await {
                Ok(Ok(())) => {
                    info!("Retainer cache synced");
                    future::pending::<Result<(), ControllerError>>().await
                }
                _ => Err(ControllerError::CacheSync(cache_sync_timeout)),
            }
        };
        tokio::select! {
            _ = controller => Ok(()),
            res = cache_synced => res,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        resolver::ResolvedResource,
        test_utils::{MockService, pod_json, status_json},
    };
    use k8s_openapi::{
        api::core::v1::Pod, apimachinery::pkg::apis::meta::v1::Time, chrono::TimeZone,
    };
    use kube::api::{ApiResource, GroupVersionKind, ObjectMeta};
    use retain_controller_apis::{FollowObjectRef, RetainerPhase, RetainerSpec, RetainerStatus};
    use futures::FutureExt;
    use serde_json::Value;
    use tokio::sync::oneshot;

    const RETAINER: &str = "/apis/deckhouse.io/v1alpha1/retainers/r1";
    const POD: &str = "/api/v1/namespaces/ns/pods/p";

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, h, m, 0).unwrap()
    }

    fn retainer(mode: &str, ttl: Option<&str>, status: Option<RetainerStatus>) -> Retainer {
        Retainer {
            metadata: ObjectMeta {
                name: Some("r1".to_string()),
                uid: Some("r1-uid".to_string()),
                resource_version: Some("1".to_string()),
                generation: Some(1),
                creation_timestamp: Some(Time(at(10, 0))),
                ..Default::default()
            },
            spec: RetainerSpec {
                mode: mode.to_string(),
                follow_object_ref: Some(FollowObjectRef {
                    api_version: "v1".to_string(),
                    kind: "Pod".to_string(),
                    namespace: "ns".to_string(),
                    name: "p".to_string(),
                    uid: "u1".to_string(),
                }),
                ttl: ttl.map(str::to_string),
            },
            status,
        }
    }

    async fn controller(mock: &MockService) -> RetainerController {
        let configuration = Configuration::from_lookup(mock.client(), |_| None).unwrap();
        let controller = RetainerController::new(configuration);
        controller
            .resolver
            .insert(
                GroupVersionKind::gvk("", "v1", "Pod"),
                ResolvedResource {
                    api_resource: ApiResource::erase::<Pod>(&()),
                    namespaced: true,
                },
            )
            .await;
        controller
    }

    fn serving(retainer: &Retainer) -> MockService {
        let body = serde_json::to_string(retainer).unwrap();
        MockService::new()
            .on_get(RETAINER, 200, body.clone())
            .on("PATCH", &format!("{}/status", RETAINER), 200, body.clone())
            .on("DELETE", RETAINER, 200, body)
    }

    fn patched_status(mock: &MockService) -> Value {
        let writes = mock.writes();
        assert_eq!(1, writes.len(), "{:?}", writes);
        assert_eq!(format!("{}/status", RETAINER), writes[0].path);
        let patch: Value = serde_json::from_str(&writes[0].body).unwrap();
        let add = patch
            .as_array()
            .unwrap()
            .iter()
            .find(|op| op["path"] == "/status")
            .cloned()
            .unwrap();
        add["value"].clone()
    }

    fn deleted_retainer(mock: &MockService) -> bool {
        mock.writes()
            .iter()
            .any(|r| r.method == "DELETE" && r.path == RETAINER)
    }

    #[tokio::test]
    async fn follow_object_tracks_existing_object() {
        let mock = serving(&retainer("FollowObject", None, None))
            .on_get(POD, 200, pod_json("ns", "p", "u1"));
        let requeue = controller(&mock).await.reconcile_at("r1", at(10, 5)).await.unwrap();
        assert_eq!(Some(modes::FOLLOW_CHECK_INTERVAL), requeue);
        let status = patched_status(&mock);
        assert_eq!("Tracking", status["phase"]);
        assert_eq!("Following object v1/Pod/p", status["message"]);
        assert_eq!("Active", status["conditions"][0]["type"]);
        assert_eq!("True", status["conditions"][0]["status"]);
        assert_eq!("ObjectExists", status["conditions"][0]["reason"]);
    }

    #[tokio::test]
    async fn follow_object_deletes_when_object_is_gone() {
        let mock = serving(&retainer("FollowObject", None, None));
        let requeue = controller(&mock).await.reconcile_at("r1", at(10, 5)).await.unwrap();
        assert_eq!(None, requeue);
        assert!(deleted_retainer(&mock));
        let body: Value = serde_json::from_str(&mock.writes()[0].body).unwrap();
        assert_eq!("Background", body["propagationPolicy"]);
        assert_eq!("r1-uid", body["preconditions"]["uid"]);
    }

    #[tokio::test]
    async fn follow_object_deletes_on_uid_mismatch() {
        let mock = serving(&retainer("FollowObject", None, None))
            .on_get(POD, 200, pod_json("ns", "p", "u2"));
        controller(&mock).await.reconcile_at("r1", at(10, 5)).await.unwrap();
        assert!(deleted_retainer(&mock));
    }

    #[tokio::test]
    async fn transient_lookup_failure_never_deletes() {
        let mock = serving(&retainer("FollowObject", None, None))
            .on_get(POD, 500, status_json(500, "etcd unavailable"));
        let requeue = controller(&mock).await.reconcile_at("r1", at(10, 5)).await.unwrap();
        assert_eq!(Some(modes::FOLLOW_CHECK_INTERVAL), requeue);
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn ttl_waits_until_expiry() {
        let mock = serving(&retainer("TTL", Some("1h"), None));
        let requeue = controller(&mock).await.reconcile_at("r1", at(10, 30)).await.unwrap();
        assert_eq!(Some(modes::TTL_CHECK_INTERVAL), requeue);
        let status = patched_status(&mock);
        assert_eq!("WaitingTTL", status["phase"]);
        assert_eq!("TTL expires at 2024-01-01T11:00:00Z", status["message"]);
        // TTL mode never looks at the followed object.
        assert!(mock.requests().iter().all(|r| r.path != POD));
    }

    #[tokio::test]
    async fn ttl_deletes_after_expiry() {
        let mock = serving(&retainer("TTL", Some("1h"), None));
        controller(&mock).await.reconcile_at("r1", at(11, 1)).await.unwrap();
        assert!(deleted_retainer(&mock));
    }

    #[tokio::test]
    async fn follow_object_with_ttl_counts_down_from_loss() {
        let mock = serving(&retainer("FollowObjectWithTTL", Some("30m"), None));
        let requeue = controller(&mock).await.reconcile_at("r1", at(10, 5)).await.unwrap();
        assert_eq!(Some(modes::TTL_CHECK_INTERVAL), requeue);
        let status = patched_status(&mock);
        assert_eq!("WaitingTTL", status["phase"]);
        assert_eq!("2024-01-01T10:05:00Z", status["lostAt"]);
        assert!(!deleted_retainer(&mock));

        let lost = RetainerStatus {
            phase: Some(RetainerPhase::WaitingTtl),
            lost_at: Some(Time(at(10, 5))),
            ..Default::default()
        };
        let mock = serving(&retainer("FollowObjectWithTTL", Some("30m"), Some(lost)));
        controller(&mock).await.reconcile_at("r1", at(10, 36)).await.unwrap();
        assert!(deleted_retainer(&mock));
    }

    #[tokio::test]
    async fn missing_ttl_is_reported_as_pending() {
        let mock = serving(&retainer("TTL", None, None));
        let requeue = controller(&mock).await.reconcile_at("r1", at(10, 5)).await.unwrap();
        assert_eq!(None, requeue);
        let status = patched_status(&mock);
        assert_eq!("Pending", status["phase"]);
        assert_eq!("MissingTTL", status["conditions"][0]["reason"]);
    }

    #[tokio::test]
    async fn unknown_mode_is_permanent() {
        let mock = serving(&retainer("Forever", None, None));
        let err = controller(&mock)
            .await
            .reconcile_at("r1", at(10, 5))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::UnknownMode(_)));
        assert!(!err.is_temporary());
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn vanished_and_terminating_retainers_are_skipped() {
        let mock = MockService::new();
        assert_eq!(
            None,
            controller(&mock).await.reconcile_at("r1", at(10, 5)).await.unwrap()
        );

        let mut terminating = retainer("TTL", Some("1h"), None);
        terminating.metadata.deletion_timestamp = Some(Time(at(10, 1)));
        let mock = serving(&terminating);
        assert_eq!(
            None,
            controller(&mock).await.reconcile_at("r1", at(12, 0)).await.unwrap()
        );
        assert!(mock.writes().is_empty());
    }

    #[tokio::test]
    async fn error_policy_backs_off_per_retainer() {
        let ctx = Arc::new(controller(&MockService::new()).await);
        let obj = Arc::new(retainer("TTL", Some("1h"), None));
        let transient = ControllerError::ApiDiscoveryError("no such group".to_string());

        for _ in 0..3 {
            let action = RetainerController::error_policy(obj.clone(), &transient, ctx.clone());
            assert_ne!(Action::await_change(), action);
            assert_ne!(Action::requeue(Duration::ZERO), action);
        }
        assert_eq!(4, ctx.backoff.failure("r1").0);
        assert_eq!(1, ctx.backoff.failure("r2").0);

        let fatal = ControllerError::UnknownMode(retain_controller_apis::UnknownMode(
            "Forever".to_string(),
        ));
        assert_eq!(
            Action::await_change(),
            RetainerController::error_policy(obj.clone(), &fatal, ctx.clone())
        );
        // A permanent error starts the next run of failures over.
        assert_eq!(1, ctx.backoff.failure("r1").0);
    }

    #[tokio::test]
    async fn first_conflict_retries_immediately() {
        let ctx = Arc::new(controller(&MockService::new()).await);
        let obj = Arc::new(retainer("TTL", Some("1h"), None));
        let conflict = ControllerError::Conflict("r1".to_string());
        assert_eq!(
            Action::requeue(Duration::ZERO),
            RetainerController::error_policy(obj.clone(), &conflict, ctx.clone())
        );
        let second = RetainerController::error_policy(obj.clone(), &conflict, ctx.clone());
        assert_ne!(Action::requeue(Duration::ZERO), second);
        assert_ne!(Action::await_change(), second);
    }

    #[tokio::test]
    async fn status_conflict_surfaces_as_conflict() {
        let body = serde_json::to_string(&retainer("TTL", Some("1h"), None)).unwrap();
        let mock = MockService::new().on_get(RETAINER, 200, body).on(
            "PATCH",
            &format!("{}/status", RETAINER),
            409,
            status_json(409, "the object has been modified"),
        );
        let err = controller(&mock)
            .await
            .reconcile_at("r1", at(10, 5))
            .await
            .unwrap_err();
        assert!(err.is_conflict());
    }

    const RETAINERS: &str = "/apis/deckhouse.io/v1alpha1/retainers";
    const NAMESPACES: &str = "/api/v1/namespaces";

    fn named(mut retainer: Retainer, name: &str) -> Retainer {
        retainer.metadata.name = Some(name.to_string());
        retainer.metadata.uid = Some(format!("{}-uid", name));
        retainer
    }

    fn list(kind: &str, api_version: &str, items: Vec<Value>) -> String {
        serde_json::json!({
            "kind": kind,
            "apiVersion": api_version,
            "metadata": { "resourceVersion": "1" },
            "items": items
        })
        .to_string()
    }

    #[tokio::test]
    async fn run_fails_when_the_cache_never_syncs() {
        let mock = MockService::new();
        let configuration = Configuration::from_lookup(mock.client(), |name| {
            (name == "CACHE_SYNC_TIMEOUT").then(|| "200ms".to_string())
        })
        .unwrap();
        let res = timeout(
            Duration::from_secs(5),
            RetainerController::new(configuration).run(future::pending()),
        )
        .await;
        assert!(
            matches!(res, Ok(Err(ControllerError::CacheSync(d))) if d == Duration::from_millis(200)),
            "{:?}",
            res
        );
    }

    #[tokio::test]
    async fn namespace_deletion_requeues_following_retainers() {
        let mut follower = named(retainer("FollowObject", None, None), "r4");
        if let Some(target) = follower.spec.follow_object_ref.as_mut() {
            target.namespace = "n".to_string();
        }
        let mut ttl = named(retainer("TTL", Some("1h"), None), "r5");
        ttl.spec.follow_object_ref = None;
        let retainers = list(
            "RetainerList",
            "deckhouse.io/v1alpha1",
            vec![
                serde_json::to_value(&follower).unwrap(),
                serde_json::to_value(&ttl).unwrap(),
            ],
        );
        let namespace_deleted = serde_json::json!({
            "type": "DELETED",
            "object": {
                "kind": "PartialObjectMetadata",
                "apiVersion": "meta.k8s.io/v1",
                "metadata": { "name": "n", "resourceVersion": "2" }
            }
        });
        // The live reads of r4 and r5 are not served: both reconcile to
        // "gone" and wait for the next change.
        let mock = MockService::new()
            .on_get(RETAINERS, 200, retainers)
            .on_get(
                NAMESPACES,
                200,
                list("PartialObjectMetadataList", "meta.k8s.io/v1", vec![]),
            )
            .on_watch(NAMESPACES, &[namespace_deleted]);
        let r4 = format!("{}/r4", RETAINERS);
        let r5 = format!("{}/r5", RETAINERS);

        let configuration = Configuration::from_lookup(mock.client(), |_| None).unwrap();
        let (trigger, shutdown) = oneshot::channel::<()>();
        let run = RetainerController::new(configuration).run(shutdown.map(|_| ()));
        tokio::pin!(run);
        let observed = async {
            while mock.gets(&r4) < 2 || mock.gets(&r5) < 1 {
                sleep(Duration::from_millis(20)).await;
            }
            sleep(Duration::from_millis(200)).await;
        };
        tokio::select! {
            res = &mut run => panic!("controller stopped early: {:?}", res),
            _ = timeout(Duration::from_secs(10), observed) => {}
        }
        assert!(mock.gets(&r4) >= 2, "{:?}", mock.requests());
        // r5 does not follow anything and is only reconciled once at start-up.
        assert_eq!(1, mock.gets(&r5), "{:?}", mock.requests());

        let _ = trigger.send(());
        assert!(matches!(
            timeout(Duration::from_secs(5), run).await,
            Ok(Ok(()))
        ));
    }
}
