//! Event recording pipeline.
//!
//! Decouples high-volume event emission from the cluster Events API: a
//! bounded queue fans out to a background forwarder which runs every
//! record through a spam correlator before posting it to the sink.
//! Delivery is best-effort; when the queue is full or the sink is down,
//! records are dropped, never retried.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use k8s_openapi::api::core::v1::{Event, EventSource, ObjectReference};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::scheme::Scheme;

/// Correlator burst override. Machine and cluster operations can create
/// enough events to trigger the default spam filter, which is tuned for
/// noisy single-resource loops rather than fleet-wide batch operations.
/// Raising the burst ensures all legitimate events reach the sink.
pub const EVENT_BURST_SIZE: u32 = 100;

/// Queued records before emitters start dropping.
const QUEUE_CAPACITY: usize = 1000;

/// Spam-correlator tuning.
#[derive(Debug, Clone, Copy)]
pub struct CorrelatorOptions {
    /// Events allowed through per correlation key before suppression
    pub burst_size: u32,
    /// Token refill rate once a key's burst is exhausted
    pub refill_per_second: f64,
}

impl Default for CorrelatorOptions {
    fn default() -> Self {
        // Upstream anti-spam defaults: 25 events, then one every 5 minutes.
        Self {
            burst_size: 25,
            refill_per_second: 1.0 / 300.0,
        }
    }
}

/// Severity of an event record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Informational
    Normal,
    /// Something went wrong but the process continues
    Warning,
}

impl EventType {
    fn as_str(self) -> &'static str {
        match self {
            Self::Normal => "Normal",
            Self::Warning => "Warning",
        }
    }
}

/// One emitted event, queued for delivery to the sink.
#[derive(Debug, Clone)]
pub struct EventRecord {
    /// Component the event is attributed to
    pub component: String,
    /// Kind of the involved object
    pub kind: String,
    /// `group/version` of the involved object
    pub api_version: String,
    /// Name of the involved object
    pub name: String,
    /// Namespace of the involved object
    pub namespace: String,
    /// Severity
    pub event_type: EventType,
    /// Machine-readable reason
    pub reason: String,
    /// Human-readable message
    pub message: String,
    /// Emission timestamp
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl EventRecord {
    /// Key the correlator aggregates on: same object, same reason.
    fn correlation_key(&self) -> String {
        format!(
            "{}/{}/{}/{}",
            self.kind, self.namespace, self.name, self.reason
        )
    }
}

/// Token-bucket spam filter keyed by (object, reason).
struct Correlator {
    opts: CorrelatorOptions,
    buckets: HashMap<String, Bucket>,
}

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

impl Correlator {
    fn new(opts: CorrelatorOptions) -> Self {
        Self {
            opts,
            buckets: HashMap::new(),
        }
    }

    /// Whether an event with this key may pass. Each key starts with a
    /// full burst of tokens and refills at the configured rate.
    fn allow(&mut self, key: &str) -> bool {
        let now = Instant::now();
        let bucket = self.buckets.entry(key.to_string()).or_insert(Bucket {
            tokens: f64::from(self.opts.burst_size),
            last_refill: now,
        });

        let elapsed = now.duration_since(bucket.last_refill).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * self.opts.refill_per_second)
            .min(f64::from(self.opts.burst_size));
        bucket.last_refill = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// Durable destination for event records.
pub trait EventSink: Send + Sync + 'static {
    /// Deliver one record. Errors are logged and the record is dropped.
    fn publish(
        &self,
        record: &EventRecord,
    ) -> impl std::future::Future<Output = Result<(), kube::Error>> + Send;
}

/// Sink posting records to the cluster Events API.
#[derive(Clone)]
pub struct ClusterSink {
    client: Client,
}

impl ClusterSink {
    /// Sink writing through the given API client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

impl EventSink for ClusterSink {
    async fn publish(&self, record: &EventRecord) -> Result<(), kube::Error> {
        let event = Event {
            metadata: ObjectMeta {
                namespace: Some(record.namespace.clone()),
                generate_name: Some(format!("{}.", record.name)),
                ..Default::default()
            },
            involved_object: ObjectReference {
                api_version: Some(record.api_version.clone()),
                kind: Some(record.kind.clone()),
                name: Some(record.name.clone()),
                namespace: Some(record.namespace.clone()),
                ..Default::default()
            },
            type_: Some(record.event_type.as_str().to_string()),
            reason: Some(record.reason.clone()),
            message: Some(record.message.clone()),
            source: Some(EventSource {
                component: Some(record.component.clone()),
                ..Default::default()
            }),
            first_timestamp: Some(Time(record.timestamp)),
            last_timestamp: Some(Time(record.timestamp)),
            count: Some(1),
            ..Default::default()
        };

        let api: Api<Event> = Api::namespaced(self.client.clone(), &record.namespace);
        api.create(&PostParams::default(), &event).await?;
        Ok(())
    }
}

/// Owns the bounded event queue and the correlator configuration.
pub struct EventBroadcaster {
    tx: mpsc::Sender<EventRecord>,
    rx: Mutex<Option<mpsc::Receiver<EventRecord>>>,
    opts: CorrelatorOptions,
}

impl std::fmt::Debug for EventBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBroadcaster")
            .field("opts", &self.opts)
            .finish_non_exhaustive()
    }
}

impl EventBroadcaster {
    /// Broadcaster with the given correlator tuning.
    pub fn new(opts: CorrelatorOptions) -> Self {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        Self {
            tx,
            rx: Mutex::new(Some(rx)),
            opts,
        }
    }

    /// Hand out a recorder attributed to `component`. Emission through the
    /// recorder is fire-and-forget.
    pub fn recorder(&self, scheme: Arc<Scheme>, component: &str) -> Recorder {
        Recorder {
            tx: self.tx.clone(),
            scheme,
            component: component.to_string(),
        }
    }

    /// Spawn the background forwarder draining the queue into `sink` for
    /// the lifetime of the process. Best-effort: sink failures are logged
    /// and the record is dropped. Subsequent calls are no-ops.
    pub fn start_recording_to_sink<S: EventSink>(
        &self,
        sink: S,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let rx = {
            let mut guard = self.rx.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
            guard.take()
        };

        let Some(mut rx) = rx else {
            warn!("event sink forwarder already started");
            return tokio::spawn(async {});
        };

        let opts = self.opts;
        tokio::spawn(async move {
            let mut correlator = Correlator::new(opts);
            info!(burst_size = opts.burst_size, "Event sink forwarder started");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    record = rx.recv() => {
                        let Some(record) = record else { break };
                        if !correlator.allow(&record.correlation_key()) {
                            debug!(
                                kind = %record.kind,
                                name = %record.name,
                                reason = %record.reason,
                                "Event suppressed by correlator"
                            );
                            continue;
                        }
                        if let Err(e) = sink.publish(&record).await {
                            warn!(
                                kind = %record.kind,
                                name = %record.name,
                                reason = %record.reason,
                                error = %e,
                                "Failed to deliver event, dropping"
                            );
                        }
                    }
                }
            }

            info!("Event sink forwarder stopped");
        })
    }
}

/// Thin fire-and-forget handle bound to a component name.
#[derive(Clone)]
pub struct Recorder {
    tx: mpsc::Sender<EventRecord>,
    scheme: Arc<Scheme>,
    component: String,
}

impl std::fmt::Debug for Recorder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Recorder")
            .field("component", &self.component)
            .finish_non_exhaustive()
    }
}

impl Recorder {
    /// Emit an event for a typed object. The kind must have been
    /// registered in the scheme before the manager started.
    pub fn emit<K>(&self, obj: &K, event_type: EventType, reason: &str, message: &str)
    where
        K: kube::Resource<DynamicType = ()>,
    {
        let kind = K::kind(&()).into_owned();
        let Some(spec) = self.scheme.resource(&kind) else {
            warn!(kind = %kind, "Dropping event for kind not registered in scheme");
            return;
        };

        let record = EventRecord {
            component: self.component.clone(),
            api_version: spec.api_version(),
            kind,
            name: obj.name_any(),
            namespace: obj.namespace().unwrap_or_default(),
            event_type,
            reason: reason.to_string(),
            message: message.to_string(),
            timestamp: chrono::Utc::now(),
        };

        if let Err(mpsc::error::TrySendError::Full(record)) = self.tx.try_send(record) {
            debug!(
                kind = %record.kind,
                name = %record.name,
                "Event queue full, dropping event"
            );
        }
    }

    /// Emit a Normal event.
    pub fn normal<K>(&self, obj: &K, reason: &str, message: &str)
    where
        K: kube::Resource<DynamicType = ()>,
    {
        self.emit(obj, EventType::Normal, reason, message);
    }

    /// Emit a Warning event.
    pub fn warning<K>(&self, obj: &K, reason: &str, message: &str)
    where
        K: kube::Resource<DynamicType = ()>,
    {
        self.emit(obj, EventType::Warning, reason, message);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheme::{register_infrastructure_types, register_metal_types, SchemeBuilder};
    use std::sync::Mutex as StdMutex;

    fn test_scheme() -> Arc<Scheme> {
        register_metal_types(register_infrastructure_types(SchemeBuilder::new())).build()
    }

    /// Sink capturing records in memory.
    #[derive(Clone, Default)]
    struct MemorySink {
        records: Arc<StdMutex<Vec<EventRecord>>>,
    }

    impl EventSink for MemorySink {
        async fn publish(&self, record: &EventRecord) -> Result<(), kube::Error> {
            self.records.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    fn sample_cluster(name: &str) -> crds::MetalCluster {
        let mut cluster = crds::MetalCluster::new(
            name,
            crds::MetalClusterSpec {
                control_plane_endpoint: crds::ApiEndpoint {
                    host: "cp.example.com".to_string(),
                    port: 6443,
                },
            },
        );
        cluster.metadata.namespace = Some("default".to_string());
        cluster
    }

    #[test]
    fn burst_override_is_a_fixed_constant() {
        assert_eq!(EVENT_BURST_SIZE, 100);
    }

    #[test]
    fn correlator_allows_full_burst_then_suppresses() {
        let mut correlator = Correlator::new(CorrelatorOptions {
            burst_size: EVENT_BURST_SIZE,
            refill_per_second: 0.0,
        });

        for i in 0..EVENT_BURST_SIZE {
            assert!(correlator.allow("MetalMachine/default/m0/Provisioned"), "event {i} suppressed early");
        }
        assert!(!correlator.allow("MetalMachine/default/m0/Provisioned"));
    }

    #[test]
    fn correlator_does_not_conflate_distinct_keys() {
        let mut correlator = Correlator::new(CorrelatorOptions {
            burst_size: 1,
            refill_per_second: 0.0,
        });

        assert!(correlator.allow("MetalMachine/default/m0/Provisioned"));
        assert!(!correlator.allow("MetalMachine/default/m0/Provisioned"));
        // Different object, same reason: independent budget.
        assert!(correlator.allow("MetalMachine/default/m1/Provisioned"));
        // Same object, different reason: independent budget.
        assert!(correlator.allow("MetalMachine/default/m0/PowerOn"));
    }

    #[tokio::test]
    async fn recorder_to_sink_roundtrip() {
        let broadcaster = EventBroadcaster::new(CorrelatorOptions {
            burst_size: EVENT_BURST_SIZE,
            ..Default::default()
        });
        let recorder = broadcaster.recorder(test_scheme(), "metal-controller-manager");
        let sink = MemorySink::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let forwarder = broadcaster.start_recording_to_sink(sink.clone(), shutdown_rx);

        let cluster = sample_cluster("cluster-0");
        recorder.normal(&cluster, "Reconciled", "cluster infrastructure ready");
        recorder.warning(&cluster, "EndpointInvalid", "control plane endpoint missing");

        // Give the forwarder a chance to drain, then stop it.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        shutdown_tx.send(true).unwrap();
        forwarder.await.unwrap();

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].component, "metal-controller-manager");
        assert_eq!(records[0].kind, "MetalCluster");
        assert_eq!(records[0].api_version, "infrastructure.metalstack.io/v1alpha3");
        assert_eq!(records[0].namespace, "default");
        assert_eq!(records[1].event_type, EventType::Warning);
    }

    #[tokio::test]
    async fn unregistered_kind_is_dropped_at_emission() {
        let broadcaster = EventBroadcaster::new(CorrelatorOptions::default());
        // Scheme with only the metal group: MetalCluster is unknown.
        let scheme = register_metal_types(SchemeBuilder::new()).build();
        let recorder = broadcaster.recorder(scheme, "metal-controller-manager");

        let cluster = sample_cluster("cluster-0");
        recorder.normal(&cluster, "Reconciled", "should not be queued");

        let sink = MemorySink::default();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let forwarder = broadcaster.start_recording_to_sink(sink.clone(), shutdown_rx);
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        shutdown_tx.send(true).unwrap();
        forwarder.await.unwrap();

        assert!(sink.records.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn forwarder_can_only_be_started_once() {
        let broadcaster = EventBroadcaster::new(CorrelatorOptions::default());
        let (_tx, shutdown_rx) = watch::channel(false);

        let first = broadcaster.start_recording_to_sink(MemorySink::default(), shutdown_rx.clone());
        let second = broadcaster.start_recording_to_sink(MemorySink::default(), shutdown_rx);

        // The second call must not panic and must resolve immediately.
        second.await.unwrap();
        first.abort();
    }
}
