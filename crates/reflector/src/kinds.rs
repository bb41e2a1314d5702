//! Per-kind reflector configuration.
//!
//! Each watched kind supplies its typed API constructor and the default
//! selectors identifying managed resources. Cluster-scoped kinds simply
//! ignore the namespace argument in [`KindSpec::api`]; the engine never
//! builds namespace paths itself.

use std::fmt::Debug;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Event, Pod};
use kube::api::Api;
use kube::Client;
use serde::de::DeserializeOwned;
use specular_core::Selector;

/// Static configuration for one watchable resource kind.
pub trait KindSpec: Send + Sync + 'static {
    type Resource: kube::Resource + Clone + Debug + DeserializeOwned + Send + Sync + 'static;

    /// Human-readable kind name for diagnostics.
    const KIND: &'static str;

    /// Typed API handle. `namespace: None` means a cluster-wide listing
    /// for namespaced kinds and is the only option for cluster-scoped
    /// ones.
    fn api(client: Client, namespace: Option<&str>) -> Api<Self::Resource>;

    /// Label selector identifying managed resources of this kind.
    fn default_labels() -> Selector {
        Selector::new()
    }

    /// Field selector identifying managed resources of this kind.
    fn default_fields() -> Selector {
        Selector::new()
    }
}

/// Pods carrying the managed-workload label.
pub struct PodSpec;

impl KindSpec for PodSpec {
    type Resource = Pod;

    const KIND: &'static str = "pods";

    fn api(client: Client, namespace: Option<&str>) -> Api<Pod> {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }

    fn default_labels() -> Selector {
        Selector::new().with("component", "managed-workload")
    }
}

/// Events attached to pods, for surfacing progress while a workload
/// starts up.
pub struct EventSpec;

impl KindSpec for EventSpec {
    type Resource = Event;

    const KIND: &'static str = "events";

    fn api(client: Client, namespace: Option<&str>) -> Api<Event> {
        match namespace {
            Some(ns) => Api::namespaced(client, ns),
            None => Api::all(client),
        }
    }

    fn default_fields() -> Selector {
        Selector::new().with("involvedObject.kind", "Pod")
    }
}

/// Best-available timestamp for ordering events.
///
/// `last_timestamp` is the low-resolution field, `event_time` the
/// high-resolution one; servers populate one or the other. Events with
/// neither fall back to the epoch so they sort deterministically first
/// and comparison is total.
fn event_timestamp(event: &Event) -> DateTime<Utc> {
    event
        .last_timestamp
        .as_ref()
        .map(|t| t.0)
        .or_else(|| event.event_time.as_ref().map(|t| t.0))
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Order events oldest-first by their best-available timestamp.
pub fn sort_events_by_time(events: impl IntoIterator<Item = Arc<Event>>) -> Vec<Arc<Event>> {
    let mut out: Vec<Arc<Event>> = events.into_iter().collect();
    out.sort_by_key(|e| event_timestamp(e));
    out
}

impl crate::Reflector<EventSpec> {
    /// The mirrored events, sorted oldest-first. The mirror itself is
    /// unordered; consumers showing progress want a stable timeline.
    pub fn sorted_events(&self) -> Vec<Arc<Event>> {
        sort_events_by_time(self.store().values().cloned())
    }
}
