//! The generic list+watch engine.
//!
//! One background task per reflector owns all network I/O and all mirror
//! mutation. The loop re-lists on every (re)connect so any events missed
//! while disconnected are folded in, then follows the watch stream from
//! the listing's resource version. Stream endings are classified: server
//! watch timeouts and client read timeouts reconnect immediately, other
//! failures back off exponentially, and once the backoff ceiling is
//! exhausted the reflector gives up for good and fires its failure
//! callback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use kube::api::{Api, ListParams, ObjectList, WatchEvent, WatchParams};
use kube::{Client, Resource};
use metrics::{counter, gauge};
use specular_core::{ExponentialBackoff, KeyScope, Selector};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::kinds::KindSpec;
use crate::mirror::{Mirror, Snapshot};
use crate::Error;

/// Invoked at most once, when the reflector exhausts its reconnect
/// backoff and stops updating the mirror.
pub type FailureCallback = Box<dyn FnOnce() + Send + 'static>;

pub(crate) type WatchStream<'a, K> = BoxStream<'a, Result<WatchEvent<K>, kube::Error>>;

/// Raw list/watch transport for one resource collection.
///
/// [`Api`] is the production implementation; tests drive the loop with
/// scripted sources so the reconnect protocol can be exercised without a
/// cluster.
pub(crate) trait ListWatch<K: Clone>: Send + Sync + 'static {
    fn list(&self, lp: &ListParams) -> BoxFuture<'_, Result<ObjectList<K>, kube::Error>>;

    fn watch<'a>(
        &'a self,
        wp: &WatchParams,
        version: &str,
    ) -> BoxFuture<'a, Result<WatchStream<'a, K>, kube::Error>>;
}

impl<K> ListWatch<K> for Api<K>
where
    K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + Sync + 'static,
{
    fn list(&self, lp: &ListParams) -> BoxFuture<'_, Result<ObjectList<K>, kube::Error>> {
        let lp = lp.clone();
        Box::pin(async move { Api::list(self, &lp).await })
    }

    fn watch<'a>(
        &'a self,
        wp: &WatchParams,
        version: &str,
    ) -> BoxFuture<'a, Result<WatchStream<'a, K>, kube::Error>> {
        let wp = wp.clone();
        let version = version.to_owned();
        Box::pin(async move { Ok(Api::watch(self, &wp, &version).await?.boxed()) })
    }
}

/// Tunables for one reflector instance.
///
/// `labels`/`fields`: `None` keeps the kind's defaults; `Some` replaces
/// them entirely (an explicitly empty selector watches everything).
/// Zero timeouts disable the corresponding limit, like the API they map
/// onto.
#[derive(Debug, Clone)]
pub struct ReflectorConfig {
    /// Namespace to watch, or `None` for a cluster-wide listing. Keys are
    /// namespace-qualified exactly when this is `None`.
    pub namespace: Option<String>,
    pub labels: Option<Selector>,
    pub fields: Option<Selector>,
    /// Client-side limit on a single read (list call or one watch-stream
    /// read). Hitting it reconnects without backoff growth: low traffic
    /// looks exactly like this.
    pub request_timeout: Duration,
    /// Server-side watch duration; the server closes the stream cleanly
    /// after this long.
    pub watch_timeout: Duration,
    /// Forced restart interval: tear the stream down and re-list at least
    /// this often even if events keep arriving, rather than trusting the
    /// server to deliver every event forever.
    pub restart_interval: Duration,
}

impl Default for ReflectorConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            labels: None,
            fields: None,
            request_timeout: Duration::from_secs(60),
            watch_timeout: Duration::from_secs(10),
            restart_interval: Duration::from_secs(30),
        }
    }
}

struct Params {
    namespace: Option<String>,
    labels: Selector,
    fields: Selector,
    request_timeout: Duration,
    watch_timeout: Duration,
    restart_interval: Duration,
}

struct Shared<K> {
    kind: &'static str,
    mirror: Mirror<K>,
    scope: KeyScope,
    stop: AtomicBool,
    failed: AtomicBool,
    ready: watch::Receiver<bool>,
}

impl<K> Shared<K> {
    fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }
}

/// A running reflector for one resource kind.
pub struct Reflector<S: KindSpec> {
    inner: Arc<Shared<S::Resource>>,
    task: JoinHandle<()>,
}

impl<S: KindSpec> Reflector<S> {
    /// Build selectors, perform the blocking bootstrap listing, then
    /// launch the background synchronization task.
    ///
    /// The mirror is fully populated when this returns, so callers can
    /// query it immediately without racing the background task. A failed
    /// bootstrap is returned as an error; the task is only spawned after
    /// a successful initial load, which is also the one and only point
    /// the ready signal fires.
    pub async fn start(
        client: Client,
        config: ReflectorConfig,
        on_failure: Option<FailureCallback>,
    ) -> Result<Self, Error> {
        let params = Params {
            labels: config.labels.unwrap_or_else(S::default_labels),
            fields: config.fields.unwrap_or_else(S::default_fields),
            namespace: config.namespace,
            request_timeout: config.request_timeout,
            watch_timeout: config.watch_timeout,
            restart_interval: config.restart_interval,
        };
        let api = S::api(client, params.namespace.as_deref());
        Self::launch(api, params, on_failure).await
    }

    /// Bootstrap and spawn against an arbitrary transport.
    async fn launch<A>(
        source: A,
        params: Params,
        on_failure: Option<FailureCallback>,
    ) -> Result<Self, Error>
    where
        A: ListWatch<S::Resource>,
    {
        let (ready_tx, ready_rx) = watch::channel(false);
        let shared = Arc::new(Shared {
            kind: S::KIND,
            mirror: Mirror::new(),
            scope: KeyScope::for_namespace(params.namespace.as_deref()),
            stop: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            ready: ready_rx,
        });

        list_and_replace(&shared, &source, &params).await?;
        ready_tx.send_replace(true);

        let task = tokio::spawn(run(Arc::clone(&shared), source, params, ready_tx, on_failure));
        Ok(Self {
            inner: shared,
            task,
        })
    }

    /// Lock-free snapshot of the mirror. Safe from any task; never
    /// observes a half-applied mutation.
    pub fn store(&self) -> Snapshot<S::Resource> {
        self.inner.mirror.snapshot()
    }

    pub fn get(&self, key: &str) -> Option<Arc<S::Resource>> {
        self.inner.mirror.get(key)
    }

    pub fn len(&self) -> usize {
        self.inner.mirror.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.mirror.is_empty()
    }

    /// Resolves once the mirror holds its first complete listing. Always
    /// already-resolved on a started reflector; provided so consumers
    /// handed a shared reference can await validity without knowing who
    /// started it.
    pub async fn ready(&self) {
        let mut rx = self.inner.ready.clone();
        // Can only fail if the sender is gone, and by then the value is true.
        let _ = rx.wait_for(|ready| *ready).await;
    }

    /// Request a cooperative stop. The loop exits at its next safe point
    /// (after the current event, or after the current stream read ends);
    /// in-flight I/O is not aborted faster than its own timeout.
    pub fn stop(&self) {
        self.inner.stop.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stop_requested()
    }

    /// True once the reflector has given up reconnecting. The mirror is
    /// stale from that point on.
    pub fn is_failed(&self) -> bool {
        self.inner.failed.load(Ordering::Acquire)
    }

    /// Stop and wait for the background task to wind down.
    pub async fn shutdown(self) {
        self.stop();
        let _ = self.task.await;
    }
}

enum CycleEnd {
    /// Stop flag observed after applying an event.
    Stopped,
    /// Forced restart interval elapsed while events were still flowing.
    Restart,
    /// Server closed the stream with no error (watch timeout).
    StreamClosed,
    /// No bytes within the request timeout; expected under low traffic.
    ReadTimeout,
}

async fn run<K, A>(
    shared: Arc<Shared<K>>,
    source: A,
    params: Params,
    ready_tx: watch::Sender<bool>,
    mut on_failure: Option<FailureCallback>,
) where
    K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned + Send + Sync + 'static,
    A: ListWatch<K>,
{
    info!(
        kind = shared.kind,
        labels = %params.labels,
        fields = %params.fields,
        namespace = params.namespace.as_deref().unwrap_or("[cluster]"),
        "watching"
    );
    let mut backoff = ExponentialBackoff::default();
    loop {
        if shared.stop_requested() {
            info!(kind = shared.kind, "watcher stopped");
            break;
        }
        debug!(kind = shared.kind, "connecting watcher");
        match watch_cycle(&shared, &source, &params, &mut backoff).await {
            Ok(CycleEnd::Stopped) => {
                info!(kind = shared.kind, "watcher stopped");
                break;
            }
            Ok(CycleEnd::Restart) => {}
            Ok(CycleEnd::StreamClosed) => {
                debug!(kind = shared.kind, "watch timed out, reconnecting");
            }
            Ok(CycleEnd::ReadTimeout) => {
                warn!(kind = shared.kind, "read timeout, reconnecting");
            }
            Err(err) => match backoff.next() {
                Some(delay) => {
                    warn!(
                        kind = shared.kind,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "error watching resources, retrying"
                    );
                    counter!("specular_watch_errors_total", 1u64, "kind" => shared.kind);
                    tokio::time::sleep(delay).await;
                }
                None => {
                    error!(
                        kind = shared.kind,
                        error = %err,
                        "watching resources never recovered, giving up"
                    );
                    shared.failed.store(true, Ordering::Release);
                    if let Some(callback) = on_failure.take() {
                        callback();
                    }
                    break;
                }
            },
        }
    }
    drop(ready_tx);
    debug!(kind = shared.kind, "watcher finished");
}

/// One relist-then-watch pass. Returns how the stream ended, or the error
/// that ended it.
async fn watch_cycle<K, A>(
    shared: &Shared<K>,
    source: &A,
    params: &Params,
    backoff: &mut ExponentialBackoff,
) -> Result<CycleEnd, Error>
where
    K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
    A: ListWatch<K> + ?Sized,
{
    let started = Instant::now();
    let version = match read_limited(params.request_timeout, list_and_replace(shared, source, params)).await {
        Some(listed) => listed?,
        None => return Ok(CycleEnd::ReadTimeout),
    };

    let mut wp = WatchParams::default();
    if let Some(labels) = params.labels.to_param() {
        wp = wp.labels(&labels);
    }
    if let Some(fields) = params.fields.to_param() {
        wp = wp.fields(&fields);
    }
    if !params.watch_timeout.is_zero() {
        wp = wp.timeout(params.watch_timeout.as_secs() as u32);
    }

    let mut stream = source.watch(&wp, &version).await?;
    loop {
        let event = match read_limited(params.request_timeout, stream.try_next()).await {
            None => return Ok(CycleEnd::ReadTimeout),
            Some(Ok(None)) => return Ok(CycleEnd::StreamClosed),
            Some(Ok(Some(event))) => event,
            Some(Err(err)) => return Err(err.into()),
        };
        match event {
            WatchEvent::Added(obj) | WatchEvent::Modified(obj) => {
                backoff.reset();
                let key = shared.scope.key_for(obj.meta())?;
                debug!(kind = shared.kind, %key, "applying upsert");
                shared.mirror.upsert(key, obj);
                counter!("specular_watch_events_total", 1u64, "kind" => shared.kind);
            }
            WatchEvent::Deleted(obj) => {
                backoff.reset();
                let key = shared.scope.key_for(obj.meta())?;
                debug!(kind = shared.kind, %key, "applying delete");
                shared.mirror.remove(&key);
                counter!("specular_watch_events_total", 1u64, "kind" => shared.kind);
            }
            // No mirror or backoff effect, but the stop and restart
            // checks below still apply.
            WatchEvent::Bookmark(_) => {}
            WatchEvent::Error(err) => return Err(kube::Error::Api(err).into()),
        }
        gauge!("specular_mirror_size", shared.mirror.len() as f64, "kind" => shared.kind);
        if shared.stop_requested() {
            return Ok(CycleEnd::Stopped);
        }
        if started.elapsed() >= params.restart_interval {
            debug!(
                kind = shared.kind,
                secs = started.elapsed().as_secs(),
                "restarting watcher"
            );
            return Ok(CycleEnd::Restart);
        }
    }
}

/// Full fetch, atomically replacing the mirror, returning the listing's
/// resource version as the watch anchor.
async fn list_and_replace<K, A>(
    shared: &Shared<K>,
    source: &A,
    params: &Params,
) -> Result<String, Error>
where
    K: Resource + Clone + std::fmt::Debug + serde::de::DeserializeOwned,
    A: ListWatch<K> + ?Sized,
{
    let mut lp = ListParams::default();
    if let Some(labels) = params.labels.to_param() {
        lp = lp.labels(&labels);
    }
    if let Some(fields) = params.fields.to_param() {
        lp = lp.fields(&fields);
    }
    if !params.request_timeout.is_zero() {
        lp = lp.timeout(params.request_timeout.as_secs() as u32);
    }

    let listing = source.list(&lp).await?;
    let version = listing
        .metadata
        .resource_version
        .clone()
        .filter(|v| !v.is_empty())
        .ok_or(Error::NoResourceVersion)?;

    let mut entries = Vec::with_capacity(listing.items.len());
    for obj in listing.items {
        let key = shared.scope.key_for(obj.meta())?;
        entries.push((key, obj));
    }
    shared.mirror.replace(entries);

    counter!("specular_relist_total", 1u64, "kind" => shared.kind);
    gauge!("specular_mirror_size", shared.mirror.len() as f64, "kind" => shared.kind);
    debug!(kind = shared.kind, size = shared.mirror.len(), %version, "listed");
    Ok(version)
}

/// Await `fut`, bounded by the read timeout when one is configured.
/// `None` means the timeout elapsed first.
async fn read_limited<F: std::future::Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    if timeout.is_zero() {
        Some(fut.await)
    } else {
        tokio::time::timeout(timeout, fut).await.ok()
    }
}
