//! Shared Kubernetes client handles.
//!
//! Building a `kube::Client` means loading kubeconfig or in-cluster
//! credentials and setting up a connection pool, so every distinct set of
//! constructor arguments gets exactly one live client at a time. Handles
//! are shared by reference count: repeated lookups return the same
//! `Arc` while any holder is alive, and once the last holder drops it the
//! registry constructs a fresh client on the next request instead of
//! handing out a dangling one.

#![forbid(unsafe_code)]

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Weak};

use kube::config::{Config, KubeConfigOptions};
use kube::Client;
use once_cell::sync::Lazy;
use tokio::sync::Mutex;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kube client error: {0}")]
    Kube(#[from] kube::Error),
    #[error("kubeconfig error: {0}")]
    Kubeconfig(#[from] kube::config::KubeconfigError),
}

/// Constructor arguments identifying one logical client.
///
/// All `None` means "infer": in-cluster config when running inside a pod,
/// the current kubeconfig context otherwise.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ClientKey {
    pub context: Option<String>,
    pub cluster: Option<String>,
    pub user: Option<String>,
}

impl ClientKey {
    pub fn inferred() -> Self {
        Self::default()
    }

    pub fn for_context(context: impl Into<String>) -> Self {
        Self {
            context: Some(context.into()),
            ..Default::default()
        }
    }

    fn is_inferred(&self) -> bool {
        self.context.is_none() && self.cluster.is_none() && self.user.is_none()
    }
}

/// Weak-reference cache of shared handles, keyed by constructor arguments.
///
/// Construction happens under the lock, so concurrent first requests for
/// the same key never race two expensive constructions.
pub struct SharedCache<K, H> {
    inner: Mutex<HashMap<K, Weak<H>>>,
}

impl<K, H> Default for SharedCache<K, H> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, H> SharedCache<K, H>
where
    K: Eq + Hash + Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached handle for `key`, or build one with `init`.
    ///
    /// Entries whose last holder has dropped are pruned and rebuilt rather
    /// than upgraded, so the cache never returns a dead handle.
    pub async fn get_or_try_init<F, Fut, E>(&self, key: K, init: F) -> Result<Arc<H>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<H, E>>,
    {
        let mut map = self.inner.lock().await;
        map.retain(|_, weak| weak.strong_count() > 0);
        if let Some(existing) = map.get(&key).and_then(Weak::upgrade) {
            return Ok(existing);
        }
        let handle = Arc::new(init().await?);
        map.insert(key, Arc::downgrade(&handle));
        Ok(handle)
    }

    /// Number of live entries. Diagnostic only.
    pub async fn live(&self) -> usize {
        let map = self.inner.lock().await;
        map.values().filter(|w| w.strong_count() > 0).count()
    }
}

/// Registry of shared `kube::Client` handles.
#[derive(Default)]
pub struct ClientRegistry {
    cache: SharedCache<ClientKey, Client>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared client for the given constructor arguments.
    pub async fn shared(&self, key: ClientKey) -> Result<Arc<Client>, Error> {
        let args = key.clone();
        self.cache
            .get_or_try_init(key, move || async move {
                debug!(?args, "constructing kube client");
                if args.is_inferred() {
                    Ok::<_, Error>(Client::try_default().await?)
                } else {
                    let opts = KubeConfigOptions {
                        context: args.context,
                        cluster: args.cluster,
                        user: args.user,
                    };
                    let config = Config::from_kubeconfig(&opts).await?;
                    Ok(Client::try_from(config)?)
                }
            })
            .await
    }
}

static REGISTRY: Lazy<ClientRegistry> = Lazy::new(ClientRegistry::new);

/// Process-wide shared client lookup.
pub async fn shared_client(key: ClientKey) -> Result<Arc<Client>, Error> {
    REGISTRY.shared(key).await
}
