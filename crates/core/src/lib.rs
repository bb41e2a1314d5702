//! Specular core types: resource keys, selectors and reconnect backoff.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub mod backoff;
pub use backoff::ExponentialBackoff;

/// Key a resource is indexed under in a mirror. Unique within one mirror.
pub type ResourceKey = String;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("invalid selector term {0:?} (expected key=value)")]
    InvalidSelector(String),
}

/// How mirror keys are derived from object metadata.
///
/// Names are only unique within one namespace, so a cluster-wide listing
/// must qualify the key with the namespace or two pods sharing a name
/// would collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyScope {
    /// All resources come from one namespace; the name alone is unique.
    Namespaced,
    /// Resources span namespaces; key is `namespace/name`.
    Cluster,
}

impl KeyScope {
    /// Pick the scope matching a listing's namespace argument: a listing
    /// without a namespace returns resources from the whole cluster.
    pub fn for_namespace(namespace: Option<&str>) -> Self {
        match namespace {
            Some(_) => KeyScope::Namespaced,
            None => KeyScope::Cluster,
        }
    }

    pub fn key_for(&self, meta: &ObjectMeta) -> Result<ResourceKey, Error> {
        let name = meta.name.as_deref().ok_or(Error::MissingName)?;
        Ok(match self {
            KeyScope::Namespaced => name.to_string(),
            KeyScope::Cluster => {
                let ns = meta.namespace.as_deref().unwrap_or("");
                format!("{ns}/{name}")
            }
        })
    }
}

/// Label or field selector built from ordered `key=value` pairs.
///
/// Pairs are kept sorted so rendered selector strings (and the log lines
/// quoting them) are stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Selector {
    pairs: BTreeMap<String, String>,
}

impl Selector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.pairs.insert(key.into(), value.into());
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.pairs.insert(key.into(), value.into());
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// Render for the API server, or `None` when no terms are set so the
    /// request carries no selector parameter at all.
    pub fn to_param(&self) -> Option<String> {
        if self.pairs.is_empty() {
            None
        } else {
            Some(self.to_string())
        }
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (k, v) in &self.pairs {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{k}={v}")?;
            first = false;
        }
        Ok(())
    }
}

impl FromStr for Selector {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut sel = Selector::new();
        for term in s.split(',').filter(|t| !t.trim().is_empty()) {
            let (k, v) = term
                .split_once('=')
                .ok_or_else(|| Error::InvalidSelector(term.to_string()))?;
            sel.insert(k.trim(), v.trim());
        }
        Ok(sel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(ns: Option<&str>, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.to_string()),
            namespace: ns.map(|s| s.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn namespaced_key_is_bare_name() {
        let scope = KeyScope::Namespaced;
        assert_eq!(scope.key_for(&meta(Some("hub"), "p1")).unwrap(), "p1");
    }

    #[test]
    fn cluster_keys_qualify_by_namespace() {
        let scope = KeyScope::Cluster;
        let a = scope.key_for(&meta(Some("ns-a"), "p1")).unwrap();
        let b = scope.key_for(&meta(Some("ns-b"), "p1")).unwrap();
        assert_eq!(a, "ns-a/p1");
        assert_eq!(b, "ns-b/p1");
        assert_ne!(a, b);
    }

    #[test]
    fn missing_name_is_an_error() {
        let no_name = ObjectMeta::default();
        assert!(KeyScope::Namespaced.key_for(&no_name).is_err());
    }

    #[test]
    fn scope_follows_namespace_argument() {
        assert_eq!(KeyScope::for_namespace(Some("hub")), KeyScope::Namespaced);
        assert_eq!(KeyScope::for_namespace(None), KeyScope::Cluster);
    }

    #[test]
    fn selector_renders_sorted_terms() {
        let sel = Selector::new().with("component", "server").with("app", "x");
        assert_eq!(sel.to_string(), "app=x,component=server");
        assert_eq!(sel.to_param().as_deref(), Some("app=x,component=server"));
    }

    #[test]
    fn empty_selector_renders_no_param() {
        assert_eq!(Selector::new().to_param(), None);
        assert_eq!(Selector::new().to_string(), "");
    }

    #[test]
    fn selector_parses_terms() {
        let sel: Selector = "app=x, component=server".parse().unwrap();
        assert_eq!(sel.to_string(), "app=x,component=server");
        assert!("app".parse::<Selector>().is_err());
        assert!("".parse::<Selector>().unwrap().is_empty());
    }
}
