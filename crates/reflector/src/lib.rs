//! List+watch reflectors.
//!
//! A [`Reflector`] keeps one resource collection mirrored in memory so
//! consumers can check cluster state without a round trip per query. It
//! fetches the full listing once, then follows the watch stream anchored
//! at the listing's resource version, re-listing and reconnecting on the
//! many ways such a stream can end. Reads are lock-free snapshots; all
//! mutation happens on the reflector's own background task.

#![forbid(unsafe_code)]

mod engine;
mod kinds;
mod mirror;

pub use engine::{FailureCallback, Reflector, ReflectorConfig};
pub use kinds::{sort_events_by_time, EventSpec, KindSpec, PodSpec};
pub use mirror::{Mirror, Snapshot};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("kube api error: {0}")]
    Kube(#[from] kube::Error),
    #[error("listing carried no resource version to anchor a watch on")]
    NoResourceVersion,
    #[error(transparent)]
    Core(#[from] specular_core::Error),
}
