//! Normalized response cache.
//!
//! Response data is flattened into entries keyed by object identity, with
//! nested identifiable objects replaced by `{"__ref": key}` links. Queries,
//! mutations and subscriptions each keep their root fields under a dedicated
//! root entry (`ROOT_QUERY`, `ROOT_MUTATION`, `ROOT_SUBSCRIPTION`).
//!
//! | Component | Description |
//! |-----------|-------------|
//! | [`NormalizedStore`] | The store: all-or-nothing writes, reads, extract/restore |
//! | [`TypePolicies`] | Per-type identity rules ([`KeyFields`]) |
//! | [`CacheKey`] | Identity key of one entry |
//! | [`CacheSnapshot`] | Serializable export used across the render/hydrate boundary |
//! | [`CacheStats`] | Counters collected by the store |

mod key;
mod snapshot;
mod store;

pub use key::{reference_target, CacheKey, KeyFields, TypePolicies, REF_FIELD, TYPENAME_FIELD};
pub use snapshot::CacheSnapshot;
pub use store::{CacheStats, NormalizedStore};
