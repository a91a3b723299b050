//! etcd-backed coordination shared by the master and worker tiers:
//! a typed KV store wrapper, service registration and watch, and the
//! leader-election session.

pub mod discovery;
pub mod election;
pub mod error;
pub mod store;

pub use discovery::{NodeEvent, NodeRecord};
pub use error::{CoordError, Result};
pub use store::KvStore;
