//! Master tier: leader election over etcd, a reactive view of the worker
//! fleet, stable minimum-load placement of crawl resources, and the HTTP
//! command API operators use to add and remove them.

pub mod api;
pub mod error;
pub mod id;
pub mod master;

pub use error::{MasterError, Result};
pub use master::{Master, MasterBuilder, ResourceSpec, WorkerNode};
