//! Per-client adaptive candidate ordering (see `context`) and its TTL-keyed
//! pool (see `pool`).

pub mod context;
pub mod pool;

pub use context::{InsertStrategy, Node, UserContext};
pub use pool::UserContextPool;
