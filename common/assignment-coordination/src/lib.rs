//! Shared etcd building blocks for processes that divide partitions between
//! themselves: a prefixed store with conditional writes, lease
//! keepalive, identifier validation and retry backoff.

pub mod error;
pub mod store;
pub mod util;
