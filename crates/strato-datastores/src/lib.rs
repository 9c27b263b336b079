//! Storage, cache and database provisioners
//!
//! Each provisioner wires a subnet group, a security group and the managed
//! service resource together, and returns connection details as deferred
//! values for downstream wiring.

pub mod cache;
pub mod database;
pub mod object_storage;

pub use cache::{CacheClusterProvisioner, CacheConfig, CacheDetails};
pub use database::{DatabaseClusterProvisioner, DatabaseConfig, DatabaseDetails};
pub use object_storage::{BucketDetails, ObjectStorageConfig, ObjectStorageProvisioner};
