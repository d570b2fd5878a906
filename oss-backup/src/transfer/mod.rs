//! Everything between a finished local artifact and the bucket.

pub mod ip;
pub mod key;
pub mod stats;
pub mod store;

pub use ip::{HttpIpResolver, IpLookup, IpResolver};
pub use key::{build_prefix, object_key, Timestamp};
pub use stats::{format_bytes, CompressionStats};
pub use store::{BucketStore, ObjectStore};
