use sha2::{Digest, Sha256};

pub mod http;
pub mod mapping;
pub mod memory;
pub mod postgres;
pub mod robots;

pub use http::{
    BackoffPolicy, FetchError, FetchedPage, HttpClientConfig, HttpFetcher, DEFAULT_USER_AGENT,
};
pub use memory::{AuditEntry, MemoryImporter};
pub use postgres::PgImporter;
pub use robots::RobotsPolicy;

pub const CRATE_NAME: &str = "grantscout-storage";

/// Lowercase hex SHA-256 of raw content.
pub fn content_hash(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
