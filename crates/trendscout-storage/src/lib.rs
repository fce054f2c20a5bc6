//! Persistence, HTTP fetch utilities, and the shared response cache for trendscout.

mod cache;
mod db;
mod http;

pub use cache::{CacheError, CacheStore, CachedResponse};
pub use db::{Database, RunRowCounts};
pub use http::{
    sha256_hex, Fetch, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher,
    RequestDescriptor, RequestPacer, RetryPolicy,
};

pub const CRATE_NAME: &str = "trendscout-storage";
