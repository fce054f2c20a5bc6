//! Trend source contracts and the catalog search adapter.

mod catalog;
mod trends;

pub use catalog::{
    CatalogParseError, CatalogSearch, ParsedSearch, DEFAULT_PAGE_SIZE, DEFAULT_SEARCH_URL,
    DEFAULT_SITE_URL, DEFAULT_SORT,
};
pub use trends::{
    load_trend_fixture, AdapterError, FileTrendSource, RawTrend, StaticTrendSource, TrendSource,
    SEED_TRENDS,
};

pub const CRATE_NAME: &str = "trendscout-adapters";
