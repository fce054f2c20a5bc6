//! Catalog search over the JSON API: request shape and response parsing.

use chrono::{DateTime, TimeZone, Utc};
use serde_json::Value as JsonValue;
use thiserror::Error;
use trendscout_core::{CatalogCandidate, CatalogStats};
use trendscout_storage::RequestDescriptor;

pub const DEFAULT_SEARCH_URL: &str = "https://makerworld.com/api/search/models";
pub const DEFAULT_SITE_URL: &str = "https://makerworld.com";
pub const DEFAULT_PAGE_SIZE: u32 = 5;
pub const DEFAULT_SORT: &str = "hot";

#[derive(Debug, Error)]
pub enum CatalogParseError {
    #[error("response is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("response has no data.list array")]
    MissingList,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedSearch {
    pub candidates: Vec<CatalogCandidate>,
    /// List items dropped for lacking a title or identifier.
    pub skipped: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogSearch {
    pub search_url: String,
    pub site_url: String,
    pub page_size: u32,
    pub sort: String,
}

impl Default for CatalogSearch {
    fn default() -> Self {
        Self {
            search_url: DEFAULT_SEARCH_URL.to_string(),
            site_url: DEFAULT_SITE_URL.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
            sort: DEFAULT_SORT.to_string(),
        }
    }
}

impl CatalogSearch {
    /// One search page for `query`: `{keyword, page, pageSize, sort}`.
    pub fn request_for(&self, query: &str) -> RequestDescriptor {
        RequestDescriptor::get(self.search_url.clone())
            .query("keyword", query)
            .query("page", 1)
            .query("pageSize", self.page_size)
            .query("sort", &self.sort)
            .header("Accept", "application/json")
    }

    pub fn model_url(&self, slug: &str) -> String {
        format!("{}/en/models/{}", self.site_url.trim_end_matches('/'), slug)
    }

    /// Parse a `{ data: { list: [...] } }` search payload.
    pub fn parse_response(&self, body: &[u8]) -> Result<ParsedSearch, CatalogParseError> {
        let value: JsonValue = serde_json::from_slice(body)?;
        let list = value
            .get("data")
            .and_then(|data| data.get("list"))
            .and_then(JsonValue::as_array)
            .ok_or(CatalogParseError::MissingList)?;

        let mut parsed = ParsedSearch {
            candidates: Vec::with_capacity(list.len()),
            skipped: 0,
        };
        for raw in list {
            match self.candidate_from_item(raw) {
                Some(candidate) => parsed.candidates.push(candidate),
                None => parsed.skipped += 1,
            }
        }
        Ok(parsed)
    }

    /// Only a title and an identifier are required; every other field is best effort.
    fn candidate_from_item(&self, raw: &JsonValue) -> Option<CatalogCandidate> {
        let title = raw.get("title").and_then(text_of)?;
        let slug = raw.get("slug").and_then(text_of);
        let model_id = raw
            .get("id")
            .and_then(scalar_text)
            .or_else(|| slug.clone())?;
        let url = self.model_url(slug.as_deref().unwrap_or(&model_id));

        let creator = raw
            .get("designCreator")
            .and_then(name_of)
            .or_else(|| raw.get("creator").and_then(name_of))
            .unwrap_or_default();
        let tags: Vec<String> = raw
            .get("tags")
            .and_then(JsonValue::as_array)
            .map(|tags| tags.iter().filter_map(name_of).collect())
            .unwrap_or_default();

        Some(CatalogCandidate {
            model_id,
            url,
            title,
            description: first_field(raw, &["description", "summary"])
                .and_then(text_of)
                .unwrap_or_default(),
            creator,
            license: raw.get("license").and_then(text_of).unwrap_or_default(),
            tags,
            stats: CatalogStats {
                likes: count_of(raw, "likeCount"),
                downloads: count_of(raw, "downloadCount"),
                prints: count_of(raw, "printCount"),
                collections: count_of(raw, "collectionCount"),
            },
            published_at: first_field(raw, &["createTime", "publishTime"])
                .and_then(parse_timestamp),
            raw: Some(raw.clone()),
        })
    }
}

fn first_field<'a>(raw: &'a JsonValue, keys: &[&str]) -> Option<&'a JsonValue> {
    keys.iter()
        .filter_map(|key| raw.get(*key))
        .find(|value| !value.is_null())
}

fn text_of(value: &JsonValue) -> Option<String> {
    value
        .as_str()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// Non-negative integer counts; floats are truncated, anything else is zero.
fn count_of(raw: &JsonValue, key: &str) -> u64 {
    let Some(value) = raw.get(key) else {
        return 0;
    };
    value
        .as_u64()
        .or_else(|| {
            value
                .as_f64()
                .filter(|f| f.is_finite() && *f >= 0.0)
                .map(|f| f as u64)
        })
        .or_else(|| value.as_str().and_then(|s| s.trim().parse().ok()))
        .unwrap_or_default()
}

fn scalar_text(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Plain strings, or objects carrying a `name`.
fn name_of(value: &JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        JsonValue::Object(map) => map.get("name").and_then(name_of),
        _ => None,
    }
}

/// RFC 3339 strings or epoch milliseconds.
fn parse_timestamp(value: &JsonValue) -> Option<DateTime<Utc>> {
    match value {
        JsonValue::String(s) => DateTime::parse_from_rfc3339(s)
            .ok()
            .map(|dt| dt.with_timezone(&Utc)),
        JsonValue::Number(n) => n
            .as_i64()
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_body() -> Vec<u8> {
        serde_json::to_vec(&json!({
            "code": 0,
            "data": {
                "total": 4,
                "list": [
                    {
                        "id": 123456,
                        "slug": "123456-infinity-cube-fidget",
                        "title": "Infinity Cube Fidget",
                        "summary": "Print-in-place folding cube.",
                        "designCreator": {"name": "cubeworks"},
                        "license": "Standard Digital File License",
                        "tags": ["fidget", {"name": "toy"}],
                        "likeCount": 1200,
                        "downloadCount": 5400,
                        "printCount": 800,
                        "collectionCount": 300,
                        "createTime": "2025-12-01T10:00:00Z"
                    },
                    {
                        "slug": "flexi-rex",
                        "title": "  Flexi Rex  ",
                        "creator": "dino-maker",
                        "createTime": 1767225600000i64
                    },
                    {"id": 99, "title": ""},
                    {"title": "No identifier"}
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn request_carries_search_parameters() {
        let search = CatalogSearch::default();
        let request = search.request_for("fidget toy");
        assert_eq!(request.url, DEFAULT_SEARCH_URL);
        assert_eq!(
            request.query,
            vec![
                ("keyword".to_string(), "fidget toy".to_string()),
                ("page".to_string(), "1".to_string()),
                ("pageSize".to_string(), "5".to_string()),
                ("sort".to_string(), "hot".to_string()),
            ]
        );
        assert_ne!(
            request.fingerprint(),
            search.request_for("desk toy").fingerprint()
        );
    }

    #[test]
    fn parses_list_items_into_candidates() {
        let parsed = CatalogSearch::default().parse_response(&sample_body()).unwrap();
        assert_eq!(parsed.candidates.len(), 2);
        assert_eq!(parsed.skipped, 2);

        let cube = &parsed.candidates[0];
        assert_eq!(cube.model_id, "123456");
        assert_eq!(
            cube.url,
            "https://makerworld.com/en/models/123456-infinity-cube-fidget"
        );
        assert_eq!(cube.description, "Print-in-place folding cube.");
        assert_eq!(cube.creator, "cubeworks");
        assert_eq!(cube.tags, vec!["fidget".to_string(), "toy".to_string()]);
        assert_eq!(cube.stats.downloads, 5400);
        assert_eq!(
            cube.published_at,
            Some(Utc.with_ymd_and_hms(2025, 12, 1, 10, 0, 0).single().unwrap())
        );
        assert!(cube.raw.is_some());

        let rex = &parsed.candidates[1];
        assert_eq!(rex.model_id, "flexi-rex");
        assert_eq!(rex.title, "Flexi Rex");
        assert_eq!(rex.creator, "dino-maker");
        assert_eq!(rex.stats, CatalogStats::default());
        assert_eq!(
            rex.published_at,
            Some(Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).single().unwrap())
        );
    }

    #[test]
    fn malformed_payloads_are_errors() {
        let search = CatalogSearch::default();
        assert!(matches!(
            search.parse_response(b"<html>blocked</html>"),
            Err(CatalogParseError::Json(_))
        ));
        assert!(matches!(
            search.parse_response(br#"{"error": "rate limited"}"#),
            Err(CatalogParseError::MissingList)
        ));
    }

    #[test]
    fn empty_list_is_not_an_error() {
        let parsed = CatalogSearch::default()
            .parse_response(br#"{"data": {"list": []}}"#)
            .unwrap();
        assert!(parsed.candidates.is_empty());
        assert_eq!(parsed.skipped, 0);
    }

    #[test]
    fn loosely_typed_optional_fields_keep_the_item() {
        let body = serde_json::to_vec(&json!({
            "data": {"list": [
                {"id": 1, "slug": "null-tags", "title": "Null Tags", "tags": null},
                {"id": 2, "slug": "float-counts", "title": "Float Counts",
                 "likeCount": 12.0, "downloadCount": "40", "printCount": -3},
                {"id": 3, "slug": "odd-types", "title": "Odd Types",
                 "license": 7, "summary": null, "tags": "fidget", "createTime": {}}
            ]}
        }))
        .unwrap();

        let parsed = CatalogSearch::default().parse_response(&body).unwrap();
        assert_eq!(parsed.skipped, 0);
        let ids: Vec<_> = parsed.candidates.iter().map(|c| c.model_id.as_str()).collect();
        assert_eq!(ids, vec!["1", "2", "3"]);

        assert!(parsed.candidates[0].tags.is_empty());
        let counts = &parsed.candidates[1].stats;
        assert_eq!(counts.likes, 12);
        assert_eq!(counts.downloads, 40);
        assert_eq!(counts.prints, 0);
        let odd = &parsed.candidates[2];
        assert_eq!(odd.license, "");
        assert!(odd.tags.is_empty());
        assert_eq!(odd.published_at, None);
    }

    #[test]
    fn slug_whitespace_is_trimmed_before_building_the_url() {
        let parsed = CatalogSearch::default()
            .parse_response(br#"{"data": {"list": [{"slug": "  flexi-rex ", "title": "Rex"}]}}"#)
            .unwrap();
        let rex = &parsed.candidates[0];
        assert_eq!(rex.model_id, "flexi-rex");
        assert_eq!(rex.url, "https://makerworld.com/en/models/flexi-rex");
    }

    #[test]
    fn site_url_trailing_slash_is_ignored() {
        let search = CatalogSearch {
            site_url: "https://makerworld.com/".into(),
            ..Default::default()
        };
        assert_eq!(search.model_url("abc"), "https://makerworld.com/en/models/abc");
    }
}
