//! Provider response normalization
//!
//! Remote providers answer with arbitrary JSON. These pure functions pull the
//! downloadable outputs and pagination hints out of it by matching a small set
//! of recognized shapes in a fixed priority order.

use crate::error::{AssetError, AssetResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Default cap on nested container unwrapping
pub const DEFAULT_MAX_DEPTH: usize = 32;

/// Keys holding the path of an output object, by priority
const PATH_KEYS: [&str; 5] = ["url", "uri", "download_url", "response_url", "path"];

/// Keys holding the MIME type of an output object, by priority
const MIME_KEYS: [&str; 2] = ["mime_type", "mimeType"];

/// Container keys unwrapped when the response is an object, by priority
const CONTAINER_KEYS: [&str; 10] = [
    "outputs",
    "output",
    "images",
    "image",
    "videos",
    "video",
    "data",
    "response_url",
    "url",
    "download_url",
];

/// Keys holding a list of model candidates, by priority
const CANDIDATE_KEYS: [&str; 3] = ["models", "results", "data"];

/// One downloadable output referenced by a provider response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderOutputArtifact {
    pub provider_path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

impl ProviderOutputArtifact {
    pub fn new(provider_path: impl Into<String>) -> Self {
        Self {
            provider_path: provider_path.into(),
            mime_type: None,
        }
    }

    pub fn with_mime_type(mut self, mime_type: impl Into<String>) -> Self {
        self.mime_type = Some(mime_type.into());
        self
    }
}

/// Shapes recognized at the top of a (sub)response
enum OutputShape<'a> {
    Path(&'a str),
    List(&'a [Value]),
    Container(&'a Value),
    Unrecognized,
}

impl<'a> OutputShape<'a> {
    fn of(value: &'a Value) -> Self {
        match value {
            Value::String(s) => Self::Path(s),
            Value::Array(items) => Self::List(items),
            Value::Object(map) => CONTAINER_KEYS
                .iter()
                .find_map(|key| map.get(*key).filter(|v| !v.is_null()))
                .map(Self::Container)
                .unwrap_or(Self::Unrecognized),
            _ => Self::Unrecognized,
        }
    }
}

/// Resolve a dot-separated key path. An empty path returns `value` itself.
///
/// Objects are traversed by key and arrays by decimal index; any other value,
/// or a missing segment, yields `None`.
pub fn get_by_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    if path.is_empty() {
        return Some(value);
    }
    path.split('.').try_fold(value, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// List of model candidates: the value itself if it is a list, else the first
/// list found under `models`, `results` or `data`.
pub fn extract_model_candidates(value: &Value) -> &[Value] {
    if let Value::Array(items) = value {
        return items;
    }
    CANDIDATE_KEYS
        .iter()
        .find_map(|key| value.get(*key).and_then(Value::as_array))
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Pagination hint. `None` means the response carries no signal either way.
pub fn extract_has_more(value: &Value) -> Option<bool> {
    if let Some(has_more) = value.get("has_more").and_then(Value::as_bool) {
        return Some(has_more);
    }
    value
        .get("next")
        .and_then(Value::as_str)
        .map(|next| !next.trim().is_empty())
}

/// Normalize any provider response into artifacts.
///
/// Never fails: a response nested deeper than [`DEFAULT_MAX_DEPTH`] is logged
/// and treated as having no outputs.
pub fn normalize_outputs(value: &Value) -> Vec<ProviderOutputArtifact> {
    try_normalize_outputs(value, DEFAULT_MAX_DEPTH).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "Discarding provider response");
        Vec::new()
    })
}

/// Normalize with an explicit depth cap, reporting overly deep responses
pub fn try_normalize_outputs(
    value: &Value,
    max_depth: usize,
) -> AssetResult<Vec<ProviderOutputArtifact>> {
    let mut depth = 0;
    let mut current = value;

    loop {
        match OutputShape::of(current) {
            OutputShape::Path(path) => return Ok(path_artifact(path).into_iter().collect()),
            OutputShape::List(items) => return Ok(items.iter().filter_map(list_item).collect()),
            OutputShape::Container(inner) => {
                depth += 1;
                if depth > max_depth {
                    return Err(AssetError::MalformedProviderResponse(format!(
                        "outputs nested deeper than {} levels",
                        max_depth
                    )));
                }
                current = inner;
            }
            OutputShape::Unrecognized => return Ok(Vec::new()),
        }
    }
}

fn path_artifact(path: &str) -> Option<ProviderOutputArtifact> {
    let path = path.trim();
    (!path.is_empty()).then(|| ProviderOutputArtifact::new(path))
}

fn list_item(item: &Value) -> Option<ProviderOutputArtifact> {
    match item {
        Value::String(path) => path_artifact(path),
        Value::Object(map) => {
            let artifact = PATH_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str).and_then(path_artifact))?;
            let mime_type = MIME_KEYS
                .iter()
                .find_map(|key| map.get(*key).and_then(Value::as_str))
                .filter(|m| !m.trim().is_empty());
            Some(match mime_type {
                Some(mime) => artifact.with_mime_type(mime),
                None => artifact,
            })
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_get_by_path_empty_returns_input() {
        let value = json!({"a": 1});
        assert_eq!(get_by_path(&value, ""), Some(&value));
    }

    #[test]
    fn test_get_by_path_nested() {
        let value = json!({"a": {"b": {"c": "deep"}}});
        assert_eq!(get_by_path(&value, "a.b.c"), Some(&json!("deep")));
    }

    #[test]
    fn test_get_by_path_missing_segment() {
        let value = json!({"a": {"b": 1}});
        assert_eq!(get_by_path(&value, "a.x.c"), None);
        // Scalars are not traversable
        assert_eq!(get_by_path(&value, "a.b.c"), None);
    }

    #[test]
    fn test_get_by_path_array_index() {
        let value = json!({"images": [{"url": "a.png"}, {"url": "b.png"}]});
        assert_eq!(get_by_path(&value, "images.1.url"), Some(&json!("b.png")));
        assert_eq!(get_by_path(&value, "images.7.url"), None);
        assert_eq!(get_by_path(&value, "images.first"), None);
    }

    #[test]
    fn test_candidates_from_list() {
        let value = json!([{"id": 1}]);
        assert_eq!(extract_model_candidates(&value).len(), 1);
    }

    #[test]
    fn test_candidates_priority() {
        let value = json!({"data": [1, 2, 3], "results": [1, 2], "models": [1]});
        assert_eq!(extract_model_candidates(&value), &[json!(1)]);

        let value = json!({"data": [1, 2, 3], "results": [1, 2]});
        assert_eq!(extract_model_candidates(&value).len(), 2);
    }

    #[test]
    fn test_candidates_skip_non_lists() {
        let value = json!({"models": "nope", "data": [1]});
        assert_eq!(extract_model_candidates(&value), &[json!(1)]);
        assert!(extract_model_candidates(&json!({"foo": []})).is_empty());
        assert!(extract_model_candidates(&json!(42)).is_empty());
    }

    #[test]
    fn test_has_more() {
        assert_eq!(extract_has_more(&json!({"has_more": false})), Some(false));
        assert_eq!(extract_has_more(&json!({"has_more": true})), Some(true));
        assert_eq!(extract_has_more(&json!({"next": "   "})), Some(false));
        assert_eq!(extract_has_more(&json!({"next": "cursor-2"})), Some(true));
        assert_eq!(extract_has_more(&json!({})), None);
    }

    #[test]
    fn test_has_more_prefers_boolean() {
        let value = json!({"has_more": false, "next": "cursor"});
        assert_eq!(extract_has_more(&value), Some(false));
    }

    #[test]
    fn test_has_more_ignores_non_boolean_flag() {
        let value = json!({"has_more": "yes", "next": "cursor"});
        assert_eq!(extract_has_more(&value), Some(true));
        assert_eq!(extract_has_more(&json!({"next": null})), None);
    }

    #[test]
    fn test_normalize_string() {
        assert_eq!(
            normalize_outputs(&json!("https://x/y.png")),
            vec![ProviderOutputArtifact::new("https://x/y.png")]
        );
    }

    #[test]
    fn test_normalize_images_mixed() {
        let value = json!({"images": ["a.png", {"url": "b.png", "mime_type": "image/png"}]});
        assert_eq!(
            normalize_outputs(&value),
            vec![
                ProviderOutputArtifact::new("a.png"),
                ProviderOutputArtifact::new("b.png").with_mime_type("image/png"),
            ]
        );
    }

    #[test]
    fn test_normalize_unrecognized_object() {
        assert!(normalize_outputs(&json!({"foo": "bar"})).is_empty());
        assert!(normalize_outputs(&json!(12)).is_empty());
        assert!(normalize_outputs(&json!(null)).is_empty());
    }

    #[test]
    fn test_normalize_path_key_priority() {
        let value = json!([{"path": "p.png", "uri": "u.png", "download_url": "d.png"}]);
        assert_eq!(normalize_outputs(&value)[0].provider_path, "u.png");
    }

    #[test]
    fn test_normalize_camel_case_mime() {
        let value = json!([{"uri": "v.mp4", "mimeType": "video/mp4"}]);
        assert_eq!(
            normalize_outputs(&value)[0].mime_type.as_deref(),
            Some("video/mp4")
        );
    }

    #[test]
    fn test_normalize_drops_items_without_path() {
        let value = json!(["", {"mime_type": "image/png"}, 3, {"url": 5}, "ok.png"]);
        assert_eq!(
            normalize_outputs(&value),
            vec![ProviderOutputArtifact::new("ok.png")]
        );
    }

    #[test]
    fn test_normalize_container_priority() {
        let value = json!({"images": ["img.png"], "outputs": ["out.png"]});
        assert_eq!(normalize_outputs(&value)[0].provider_path, "out.png");
    }

    #[test]
    fn test_normalize_nested_containers() {
        let value = json!({"data": {"output": {"video": {"url": "https://x/v.mp4"}}}});
        assert_eq!(
            normalize_outputs(&value),
            vec![ProviderOutputArtifact::new("https://x/v.mp4")]
        );
    }

    #[test]
    fn test_normalize_skips_null_container() {
        let value = json!({"outputs": null, "response_url": "https://queue/r/1"});
        assert_eq!(normalize_outputs(&value)[0].provider_path, "https://queue/r/1");
    }

    #[test]
    fn test_depth_cap() {
        let mut value = json!("deep.png");
        for _ in 0..10 {
            value = json!({ "output": value });
        }
        assert_eq!(try_normalize_outputs(&value, 10).unwrap().len(), 1);
        assert!(matches!(
            try_normalize_outputs(&value, 9),
            Err(AssetError::MalformedProviderResponse(_))
        ));
    }

    #[test]
    fn test_too_deep_is_empty_when_infallible() {
        let mut value = json!("deep.png");
        for _ in 0..(DEFAULT_MAX_DEPTH + 1) {
            value = json!({ "data": value });
        }
        assert!(normalize_outputs(&value).is_empty());
    }
}
