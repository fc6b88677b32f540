//! The reserved tag vocabulary of the wire envelope.
//!
//! Every tagged value is a JSON object carrying exactly one key from
//! [`RESERVED_TAGS`]. Composite forms additionally carry a [`REF_ID_KEY`]
//! sibling holding their dense reference id.

use serde_json::Value as Json;

/// Tag key discriminating an encoded date.
pub const TAG_DATE: &str = "__date";
/// Tag key discriminating an encoded regular expression.
pub const TAG_REGEXP: &str = "__regexp";
/// Tag key discriminating an encoded keyed mapping.
pub const TAG_MAP: &str = "__map";
/// Tag key discriminating an encoded uniqueness set.
pub const TAG_SET: &str = "__set";
/// Tag key discriminating an arbitrary-precision integer.
pub const TAG_BIGINT: &str = "__bigint";
/// Tag key discriminating a non-plain numeric value.
pub const TAG_NUMBER: &str = "__number";
/// Wrap form for booleans; emitted bare, accepted on decode.
pub const TAG_BOOLEAN: &str = "__boolean";
/// Wrap form for strings; emitted bare, accepted on decode.
pub const TAG_STRING: &str = "__string";
/// Wrap form for null; emitted bare, accepted on decode.
pub const TAG_NULL: &str = "__null";
/// Tag key discriminating the "absent" marker (distinct from null).
pub const TAG_UNDEFINED: &str = "__undefined";
/// Tag key discriminating an opaque byte blob with media type.
pub const TAG_BLOB: &str = "__blob";
/// Tag key discriminating a raw byte buffer.
pub const TAG_ARRAYBUFFER: &str = "__arraybuffer";
/// Tag key discriminating a typed numeric array view.
pub const TAG_TYPEDARRAY: &str = "__typedarray";
/// Tag key discriminating an aligned buffer view.
pub const TAG_DATAVIEW: &str = "__dataview";
/// Tag key discriminating an error value.
pub const TAG_ERROR: &str = "__error";
/// Tag key discriminating a URL value.
pub const TAG_URL: &str = "__url";
/// Tag key citing a previously emitted reference id.
pub const TAG_REF: &str = "__ref";
/// Legacy placeholder with no back-reference; refused on decode.
pub const TAG_CIRCULAR_REF: &str = "__circular_ref";
/// Tag key discriminating an ordered sequence with identity.
pub const TAG_ARRAY: &str = "__array";

/// Sibling key carrying the dense reference id of a composite form.
pub const REF_ID_KEY: &str = "__refId";

/// The full reserved tag vocabulary.
pub const RESERVED_TAGS: &[&str] = &[
    TAG_DATE,
    TAG_REGEXP,
    TAG_MAP,
    TAG_SET,
    TAG_BIGINT,
    TAG_NUMBER,
    TAG_BOOLEAN,
    TAG_STRING,
    TAG_NULL,
    TAG_UNDEFINED,
    TAG_BLOB,
    TAG_ARRAYBUFFER,
    TAG_TYPEDARRAY,
    TAG_DATAVIEW,
    TAG_ERROR,
    TAG_URL,
    TAG_REF,
    TAG_CIRCULAR_REF,
    TAG_ARRAY,
];

/// Whether `key` belongs to the reserved tag vocabulary.
pub fn is_reserved(key: &str) -> bool {
    RESERVED_TAGS.contains(&key)
}

/// Decide, in bounded time, whether a parsed JSON tree uses the tag
/// vocabulary anywhere within `max_depth` levels.
///
/// True if the root or any descendant object has a key intersecting the
/// reserved set (or a `__refId` sibling). Nodes below the depth limit are
/// not examined.
pub fn is_type_preserved(root: &Json, max_depth: usize) -> bool {
    scan(root, 0, max_depth)
}

fn scan(node: &Json, depth: usize, max_depth: usize) -> bool {
    if depth > max_depth {
        return false;
    }
    match node {
        Json::Object(map) => {
            if map.keys().any(|k| k == REF_ID_KEY || is_reserved(k)) {
                return true;
            }
            map.values().any(|v| scan(v, depth + 1, max_depth))
        }
        Json::Array(items) => items.iter().any(|v| scan(v, depth + 1, max_depth)),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn plain_json_is_not_type_preserved() {
        let v = json!({"a": 1, "b": [true, null, "x"]});
        assert!(!is_type_preserved(&v, 20));
    }

    #[test]
    fn tagged_root_is_detected() {
        let v = json!({"__date": "2023-01-01T00:00:00.000Z"});
        assert!(is_type_preserved(&v, 20));
    }

    #[test]
    fn nested_tag_is_detected() {
        let v = json!({"outer": {"inner": [{"__bigint": "1"}]}});
        assert!(is_type_preserved(&v, 20));
    }

    #[test]
    fn ref_id_sibling_is_detected() {
        let v = json!({"__refId": 0, "name": "A"});
        assert!(is_type_preserved(&v, 20));
    }

    #[test]
    fn depth_limit_bounds_the_scan() {
        let v = json!({"a": {"b": {"c": {"__set": []}}}});
        assert!(is_type_preserved(&v, 20));
        assert!(!is_type_preserved(&v, 2));
    }
}
