//! Type-preserving serialization codec for Poto.
//!
//! Converts rich value graphs ([`Value`]) to a self-describing JSON
//! envelope and back, preserving semantics for dates, regular expressions,
//! big integers, maps and sets, binary buffers, errors, URLs, and shared or
//! cyclic object graphs. Receivers that do not need rich types can still
//! parse the envelope as ordinary JSON.

pub mod decode;
pub mod encode;
pub mod error;
pub mod tags;
pub mod value;

use serde_json::Value as Json;

pub use error::CodecError;
pub use tags::{is_type_preserved, RESERVED_TAGS};
pub use value::{
    BlobSource, BlobValue, Composite, DataViewValue, DateValue, ElementKind, ErrorValue, Handle,
    MemoryBlob, RegExpValue, TypedArrayValue, Value,
};

/// Resource ceilings enforced by both directions of the codec.
#[derive(Debug, Clone)]
pub struct CodecLimits {
    /// Maximum nesting depth for encode and decode.
    pub max_depth: usize,
    /// Maximum string length in bytes, enforced at encode time.
    pub max_string_len: usize,
    /// Maximum byte length for buffers and blobs, validated before
    /// allocating backing storage on decode.
    pub max_blob_bytes: usize,
}

impl Default for CodecLimits {
    fn default() -> Self {
        Self {
            max_depth: 20,
            max_string_len: 10 * 1024 * 1024,
            max_blob_bytes: 50 * 1024 * 1024,
        }
    }
}

/// The bidirectional codec. Cheap to clone; carries only limits.
#[derive(Debug, Clone, Default)]
pub struct Codec {
    limits: CodecLimits,
}

impl Codec {
    pub fn new(limits: CodecLimits) -> Self {
        Self { limits }
    }

    pub fn limits(&self) -> &CodecLimits {
        &self.limits
    }

    /// Encode a value graph synchronously. Fails with
    /// [`CodecError::NeedsAsync`] if the graph contains a blob.
    pub fn encode(&self, value: &Value) -> Result<Json, CodecError> {
        encode::Encoder::sync(&self.limits).encode(value)
    }

    /// Encode a value graph, reading blob bytes asynchronously first.
    pub async fn encode_async(&self, value: &Value) -> Result<Json, CodecError> {
        let blobs = encode::collect_blob_bytes(value, &self.limits).await?;
        encode::Encoder::with_blobs(&self.limits, blobs).encode(value)
    }

    /// Encode straight to the envelope text.
    pub fn encode_to_string(&self, value: &Value) -> Result<String, CodecError> {
        let json = self.encode(value)?;
        serde_json::to_string(&json).map_err(|e| CodecError::Json(e.to_string()))
    }

    /// Encode straight to the envelope text, reading blobs asynchronously.
    pub async fn encode_to_string_async(&self, value: &Value) -> Result<String, CodecError> {
        let json = self.encode_async(value).await?;
        serde_json::to_string(&json).map_err(|e| CodecError::Json(e.to_string()))
    }

    /// Decode a parsed envelope. Always synchronous; blob bytes are
    /// produced eagerly.
    pub fn decode(&self, json: &Json) -> Result<Value, CodecError> {
        decode::Decoder::new(&self.limits).decode(json)
    }

    /// Parse and decode an envelope from text.
    pub fn decode_str(&self, text: &str) -> Result<Value, CodecError> {
        let json: Json = serde_json::from_str(text).map_err(|e| CodecError::Json(e.to_string()))?;
        self.decode(&json)
    }

    /// Whether a parsed JSON tree uses the tag vocabulary anywhere within
    /// the configured depth.
    pub fn is_type_preserved(&self, json: &Json) -> bool {
        tags::is_type_preserved(json, self.limits.max_depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use num_bigint::BigInt;
    use serde_json::json;

    fn roundtrip(v: &Value) -> Value {
        let codec = Codec::default();
        let json = codec.encode(v).unwrap();
        codec.decode(&json).unwrap()
    }

    #[test]
    fn scalars_round_trip() {
        for v in [
            Value::Null,
            Value::Undefined,
            Value::Bool(true),
            Value::Bool(false),
            Value::int(42),
            Value::Number(0.5),
            Value::string("hello"),
        ] {
            assert!(roundtrip(&v).deep_eq(&v), "{v:?}");
        }
    }

    #[test]
    fn special_numbers_round_trip() {
        for n in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY, -0.0, 1e300] {
            let v = Value::Number(n);
            assert!(roundtrip(&v).deep_eq(&v), "{n}");
        }
        // Beyond the safe integer range the value is tagged, not truncated.
        let codec = Codec::default();
        let json = codec.encode(&Value::Number(1e300)).unwrap();
        assert!(json.get(tags::TAG_NUMBER).is_some());
    }

    #[test]
    fn plain_integers_stay_bare() {
        let codec = Codec::default();
        let json = codec.encode(&Value::int(42)).unwrap();
        assert_eq!(json, json!(42));
    }

    #[test]
    fn rich_scalar_graph_round_trips() {
        // The seed scenario: every type survives one envelope.
        let date = chrono::Utc.with_ymd_and_hms(2023, 1, 1, 0, 0, 0).unwrap();
        let big = BigInt::from(2).pow(64);
        let v = Value::object([
            ("a", Value::int(1)),
            ("date", Value::date(date)),
            ("regex", Value::regexp("x", "gi")),
            (
                "map",
                Value::map(vec![(Value::string("k"), Value::string("v"))]),
            ),
            (
                "set",
                Value::set(vec![Value::int(1), Value::int(2), Value::int(3)]),
            ),
            ("big", Value::BigInt(big.clone())),
            ("bad", Value::Number(f64::NAN)),
        ]);

        let decoded = roundtrip(&v);
        assert!(decoded.deep_eq(&v));
        assert_eq!(
            decoded.get("map").unwrap().map_get(&Value::string("k")).unwrap().as_str(),
            Some("v")
        );
        assert_eq!(decoded.get("big").unwrap().as_bigint(), Some(&big));
        assert!(decoded.get("bad").unwrap().as_f64().unwrap().is_nan());
        assert!(decoded.get("set").unwrap().set_has(&Value::int(2)));
    }

    #[test]
    fn cycle_round_trips_with_identity() {
        // a.next = b; b.next = a
        let a = Value::object([("name", Value::string("A"))]);
        let b = Value::object([("name", Value::string("B"))]);
        if let Composite::Object(map) = &mut *a.as_handle().unwrap().write() {
            map.insert("next".into(), b.clone());
        }
        if let Composite::Object(map) = &mut *b.as_handle().unwrap().write() {
            map.insert("next".into(), a.clone());
        }

        let decoded = roundtrip(&a);
        let next = decoded.get("next").unwrap();
        let back = next.get("next").unwrap();
        assert!(back.as_handle().unwrap().ptr_eq(decoded.as_handle().unwrap()));
        assert_eq!(next.get("name").unwrap().as_str(), Some("B"));
    }

    #[test]
    fn shared_identity_emits_one_encoding_and_refs() {
        let shared = Value::object([("tag", Value::string("shared"))]);
        let root = Value::array(vec![shared.clone(), shared.clone(), shared.clone()]);

        let codec = Codec::default();
        let json = codec.encode(&root).unwrap();
        let text = serde_json::to_string(&json).unwrap();
        // One full encoding plus k-1 citations.
        assert_eq!(text.matches("shared").count(), 1);
        assert_eq!(text.matches("__ref\"").count(), 2);

        let decoded = codec.decode(&json).unwrap();
        let first = decoded.at(0).unwrap();
        let second = decoded.at(1).unwrap();
        assert!(first.as_handle().unwrap().ptr_eq(second.as_handle().unwrap()));
    }

    #[test]
    fn key_order_is_preserved() {
        let v = Value::object([
            ("zebra", Value::int(1)),
            ("alpha", Value::int(2)),
            ("mid", Value::object([("z", Value::int(3)), ("a", Value::int(4))])),
        ]);
        let decoded = roundtrip(&v);
        let handle = decoded.as_handle().unwrap();
        let keys: Vec<String> = match &*handle.read() {
            Composite::Object(map) => map.keys().cloned().collect(),
            _ => panic!("expected object"),
        };
        assert_eq!(keys, ["zebra", "alpha", "mid"]);
        let inner = decoded.get("mid").unwrap();
        let inner_keys: Vec<String> = match &*inner.as_handle().unwrap().read() {
            Composite::Object(map) => map.keys().cloned().collect(),
            _ => panic!("expected object"),
        };
        assert_eq!(inner_keys, ["z", "a"]);
    }

    #[test]
    fn depth_guard_fires() {
        let mut v = Value::int(0);
        for _ in 0..30 {
            v = Value::array(vec![v]);
        }
        let codec = Codec::default();
        match codec.encode(&v) {
            Err(CodecError::Depth { max }) => assert_eq!(max, 20),
            other => panic!("expected depth error, got {other:?}"),
        }
    }

    #[test]
    fn string_ceiling_fires_at_encode_time() {
        let codec = Codec::new(CodecLimits {
            max_string_len: 8,
            ..CodecLimits::default()
        });
        let err = codec.encode(&Value::string("way past the limit")).unwrap_err();
        assert!(matches!(err, CodecError::SizeLimit { what: "string", .. }));
    }

    #[test]
    fn binary_ceiling_checked_before_decode_allocates() {
        let codec = Codec::new(CodecLimits {
            max_blob_bytes: 4,
            ..CodecLimits::default()
        });
        let json = json!({ "__arraybuffer": "AAAAAAAAAAAAAAAA" });
        let err = codec.decode(&json).unwrap_err();
        assert!(matches!(err, CodecError::SizeLimit { .. }));
    }

    #[test]
    fn sync_encode_refuses_blobs() {
        let codec = Codec::default();
        let v = Value::blob("text/plain", b"hello".to_vec());
        assert!(matches!(codec.encode(&v), Err(CodecError::NeedsAsync)));
    }

    #[tokio::test]
    async fn async_encode_carries_blob_bytes() {
        let codec = Codec::default();
        let v = Value::object([("file", Value::blob("text/plain", b"hello".to_vec()))]);
        let json = codec.encode_async(&v).await.unwrap();
        let decoded = codec.decode(&json).unwrap();
        match decoded.get("file").unwrap() {
            Value::Blob(blob) => {
                assert_eq!(blob.media_type, "text/plain");
                assert_eq!(blob.size, 5);
                assert_eq!(blob.source.read().await.unwrap(), b"hello");
            }
            other => panic!("expected blob, got {other:?}"),
        }
    }

    #[test]
    fn typed_array_resets_offset_on_decode() {
        let codec = Codec::default();
        let mut view = TypedArrayValue::new(ElementKind::Int32, vec![1, 0, 0, 0, 2, 0, 0, 0]);
        view.source_offset = 8;
        let json = codec.encode(&Value::TypedArray(view)).unwrap();
        match codec.decode(&json).unwrap() {
            Value::TypedArray(decoded) => {
                assert_eq!(decoded.source_offset, 0);
                assert_eq!(decoded.kind, ElementKind::Int32);
                assert_eq!(decoded.bytes, vec![1, 0, 0, 0, 2, 0, 0, 0]);
            }
            other => panic!("expected typed array, got {other:?}"),
        }
    }

    #[test]
    fn error_values_round_trip_with_cause() {
        let mut inner = ErrorValue::new("TypeError", "inner cause");
        inner.code = Some("E_INNER".into());
        let mut outer = ErrorValue::new("Error", "outer failure");
        outer.stack = Some("at main".into());
        outer.cause = Some(Value::Error(Box::new(inner)));
        let v = Value::Error(Box::new(outer));
        let decoded = roundtrip(&v);
        assert!(decoded.deep_eq(&v));
    }

    #[test]
    fn reserved_user_keys_are_wrapped_as_map() {
        let codec = Codec::default();
        let v = Value::object([("__date", Value::string("not a date"))]);
        let json = codec.encode(&v).unwrap();
        assert!(json.get(tags::TAG_MAP).is_some());
        let decoded = codec.decode(&json).unwrap();
        assert_eq!(
            decoded.map_get(&Value::string("__date")).unwrap().as_str(),
            Some("not a date")
        );
    }

    #[test]
    fn malformed_and_unknown_tags_are_rejected() {
        let codec = Codec::default();
        assert!(matches!(
            codec.decode(&json!({"__bogus": 1})),
            Err(CodecError::UnknownTag(_))
        ));
        assert!(matches!(
            codec.decode(&json!({"__date": 17})),
            Err(CodecError::MalformedTag(_))
        ));
        assert!(matches!(
            codec.decode(&json!({"__date": "x", "__set": []})),
            Err(CodecError::MalformedTag(_))
        ));
        assert!(matches!(
            codec.decode(&json!({"__circular_ref": true})),
            Err(CodecError::MalformedTag(_))
        ));
        assert!(matches!(
            codec.decode(&json!({"__arraybuffer": "!!!not base64!!!"})),
            Err(CodecError::BadBase64(_))
        ));
    }

    #[test]
    fn invalid_date_sentinel_round_trips() {
        let v = Value::invalid_date();
        assert!(roundtrip(&v).deep_eq(&v));
    }

    #[test]
    fn url_round_trips() {
        let v = Value::Url(url::Url::parse("https://example.com/a?b=c").unwrap());
        assert!(roundtrip(&v).deep_eq(&v));
    }

    #[test]
    fn undefined_is_distinct_from_null() {
        let codec = Codec::default();
        let json = codec.encode(&Value::Undefined).unwrap();
        assert_eq!(json, json!({"__undefined": true}));
        assert!(matches!(codec.decode(&json).unwrap(), Value::Undefined));
        assert!(matches!(codec.decode(&json!(null)).unwrap(), Value::Null));
    }

    #[test]
    fn forward_reference_decodes_via_second_pass() {
        // Hand-built envelope citing a shell that appears later.
        let json = json!({
            "__refId": 0,
            "first": {"__ref": 2},
            "second": {"__refId": 2, "name": "target"}
        });
        let codec = Codec::default();
        let decoded = codec.decode(&json).unwrap();
        let first = decoded.get("first").unwrap();
        let second = decoded.get("second").unwrap();
        assert!(first.as_handle().unwrap().ptr_eq(second.as_handle().unwrap()));
    }
}
