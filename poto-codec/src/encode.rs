//! Envelope encoding: value graph → tagged JSON.
//!
//! Every composite node receives a dense reference id on first encounter;
//! later encounters of the same identity emit `{"__ref": n}`. The
//! synchronous entry point refuses blob values; the asynchronous one
//! pre-reads blob bytes and then encodes synchronously.

use std::collections::HashMap;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::{json, Map as JsonMap, Value as Json};
use tracing::warn;

use crate::error::CodecError;
use crate::tags;
use crate::value::{BlobSource, Composite, ErrorValue, Value};
use crate::CodecLimits;

/// Largest integer exactly representable (and ordered) in a 64-bit float.
pub(crate) const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// Whether a number can be emitted as a bare JSON number losslessly.
fn is_plain_number(n: f64) -> bool {
    if !n.is_finite() {
        return false;
    }
    if n == 0.0 && n.is_sign_negative() {
        return false;
    }
    if n.fract() == 0.0 && n.abs() > MAX_SAFE_INTEGER {
        return false;
    }
    true
}

/// Canonical string form for a `__number` tag.
fn canonical_number(n: f64) -> String {
    if n.is_nan() {
        "NaN".to_string()
    } else if n == f64::INFINITY {
        "Infinity".to_string()
    } else if n == f64::NEG_INFINITY {
        "-Infinity".to_string()
    } else if n == 0.0 && n.is_sign_negative() {
        "-0".to_string()
    } else {
        format!("{n}")
    }
}

pub(crate) struct Encoder<'a> {
    limits: &'a CodecLimits,
    refs: HashMap<usize, u64>,
    next_ref: u64,
    /// Pre-read blob bytes keyed by source address; `None` means the
    /// synchronous path, which refuses blobs outright.
    blob_bytes: Option<HashMap<usize, Vec<u8>>>,
}

impl<'a> Encoder<'a> {
    pub(crate) fn sync(limits: &'a CodecLimits) -> Self {
        Self {
            limits,
            refs: HashMap::new(),
            next_ref: 0,
            blob_bytes: None,
        }
    }

    pub(crate) fn with_blobs(limits: &'a CodecLimits, blob_bytes: HashMap<usize, Vec<u8>>) -> Self {
        Self {
            limits,
            refs: HashMap::new(),
            next_ref: 0,
            blob_bytes: Some(blob_bytes),
        }
    }

    pub(crate) fn encode(&mut self, value: &Value) -> Result<Json, CodecError> {
        self.encode_inner(value, 0)
    }

    fn check_binary(&self, what: &'static str, len: usize) -> Result<(), CodecError> {
        if len > self.limits.max_blob_bytes {
            return Err(CodecError::SizeLimit {
                what,
                actual: len,
                max: self.limits.max_blob_bytes,
            });
        }
        Ok(())
    }

    fn check_string(&self, s: &str) -> Result<(), CodecError> {
        if s.len() > self.limits.max_string_len {
            return Err(CodecError::SizeLimit {
                what: "string",
                actual: s.len(),
                max: self.limits.max_string_len,
            });
        }
        Ok(())
    }

    fn encode_inner(&mut self, value: &Value, depth: usize) -> Result<Json, CodecError> {
        if depth > self.limits.max_depth {
            return Err(CodecError::Depth {
                max: self.limits.max_depth,
            });
        }

        match value {
            Value::Null => Ok(Json::Null),
            Value::Undefined => Ok(json!({ (tags::TAG_UNDEFINED): true })),
            Value::Bool(b) => Ok(Json::Bool(*b)),
            Value::Number(n) => Ok(self.encode_number(*n)),
            Value::BigInt(n) => Ok(json!({ (tags::TAG_BIGINT): n.to_string() })),
            Value::String(s) => {
                self.check_string(s)?;
                Ok(Json::String(s.clone()))
            }
            Value::Date(d) => Ok(json!({ (tags::TAG_DATE): d.to_wire() })),
            Value::RegExp(r) => Ok(json!({
                (tags::TAG_REGEXP): { "source": r.source, "flags": r.flags }
            })),
            Value::Url(u) => Ok(json!({ (tags::TAG_URL): u.as_str() })),
            Value::Error(e) => self.encode_error(e, depth),
            Value::Bytes(bytes) => {
                self.check_binary("byte buffer", bytes.len())?;
                Ok(json!({ (tags::TAG_ARRAYBUFFER): BASE64.encode(bytes) }))
            }
            Value::TypedArray(view) => {
                self.check_binary("typed array", view.bytes.len())?;
                if view.source_offset != 0 {
                    warn!(
                        offset = view.source_offset,
                        kind = view.kind.as_str(),
                        "encoding a typed array view with non-zero offset; \
                         the buffer-sharing relationship is not preserved"
                    );
                }
                Ok(json!({
                    (tags::TAG_TYPEDARRAY): {
                        "kind": view.kind.as_str(),
                        "data": BASE64.encode(&view.bytes),
                    }
                }))
            }
            Value::DataView(view) => {
                self.check_binary("data view", view.bytes.len())?;
                if view.source_offset != 0 {
                    warn!(
                        offset = view.source_offset,
                        "encoding a data view with non-zero offset; \
                         the buffer-sharing relationship is not preserved"
                    );
                }
                Ok(json!({
                    (tags::TAG_DATAVIEW): { "data": BASE64.encode(&view.bytes) }
                }))
            }
            Value::Blob(blob) => {
                let Some(blob_bytes) = &self.blob_bytes else {
                    return Err(CodecError::NeedsAsync);
                };
                let addr = Arc::as_ptr(&blob.source) as *const () as usize;
                let bytes = blob_bytes
                    .get(&addr)
                    .ok_or_else(|| CodecError::BlobRead("blob bytes not collected".into()))?;
                Ok(json!({
                    (tags::TAG_BLOB): {
                        "type": blob.media_type,
                        "size": bytes.len() as u64,
                        "data": BASE64.encode(bytes),
                    }
                }))
            }
            Value::Composite(handle) => {
                if let Some(&id) = self.refs.get(&handle.addr()) {
                    return Ok(json!({ (tags::TAG_REF): id }));
                }
                let id = self.next_ref;
                self.next_ref += 1;
                self.refs.insert(handle.addr(), id);

                let guard = handle.read();
                match &*guard {
                    Composite::Array(items) => {
                        let mut encoded = Vec::with_capacity(items.len());
                        for item in items {
                            encoded.push(self.encode_inner(item, depth + 1)?);
                        }
                        Ok(json!({ (tags::TAG_ARRAY): encoded, (tags::REF_ID_KEY): id }))
                    }
                    Composite::Object(map) => {
                        if map.keys().any(|k| tags::is_reserved(k) || k == tags::REF_ID_KEY) {
                            // Collision avoidance: reserved keys force the map form.
                            let mut entries = Vec::with_capacity(map.len());
                            for (k, v) in map {
                                self.check_string(k)?;
                                entries.push(Json::Array(vec![
                                    Json::String(k.clone()),
                                    self.encode_inner(v, depth + 1)?,
                                ]));
                            }
                            Ok(json!({ (tags::TAG_MAP): entries, (tags::REF_ID_KEY): id }))
                        } else {
                            let mut out = JsonMap::with_capacity(map.len() + 1);
                            out.insert(tags::REF_ID_KEY.to_string(), json!(id));
                            for (k, v) in map {
                                self.check_string(k)?;
                                out.insert(k.clone(), self.encode_inner(v, depth + 1)?);
                            }
                            Ok(Json::Object(out))
                        }
                    }
                    Composite::Map(map_entries) => {
                        let mut entries = Vec::with_capacity(map_entries.len());
                        for (k, v) in map_entries {
                            entries.push(Json::Array(vec![
                                self.encode_inner(k, depth + 1)?,
                                self.encode_inner(v, depth + 1)?,
                            ]));
                        }
                        Ok(json!({ (tags::TAG_MAP): entries, (tags::REF_ID_KEY): id }))
                    }
                    Composite::Set(items) => {
                        let mut encoded = Vec::with_capacity(items.len());
                        for item in items {
                            encoded.push(self.encode_inner(item, depth + 1)?);
                        }
                        Ok(json!({ (tags::TAG_SET): encoded, (tags::REF_ID_KEY): id }))
                    }
                }
            }
        }
    }

    fn encode_number(&self, n: f64) -> Json {
        if is_plain_number(n) {
            if n.fract() == 0.0 && n.abs() <= MAX_SAFE_INTEGER {
                json!(n as i64)
            } else {
                json!(n)
            }
        } else {
            json!({ (tags::TAG_NUMBER): canonical_number(n) })
        }
    }

    fn encode_error(&mut self, e: &ErrorValue, depth: usize) -> Result<Json, CodecError> {
        let mut body = JsonMap::new();
        body.insert("name".into(), Json::String(e.name.clone()));
        body.insert("message".into(), Json::String(e.message.clone()));
        if let Some(stack) = &e.stack {
            body.insert("stack".into(), Json::String(stack.clone()));
        }
        if let Some(code) = &e.code {
            body.insert("code".into(), Json::String(code.clone()));
        }
        if let Some(cause) = &e.cause {
            body.insert("cause".into(), self.encode_inner(cause, depth + 1)?);
        }
        Ok(json!({ (tags::TAG_ERROR): body }))
    }
}

/// Walk a value graph and read every blob's bytes, keyed by source address.
/// Cycle-safe: visited composites are skipped.
pub(crate) async fn collect_blob_bytes(
    root: &Value,
    limits: &CodecLimits,
) -> Result<HashMap<usize, Vec<u8>>, CodecError> {
    let mut sources: Vec<(usize, Arc<dyn BlobSource>)> = Vec::new();
    let mut visited = Vec::new();
    collect_sources(root, &mut sources, &mut visited);

    let mut out = HashMap::new();
    for (addr, source) in sources {
        if out.contains_key(&addr) {
            continue;
        }
        let declared = source.len() as usize;
        if declared > limits.max_blob_bytes {
            return Err(CodecError::SizeLimit {
                what: "blob",
                actual: declared,
                max: limits.max_blob_bytes,
            });
        }
        let bytes = source
            .read()
            .await
            .map_err(|e| CodecError::BlobRead(e.to_string()))?;
        if bytes.len() > limits.max_blob_bytes {
            return Err(CodecError::SizeLimit {
                what: "blob",
                actual: bytes.len(),
                max: limits.max_blob_bytes,
            });
        }
        out.insert(addr, bytes);
    }
    Ok(out)
}

fn collect_sources(
    value: &Value,
    out: &mut Vec<(usize, Arc<dyn BlobSource>)>,
    visited: &mut Vec<usize>,
) {
    match value {
        Value::Blob(blob) => {
            let addr = Arc::as_ptr(&blob.source) as *const () as usize;
            out.push((addr, Arc::clone(&blob.source)));
        }
        Value::Error(e) => {
            if let Some(cause) = &e.cause {
                collect_sources(cause, out, visited);
            }
        }
        Value::Composite(handle) => {
            if visited.contains(&handle.addr()) {
                return;
            }
            visited.push(handle.addr());
            match &*handle.read() {
                Composite::Array(items) | Composite::Set(items) => {
                    for item in items {
                        collect_sources(item, out, visited);
                    }
                }
                Composite::Object(map) => {
                    for v in map.values() {
                        collect_sources(v, out, visited);
                    }
                }
                Composite::Map(entries) => {
                    for (k, v) in entries {
                        collect_sources(k, out, visited);
                        collect_sources(v, out, visited);
                    }
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_number_policy() {
        assert!(is_plain_number(42.0));
        assert!(is_plain_number(0.5));
        assert!(is_plain_number(-3.25));
        assert!(is_plain_number(9_007_199_254_740_991.0));
        assert!(!is_plain_number(f64::NAN));
        assert!(!is_plain_number(f64::INFINITY));
        assert!(!is_plain_number(f64::NEG_INFINITY));
        assert!(!is_plain_number(-0.0));
        assert!(!is_plain_number(1e300));
    }

    #[test]
    fn canonical_number_strings() {
        assert_eq!(canonical_number(f64::NAN), "NaN");
        assert_eq!(canonical_number(f64::INFINITY), "Infinity");
        assert_eq!(canonical_number(f64::NEG_INFINITY), "-Infinity");
        assert_eq!(canonical_number(-0.0), "-0");
        assert_eq!(canonical_number(1e300), "1e300");
    }
}
