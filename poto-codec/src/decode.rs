//! Envelope decoding: tagged JSON → value graph.
//!
//! Decoding is two-pass. Pass one allocates a shell for every composite
//! before descending into its children, registers `__refId → shell`, and
//! records a patch for every `__ref` slot it encounters. Pass two replaces
//! each patched slot with the shell of its target, so shared identity and
//! cycles (including forward references) are reconstructed exactly.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use num_bigint::BigInt;
use serde_json::{Map as JsonMap, Value as Json};
use url::Url;

use crate::error::CodecError;
use crate::tags;
use crate::value::{
    BlobValue, Composite, DataViewValue, DateValue, ElementKind, ErrorValue, Handle, RegExpValue,
    TypedArrayValue, Value,
};
use crate::CodecLimits;

pub(crate) struct Decoder<'a> {
    limits: &'a CodecLimits,
    refs: HashMap<u64, Handle>,
    patches: Vec<Patch>,
}

struct Patch {
    handle: Handle,
    slot: Slot,
    target: u64,
}

enum Slot {
    Array(usize),
    Object(usize),
    MapKey(usize),
    MapVal(usize),
    Set(usize),
}

/// `{"__ref": n}` citation, if the node is one.
fn as_ref_citation(json: &Json) -> Option<u64> {
    let map = json.as_object()?;
    if map.len() == 1 {
        map.get(tags::TAG_REF)?.as_u64()
    } else {
        None
    }
}

impl<'a> Decoder<'a> {
    pub(crate) fn new(limits: &'a CodecLimits) -> Self {
        Self {
            limits,
            refs: HashMap::new(),
            patches: Vec::new(),
        }
    }

    pub(crate) fn decode(mut self, json: &Json) -> Result<Value, CodecError> {
        let root = self.decode_inner(json, 0)?;
        self.apply_patches()?;
        Ok(root)
    }

    fn apply_patches(&mut self) -> Result<(), CodecError> {
        for patch in self.patches.drain(..) {
            let target = self
                .refs
                .get(&patch.target)
                .ok_or_else(|| {
                    CodecError::MalformedTag(format!("unresolved __ref {}", patch.target))
                })?
                .clone();
            let value = Value::Composite(target);
            let mut composite = patch.handle.write();
            match (&mut *composite, &patch.slot) {
                (Composite::Array(items), Slot::Array(i)) => items[*i] = value,
                (Composite::Object(map), Slot::Object(i)) => {
                    if let Some((_, slot)) = map.get_index_mut(*i) {
                        *slot = value;
                    }
                }
                (Composite::Map(entries), Slot::MapKey(i)) => entries[*i].0 = value,
                (Composite::Map(entries), Slot::MapVal(i)) => entries[*i].1 = value,
                (Composite::Set(items), Slot::Set(i)) => items[*i] = value,
                _ => {
                    return Err(CodecError::MalformedTag(
                        "reference patch does not match its composite".into(),
                    ))
                }
            }
        }
        Ok(())
    }

    /// Decode a child slot: either record a `__ref` patch and leave a
    /// placeholder, or decode the child eagerly.
    fn decode_slot(
        &mut self,
        json: &Json,
        depth: usize,
        handle: &Handle,
        slot: Slot,
    ) -> Result<Value, CodecError> {
        if let Some(target) = as_ref_citation(json) {
            self.patches.push(Patch {
                handle: handle.clone(),
                slot,
                target,
            });
            return Ok(Value::Null);
        }
        self.decode_inner(json, depth)
    }

    fn decode_inner(&mut self, json: &Json, depth: usize) -> Result<Value, CodecError> {
        if depth > self.limits.max_depth {
            return Err(CodecError::Depth {
                max: self.limits.max_depth,
            });
        }

        match json {
            Json::Null => Ok(Value::Null),
            Json::Bool(b) => Ok(Value::Bool(*b)),
            Json::Number(n) => {
                let f = n.as_f64().ok_or_else(|| {
                    CodecError::MalformedTag(format!("unrepresentable number {n}"))
                })?;
                Ok(Value::Number(f))
            }
            Json::String(s) => Ok(Value::String(s.clone())),
            // A bare array (e.g. an argument envelope root) decodes as an
            // array without a registered identity.
            Json::Array(items) => {
                let handle = Handle::new(Composite::Array(vec![Value::Null; items.len()]));
                for (i, item) in items.iter().enumerate() {
                    let decoded = self.decode_slot(item, depth + 1, &handle, Slot::Array(i))?;
                    if let Composite::Array(slots) = &mut *handle.write() {
                        slots[i] = decoded;
                    }
                }
                Ok(Value::Composite(handle))
            }
            Json::Object(map) => self.decode_object(map, depth),
        }
    }

    fn decode_object(&mut self, map: &JsonMap<String, Json>, depth: usize) -> Result<Value, CodecError> {
        let tag_keys: Vec<&str> = map
            .keys()
            .map(String::as_str)
            .filter(|k| tags::is_reserved(k))
            .collect();

        match tag_keys.as_slice() {
            [] => self.decode_plain_object(map, depth),
            [tag] => self.decode_tagged(tag, map, depth),
            _ => Err(CodecError::MalformedTag(format!(
                "object carries multiple tags: {}",
                tag_keys.join(", ")
            ))),
        }
    }

    fn decode_plain_object(
        &mut self,
        map: &JsonMap<String, Json>,
        depth: usize,
    ) -> Result<Value, CodecError> {
        // A single unknown double-underscore key is a vocabulary miss, not data.
        if map.len() == 1 {
            if let Some(key) = map.keys().next() {
                if key.starts_with("__") && key != tags::REF_ID_KEY {
                    return Err(CodecError::UnknownTag(key.clone()));
                }
            }
        }

        let ref_id = self.take_ref_id(map)?;
        let handle = Handle::new(Composite::Object(IndexMap::new()));
        if let Some(id) = ref_id {
            self.refs.insert(id, handle.clone());
        }

        let mut index = 0usize;
        for (key, child) in map {
            if key == tags::REF_ID_KEY {
                continue;
            }
            // Reserve the slot first so patch indices line up.
            if let Composite::Object(fields) = &mut *handle.write() {
                fields.insert(key.clone(), Value::Null);
            }
            let decoded = self.decode_slot(child, depth + 1, &handle, Slot::Object(index))?;
            if let Composite::Object(fields) = &mut *handle.write() {
                fields[index] = decoded;
            }
            index += 1;
        }
        Ok(Value::Composite(handle))
    }

    fn take_ref_id(&self, map: &JsonMap<String, Json>) -> Result<Option<u64>, CodecError> {
        match map.get(tags::REF_ID_KEY) {
            None => Ok(None),
            Some(v) => v
                .as_u64()
                .map(Some)
                .ok_or_else(|| CodecError::MalformedTag("__refId must be an integer".into())),
        }
    }

    fn decode_tagged(
        &mut self,
        tag: &str,
        map: &JsonMap<String, Json>,
        depth: usize,
    ) -> Result<Value, CodecError> {
        let is_composite_tag =
            matches!(tag, tags::TAG_ARRAY | tags::TAG_MAP | tags::TAG_SET);
        let allowed = if is_composite_tag { 2 } else { 1 };
        if map.len() > allowed || (!is_composite_tag && map.contains_key(tags::REF_ID_KEY)) {
            return Err(CodecError::MalformedTag(format!(
                "tag {tag} carries unexpected sibling keys"
            )));
        }
        let body = &map[tag];

        match tag {
            tags::TAG_UNDEFINED => Ok(Value::Undefined),
            tags::TAG_NULL => Ok(Value::Null),
            tags::TAG_BOOLEAN => body
                .as_bool()
                .map(Value::Bool)
                .ok_or_else(|| CodecError::MalformedTag("__boolean expects a bool".into())),
            tags::TAG_STRING => body
                .as_str()
                .map(Value::string)
                .ok_or_else(|| CodecError::MalformedTag("__string expects a string".into())),
            tags::TAG_NUMBER => {
                let s = body
                    .as_str()
                    .ok_or_else(|| CodecError::MalformedTag("__number expects a string".into()))?;
                let n = match s {
                    "NaN" => f64::NAN,
                    "Infinity" => f64::INFINITY,
                    "-Infinity" => f64::NEG_INFINITY,
                    "-0" => -0.0,
                    other => other.parse::<f64>().map_err(|_| {
                        CodecError::MalformedTag(format!("unparseable __number literal {other:?}"))
                    })?,
                };
                Ok(Value::Number(n))
            }
            tags::TAG_BIGINT => {
                let s = body
                    .as_str()
                    .ok_or_else(|| CodecError::MalformedTag("__bigint expects a string".into()))?;
                let n = s.parse::<BigInt>().map_err(|_| {
                    CodecError::MalformedTag(format!("unparseable __bigint literal {s:?}"))
                })?;
                Ok(Value::BigInt(n))
            }
            tags::TAG_DATE => {
                let s = body
                    .as_str()
                    .ok_or_else(|| CodecError::MalformedTag("__date expects a string".into()))?;
                if s == "Invalid Date" {
                    return Ok(Value::Date(DateValue::Invalid));
                }
                let dt = DateTime::parse_from_rfc3339(s).map_err(|_| {
                    CodecError::MalformedTag(format!("unparseable __date {s:?}"))
                })?;
                Ok(Value::Date(DateValue::Valid(dt.with_timezone(&Utc))))
            }
            tags::TAG_REGEXP => {
                let obj = body
                    .as_object()
                    .ok_or_else(|| CodecError::MalformedTag("__regexp expects an object".into()))?;
                let source = obj.get("source").and_then(Json::as_str).ok_or_else(|| {
                    CodecError::MalformedTag("__regexp is missing its source".into())
                })?;
                let flags = obj.get("flags").and_then(Json::as_str).unwrap_or("");
                Ok(Value::RegExp(RegExpValue {
                    source: source.to_string(),
                    flags: flags.to_string(),
                }))
            }
            tags::TAG_URL => {
                let s = body
                    .as_str()
                    .ok_or_else(|| CodecError::MalformedTag("__url expects a string".into()))?;
                let url = Url::parse(s)
                    .map_err(|e| CodecError::MalformedTag(format!("unparseable __url: {e}")))?;
                Ok(Value::Url(url))
            }
            tags::TAG_ERROR => self.decode_error(body, depth),
            tags::TAG_ARRAYBUFFER => {
                let bytes = self.decode_base64("__arraybuffer", body)?;
                Ok(Value::Bytes(bytes))
            }
            tags::TAG_TYPEDARRAY => {
                let obj = body.as_object().ok_or_else(|| {
                    CodecError::MalformedTag("__typedarray expects an object".into())
                })?;
                let kind_str = obj.get("kind").and_then(Json::as_str).ok_or_else(|| {
                    CodecError::MalformedTag("__typedarray is missing its kind".into())
                })?;
                let kind = ElementKind::from_str(kind_str).ok_or_else(|| {
                    CodecError::MalformedTag(format!("unknown element kind {kind_str:?}"))
                })?;
                let data = obj.get("data").cloned().unwrap_or(Json::Null);
                let bytes = self.decode_base64("__typedarray", &data)?;
                if bytes.len() % kind.element_size() != 0 {
                    return Err(CodecError::MalformedTag(format!(
                        "typed array of {} bytes is not a multiple of the {} element size",
                        bytes.len(),
                        kind.as_str()
                    )));
                }
                // A fresh backing buffer; the source offset is not restored.
                Ok(Value::TypedArray(TypedArrayValue::new(kind, bytes)))
            }
            tags::TAG_DATAVIEW => {
                let obj = body.as_object().ok_or_else(|| {
                    CodecError::MalformedTag("__dataview expects an object".into())
                })?;
                let data = obj.get("data").cloned().unwrap_or(Json::Null);
                let bytes = self.decode_base64("__dataview", &data)?;
                Ok(Value::DataView(DataViewValue::new(bytes)))
            }
            tags::TAG_BLOB => {
                let obj = body
                    .as_object()
                    .ok_or_else(|| CodecError::MalformedTag("__blob expects an object".into()))?;
                let media_type = obj.get("type").and_then(Json::as_str).unwrap_or("");
                if let Some(declared) = obj.get("size").and_then(Json::as_u64) {
                    if declared as usize > self.limits.max_blob_bytes {
                        return Err(CodecError::SizeLimit {
                            what: "blob",
                            actual: declared as usize,
                            max: self.limits.max_blob_bytes,
                        });
                    }
                }
                let data = obj.get("data").cloned().unwrap_or(Json::Null);
                let bytes = self.decode_base64("__blob", &data)?;
                Ok(Value::Blob(BlobValue::from_bytes(media_type, bytes)))
            }
            tags::TAG_ARRAY => {
                let items = body.as_array().ok_or_else(|| {
                    CodecError::MalformedTag("__array expects an array".into())
                })?;
                let handle = Handle::new(Composite::Array(vec![Value::Null; items.len()]));
                self.register(map, &handle)?;
                for (i, item) in items.iter().enumerate() {
                    let decoded = self.decode_slot(item, depth + 1, &handle, Slot::Array(i))?;
                    if let Composite::Array(slots) = &mut *handle.write() {
                        slots[i] = decoded;
                    }
                }
                Ok(Value::Composite(handle))
            }
            tags::TAG_SET => {
                let items = body
                    .as_array()
                    .ok_or_else(|| CodecError::MalformedTag("__set expects an array".into()))?;
                let handle = Handle::new(Composite::Set(vec![Value::Null; items.len()]));
                self.register(map, &handle)?;
                for (i, item) in items.iter().enumerate() {
                    let decoded = self.decode_slot(item, depth + 1, &handle, Slot::Set(i))?;
                    if let Composite::Set(slots) = &mut *handle.write() {
                        slots[i] = decoded;
                    }
                }
                Ok(Value::Composite(handle))
            }
            tags::TAG_MAP => {
                let entries = body
                    .as_array()
                    .ok_or_else(|| CodecError::MalformedTag("__map expects an array".into()))?;
                let handle = Handle::new(Composite::Map(vec![
                    (Value::Null, Value::Null);
                    entries.len()
                ]));
                self.register(map, &handle)?;
                for (i, entry) in entries.iter().enumerate() {
                    let pair = entry.as_array().filter(|p| p.len() == 2).ok_or_else(|| {
                        CodecError::MalformedTag("__map entries must be [key, value] pairs".into())
                    })?;
                    let key = self.decode_slot(&pair[0], depth + 1, &handle, Slot::MapKey(i))?;
                    let val = self.decode_slot(&pair[1], depth + 1, &handle, Slot::MapVal(i))?;
                    if let Composite::Map(slots) = &mut *handle.write() {
                        slots[i] = (key, val);
                    }
                }
                Ok(Value::Composite(handle))
            }
            tags::TAG_REF => Err(CodecError::MalformedTag(
                "__ref outside a composite slot".into(),
            )),
            tags::TAG_CIRCULAR_REF => Err(CodecError::MalformedTag(
                "legacy __circular_ref placeholders cannot be decoded".into(),
            )),
            other => Err(CodecError::UnknownTag(other.to_string())),
        }
    }

    fn register(&mut self, map: &JsonMap<String, Json>, handle: &Handle) -> Result<(), CodecError> {
        if let Some(id) = self.take_ref_id(map)? {
            self.refs.insert(id, handle.clone());
        }
        Ok(())
    }

    fn decode_error(&mut self, body: &Json, depth: usize) -> Result<Value, CodecError> {
        let obj = body
            .as_object()
            .ok_or_else(|| CodecError::MalformedTag("__error expects an object".into()))?;
        let name = obj
            .get("name")
            .and_then(Json::as_str)
            .unwrap_or("Error")
            .to_string();
        let message = obj
            .get("message")
            .and_then(Json::as_str)
            .unwrap_or("")
            .to_string();
        let stack = obj.get("stack").and_then(Json::as_str).map(String::from);
        let code = obj.get("code").and_then(Json::as_str).map(String::from);
        let cause = match obj.get("cause") {
            None => None,
            Some(c) => {
                // A cause citing an earlier composite resolves immediately;
                // error values own their cause and expose no patchable slot.
                if let Some(target) = as_ref_citation(c) {
                    let handle = self.refs.get(&target).ok_or_else(|| {
                        CodecError::MalformedTag(format!("unresolved __ref {target} in cause"))
                    })?;
                    Some(Value::Composite(handle.clone()))
                } else {
                    Some(self.decode_inner(c, depth + 1)?)
                }
            }
        };
        Ok(Value::Error(Box::new(ErrorValue {
            name,
            message,
            stack,
            code,
            cause,
        })))
    }

    fn decode_base64(&self, what: &'static str, body: &Json) -> Result<Vec<u8>, CodecError> {
        let s = body
            .as_str()
            .ok_or_else(|| CodecError::MalformedTag(format!("{what} expects base64 data")))?;
        // Bound the allocation from the encoded length before decoding.
        let estimated = s.len() / 4 * 3;
        if estimated > self.limits.max_blob_bytes {
            return Err(CodecError::SizeLimit {
                what: "binary payload",
                actual: estimated,
                max: self.limits.max_blob_bytes,
            });
        }
        BASE64
            .decode(s)
            .map_err(|e| CodecError::BadBase64(e.to_string()))
    }
}
