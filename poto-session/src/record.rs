//! The session record and its codec representation.

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use poto_codec::{Composite, DateValue, Value};

/// Per-principal session state. Created on first write; mutated only
/// through the store operations. Invariant: `created_at ≤ last_activity ≤
/// now`.
#[derive(Debug, Clone)]
pub struct SessionRecord {
    pub principal_id: String,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub data: IndexMap<String, Value>,
}

impl SessionRecord {
    pub fn new(principal_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            principal_id: principal_id.into(),
            created_at: now,
            last_activity: now,
            data: IndexMap::new(),
        }
    }

    /// Refresh `last_activity`.
    pub fn touch(&mut self) {
        self.last_activity = Utc::now();
    }

    /// Time since the last activity, saturating at zero.
    pub fn idle_age(&self, now: DateTime<Utc>) -> std::time::Duration {
        (now - self.last_activity).to_std().unwrap_or_default()
    }

    /// The codec value form used by serializing backends.
    pub fn to_value(&self) -> Value {
        let entries = self
            .data
            .iter()
            .map(|(k, v)| (Value::string(k.clone()), v.clone()))
            .collect();
        Value::object([
            ("principalId", Value::string(self.principal_id.clone())),
            ("createdAt", Value::Date(DateValue::Valid(self.created_at))),
            (
                "lastActivity",
                Value::Date(DateValue::Valid(self.last_activity)),
            ),
            ("data", Value::map(entries)),
        ])
    }

    /// Rebuild a record from its codec value form. Any structural mismatch
    /// yields `None`; serializing backends treat that as no session.
    pub fn from_value(value: &Value) -> Option<Self> {
        let principal_id = value.get("principalId")?.as_str()?.to_string();
        let created_at = match value.get("createdAt")? {
            Value::Date(DateValue::Valid(dt)) => dt,
            _ => return None,
        };
        let last_activity = match value.get("lastActivity")? {
            Value::Date(DateValue::Valid(dt)) => dt,
            _ => return None,
        };

        let data_value = value.get("data")?;
        let handle = data_value.as_handle()?;
        let mut data = IndexMap::new();
        match &*handle.read() {
            Composite::Map(entries) => {
                for (k, v) in entries {
                    data.insert(k.as_str()?.to_string(), v.clone());
                }
            }
            _ => return None,
        }

        Some(Self {
            principal_id,
            created_at,
            last_activity,
            data,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_round_trips_through_its_value_form() {
        let mut record = SessionRecord::new("user-1");
        record.data.insert("cart".into(), Value::int(3));
        record.data.insert("theme".into(), Value::string("dark"));

        let rebuilt = SessionRecord::from_value(&record.to_value()).unwrap();
        assert_eq!(rebuilt.principal_id, "user-1");
        assert_eq!(rebuilt.data.len(), 2);
        assert_eq!(rebuilt.data["cart"].as_f64(), Some(3.0));
        assert_eq!(rebuilt.data["theme"].as_str(), Some("dark"));
        // Millisecond wire precision: timestamps agree to the millisecond.
        assert_eq!(
            rebuilt.created_at.timestamp_millis(),
            record.created_at.timestamp_millis()
        );
    }

    #[test]
    fn malformed_value_forms_are_rejected() {
        assert!(SessionRecord::from_value(&Value::Null).is_none());
        assert!(SessionRecord::from_value(&Value::object([(
            "principalId",
            Value::int(7)
        )]))
        .is_none());
    }

    #[test]
    fn timestamps_keep_their_ordering_invariant() {
        let mut record = SessionRecord::new("user-2");
        let created = record.created_at;
        record.touch();
        assert!(record.created_at <= record.last_activity);
        assert_eq!(record.created_at, created);
    }
}
