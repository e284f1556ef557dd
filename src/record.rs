//! Schema-agnostic record model.
//!
//! Records coming out of a store are open maps of field name to a tagged
//! value. Keys are kept ordered so encoding and hashing are canonical.

use crate::error::Result;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// Name of the identity field every record carries.
pub const ID_FIELD: &str = "Id";

/// Single field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    /// Absent / null
    Null,
    /// Boolean
    Bool(bool),
    /// Any JSON number
    Number(serde_json::Number),
    /// String
    Text(String),
    /// Nested list
    List(Vec<FieldValue>),
    /// Nested record (relationship traversal, compound field)
    Record(Record),
}

impl FieldValue {
    /// Null, `false`, zero and the empty string are blank.
    pub fn is_blank(&self) -> bool {
        match self {
            FieldValue::Null => true,
            FieldValue::Bool(b) => !b,
            FieldValue::Number(n) => n.as_f64().map(|f| f == 0.0).unwrap_or(false),
            FieldValue::Text(s) => s.is_empty(),
            FieldValue::List(_) | FieldValue::Record(_) => false,
        }
    }

    /// String content, if this is a text value.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Scalar values are everything except nested records and lists.
    pub fn is_scalar(&self) -> bool {
        !matches!(self, FieldValue::List(_) | FieldValue::Record(_))
    }

    /// Loose equality used when diffing against destination rows.
    ///
    /// Scalars compare by their rendered text so `5` and `"5"` match, which is
    /// how values come back from stores that stringify numbers.
    pub fn same_as(&self, other: &FieldValue) -> bool {
        if self == other {
            return true;
        }
        if self.is_scalar() && other.is_scalar() {
            return self.to_string() == other.to_string();
        }
        false
    }

    fn hash_into(&self, hasher: &mut Sha256) {
        match self {
            FieldValue::Null => hasher.update(b"n"),
            FieldValue::Bool(b) => hasher.update(if *b { b"t" } else { b"f" }),
            FieldValue::Number(n) => {
                hasher.update(b"#");
                hasher.update(n.to_string().as_bytes());
                hasher.update(b";");
            }
            FieldValue::Text(s) => {
                hasher.update(b"s");
                hasher.update((s.len() as u64).to_be_bytes());
                hasher.update(s.as_bytes());
            }
            FieldValue::List(items) => {
                hasher.update(b"[");
                for item in items {
                    item.hash_into(hasher);
                }
                hasher.update(b"]");
            }
            FieldValue::Record(record) => record.hash_into(hasher),
        }
    }
}

impl fmt::Display for FieldValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldValue::Null => write!(f, "null"),
            FieldValue::Bool(b) => write!(f, "{}", b),
            FieldValue::Number(n) => write!(f, "{}", n),
            FieldValue::Text(s) => write!(f, "{}", s),
            FieldValue::List(_) | FieldValue::Record(_) => {
                let json = serde_json::to_string(self).map_err(|_| fmt::Error)?;
                write!(f, "{}", json)
            }
        }
    }
}

impl From<&str> for FieldValue {
    fn from(s: &str) -> Self {
        FieldValue::Text(s.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(s: String) -> Self {
        FieldValue::Text(s)
    }
}

impl From<bool> for FieldValue {
    fn from(b: bool) -> Self {
        FieldValue::Bool(b)
    }
}

impl From<i64> for FieldValue {
    fn from(n: i64) -> Self {
        FieldValue::Number(n.into())
    }
}

impl From<i32> for FieldValue {
    fn from(n: i32) -> Self {
        FieldValue::Number(n.into())
    }
}

impl From<f64> for FieldValue {
    fn from(n: f64) -> Self {
        serde_json::Number::from_f64(n)
            .map(FieldValue::Number)
            .unwrap_or(FieldValue::Null)
    }
}

impl From<Record> for FieldValue {
    fn from(r: Record) -> Self {
        FieldValue::Record(r)
    }
}

/// Open record: field name to value, ordered by field name.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record {
    fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Create an empty record.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a record from field/value pairs.
    pub fn from_pairs<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> Self
    where
        K: Into<String>,
        V: Into<FieldValue>,
    {
        Self {
            fields: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    /// Decode from a JSON object.
    pub fn from_json(value: serde_json::Value) -> Result<Self> {
        Ok(serde_json::from_value(value)?)
    }

    /// Encode as a JSON object.
    pub fn to_json(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    /// Source identity.
    pub fn id(&self) -> Option<&str> {
        self.text(ID_FIELD)
    }

    /// Text value of a field.
    pub fn text(&self, field: &str) -> Option<&str> {
        self.fields.get(field).and_then(FieldValue::as_str)
    }

    /// Field value.
    pub fn get(&self, field: &str) -> Option<&FieldValue> {
        self.fields.get(field)
    }

    /// Set a field.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<FieldValue>) {
        self.fields.insert(field.into(), value.into());
    }

    /// Remove a field.
    pub fn remove(&mut self, field: &str) -> Option<FieldValue> {
        self.fields.remove(field)
    }

    /// Whether the field is present.
    pub fn contains(&self, field: &str) -> bool {
        self.fields.contains_key(field)
    }

    /// Iterate fields in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &FieldValue)> {
        self.fields.iter()
    }

    /// Field names in order.
    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.fields.keys()
    }

    /// Number of fields.
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Whether the record has no fields.
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Drop every blank field.
    pub fn prune_blank(&mut self) {
        self.fields.retain(|_, v| !v.is_blank());
    }

    /// Flatten one level of nesting into `parent.child` keys for bulk payloads.
    pub fn flatten(&self) -> Record {
        let mut out = Record::new();
        for (k, v) in &self.fields {
            match v {
                FieldValue::Record(inner) => {
                    for (kk, vv) in inner.iter() {
                        out.insert(format!("{}.{}", k, kk), vv.clone());
                    }
                }
                other => out.insert(k.clone(), other.clone()),
            }
        }
        out
    }

    /// Stable hash of the record contents, independent of insertion order.
    pub fn content_hash(&self) -> String {
        let mut hasher = Sha256::new();
        self.hash_into(&mut hasher);
        hex::encode(hasher.finalize())
    }

    fn hash_into(&self, hasher: &mut Sha256) {
        hasher.update(b"{");
        for (k, v) in &self.fields {
            hasher.update((k.len() as u64).to_be_bytes());
            hasher.update(k.as_bytes());
            v.hash_into(hasher);
        }
        hasher.update(b"}");
    }
}

impl FromIterator<(String, FieldValue)> for Record {
    fn from_iter<I: IntoIterator<Item = (String, FieldValue)>>(iter: I) -> Self {
        Self {
            fields: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_blank_values() {
        assert!(FieldValue::Null.is_blank());
        assert!(FieldValue::Bool(false).is_blank());
        assert!(FieldValue::from(0).is_blank());
        assert!(FieldValue::from("").is_blank());
        assert!(!FieldValue::from("x").is_blank());
        assert!(!FieldValue::from(0.5).is_blank());
        assert!(!FieldValue::List(vec![]).is_blank());
    }

    #[test]
    fn test_prune_blank() {
        let mut r = Record::from_json(json!({
            "Id": "001A",
            "Name": "Acme",
            "Description": "",
            "IsPartner": false,
            "NumberOfEmployees": 0,
            "ParentId": null
        }))
        .unwrap();
        r.prune_blank();
        assert_eq!(r.keys().cloned().collect::<Vec<_>>(), vec!["Id", "Name"]);
    }

    #[test]
    fn test_content_hash_ignores_insertion_order() {
        let mut a = Record::new();
        a.insert("Name", "Acme");
        a.insert("Phone", "555");
        let mut b = Record::new();
        b.insert("Phone", "555");
        b.insert("Name", "Acme");
        assert_eq!(a.content_hash(), b.content_hash());

        b.insert("Phone", "556");
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_content_hash_distinguishes_types() {
        let a = Record::from_pairs([("n", FieldValue::from(5))]);
        let b = Record::from_pairs([("n", FieldValue::from("5"))]);
        assert_ne!(a.content_hash(), b.content_hash());
    }

    #[test]
    fn test_flatten_nested_record() {
        let r = Record::from_json(json!({
            "Name": "Acme",
            "BillingAddress": {"city": "Oslo", "country": "NO"}
        }))
        .unwrap();
        let flat = r.flatten();
        assert_eq!(flat.text("BillingAddress.city"), Some("Oslo"));
        assert_eq!(flat.text("BillingAddress.country"), Some("NO"));
        assert!(!flat.contains("BillingAddress"));
    }

    #[test]
    fn test_loose_equality() {
        assert!(FieldValue::from(5).same_as(&FieldValue::from("5")));
        assert!(FieldValue::from(true).same_as(&FieldValue::from("true")));
        assert!(!FieldValue::from("a").same_as(&FieldValue::from("b")));
    }

    #[test]
    fn test_json_roundtrip_preserves_nesting() {
        let value = json!({"Id": "a", "Tags": ["x", 1], "Owner": {"Name": "B"}});
        let r = Record::from_json(value.clone()).unwrap();
        assert!(matches!(r.get("Tags"), Some(FieldValue::List(_))));
        assert!(matches!(r.get("Owner"), Some(FieldValue::Record(_))));
        assert_eq!(r.to_json().unwrap(), value);
    }
}
