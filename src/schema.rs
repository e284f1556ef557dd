//! Object and field descriptors, plus the per-connection schema cache.

use crate::connection::Connection;
use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use tokio::sync::OnceCell;
use tracing::debug;

/// Field data types the replicator distinguishes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// Record identity
    Id,
    /// Lookup / master-detail pointer to another record
    Reference,
    /// Short text
    String,
    /// Long text
    Textarea,
    /// Boolean
    Boolean,
    /// Integer
    Int,
    /// Floating point
    Double,
    /// Currency amount
    Currency,
    /// Percentage
    Percent,
    /// Date
    Date,
    /// Date and time
    Datetime,
    /// Single-select picklist
    Picklist,
    /// Multi-select picklist
    Multipicklist,
    /// Email address
    Email,
    /// Phone number
    Phone,
    /// URL
    Url,
    /// Compound address
    Address,
    /// Anything else
    #[default]
    #[serde(other)]
    Other,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = serde_json::to_value(self)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_else(|| "other".into());
        write!(f, "{}", s)
    }
}

/// Field metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDescriptor {
    /// API name
    pub name: String,
    /// Data type
    #[serde(rename = "type", default)]
    pub field_type: FieldType,
    /// Settable on create
    #[serde(default)]
    pub createable: bool,
    /// Settable on update
    #[serde(default)]
    pub updateable: bool,
    /// Target object types for reference fields
    #[serde(default)]
    pub reference_to: Vec<String>,
    /// Flagged as an external id
    #[serde(default)]
    pub external_id: bool,
}

impl FieldDescriptor {
    /// Create a plain createable, updateable field.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            createable: true,
            updateable: true,
            reference_to: Vec::new(),
            external_id: false,
        }
    }

    /// Create a reference field pointing at `targets`.
    pub fn reference(
        name: impl Into<String>,
        targets: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        Self {
            reference_to: targets.into_iter().map(Into::into).collect(),
            ..Self::new(name, FieldType::Reference)
        }
    }

    /// Create a system field that cannot be written.
    pub fn read_only(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            createable: false,
            updateable: false,
            ..Self::new(name, field_type)
        }
    }

    /// Mark as an external id.
    pub fn external_id(mut self) -> Self {
        self.external_id = true;
        self
    }

    /// Whether this field points at other records.
    pub fn is_reference(&self) -> bool {
        self.field_type == FieldType::Reference || !self.reference_to.is_empty()
    }
}

/// Object type metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectDescriptor {
    /// API name
    pub name: String,
    /// Fields
    #[serde(default)]
    pub fields: Vec<FieldDescriptor>,
}

impl ObjectDescriptor {
    /// Create a descriptor.
    pub fn new(name: impl Into<String>, fields: Vec<FieldDescriptor>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Look up a field by name.
    pub fn field(&self, name: &str) -> Option<&FieldDescriptor> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Whether a field exists.
    pub fn has_field(&self, name: &str) -> bool {
        self.field(name).is_some()
    }

    /// All field names.
    pub fn field_names(&self) -> Vec<String> {
        self.fields.iter().map(|f| f.name.clone()).collect()
    }

    /// Fields with a non-empty reference target list.
    pub fn reference_fields(&self) -> impl Iterator<Item = &FieldDescriptor> {
        self.fields.iter().filter(|f| !f.reference_to.is_empty())
    }
}

/// Object entry from a global describe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectSummary {
    /// API name
    pub name: String,
    /// Queryable
    #[serde(default)]
    pub queryable: bool,
    /// Createable
    #[serde(default)]
    pub createable: bool,
    /// Updateable
    #[serde(default)]
    pub updateable: bool,
    /// Has page layouts (user-facing object)
    #[serde(default)]
    pub layoutable: bool,
    /// Deprecated and hidden
    #[serde(default)]
    pub deprecated_and_hidden: bool,
}

impl ObjectSummary {
    /// A regular, fully accessible object.
    pub fn standard(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            queryable: true,
            createable: true,
            updateable: true,
            layoutable: true,
            deprecated_and_hidden: false,
        }
    }

    /// Whether records of this type can be both read and written.
    pub fn is_replicable(&self) -> bool {
        self.queryable
            && self.createable
            && self.updateable
            && self.layoutable
            && !self.deprecated_and_hidden
    }
}

/// Memoized describe lookups for one connection.
///
/// Concurrent callers asking for the same object share a single in-flight
/// fetch. Entries are never invalidated for the lifetime of the cache.
pub struct SchemaCache {
    connection: Arc<Connection>,
    objects: Mutex<HashMap<String, Arc<OnceCell<Arc<ObjectDescriptor>>>>>,
    global: OnceCell<Arc<Vec<ObjectSummary>>>,
}

impl SchemaCache {
    /// Create an empty cache over `connection`.
    pub fn new(connection: Arc<Connection>) -> Self {
        Self {
            connection,
            objects: Mutex::new(HashMap::new()),
            global: OnceCell::new(),
        }
    }

    /// The connection this cache describes.
    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    /// Describe an object type.
    pub async fn describe(&self, object: &str) -> Result<Arc<ObjectDescriptor>> {
        let cell = {
            let mut objects = self
                .objects
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            objects.entry(object.to_string()).or_default().clone()
        };

        let descriptor = cell
            .get_or_try_init(|| async {
                debug!(object, connection = %self.connection.label(), "describing object");
                self.connection.describe(object).await.map(Arc::new)
            })
            .await?;
        Ok(descriptor.clone())
    }

    /// List all object types.
    pub async fn describe_global(&self) -> Result<Arc<Vec<ObjectSummary>>> {
        let summaries = self
            .global
            .get_or_try_init(|| async { self.connection.describe_global().await.map(Arc::new) })
            .await?;
        Ok(summaries.clone())
    }

    /// Number of object types described so far.
    pub fn len(&self) -> usize {
        self.objects
            .lock()
            .map(|o| o.values().filter(|c| c.initialized()).count())
            .unwrap_or(0)
    }

    /// Whether nothing has been described yet.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
