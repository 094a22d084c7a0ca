//! Field registry.
//!
//! A static catalog of the data fields a condition can address. The registry is
//! built once at startup (built-in lead/user/workspace/system fields plus any
//! custom fields), then frozen and shared behind an `Arc`.

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Declared type of a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Number,
    Date,
    Boolean,
    Select,
    Multiselect,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Text => "text",
            FieldType::Number => "number",
            FieldType::Date => "date",
            FieldType::Boolean => "boolean",
            FieldType::Select => "select",
            FieldType::Multiselect => "multiselect",
        };
        f.write_str(name)
    }
}

/// Which part of the data model a field belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldNamespace {
    Lead,
    User,
    Workspace,
    System,
    Custom,
}

/// One selectable option of a select/multiselect field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldOption {
    pub label: String,
    pub value: Value,
}

/// An addressable field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDefinition {
    pub name: String,
    pub label: String,
    #[serde(rename = "type")]
    pub field_type: FieldType,
    pub namespace: FieldNamespace,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<FieldOption>,
}

impl FieldDefinition {
    pub fn new(
        name: &str,
        label: &str,
        field_type: FieldType,
        namespace: FieldNamespace,
    ) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            field_type,
            namespace,
            options: Vec::new(),
        }
    }

    /// Attach options; labels double as values.
    pub fn with_options(mut self, values: &[&str]) -> Self {
        self.options = values
            .iter()
            .map(|v| FieldOption {
                label: v.to_string(),
                value: Value::String(v.to_string()),
            })
            .collect();
        self
    }

    /// Whether `value` is one of the declared options. Fields without options
    /// accept anything.
    pub fn allows_option(&self, value: &Value) -> bool {
        self.options.is_empty() || self.options.iter().any(|o| &o.value == value)
    }
}

/// Read-only catalog of fields keyed by name.
#[derive(Debug, Clone)]
pub struct FieldRegistry {
    fields: HashMap<String, FieldDefinition>,
}

impl FieldRegistry {
    /// Registry with the built-in catalog only.
    pub fn builtin() -> Self {
        FieldRegistryBuilder::with_builtin().build()
    }

    /// Start a builder seeded with the built-in catalog.
    pub fn builder() -> FieldRegistryBuilder {
        FieldRegistryBuilder::with_builtin()
    }

    /// Look up a field by name.
    pub fn lookup(&self, name: &str) -> Result<&FieldDefinition> {
        self.fields
            .get(name)
            .ok_or_else(|| Error::FieldNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.fields.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// All fields in a namespace, sorted by name.
    pub fn in_namespace(&self, namespace: FieldNamespace) -> Vec<&FieldDefinition> {
        let mut fields: Vec<&FieldDefinition> = self
            .fields
            .values()
            .filter(|f| f.namespace == namespace)
            .collect();
        fields.sort_by(|a, b| a.name.cmp(&b.name));
        fields
    }
}

impl Default for FieldRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Collects field definitions before the registry is frozen.
#[derive(Debug, Default)]
pub struct FieldRegistryBuilder {
    fields: HashMap<String, FieldDefinition>,
}

impl FieldRegistryBuilder {
    /// Empty builder (for testing).
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut builder = Self::default();
        for field in builtin_catalog() {
            builder.fields.insert(field.name.clone(), field);
        }
        builder
    }

    /// Add a field. Duplicate names are rejected.
    pub fn field(mut self, field: FieldDefinition) -> Result<Self> {
        if self.fields.contains_key(&field.name) {
            return Err(Error::Config(format!(
                "Field '{}' is already registered",
                field.name
            )));
        }
        self.fields.insert(field.name.clone(), field);
        Ok(self)
    }

    /// Add a field in the custom namespace.
    pub fn custom(self, name: &str, label: &str, field_type: FieldType) -> Result<Self> {
        self.field(FieldDefinition::new(
            name,
            label,
            field_type,
            FieldNamespace::Custom,
        ))
    }

    pub fn build(self) -> FieldRegistry {
        FieldRegistry {
            fields: self.fields,
        }
    }
}

fn builtin_catalog() -> Vec<FieldDefinition> {
    use FieldNamespace::*;
    use FieldType::*;

    vec![
        // Lead
        FieldDefinition::new("score", "Lead score", Number, Lead),
        FieldDefinition::new("name", "Lead name", Text, Lead),
        FieldDefinition::new("email", "Email", Text, Lead),
        FieldDefinition::new("phone", "Phone", Text, Lead),
        FieldDefinition::new("company", "Company", Text, Lead),
        FieldDefinition::new("source", "Lead source", Select, Lead).with_options(&[
            "website", "referral", "social", "ads", "event", "other",
        ]),
        FieldDefinition::new("temperature", "Temperature", Select, Lead)
            .with_options(&["hot", "warm", "cold"]),
        FieldDefinition::new("status", "Lead status", Select, Lead).with_options(&[
            "new",
            "contacted",
            "qualified",
            "proposal",
            "won",
            "lost",
        ]),
        FieldDefinition::new("priority", "Priority", Select, Lead)
            .with_options(&["low", "medium", "high", "urgent"]),
        FieldDefinition::new("tags", "Tags", Multiselect, Lead),
        FieldDefinition::new("deal_value", "Deal value", Number, Lead),
        FieldDefinition::new("is_qualified", "Qualified", Boolean, Lead),
        FieldDefinition::new("created_at", "Created at", Date, Lead),
        FieldDefinition::new("last_contacted_at", "Last contacted", Date, Lead),
        // User
        FieldDefinition::new("user_id", "User id", Text, User),
        FieldDefinition::new("user_role", "User role", Select, User)
            .with_options(&["admin", "manager", "agent"]),
        FieldDefinition::new("assignee", "Assignee", Text, User),
        // Workspace
        FieldDefinition::new("workspace_id", "Workspace id", Text, Workspace),
        FieldDefinition::new("workspace_plan", "Plan", Select, Workspace)
            .with_options(&["free", "pro", "enterprise"]),
        // System
        FieldDefinition::new("current_date", "Current date", Date, System),
        FieldDefinition::new("hour_of_day", "Hour of day", Number, System),
        FieldDefinition::new("day_of_week", "Day of week", Select, System)
            .with_options(&["mon", "tue", "wed", "thu", "fri", "sat", "sun"]),
    ]
}
