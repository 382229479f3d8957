use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Field map of a document, keyed by field name.
pub type DocumentData = serde_json::Map<String, serde_json::Value>;

/// A tenant record as held by the catalog.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Tenant {
    pub id: String,
    pub write_key: String,
    pub read_key: String,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
    pub quota_used: u64,  // bytes
    pub quota_limit: u64, // bytes
}

/// What a capability key allows its bearer to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
}

impl Capability {
    pub fn can_write(&self) -> bool {
        matches!(self, Capability::Write)
    }
}

/// A tenant resolved from a capability key.
#[derive(Debug, Clone)]
pub struct Resolved {
    pub tenant: Tenant,
    pub capability: Capability,
}

/// Returned exactly once, when a database is created.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct CreatedDatabase {
    pub database_id: String,
    pub write_key: String,
    pub read_key: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Bool,
}

impl FieldType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Bool => "bool",
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FieldType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "string" => Ok(FieldType::String),
            "number" => Ok(FieldType::Number),
            "bool" => Ok(FieldType::Bool),
            other => Err(format!("invalid field type: {}", other)),
        }
    }
}

/// Collection schema. Immutable once created.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Schema {
    pub database_id: String,
    pub name: String,
    pub fields: BTreeMap<String, FieldType>,
    pub created_at: DateTime<Utc>,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Document {
    pub id: String,
    pub collection: String,
    pub data: DocumentData,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Quota and usage summary for a database.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct DatabaseInfo {
    pub database_id: String,
    pub quota_used: u64,
    pub quota_limit: u64,
    pub quota_percent: f64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: DateTime<Utc>,
}

impl From<&Tenant> for DatabaseInfo {
    fn from(tenant: &Tenant) -> Self {
        let quota_percent = if tenant.quota_limit == 0 {
            0.0
        } else {
            tenant.quota_used as f64 / tenant.quota_limit as f64 * 100.0
        };
        Self {
            database_id: tenant.id.clone(),
            quota_used: tenant.quota_used,
            quota_limit: tenant.quota_limit,
            quota_percent,
            created_at: tenant.created_at,
            last_accessed: tenant.last_accessed,
        }
    }
}
