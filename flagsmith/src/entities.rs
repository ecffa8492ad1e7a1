//! Request and response bodies of the Flagsmith REST api.
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

/// Dynamically typed flag or trait value.
///
/// Numbers are always kept as `f64`. Arrays and objects, which the api does
/// not officially produce, are kept as their JSON text.
#[derive(Debug, Clone, PartialEq)]
pub enum FlagValue {
    String(String),
    Bool(bool),
    Number(f64),
}

impl FlagValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for FlagValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Number(n) => write!(f, "{n}"),
        }
    }
}

impl From<&str> for FlagValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for FlagValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<bool> for FlagValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<f64> for FlagValue {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

impl From<i64> for FlagValue {
    fn from(value: i64) -> Self {
        Self::Number(value as f64)
    }
}

impl Serialize for FlagValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::String(s) => serializer.serialize_str(s),
            Self::Bool(b) => serializer.serialize_bool(*b),
            Self::Number(n) => serializer.serialize_f64(*n),
        }
    }
}

impl<'de> Deserialize<'de> for FlagValue {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = serde_json::Value::deserialize(deserializer)?;
        Ok(match value {
            serde_json::Value::String(s) => Self::String(s),
            serde_json::Value::Bool(b) => Self::Bool(b),
            serde_json::Value::Number(n) => match n.as_f64() {
                Some(n) => Self::Number(n),
                None => Self::String(n.to_string()),
            },
            other => Self::String(other.to_string()),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Feature {
    pub id: i64,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_enabled: Option<bool>,
    #[serde(rename = "type")]
    pub feature_type: String,
}

impl Feature {
    /// Minimal standard feature, handy for default flag lists.
    pub fn named(id: i64, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            created_date: None,
            description: None,
            initial_value: None,
            default_enabled: None,
            feature_type: "STANDARD".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Flag {
    pub feature: Feature,
    #[serde(default)]
    pub feature_state_value: Option<FlagValue>,
    pub enabled: bool,
}

impl Flag {
    pub fn new(feature: Feature, enabled: bool, value: Option<FlagValue>) -> Self {
        Self {
            feature,
            feature_state_value: value,
            enabled,
        }
    }

    pub fn name(&self) -> &str {
        &self.feature.name
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Trait {
    #[serde(rename = "trait_key")]
    pub key: String,
    #[serde(rename = "trait_value")]
    pub value: FlagValue,
}

impl Trait {
    pub fn new(key: impl Into<String>, value: impl Into<FlagValue>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub identifier: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraitWithIdentity {
    #[serde(rename = "trait_key")]
    pub key: String,
    #[serde(rename = "trait_value")]
    pub value: FlagValue,
    pub identity: Identity,
}

/// Response of `GET/POST identities/`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct IdentityFlagsAndTraits {
    #[serde(default)]
    pub flags: Vec<Flag>,
    #[serde(default)]
    pub traits: Vec<Trait>,
}

/// Body of `POST identities/`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IdentityAndTraits {
    pub identifier: String,
    pub traits: Vec<Trait>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transient: Option<bool>,
}

/// Payload of a push-update event.
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
pub struct FlagEvent {
    pub updated_at: f64,
}
