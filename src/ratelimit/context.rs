//! Request identity and rate key derivation.

use std::collections::HashMap;
use std::convert::Infallible;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Identifiers describing one incoming request.
///
/// Each field feeds one [`KeyStrategy`]. `metadata` is carried for hooks and
/// logging only and never influences a rate key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RequestContext {
    pub ip: Option<String>,
    pub user_id: Option<String>,
    pub endpoint: Option<String>,
    pub session_id: Option<String>,
    pub custom: HashMap<String, String>,
    pub metadata: HashMap<String, serde_json::Value>,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip = Some(ip.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_custom(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.custom.insert(name.into(), value.into());
        self
    }

    pub fn with_metadata(mut self, name: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata.insert(name.into(), value);
        self
    }

    /// Derive the rate key for `strategy`, or `None` when the identifier it
    /// needs is missing or empty.
    ///
    /// Keys are namespaced by strategy (`ip:1.2.3.4`, `user:42`, `tenant:acme`)
    /// so different dimensions never share storage entries.
    pub fn key(&self, strategy: &KeyStrategy) -> Option<String> {
        fn prefixed(prefix: &str, value: Option<&String>) -> Option<String> {
            value.filter(|v| !v.is_empty()).map(|v| format!("{prefix}:{v}"))
        }

        match strategy {
            KeyStrategy::Ip => prefixed("ip", self.ip.as_ref()),
            KeyStrategy::User => prefixed("user", self.user_id.as_ref()),
            KeyStrategy::Endpoint => prefixed("endpoint", self.endpoint.as_ref()),
            KeyStrategy::Session => prefixed("session", self.session_id.as_ref()),
            KeyStrategy::Global => Some("global".to_string()),
            KeyStrategy::Custom(name) => prefixed(name, self.custom.get(name)),
        }
    }
}

/// How a composite dimension derives its key from a [`RequestContext`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KeyStrategy {
    Ip,
    User,
    Endpoint,
    Session,
    /// One shared key for every request.
    Global,
    /// A named entry of [`RequestContext::custom`].
    Custom(String),
}

impl KeyStrategy {
    pub fn name(&self) -> &str {
        match self {
            KeyStrategy::Ip => "ip",
            KeyStrategy::User => "user",
            KeyStrategy::Endpoint => "endpoint",
            KeyStrategy::Session => "session",
            KeyStrategy::Global => "global",
            KeyStrategy::Custom(name) => name,
        }
    }
}

impl fmt::Display for KeyStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for KeyStrategy {
    type Err = Infallible;

    /// Unknown names select a custom field of the same name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "ip" => KeyStrategy::Ip,
            "user" => KeyStrategy::User,
            "endpoint" => KeyStrategy::Endpoint,
            "session" => KeyStrategy::Session,
            "global" => KeyStrategy::Global,
            other => KeyStrategy::Custom(other.to_string()),
        })
    }
}

impl Serialize for KeyStrategy {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for KeyStrategy {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(match name.parse::<KeyStrategy>() {
            Ok(strategy) => strategy,
            Err(never) => match never {},
        })
    }
}
