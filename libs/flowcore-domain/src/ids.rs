//! Identifier types.
//!
//! `FlowId`, `StepId`, and `AttributeName` are caller-supplied strings — a
//! flow or a step is named by whoever registers it, not generated by the
//! engine. `WorkToken` is the one identifier the engine itself mints, so it
//! follows the time-ordered, prefixed-UUID shape used for every
//! engine-generated ID.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{self, Display};
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Errors parsing a `WorkToken` back from its string form.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdParseError {
    #[error("missing prefix separator '_'")]
    MissingPrefix,
    #[error("wrong prefix: expected '{expected}', got '{got}'")]
    WrongPrefix { expected: &'static str, got: String },
    #[error("invalid UUID: {0}")]
    InvalidUuid(String),
}

impl From<uuid::Error> for IdParseError {
    fn from(e: uuid::Error) -> Self {
        IdParseError::InvalidUuid(e.to_string())
    }
}

macro_rules! define_string_id {
    ($name:ident) => {
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            #[must_use]
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }

            #[must_use]
            pub fn into_string(self) -> String {
                self.0
            }
        }

        impl Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

define_string_id!(FlowId);
define_string_id!(StepId);
define_string_id!(AttributeName);

/// Engine-minted token identifying one work item within one step execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkToken(Uuid);

impl WorkToken {
    pub const PREFIX: &'static str = "work";

    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    #[must_use]
    pub const fn into_uuid(self) -> Uuid {
        self.0
    }
}

impl Default for WorkToken {
    fn default() -> Self {
        Self::new()
    }
}

impl Display for WorkToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", Self::PREFIX, self.0)
    }
}

impl FromStr for WorkToken {
    type Err = IdParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (prefix, uuid_str) = s.split_once('_').ok_or(IdParseError::MissingPrefix)?;
        if prefix != Self::PREFIX {
            return Err(IdParseError::WrongPrefix {
                expected: Self::PREFIX,
                got: prefix.to_string(),
            });
        }
        Ok(Self(Uuid::parse_str(uuid_str)?))
    }
}

impl Serialize for WorkToken {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for WorkToken {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_id_roundtrips_through_json() {
        let id = FlowId::new("f1");
        let json = serde_json::to_string(&id).unwrap();
        let parsed: FlowId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn work_token_display_and_parse_roundtrip() {
        let token = WorkToken::new();
        let s = token.to_string();
        assert!(s.starts_with("work_"));
        let parsed: WorkToken = s.parse().unwrap();
        assert_eq!(token, parsed);
    }

    #[test]
    fn work_token_rejects_wrong_prefix() {
        let other = "task_01961a8e-7d3a-7f1c-9b2e-4a5c6d7e8f90";
        let result = other.parse::<WorkToken>();
        assert!(matches!(result, Err(IdParseError::WrongPrefix { .. })));
    }

    #[test]
    fn work_tokens_are_unique() {
        assert_ne!(WorkToken::new(), WorkToken::new());
    }
}
