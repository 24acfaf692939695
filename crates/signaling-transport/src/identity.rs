//! Identities and call identifiers shared by both ends of the relay

use std::fmt;

use serde::{Deserialize, Serialize};

/// Opaque identifier of a registered endpoint
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdentityId(pub String);

impl IdentityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for IdentityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for IdentityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for IdentityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Which side of a consultation an identity plays
///
/// The relay historically called these `patient` and `doctor`; both
/// spellings are accepted on the wire.
#[derive(Debug, Clone, Copy, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    #[serde(alias = "patient")]
    Initiator,
    #[serde(alias = "doctor")]
    Responder,
}

impl Role {
    /// The role expected on the other end of a call
    pub fn counterpart(self) -> Self {
        match self {
            Role::Initiator => Role::Responder,
            Role::Responder => Role::Initiator,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Initiator => write!(f, "initiator"),
            Role::Responder => write!(f, "responder"),
        }
    }
}

/// An authenticated endpoint; immutable for the lifetime of a client session
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: IdentityId,
    pub display_name: String,
    pub role: Role,
}

impl Identity {
    pub fn new(id: impl Into<IdentityId>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
        }
    }
}

/// Identifier of one call attempt
///
/// Generated ids combine both endpoint ids with a random component, so a
/// retry between the same two parties never collides with an earlier attempt.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallId(pub String);

impl CallId {
    pub fn generate(from: &IdentityId, to: &IdentityId) -> Self {
        Self(format!("{}_{}_{}", from, to, uuid::Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CallId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_call_ids_are_unique_per_attempt() {
        let p = IdentityId::from("patient-1");
        let d = IdentityId::from("doctor-7");

        let first = CallId::generate(&p, &d);
        let second = CallId::generate(&p, &d);

        assert_ne!(first, second);
        assert!(first.as_str().starts_with("patient-1_doctor-7_"));
    }

    #[test]
    fn legacy_role_names_are_accepted() {
        let role: Role = serde_json::from_str("\"doctor\"").unwrap();
        assert_eq!(role, Role::Responder);
        let role: Role = serde_json::from_str("\"patient\"").unwrap();
        assert_eq!(role, Role::Initiator);
        assert_eq!(serde_json::to_string(&Role::Initiator).unwrap(), "\"initiator\"");
    }
}
