//! Access-level tags carried by every identity and every bearer token.

use serde::{Deserialize, Serialize};

/// Coarse-grained role used for authorization decisions.
///
/// External systems are ordinary identities holding [`Role::ExtSys`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Admin,
    User,
    ExtSys,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Admin => "admin",
            Self::User => "user",
            Self::ExtSys => "ext_sys",
        }
    }

    /// Whether this role appears in `required`. An empty set admits every role.
    pub fn is_member_of(self, required: &[Role]) -> bool {
        required.is_empty() || required.contains(&self)
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a stored or supplied role string is not one of the known tags.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown role: {0}")]
pub struct UnknownRole(pub String);

impl std::str::FromStr for Role {
    type Err = UnknownRole;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "admin" => Ok(Self::Admin),
            "user" => Ok(Self::User),
            "ext_sys" => Ok(Self::ExtSys),
            other => Err(UnknownRole(other.to_string())),
        }
    }
}
