//! NewType wrappers for strong typing throughout the runtime agent.
//!
//! These types prevent accidental mixing of semantically different strings
//! (e.g., passing a tool name where a worker config id is expected).

use serde::{Deserialize, Serialize};
use std::fmt;

/// Macro to generate a NewType wrapper with standard trait implementations.
macro_rules! newtype_string {
    (
        $(#[$meta:meta])*
        $name:ident
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create a new instance.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Get the inner value as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            /// Consume and return the inner String.
            pub fn into_inner(self) -> String {
                self.0
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_string())
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl std::borrow::Borrow<str> for $name {
            fn borrow(&self) -> &str {
                &self.0
            }
        }
    };
}

newtype_string!(
    /// Bus-issued identity id for a runtime or a skill session.
    ///
    /// Created by the control plane during the connect handshake and carried
    /// on every subsequent bus publication. It is distinct from human-facing
    /// runtime names.
    IdentityId
);

newtype_string!(
    /// Tenant boundary identifier.
    ///
    /// All configuration, tools, and sessions belong to exactly one
    /// workspace. Returned by the connect handshake.
    WorkspaceId
);

newtype_string!(
    /// Inbound MCP session identifier.
    ///
    /// Visible-ASCII only (0x21-0x7E); requests carrying anything else are
    /// rejected before session lookup.
    SessionId
);

newtype_string!(
    /// Tool name as advertised to MCP clients.
    ///
    /// Unique within one skill surface. Distinct from `ConfigId`, which
    /// names the server configuration a tool originates from.
    ToolName
);

newtype_string!(
    /// Identifier of a declarative tool-server or smart-skill configuration.
    ///
    /// The reconciler keys its worker map on this. A new config version
    /// keeps the same id but changes the content signature.
    ConfigId
);

newtype_string!(
    /// Per-call correlation id stamped on tool-call requests and replies,
    /// including relayed calls between runtimes.
    CallId
);

impl SessionId {
    /// Whether every byte is visible ASCII (0x21-0x7E).
    pub fn is_valid_format(&self) -> bool {
        !self.0.is_empty() && self.0.bytes().all(|b| (0x21..=0x7e).contains(&b))
    }

    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl CallId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_id_creation() {
        let id = IdentityId::new("rt-abc123");
        assert_eq!(id.as_str(), "rt-abc123");
        assert_eq!(id.to_string(), "rt-abc123");
    }

    #[test]
    fn test_identity_id_serde() {
        let id = IdentityId::new("rt-abc123");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"rt-abc123\"");

        let parsed: IdentityId = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn test_session_id_valid_format() {
        assert!(SessionId::new("abc-123_XYZ").is_valid_format());
        assert!(SessionId::new("!~").is_valid_format());
    }

    #[test]
    fn test_session_id_invalid_format() {
        assert!(!SessionId::new("").is_valid_format());
        assert!(!SessionId::new("bad id").is_valid_format());
        assert!(!SessionId::new("bad\x01id").is_valid_format());
        assert!(!SessionId::new("snowman\u{2603}").is_valid_format());
    }

    #[test]
    fn test_session_id_generate_is_valid() {
        assert!(SessionId::generate().is_valid_format());
    }

    #[test]
    fn test_tool_name_ordering() {
        let a = ToolName::new("alpha");
        let b = ToolName::new("beta");
        assert!(a < b);
    }

    #[test]
    fn test_config_id_hash() {
        use std::collections::HashSet;

        let mut set = HashSet::new();
        set.insert(ConfigId::new("filesystem"));
        set.insert(ConfigId::new("github"));

        assert!(set.contains(&ConfigId::new("filesystem")));
        assert!(!set.contains(&ConfigId::new("gitlab")));
    }

    #[test]
    fn test_call_id_generate_unique() {
        assert_ne!(CallId::generate(), CallId::generate());
    }

    #[test]
    fn test_borrow() {
        use std::borrow::Borrow;
        let id = ConfigId::new("filesystem");
        let s: &str = id.borrow();
        assert_eq!(s, "filesystem");
    }
}
