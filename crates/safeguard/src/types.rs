//! Core types shared by every component.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a cloud resource: its type tag plus its name.
///
/// Renders as `type/name`, which is also the key used in the state document.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId {
    /// Resource type tag (e.g., "instance", "disk", "network")
    #[serde(rename = "type")]
    pub kind: String,
    /// Resource name, unique within its type
    pub name: String,
}

impl ResourceId {
    /// Create a new resource identity.
    pub fn new(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Key used for this resource inside the state document.
    pub fn key(&self) -> String {
        format!("{}/{}", self.kind, self.name)
    }

    /// Filesystem-safe stem for entries named after this resource.
    ///
    /// Bytes outside `[A-Za-z0-9._-]` are percent-encoded, and the type and
    /// name are joined with `@`, so distinct identities never share a stem.
    pub fn file_stem(&self) -> String {
        format!("{}@{}", encode_component(&self.kind), encode_component(&self.name))
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.kind, self.name)
    }
}

impl FromStr for ResourceId {
    type Err = String;

    /// Parse `type/name`. The name may itself contain `/`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('/') {
            Some((kind, name)) if !kind.is_empty() && !name.is_empty() => {
                Ok(Self::new(kind, name))
            }
            _ => Err(format!("expected <type>/<name>, got '{s}'")),
        }
    }
}

fn encode_component(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for byte in raw.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'_' | b'-') {
            out.push(byte as char);
        } else {
            out.push_str(&format!("%{byte:02X}"));
        }
    }
    out
}

/// Lifecycle state of a tracked resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ResourceState {
    /// Never observed, or not in the state document
    #[default]
    Unknown,
    /// Observed and not under any operation
    Unlocked,
    /// A process holds the lock and is preparing a mutation
    Locked,
    /// A mutation is in flight against the provider
    Mutating,
    /// Terminal: the resource was deleted through this tool
    Deleted,
}

impl ResourceState {
    /// Lowercase name, as stored in the state document.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Unlocked => "unlocked",
            Self::Locked => "locked",
            Self::Mutating => "mutating",
            Self::Deleted => "deleted",
        }
    }

    /// Whether no further transitions are expected.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Deleted)
    }
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ResourceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unknown" => Ok(Self::Unknown),
            "unlocked" => Ok(Self::Unlocked),
            "locked" => Ok(Self::Locked),
            "mutating" => Ok(Self::Mutating),
            "deleted" => Ok(Self::Deleted),
            other => Err(format!("unknown resource state '{other}'")),
        }
    }
}

/// A resource as described by the provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Identity of the resource
    pub id: ResourceId,
    /// Provider-supplied attributes (zone, size, ...), opaque to the core
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    /// When the provider reported this descriptor
    pub observed_at: DateTime<Utc>,
}

impl ResourceDescriptor {
    /// Descriptor with no metadata, observed now.
    pub fn new(id: ResourceId) -> Self {
        Self {
            id,
            metadata: serde_json::Map::new(),
            observed_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_display_and_parse() {
        let id = ResourceId::new("disk", "disk-1");
        assert_eq!(id.to_string(), "disk/disk-1");
        assert_eq!("disk/disk-1".parse::<ResourceId>().unwrap(), id);

        let nested: ResourceId = "bucket/logs/2024".parse().unwrap();
        assert_eq!(nested.kind, "bucket");
        assert_eq!(nested.name, "logs/2024");

        assert!("disk".parse::<ResourceId>().is_err());
        assert!("/name".parse::<ResourceId>().is_err());
    }

    #[test]
    fn test_file_stem_is_filesystem_safe() {
        let id = ResourceId::new("bucket", "logs/2024 q1");
        assert_eq!(id.file_stem(), "bucket@logs%2F2024%20q1");

        // "@" in a name must not collide with the separator
        let a = ResourceId::new("a@b", "c");
        let b = ResourceId::new("a", "b@c");
        assert_ne!(a.file_stem(), b.file_stem());
    }

    #[test]
    fn test_resource_state_round_trip_names() {
        for state in [
            ResourceState::Unknown,
            ResourceState::Unlocked,
            ResourceState::Locked,
            ResourceState::Mutating,
            ResourceState::Deleted,
        ] {
            assert_eq!(state.as_str().parse::<ResourceState>().unwrap(), state);
        }
        assert!(ResourceState::Deleted.is_terminal());
        assert!(!ResourceState::Locked.is_terminal());
        assert_eq!(
            serde_json::to_string(&ResourceState::Mutating).unwrap(),
            "\"mutating\""
        );
    }
}
