use std::fmt;

/// Identifier string for a node in the mesh. Distinct from `"controller"`,
/// which is a plain string sentinel compared by value rather than a variant
/// here, matching how the rest of the wire protocol treats destinations.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
pub struct NodeId(String);

/// Destination sentinel meaning "deliver to the controller", not a specific peer.
pub const CONTROLLER: &str = "controller";

#[derive(Debug, thiserror::Error)]
pub enum NodeIdError {
    #[error("node id must not be empty")]
    Empty,
    #[error("node id too long: {0} bytes (max 255)")]
    TooLong(usize),
}

impl NodeId {
    pub fn new(raw: impl Into<String>) -> Result<Self, NodeIdError> {
        let raw = raw.into();
        if raw.is_empty() {
            return Err(NodeIdError::Empty);
        }
        if raw.len() > 255 {
            return Err(NodeIdError::TooLong(raw.len()));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
