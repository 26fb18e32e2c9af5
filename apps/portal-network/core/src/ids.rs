use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

const DEFAULT_NAMESPACE: &str = "minecraft";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("invalid endpoint id {0:?}")]
    InvalidEndpointId(String),
    #[error("invalid resource id {0:?}")]
    InvalidResourceId(String),
    #[error("invalid block position {0:?}; expected x,y,z")]
    InvalidBlockPos(String),
}

/// Stable 128-bit identity of a registered endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EndpointId(Uuid);

impl EndpointId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn from_u64_pair(most: u64, least: u64) -> Self {
        Self(Uuid::from_u64_pair(most, least))
    }

    pub fn as_u64_pair(&self) -> (u64, u64) {
        self.0.as_u64_pair()
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Eight hex digits, used wherever an endpoint has no display name.
    pub fn short(&self) -> String {
        let mut simple = self.0.simple().to_string();
        simple.truncate(8);
        simple
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for EndpointId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(Self)
            .map_err(|_| IdError::InvalidEndpointId(s.to_string()))
    }
}

/// Integer block coordinate.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct BlockPos {
    pub x: i32,
    pub y: i32,
    pub z: i32,
}

impl BlockPos {
    pub const fn new(x: i32, y: i32, z: i32) -> Self {
        Self { x, y, z }
    }

    /// Chebyshev distance; the shape of every bounded scan in this crate.
    pub fn chebyshev(&self, other: &BlockPos) -> u32 {
        let dx = self.x.abs_diff(other.x);
        let dy = self.y.abs_diff(other.y);
        let dz = self.z.abs_diff(other.z);
        dx.max(dy).max(dz)
    }

    /// Chunk column containing this position.
    pub fn chunk(&self) -> (i32, i32) {
        (self.x >> 4, self.z >> 4)
    }
}

impl fmt::Display for BlockPos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {}, {})", self.x, self.y, self.z)
    }
}

impl FromStr for BlockPos {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || IdError::InvalidBlockPos(s.to_string());
        let trimmed = s.trim().trim_start_matches('(').trim_end_matches(')');
        let mut parts = trimmed.split(',').map(|part| part.trim().parse::<i32>());
        let (Some(Ok(x)), Some(Ok(y)), Some(Ok(z)), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(invalid());
        };
        Ok(Self { x, y, z })
    }
}

/// Namespaced identifier (`namespace:path`) naming a dimension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceId {
    namespace: String,
    path: String,
}

impl ResourceId {
    pub fn new(namespace: &str, path: &str) -> Result<Self, IdError> {
        let valid_namespace = !namespace.is_empty()
            && namespace
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '-' | '.'));
        let valid_path = !path.is_empty()
            && path
                .chars()
                .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '_' | '-' | '.' | '/'));
        if !valid_namespace || !valid_path {
            return Err(IdError::InvalidResourceId(format!("{namespace}:{path}")));
        }
        Ok(Self {
            namespace: namespace.to_string(),
            path: path.to_string(),
        })
    }

    pub fn overworld() -> Self {
        Self::vanilla("overworld")
    }

    pub fn nether() -> Self {
        Self::vanilla("the_nether")
    }

    pub fn end() -> Self {
        Self::vanilla("the_end")
    }

    fn vanilla(path: &str) -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            path: path.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.namespace, self.path)
    }
}

impl FromStr for ResourceId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((namespace, path)) => Self::new(namespace, path),
            None => Self::new(DEFAULT_NAMESPACE, s),
        }
    }
}

impl TryFrom<String> for ResourceId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceId> for String {
    fn from(value: ResourceId) -> Self {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_timeout::timeout]
    fn endpoint_id_survives_u64_pair_split() {
        let id = EndpointId::generate();
        let (most, least) = id.as_u64_pair();
        assert_eq!(EndpointId::from_u64_pair(most, least), id);
        assert_eq!(id.short().len(), 8);
        assert!(id.to_string().starts_with(&id.short()));
    }

    #[test_timeout::timeout]
    fn resource_id_defaults_namespace() {
        let parsed: ResourceId = "the_nether".parse().expect("parse");
        assert_eq!(parsed, ResourceId::nether());
        assert_eq!(parsed.to_string(), "minecraft:the_nether");
        assert!("Bad:Caps".parse::<ResourceId>().is_err());
        assert!("ns:".parse::<ResourceId>().is_err());
    }

    #[test_timeout::timeout]
    fn block_pos_parses_cli_forms() {
        assert_eq!(
            "10,64,-3".parse::<BlockPos>().expect("parse"),
            BlockPos::new(10, 64, -3)
        );
        assert_eq!(
            "(1, 2, 3)".parse::<BlockPos>().expect("parse"),
            BlockPos::new(1, 2, 3)
        );
        assert!("1,2".parse::<BlockPos>().is_err());
        assert!("1,2,3,4".parse::<BlockPos>().is_err());
    }

    #[test_timeout::timeout]
    fn chebyshev_and_chunk() {
        let a = BlockPos::new(0, 0, 0);
        assert_eq!(a.chebyshev(&BlockPos::new(3, -5, 1)), 5);
        assert_eq!(BlockPos::new(-1, 0, 17).chunk(), (-1, 1));
    }
}
