use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::Vec3I;

/// A block identifier together with its state properties.
///
/// Equality and hashing are by value, so two states built independently with
/// the same name and properties collapse to the same palette entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct BlockState {
    name: String,
    properties: BTreeMap<String, String>,
}

impl BlockState {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            properties: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.properties.insert(key.into(), value.to_string());
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn properties(&self) -> &BTreeMap<String, String> {
        &self.properties
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn air() -> Self {
        BlockState::new("minecraft:air")
    }
}

impl fmt::Display for BlockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if self.properties.is_empty() {
            return Ok(());
        }
        f.write_str("[")?;
        for (index, (key, value)) in self.properties.iter().enumerate() {
            if index > 0 {
                f.write_str(",")?;
            }
            write!(f, "{key}={value}")?;
        }
        f.write_str("]")
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum BlockStateParseError {
    #[error("empty block state")]
    Empty,
    #[error("unterminated property list in '{0}'")]
    Unterminated(String),
    #[error("malformed property '{property}' in '{input}'")]
    MalformedProperty { input: String, property: String },
}

impl FromStr for BlockState {
    type Err = BlockStateParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(BlockStateParseError::Empty);
        }
        let Some((name, rest)) = trimmed.split_once('[') else {
            return Ok(BlockState::new(trimmed));
        };
        let body = rest
            .strip_suffix(']')
            .ok_or_else(|| BlockStateParseError::Unterminated(trimmed.to_string()))?;
        if name.is_empty() {
            return Err(BlockStateParseError::Empty);
        }
        let mut state = BlockState::new(name);
        for property in body.split(',').filter(|p| !p.trim().is_empty()) {
            let (key, value) = property.split_once('=').ok_or_else(|| {
                BlockStateParseError::MalformedProperty {
                    input: trimmed.to_string(),
                    property: property.to_string(),
                }
            })?;
            state = state.with(key.trim(), value.trim());
        }
        Ok(state)
    }
}

impl TryFrom<String> for BlockState {
    type Error = BlockStateParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<BlockState> for String {
    fn from(value: BlockState) -> Self {
        value.to_string()
    }
}

/// World dimension as numbered by the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dimension {
    Nether,
    Overworld,
    End,
}

impl Dimension {
    pub fn id(self) -> i32 {
        match self {
            Dimension::Nether => -1,
            Dimension::Overworld => 0,
            Dimension::End => 1,
        }
    }

    pub fn from_id(id: i32) -> Option<Self> {
        match id {
            -1 => Some(Dimension::Nether),
            0 => Some(Dimension::Overworld),
            1 => Some(Dimension::End),
            _ => None,
        }
    }
}

/// Biome column identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Biome {
    pub id: u8,
    pub name: String,
}

/// Read-only view of world geometry supplied by an external region reader.
///
/// Client code uses it to plan commands against the current terrain; the
/// transport itself never consults it.
pub trait BlockLookup {
    fn block(&self, position: Vec3I, dimension: Dimension) -> BlockState;

    fn biome(&self, x: i32, z: i32, dimension: Dimension) -> Biome;

    /// Highest non-air block in the column, if any.
    fn surface(&self, x: i32, z: i32, dimension: Dimension, ceiling: i32) -> Option<Vec3I> {
        (0..=ceiling)
            .rev()
            .map(|y| Vec3I::new(x, y, z))
            .find(|position| self.block(*position, dimension).name() != "minecraft:air")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn display_and_parse_agree() {
        let state = BlockState::new("minecraft:chain_command_block")
            .with("facing", "east")
            .with("conditional", true);
        let text = state.to_string();
        assert_eq!(
            text,
            "minecraft:chain_command_block[conditional=true,facing=east]"
        );
        assert_eq!(text.parse::<BlockState>().unwrap(), state);
        assert_eq!(
            "minecraft:air".parse::<BlockState>().unwrap(),
            BlockState::air()
        );
    }

    #[test]
    fn parse_rejects_malformed_states() {
        assert_eq!("".parse::<BlockState>(), Err(BlockStateParseError::Empty));
        assert!(matches!(
            "minecraft:rail[shape=north_south".parse::<BlockState>(),
            Err(BlockStateParseError::Unterminated(_))
        ));
        assert!(matches!(
            "minecraft:rail[shape]".parse::<BlockState>(),
            Err(BlockStateParseError::MalformedProperty { .. })
        ));
    }

    #[test]
    fn dimension_ids() {
        for dimension in [Dimension::Nether, Dimension::Overworld, Dimension::End] {
            assert_eq!(Dimension::from_id(dimension.id()), Some(dimension));
        }
        assert_eq!(Dimension::from_id(7), None);
    }

    struct Column(HashMap<Vec3I, BlockState>);

    impl BlockLookup for Column {
        fn block(&self, position: Vec3I, _dimension: Dimension) -> BlockState {
            self.0.get(&position).cloned().unwrap_or_else(BlockState::air)
        }

        fn biome(&self, _x: i32, _z: i32, _dimension: Dimension) -> Biome {
            Biome {
                id: 1,
                name: "minecraft:plains".into(),
            }
        }
    }

    #[test]
    fn surface_scans_down_from_ceiling() {
        let mut blocks = HashMap::new();
        blocks.insert(Vec3I::new(0, 3, 0), BlockState::new("minecraft:stone"));
        blocks.insert(Vec3I::new(0, 7, 0), BlockState::new("minecraft:grass"));
        let lookup = Column(blocks);
        assert_eq!(
            lookup.surface(0, 0, Dimension::Overworld, 16),
            Some(Vec3I::new(0, 7, 0))
        );
        assert_eq!(lookup.surface(1, 0, Dimension::Overworld, 16), None);
    }
}
