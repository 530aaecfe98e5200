use std::collections::BTreeMap;

use ahash::AHashMap;
use inject_schema::{BlockState, Vec3D, Vec3I};
use thiserror::Error;

use crate::nbt::{Compound, NbtError, Tag};

#[derive(Debug, Error)]
pub enum StructureError {
    #[error("block already placed at {0}")]
    Occupied(Vec3I),
    #[error("coordinate {0} lies outside the structure's positive octant")]
    OutOfRange(Vec3I),
    #[error("structure is missing field '{0}'")]
    Malformed(&'static str),
    #[error(transparent)]
    Nbt(#[from] NbtError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructureBlock {
    pub state: BlockState,
    pub nbt: Option<Compound>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StructureEntity {
    pub pos: Vec3D,
    pub nbt: Compound,
}

/// One packet: the blocks and entities loaded into the world in one step.
#[derive(Debug, Clone, PartialEq)]
pub struct Structure {
    data_version: i32,
    author: String,
    background: Option<BlockState>,
    blocks: BTreeMap<Vec3I, StructureBlock>,
    entities: Vec<StructureEntity>,
}

impl Structure {
    pub fn new(data_version: i32, author: impl Into<String>) -> Self {
        Self {
            data_version,
            author: author.into(),
            background: None,
            blocks: BTreeMap::new(),
            entities: Vec::new(),
        }
    }

    /// Fill every unoccupied coordinate of the encoded footprint with `state`.
    pub fn with_background(mut self, state: Option<BlockState>) -> Self {
        self.background = state;
        self
    }

    pub fn insert_block(
        &mut self,
        position: Vec3I,
        state: BlockState,
        nbt: Option<Compound>,
    ) -> Result<(), StructureError> {
        if position.x < 0 || position.y < 0 || position.z < 0 {
            return Err(StructureError::OutOfRange(position));
        }
        if self.blocks.contains_key(&position) {
            return Err(StructureError::Occupied(position));
        }
        self.blocks.insert(position, StructureBlock { state, nbt });
        Ok(())
    }

    pub fn add_entity(&mut self, pos: Vec3D, nbt: Compound) -> Result<(), StructureError> {
        if pos.x < 0.0 || pos.y < 0.0 || pos.z < 0.0 {
            return Err(StructureError::OutOfRange(pos.floor()));
        }
        self.entities.push(StructureEntity { pos, nbt });
        Ok(())
    }

    pub fn data_version(&self) -> i32 {
        self.data_version
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn background(&self) -> Option<&BlockState> {
        self.background.as_ref()
    }

    pub fn block(&self, position: Vec3I) -> Option<&StructureBlock> {
        self.blocks.get(&position)
    }

    pub fn blocks(&self) -> impl Iterator<Item = (Vec3I, &StructureBlock)> {
        self.blocks.iter().map(|(pos, block)| (*pos, block))
    }

    pub fn entities(&self) -> &[StructureEntity] {
        &self.entities
    }

    /// Component-wise maximum coordinate + 1 over blocks and entities.
    pub fn footprint(&self) -> Vec3I {
        let blocks = self
            .blocks
            .keys()
            .map(|pos| *pos + Vec3I::new(1, 1, 1));
        let entities = self.entities.iter().map(|entity| entity.pos.ceil());
        blocks
            .chain(entities)
            .fold(Vec3I::ZERO, |acc, corner| acc.max(corner))
    }
}

/// Serializes structures, never letting the size shrink below the footprint of
/// an earlier packet so each load fully overwrites its predecessor.
#[derive(Debug, Clone, Default)]
pub struct StructureEncoder {
    footprint: Vec3I,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodedStructure {
    pub size: Vec3I,
    pub palette: Vec<BlockState>,
    pub root: Compound,
}

impl EncodedStructure {
    /// Gzip-compressed named NBT, the on-disk packet format.
    pub fn to_bytes(&self) -> Result<Vec<u8>, NbtError> {
        crate::write_gzip(&self.root)
    }
}

#[derive(Default)]
struct Palette {
    states: Vec<BlockState>,
    index: AHashMap<BlockState, i32>,
}

impl Palette {
    fn index_of(&mut self, state: &BlockState) -> i32 {
        if let Some(index) = self.index.get(state) {
            return *index;
        }
        let index = self.states.len() as i32;
        self.states.push(state.clone());
        self.index.insert(state.clone(), index);
        index
    }

    fn to_tag(&self) -> Tag {
        Tag::List(
            self.states
                .iter()
                .map(|state| {
                    let mut entry = Compound::new().with("Name", Tag::string(state.name()));
                    if !state.properties().is_empty() {
                        let mut properties = Compound::new();
                        for (key, value) in state.properties() {
                            properties.insert(key.clone(), Tag::string(value.clone()));
                        }
                        entry.insert("Properties", properties.into());
                    }
                    Tag::Compound(entry)
                })
                .collect(),
        )
    }
}

impl StructureEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts from a known footprint, e.g. the header region of a session.
    pub fn with_footprint(footprint: Vec3I) -> Self {
        Self { footprint }
    }

    pub fn footprint(&self) -> Vec3I {
        self.footprint
    }

    pub fn encode(&mut self, structure: &Structure) -> EncodedStructure {
        let size = structure.footprint().max(self.footprint);
        self.footprint = size;

        let mut palette = Palette::default();
        let mut blocks = Vec::with_capacity(structure.blocks.len());
        for (pos, block) in structure.blocks() {
            let mut entry = Compound::new()
                .with("state", Tag::Int(palette.index_of(&block.state)))
                .with("pos", Tag::int_list(&pos.as_array()));
            if let Some(nbt) = &block.nbt {
                entry.insert("nbt", nbt.clone().into());
            }
            blocks.push(Tag::Compound(entry));
        }

        if let Some(background) = structure.background() {
            for y in 0..size.y {
                for z in 0..size.z {
                    for x in 0..size.x {
                        let pos = Vec3I::new(x, y, z);
                        if structure.blocks.contains_key(&pos) {
                            continue;
                        }
                        let entry = Compound::new()
                            .with("state", Tag::Int(palette.index_of(background)))
                            .with("pos", Tag::int_list(&pos.as_array()));
                        blocks.push(Tag::Compound(entry));
                    }
                }
            }
        }

        let entities = structure
            .entities()
            .iter()
            .map(|entity| {
                Tag::Compound(
                    Compound::new()
                        .with(
                            "pos",
                            Tag::double_list(&[entity.pos.x, entity.pos.y, entity.pos.z]),
                        )
                        .with("blockPos", Tag::int_list(&entity.pos.floor().as_array()))
                        .with("nbt", entity.nbt.clone().into()),
                )
            })
            .collect();

        let root = Compound::new()
            .with("DataVersion", Tag::Int(structure.data_version))
            .with("author", Tag::string(structure.author.clone()))
            .with("size", Tag::int_list(&size.as_array()))
            .with("palette", palette.to_tag())
            .with("blocks", Tag::List(blocks))
            .with("entities", Tag::List(entities));

        EncodedStructure {
            size,
            palette: palette.states,
            root,
        }
    }
}

/// Block entry of a decoded packet.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBlock {
    pub pos: Vec3I,
    pub state: BlockState,
    pub nbt: Option<Compound>,
}

/// Read-side view of a packet, used by tools that inspect written files.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedStructure {
    pub data_version: i32,
    pub author: String,
    pub size: Vec3I,
    pub palette: Vec<BlockState>,
    pub blocks: Vec<DecodedBlock>,
    pub entities: Vec<StructureEntity>,
}

impl DecodedStructure {
    pub fn from_gzip(bytes: &[u8]) -> Result<Self, StructureError> {
        let root = crate::read_gzip(bytes)?;
        Self::from_root(&root)
    }

    pub fn from_root(root: &Compound) -> Result<Self, StructureError> {
        let data_version = root
            .get_i64("DataVersion")
            .ok_or(StructureError::Malformed("DataVersion"))? as i32;
        let author = root.get_str("author").unwrap_or_default().to_string();
        let size = read_int_triple(root.get_list("size").ok_or(StructureError::Malformed("size"))?)
            .ok_or(StructureError::Malformed("size"))?;

        let mut palette = Vec::new();
        for entry in root
            .get_list("palette")
            .ok_or(StructureError::Malformed("palette"))?
        {
            let entry = entry.as_compound().ok_or(StructureError::Malformed("palette"))?;
            let mut state =
                BlockState::new(entry.get_str("Name").ok_or(StructureError::Malformed("Name"))?);
            if let Some(properties) = entry.get_compound("Properties") {
                for (key, value) in properties.iter() {
                    state = state.with(key, value.as_str().unwrap_or_default());
                }
            }
            palette.push(state);
        }

        let mut blocks = Vec::new();
        for entry in root
            .get_list("blocks")
            .ok_or(StructureError::Malformed("blocks"))?
        {
            let entry = entry.as_compound().ok_or(StructureError::Malformed("blocks"))?;
            let index = entry
                .get_i64("state")
                .ok_or(StructureError::Malformed("state"))?;
            let state = usize::try_from(index)
                .ok()
                .and_then(|index| palette.get(index))
                .cloned()
                .ok_or(StructureError::Malformed("state"))?;
            let pos = entry
                .get_list("pos")
                .and_then(read_int_triple)
                .ok_or(StructureError::Malformed("pos"))?;
            blocks.push(DecodedBlock {
                pos,
                state,
                nbt: entry.get_compound("nbt").cloned(),
            });
        }

        let mut entities = Vec::new();
        for entry in root
            .get_list("entities")
            .ok_or(StructureError::Malformed("entities"))?
        {
            let entry = entry.as_compound().ok_or(StructureError::Malformed("entities"))?;
            let pos = entry
                .get_list("pos")
                .and_then(|items| {
                    let values: Vec<f64> = items.iter().filter_map(Tag::as_f64).collect();
                    (values.len() == 3).then(|| Vec3D::new(values[0], values[1], values[2]))
                })
                .ok_or(StructureError::Malformed("pos"))?;
            entities.push(StructureEntity {
                pos,
                nbt: entry.get_compound("nbt").cloned().unwrap_or_default(),
            });
        }

        Ok(Self {
            data_version,
            author,
            size,
            palette,
            blocks,
            entities,
        })
    }

    pub fn block_at(&self, pos: Vec3I) -> Option<&DecodedBlock> {
        self.blocks.iter().find(|block| block.pos == pos)
    }
}

fn read_int_triple(items: &[Tag]) -> Option<Vec3I> {
    let values: Vec<i64> = items.iter().filter_map(Tag::as_i64).collect();
    match values.as_slice() {
        [x, y, z] => Some(Vec3I::new(*x as i32, *y as i32, *z as i32)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain(facing: &str) -> BlockState {
        BlockState::new("minecraft:chain_command_block")
            .with("conditional", false)
            .with("facing", facing)
    }

    #[test]
    fn rejects_second_block_at_same_coordinate() {
        let mut structure = Structure::new(1343, "test");
        structure
            .insert_block(Vec3I::new(1, 0, 0), chain("east"), None)
            .unwrap();
        let err = structure
            .insert_block(Vec3I::new(1, 0, 0), chain("west"), None)
            .unwrap_err();
        assert!(matches!(err, StructureError::Occupied(pos) if pos == Vec3I::new(1, 0, 0)));
        assert_eq!(structure.block(Vec3I::new(1, 0, 0)).unwrap().state, chain("east"));
    }

    #[test]
    fn palette_collapses_equal_states() {
        let mut structure = Structure::new(1343, "test");
        for x in 0..6 {
            let facing = if x % 2 == 0 { "east" } else { "up" };
            structure
                .insert_block(Vec3I::new(x, 0, 0), chain(facing), None)
                .unwrap();
        }
        let encoded = StructureEncoder::new().encode(&structure);
        assert_eq!(encoded.palette, vec![chain("east"), chain("up")]);

        let decoded = DecodedStructure::from_root(&encoded.root).unwrap();
        for block in &decoded.blocks {
            let expected = if block.pos.x % 2 == 0 { "east" } else { "up" };
            assert_eq!(block.state.property("facing"), Some(expected));
        }
    }

    #[test]
    fn size_covers_entities_and_never_shrinks() {
        let mut encoder = StructureEncoder::new();
        let mut wide = Structure::new(1343, "test");
        wide.insert_block(Vec3I::new(5, 0, 0), BlockState::new("minecraft:stone"), None)
            .unwrap();
        wide.add_entity(Vec3D::new(2.5, 3.0625, 0.5), Compound::new())
            .unwrap();
        assert_eq!(encoder.encode(&wide).size, Vec3I::new(6, 4, 1));

        let mut narrow = Structure::new(1343, "test");
        narrow
            .insert_block(Vec3I::new(0, 0, 2), BlockState::new("minecraft:stone"), None)
            .unwrap();
        assert_eq!(encoder.encode(&narrow).size, Vec3I::new(6, 4, 3));
    }

    #[test]
    fn background_fills_unoccupied_cells() {
        let mut structure =
            Structure::new(1343, "test").with_background(Some(BlockState::air()));
        structure
            .insert_block(Vec3I::new(1, 0, 0), BlockState::new("minecraft:redstone_block"), None)
            .unwrap();
        let encoded = StructureEncoder::with_footprint(Vec3I::new(2, 2, 1)).encode(&structure);
        assert_eq!(encoded.size, Vec3I::new(2, 2, 1));
        assert_eq!(encoded.palette.len(), 2);
        let decoded = DecodedStructure::from_root(&encoded.root).unwrap();
        assert_eq!(decoded.blocks.len(), 4);
        assert_eq!(
            decoded.block_at(Vec3I::new(0, 1, 0)).unwrap().state,
            BlockState::air()
        );
    }

    #[test]
    fn root_fields_follow_fixed_order() {
        let mut structure = Structure::new(1343, "inject");
        structure
            .add_entity(
                Vec3D::new(2.5, 0.0625, 0.5),
                Compound::new().with("id", Tag::string("minecraft:commandblock_minecart")),
            )
            .unwrap();
        let encoded = StructureEncoder::new().encode(&structure);
        let keys: Vec<&str> = encoded.root.iter().map(|(key, _)| key).collect();
        assert_eq!(
            keys,
            vec!["DataVersion", "author", "size", "palette", "blocks", "entities"]
        );
        let entity = encoded.root.get_list("entities").unwrap()[0]
            .as_compound()
            .unwrap();
        assert_eq!(entity.get_list("blockPos").unwrap(), &[Tag::Int(2), Tag::Int(0), Tag::Int(0)]);

        let bytes = encoded.to_bytes().unwrap();
        let decoded = DecodedStructure::from_gzip(&bytes).unwrap();
        assert_eq!(decoded.author, "inject");
        assert_eq!(decoded.entities[0].pos, Vec3D::new(2.5, 0.0625, 0.5));
    }
}
