//! Turns drained command batches into one loadable packet.
//!
//! Every packet carries the same three-block header on the x axis: a
//! structure block in LOAD mode naming the next packet, a redstone block
//! powering it, and an activator rail the minecart batch rides on. Above
//! the header a repeating/chain pair knocks the redstone block out and puts
//! it back every tick, so the structure block keeps retrying the load until
//! the next file shows up.

use std::sync::Arc;

use inject_proto::{Compound, Structure, StructureError, Tag};
use inject_runtime::{BlockState, Bounds, Command, Direction, InjectionType, Vec3D, Vec3I};
use thiserror::Error;

use crate::curve::snake_curve;
use crate::placement::{ChainPlacer, PlacedCommand, PlacementError};

pub const STRUCTURE_BLOCK_POS: Vec3I = Vec3I::new(0, 0, 0);
pub const POWER_POS: Vec3I = Vec3I::new(1, 0, 0);
pub const RAIL_POS: Vec3I = Vec3I::new(2, 0, 0);
pub const CLOCK_REPEAT_POS: Vec3I = Vec3I::new(0, 1, 0);
pub const CLOCK_CHAIN_POS: Vec3I = Vec3I::new(1, 1, 0);

pub const HEADER_BOUNDS: Bounds = Bounds {
    min: Vec3I::new(0, 0, 0),
    max: Vec3I::new(2, 1, 0),
};

/// Height of a minecart resting on a rail.
const MINECART_RIDE_HEIGHT: f64 = 0.0625;

const STRUCTURE_BLOCK: &str = "minecraft:structure_block";
const IMPULSE_BLOCK: &str = "minecraft:command_block";
const REPEATING_BLOCK: &str = "minecraft:repeating_command_block";
const CHAIN_BLOCK: &str = "minecraft:chain_command_block";
const COMMAND_BLOCK_ENTITY: &str = "minecraft:command_block";
const MINECART_ENTITY: &str = "minecraft:commandblock_minecart";

#[derive(Debug, Error)]
pub enum AssemblyError {
    #[error("identifier '{0}' must be non-empty and use only a-z, 0-9, '_', '-' or '.'")]
    InvalidIdentifier(String),
    #[error("{region} bounds {bounds} must lie at non-negative coordinates")]
    NegativeBounds { region: &'static str, bounds: Bounds },
    #[error("{region} bounds {bounds} overlap the {other} region")]
    Overlap {
        region: &'static str,
        other: &'static str,
        bounds: Bounds,
    },
    #[error("{kind} batch does not fit: {source}")]
    Placement {
        kind: InjectionType,
        #[source]
        source: PlacementError,
    },
    #[error(transparent)]
    Structure(#[from] StructureError),
}

impl AssemblyError {
    pub fn is_capacity(&self) -> bool {
        matches!(
            self,
            AssemblyError::Placement {
                source: PlacementError::CapacityExceeded { .. },
                ..
            }
        )
    }
}

pub fn validate_identifier(identifier: &str) -> Result<(), AssemblyError> {
    let valid = !identifier.is_empty()
        && identifier
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(AssemblyError::InvalidIdentifier(identifier.to_string()))
    }
}

/// Name a structure block uses to load packet `id` of a session.
pub fn structure_name(identifier: &str, id: u64) -> String {
    format!("inject/{identifier}/{id}")
}

/// One packet's worth of commands, split by encoding.
#[derive(Debug, Clone, Default)]
pub struct Batches {
    pub minecart: Vec<Arc<Command>>,
    pub impulse: Vec<Arc<Command>>,
    pub repeat: Vec<Arc<Command>>,
}

impl Batches {
    pub fn get(&self, kind: InjectionType) -> &Vec<Arc<Command>> {
        match kind {
            InjectionType::Minecart => &self.minecart,
            InjectionType::Impulse => &self.impulse,
            InjectionType::Repeat => &self.repeat,
        }
    }

    pub fn get_mut(&mut self, kind: InjectionType) -> &mut Vec<Arc<Command>> {
        match kind {
            InjectionType::Minecart => &mut self.minecart,
            InjectionType::Impulse => &mut self.impulse,
            InjectionType::Repeat => &mut self.repeat,
        }
    }

    pub fn is_empty(&self) -> bool {
        InjectionType::ALL
            .into_iter()
            .all(|kind| self.get(kind).is_empty())
    }

    pub fn len(&self) -> usize {
        InjectionType::ALL
            .into_iter()
            .map(|kind| self.get(kind).len())
            .sum()
    }
}

/// Fixed geometry and metadata of every packet in one session.
#[derive(Debug, Clone)]
pub struct PacketLayout {
    identifier: String,
    data_version: i32,
    author: String,
    background: Option<BlockState>,
    impulse_bounds: Bounds,
    repeat_bounds: Bounds,
    impulse: ChainPlacer,
    repeat: ChainPlacer,
}

impl PacketLayout {
    pub fn new(
        identifier: impl Into<String>,
        data_version: i32,
        author: impl Into<String>,
        background: Option<BlockState>,
        impulse_bounds: Bounds,
        repeat_bounds: Bounds,
    ) -> Result<Self, AssemblyError> {
        let identifier = identifier.into();
        validate_identifier(&identifier)?;
        check_regions(impulse_bounds, repeat_bounds)?;
        Ok(Self {
            identifier,
            data_version,
            author: author.into(),
            background,
            impulse: placer_for(InjectionType::Impulse, impulse_bounds)?,
            repeat: placer_for(InjectionType::Repeat, repeat_bounds)?,
            impulse_bounds,
            repeat_bounds,
        })
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn impulse_bounds(&self) -> Bounds {
        self.impulse_bounds
    }

    pub fn repeat_bounds(&self) -> Bounds {
        self.repeat_bounds
    }

    pub fn set_impulse_bounds(&mut self, bounds: Bounds) -> Result<(), AssemblyError> {
        check_regions(bounds, self.repeat_bounds)?;
        self.impulse = placer_for(InjectionType::Impulse, bounds)?;
        self.impulse_bounds = bounds;
        Ok(())
    }

    pub fn set_repeat_bounds(&mut self, bounds: Bounds) -> Result<(), AssemblyError> {
        check_regions(self.impulse_bounds, bounds)?;
        self.repeat = placer_for(InjectionType::Repeat, bounds)?;
        self.repeat_bounds = bounds;
        Ok(())
    }

    /// Size that covers the header and both chain regions.
    pub fn footprint(&self) -> Vec3I {
        HEADER_BOUNDS
            .union(&self.impulse_bounds)
            .union(&self.repeat_bounds)
            .max
            + Vec3I::new(1, 1, 1)
    }

    pub fn minecart_tag(&self, id: u64) -> String {
        format!("{}_{}", self.identifier, id)
    }

    /// Builds packet `id`. Batches must already carry any logging wrapper.
    pub fn assemble(&self, id: u64, batches: &Batches) -> Result<Structure, AssemblyError> {
        let mut structure = Structure::new(self.data_version, self.author.clone())
            .with_background(self.background.clone());
        self.place_header(&mut structure, id)?;

        for (kind, placer, head) in [
            (InjectionType::Impulse, &self.impulse, IMPULSE_BLOCK),
            (InjectionType::Repeat, &self.repeat, REPEATING_BLOCK),
        ] {
            let placed = placer
                .place(batches.get(kind))
                .map_err(|source| AssemblyError::Placement { kind, source })?;
            for (index, entry) in placed.iter().enumerate() {
                let block = if index == 0 { head } else { CHAIN_BLOCK };
                insert_command_block(&mut structure, block, entry)?;
            }
        }

        if !batches.minecart.is_empty() {
            let tag = self.minecart_tag(id);
            let position = Vec3D::new(
                RAIL_POS.x as f64 + 0.5,
                RAIL_POS.y as f64 + MINECART_RIDE_HEIGHT,
                RAIL_POS.z as f64 + 0.5,
            );
            let cleanup = Command::new(format!("kill @e[type=commandblock_minecart,tag={tag}]"));
            for command in batches.minecart.iter().map(|c| &**c).chain([&cleanup]) {
                structure.add_entity(position, minecart_nbt(command, &tag))?;
            }
        }

        Ok(structure)
    }

    fn place_header(&self, structure: &mut Structure, id: u64) -> Result<(), StructureError> {
        let next = structure_name(&self.identifier, id + 1);
        let loader = Compound::new()
            .with("id", Tag::string(STRUCTURE_BLOCK))
            .with("name", Tag::string(next))
            .with("author", Tag::string(self.author.clone()))
            .with("metadata", Tag::string(""))
            .with("mode", Tag::string("LOAD"))
            .with("posX", Tag::Int(0))
            .with("posY", Tag::Int(0))
            .with("posZ", Tag::Int(0))
            .with("sizeX", Tag::Int(0))
            .with("sizeY", Tag::Int(0))
            .with("sizeZ", Tag::Int(0))
            .with("rotation", Tag::string("NONE"))
            .with("mirror", Tag::string("NONE"))
            .with("ignoreEntities", Tag::flag(false))
            .with("powered", Tag::flag(false))
            .with("showair", Tag::flag(false))
            .with("showboundingbox", Tag::flag(false))
            .with("integrity", Tag::Float(1.0))
            .with("seed", Tag::Long(0));
        structure.insert_block(
            STRUCTURE_BLOCK_POS,
            BlockState::new(STRUCTURE_BLOCK).with("mode", "load"),
            Some(loader),
        )?;
        structure.insert_block(POWER_POS, BlockState::new("minecraft:redstone_block"), None)?;
        structure.insert_block(
            RAIL_POS,
            BlockState::new("minecraft:activator_rail")
                .with("powered", true)
                .with("shape", "east_west"),
            None,
        )?;

        let unpower = Command::new(format!(
            "setblock ~{} ~-1 ~ minecraft:air",
            POWER_POS.x - CLOCK_REPEAT_POS.x
        ));
        let repower = Command::new("setblock ~ ~-1 ~ minecraft:redstone_block");
        for (position, block, command) in [
            (CLOCK_REPEAT_POS, REPEATING_BLOCK, unpower),
            (CLOCK_CHAIN_POS, CHAIN_BLOCK, repower),
        ] {
            structure.insert_block(
                position,
                command_block_state(block, Direction::East, false),
                Some(command_block_nbt(Some(&command))),
            )?;
        }
        Ok(())
    }
}

fn check_regions(impulse: Bounds, repeat: Bounds) -> Result<(), AssemblyError> {
    for (region, bounds) in [("impulse", impulse), ("repeat", repeat)] {
        if bounds.min.x < 0 || bounds.min.y < 0 || bounds.min.z < 0 {
            return Err(AssemblyError::NegativeBounds { region, bounds });
        }
        if bounds.intersects(&HEADER_BOUNDS) {
            return Err(AssemblyError::Overlap {
                region,
                other: "header",
                bounds,
            });
        }
    }
    if impulse.intersects(&repeat) {
        return Err(AssemblyError::Overlap {
            region: "repeat",
            other: "impulse",
            bounds: repeat,
        });
    }
    Ok(())
}

fn placer_for(kind: InjectionType, bounds: Bounds) -> Result<ChainPlacer, AssemblyError> {
    ChainPlacer::new(snake_curve(bounds)).map_err(|source| AssemblyError::Placement { kind, source })
}

fn command_block_state(block: &str, facing: Direction, conditional: bool) -> BlockState {
    BlockState::new(block)
        .with("conditional", conditional)
        .with("facing", facing.as_str())
}

fn command_block_nbt(command: Option<&Command>) -> Compound {
    let mut nbt = Compound::new()
        .with("id", Tag::string(COMMAND_BLOCK_ENTITY))
        .with(
            "Command",
            Tag::string(command.map(Command::text).unwrap_or_default()),
        )
        .with(
            "TrackOutput",
            Tag::flag(command.is_some_and(Command::tracks_output)),
        )
        .with("auto", Tag::flag(true))
        .with("powered", Tag::flag(false))
        .with("conditionMet", Tag::flag(false))
        .with("SuccessCount", Tag::Int(0));
    if let Some(name) = command.and_then(Command::name) {
        nbt.insert("CustomName", Tag::string(name));
    }
    nbt
}

fn insert_command_block(
    structure: &mut Structure,
    block: &str,
    entry: &PlacedCommand,
) -> Result<(), StructureError> {
    let command = entry.command.as_deref();
    let conditional = command.is_some_and(Command::is_conditional);
    structure.insert_block(
        entry.coordinate,
        command_block_state(block, entry.facing, conditional),
        Some(command_block_nbt(command)),
    )
}

fn minecart_nbt(command: &Command, tag: &str) -> Compound {
    let mut nbt = Compound::new()
        .with("id", Tag::string(MINECART_ENTITY))
        .with("Command", Tag::string(command.text()))
        .with("TrackOutput", Tag::flag(command.tracks_output()))
        .with("Tags", Tag::List(vec![Tag::string(tag)]));
    if let Some(name) = command.name() {
        nbt.insert("CustomName", Tag::string(name));
    }
    nbt
}
