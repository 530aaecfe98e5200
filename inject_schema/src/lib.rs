//! Shared value types for the structure injection workspace.
//!
//! Coordinates, facings, block states and the read-only world lookup
//! interface live here so the encoder, the runtime parsers and the
//! connection layer agree on one vocabulary without depending on each other.

mod block;
mod geometry;

pub use block::{Biome, BlockLookup, BlockState, BlockStateParseError, Dimension};
pub use geometry::{Bounds, Direction, Vec3D, Vec3I};
