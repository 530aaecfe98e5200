//! Packet encoding for structure injection.
//!
//! A packet is a structure file: gzip-compressed named binary tags holding a
//! fixed header, a deduplicated block-state palette, the block list and the
//! entity list. [`StructureEncoder`] turns a [`Structure`] into that layout;
//! [`DecodedStructure`] reads it back for inspection.

pub mod nbt;
mod structure;

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

pub use nbt::{Compound, NbtError, Tag, TagKind};
pub use structure::{
    DecodedBlock, DecodedStructure, EncodedStructure, Structure, StructureBlock, StructureEncoder,
    StructureEntity, StructureError,
};

/// Gzip-compress `root` as an unnamed root compound.
pub fn write_gzip(root: &Compound) -> Result<Vec<u8>, NbtError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    nbt::write_named(&mut encoder, "", root)?;
    encoder.flush()?;
    Ok(encoder.finish()?)
}

/// Decompress and decode a root compound, discarding its name.
pub fn read_gzip(bytes: &[u8]) -> Result<Compound, NbtError> {
    let mut decoder = GzDecoder::new(bytes);
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    let (_, root) = nbt::read_named(&mut raw.as_slice())?;
    Ok(root)
}
