//! Structure-file command injection for a running Minecraft 1.12 server.
//!
//! Commands queued on a [`Connection`] are laid out as command blocks and
//! command-block minecarts, written as numbered structure files into the
//! world's `structures/` folder, and loaded by the game one after another.
//! The server log is the return channel: probe commands echo their output
//! there and confirm how far the game has read.

mod assembly;
mod buffer;
pub mod config;
mod connection;
mod curve;
mod observer;
mod placement;
mod session;
mod ticker;

pub use assembly::{structure_name, validate_identifier, AssemblyError, Batches, PacketLayout};
pub use buffer::{CommandBuffer, Drained, Packet, DISABLE_OUTPUT, ENABLE_OUTPUT};
pub use config::{
    load_connection_config, load_connection_config_from_env, ConfigError, ConnectionConfig,
    ConnectionConfigMetadata,
};
pub use connection::{Connection, ConnectionError, ConnectionState};
pub use curve::snake_curve;
pub use observer::{ListenerId, LogObserver};
pub use placement::{ChainPlacer, PlacedCommand, PlacementError};
pub use session::{peek_next_id, session_dir, Session, SessionError, SESSION_FILE};
pub use ticker::Ticker;

pub use inject_proto::{DecodedStructure, StructureEncoder};
pub use inject_runtime::*;
