#![allow(dead_code)]

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use inject_core::{session_dir, ConnectionConfig, DecodedStructure, Direction};
use inject_proto::{Compound, DecodedBlock};
use parking_lot::Mutex;

pub const WAIT: Duration = Duration::from_secs(10);

pub fn test_config(identifier: &str) -> ConnectionConfig {
    ConnectionConfig {
        identifier: identifier.to_string(),
        flush_interval_ms: 10,
        poll_interval_ms: 5,
        ..ConnectionConfig::default()
    }
}

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(2));
    }
}

/// Plays the game's side of a session: loads packets in id order, "runs"
/// their commands and logs output for every named block that tracks it.
pub struct FakeServer {
    log: PathBuf,
    stalled: Arc<AtomicBool>,
    stop: Arc<AtomicBool>,
    next: Arc<AtomicU64>,
    executed: Arc<Mutex<Vec<String>>>,
    handle: Option<JoinHandle<()>>,
}

impl FakeServer {
    pub fn start(world: &Path, identifier: &str, first_id: u64) -> Self {
        let dir = session_dir(world, identifier);
        let log = world.join(format!("{identifier}.log"));
        fs::write(&log, "[09:59:59] [Server thread/INFO]: Done (1.0s)! For help, type \"help\"\n")
            .unwrap();

        let stalled = Arc::new(AtomicBool::new(false));
        let stop = Arc::new(AtomicBool::new(false));
        let next = Arc::new(AtomicU64::new(first_id));
        let executed = Arc::new(Mutex::new(Vec::new()));

        let handle = {
            let log = log.clone();
            let stalled = Arc::clone(&stalled);
            let stop = Arc::clone(&stop);
            let next = Arc::clone(&next);
            let executed = Arc::clone(&executed);
            thread::spawn(move || {
                while !stop.load(Ordering::Acquire) {
                    if stalled.load(Ordering::Acquire) {
                        thread::sleep(Duration::from_millis(2));
                        continue;
                    }
                    let id = next.load(Ordering::Acquire);
                    let Ok(bytes) = fs::read(dir.join(format!("{id}.nbt"))) else {
                        thread::sleep(Duration::from_millis(2));
                        continue;
                    };
                    let packet = DecodedStructure::from_gzip(&bytes).unwrap();
                    run_packet(&packet, &log, &executed);
                    next.store(id + 1, Ordering::Release);
                }
            })
        };

        Self {
            log,
            stalled,
            stop,
            next,
            executed,
            handle: Some(handle),
        }
    }

    pub fn log(&self) -> &Path {
        &self.log
    }

    /// Stop loading packets, as if the structure block chain was broken.
    pub fn stall(&self) {
        self.stalled.store(true, Ordering::Release);
    }

    pub fn unstall(&self) {
        self.stalled.store(false, Ordering::Release);
    }

    /// Id of the next packet the server will load.
    pub fn next_id(&self) -> u64 {
        self.next.load(Ordering::Acquire)
    }

    /// Command text in the order the server ran it, wrappers included.
    pub fn executed(&self) -> Vec<String> {
        self.executed.lock().clone()
    }

    pub fn say(&self, user: &str, message: &str) {
        append_line(
            &self.log,
            &format!("[10:00:00] [Server thread/INFO]: <{user}> {message}"),
        );
    }
}

impl Drop for FakeServer {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn run_packet(packet: &DecodedStructure, log: &Path, executed: &Mutex<Vec<String>>) {
    // Minecarts ride the rail first, then each chain fires from its head.
    for entity in &packet.entities {
        run_command(&entity.nbt, log, executed);
    }
    let heads = packet.blocks.iter().filter(|block| {
        matches!(
            block.state.name(),
            "minecraft:command_block" | "minecraft:repeating_command_block"
        )
    });
    for head in heads {
        let mut current = Some(head);
        while let Some(block) = current {
            if let Some(nbt) = &block.nbt {
                run_command(nbt, log, executed);
            }
            current = facing(block)
                .and_then(|direction| packet.block_at(block.pos.offset(direction)))
                .filter(|next| next.state.name() == "minecraft:chain_command_block");
        }
    }
}

fn facing(block: &DecodedBlock) -> Option<Direction> {
    let facing = block.state.property("facing")?;
    Direction::ALL
        .into_iter()
        .find(|direction| direction.as_str() == facing)
}

fn run_command(nbt: &Compound, log: &Path, executed: &Mutex<Vec<String>>) {
    let Some(text) = nbt.get_str("Command").filter(|text| !text.is_empty()) else {
        return;
    };
    executed.lock().push(text.to_string());
    if nbt.get_i64("TrackOutput") != Some(1) {
        return;
    }
    if let Some(name) = nbt.get_str("CustomName") {
        append_line(
            log,
            &format!("[10:00:00] [Server thread/INFO]: [{name}: {text}]"),
        );
    }
}

fn append_line(log: &Path, line: &str) {
    let mut file = OpenOptions::new().append(true).create(true).open(log).unwrap();
    writeln!(file, "{line}").unwrap();
}
