use std::mem;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use inject_proto::Structure;
use inject_runtime::{Bounds, Command, InjectionType, Vec3I};
use parking_lot::{Mutex, RwLock};
use tracing::{debug, warn};

use crate::assembly::{AssemblyError, Batches, PacketLayout};

pub const ENABLE_OUTPUT: &str = "gamerule commandBlockOutput true";
pub const DISABLE_OUTPUT: &str = "gamerule commandBlockOutput false";

/// Everything removed from the queues by one drain.
#[derive(Debug, Clone, Default)]
pub struct Drained {
    pub batches: Batches,
    /// Per [`InjectionType::index`]: whether a fetch command was queued.
    pub logged: [bool; 3],
}

/// A packet ready to be written, plus the caller commands it carries.
#[derive(Debug, Clone)]
pub struct Packet {
    pub id: u64,
    pub structure: Structure,
    pub commands: Vec<Arc<Command>>,
    drained: Drained,
}

/// Queues commands from any thread and turns them into packets.
///
/// A fetch command raises its queue's logging flag under the read side of
/// `drain_lock`; draining swaps queues and flags under the write side, so a
/// drained batch and its flag always describe the same set of commands.
pub struct CommandBuffer {
    queues: [Mutex<Vec<Arc<Command>>>; 3],
    logged: [AtomicBool; 3],
    drain_lock: RwLock<()>,
    layout: Mutex<PacketLayout>,
}

impl CommandBuffer {
    pub fn new(layout: PacketLayout) -> Self {
        Self {
            queues: Default::default(),
            logged: Default::default(),
            drain_lock: RwLock::new(()),
            layout: Mutex::new(layout),
        }
    }

    pub fn add_command(&self, kind: InjectionType, command: Arc<Command>) {
        self.queues[kind.index()].lock().push(command);
    }

    /// Queue a command whose output must reach the log.
    pub fn add_fetch_command(&self, kind: InjectionType, command: Arc<Command>) {
        let _shared = self.drain_lock.read();
        self.queues[kind.index()].lock().push(command);
        self.logged[kind.index()].store(true, Ordering::Release);
    }

    pub fn is_empty(&self) -> bool {
        self.queues.iter().all(|queue| queue.lock().is_empty())
    }

    pub fn len(&self, kind: InjectionType) -> usize {
        self.queues[kind.index()].lock().len()
    }

    pub fn impulse_bounds(&self) -> Bounds {
        self.layout.lock().impulse_bounds()
    }

    pub fn set_impulse_bounds(&self, bounds: Bounds) -> Result<(), AssemblyError> {
        self.layout.lock().set_impulse_bounds(bounds)
    }

    pub fn repeat_bounds(&self) -> Bounds {
        self.layout.lock().repeat_bounds()
    }

    pub fn set_repeat_bounds(&self, bounds: Bounds) -> Result<(), AssemblyError> {
        self.layout.lock().set_repeat_bounds(bounds)
    }

    pub fn footprint(&self) -> Vec3I {
        self.layout.lock().footprint()
    }

    /// Atomically empty every queue and clear every logging flag.
    pub fn drain(&self) -> Drained {
        let _exclusive = self.drain_lock.write();
        let mut drained = Drained::default();
        for kind in InjectionType::ALL {
            let index = kind.index();
            *drained.batches.get_mut(kind) = mem::take(&mut *self.queues[index].lock());
            drained.logged[index] = self.logged[index].swap(false, Ordering::AcqRel);
        }
        drained
    }

    /// Build packet `id` from everything queued so far.
    ///
    /// Returns `Ok(None)` when nothing is queued. On failure the drained
    /// commands go back to the front of their queues.
    pub fn create_structure(&self, id: u64) -> Result<Option<Packet>, AssemblyError> {
        let drained = self.drain();
        if drained.batches.is_empty() {
            return Ok(None);
        }

        let mut wrapped = drained.batches.clone();
        for kind in InjectionType::ALL {
            let batch = wrapped.get_mut(kind);
            if drained.logged[kind.index()] && !batch.is_empty() {
                batch.insert(0, Command::new(ENABLE_OUTPUT).into_shared());
                batch.push(Command::new(DISABLE_OUTPUT).into_shared());
            }
        }

        let assembled = self.layout.lock().assemble(id, &wrapped);
        match assembled {
            Ok(structure) => {
                debug!(
                    target: "inject::buffer",
                    id,
                    minecart = drained.batches.minecart.len(),
                    impulse = drained.batches.impulse.len(),
                    repeat = drained.batches.repeat.len(),
                    "buffer.drained"
                );
                let batches = &drained.batches;
                let commands = batches
                    .minecart
                    .iter()
                    .chain(&batches.impulse)
                    .chain(&batches.repeat)
                    .cloned()
                    .collect();
                Ok(Some(Packet {
                    id,
                    structure,
                    commands,
                    drained,
                }))
            }
            Err(err) => {
                warn!(
                    target: "inject::buffer",
                    id,
                    error = %err,
                    "buffer.requeued"
                );
                self.restore(drained);
                Err(err)
            }
        }
    }

    /// Put the commands of a packet that never reached the game back at the
    /// front of their queues, ahead of anything queued since.
    pub fn requeue(&self, packet: Packet) {
        warn!(
            target: "inject::buffer",
            id = packet.id,
            commands = packet.commands.len(),
            "buffer.requeued"
        );
        self.restore(packet.drained);
    }

    fn restore(&self, drained: Drained) {
        let _exclusive = self.drain_lock.write();
        let Drained {
            mut batches,
            logged,
        } = drained;
        for kind in InjectionType::ALL {
            let index = kind.index();
            let mut queue = self.queues[index].lock();
            let newer = mem::replace(&mut *queue, mem::take(batches.get_mut(kind)));
            queue.extend(newer);
            if logged[index] {
                self.logged[index].store(true, Ordering::Release);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use inject_runtime::{BlockState, Vec3I};
    use std::thread;

    fn buffer() -> CommandBuffer {
        let layout = PacketLayout::new(
            "buffer",
            1343,
            "tests",
            Some(BlockState::air()),
            Bounds::new(Vec3I::new(0, 0, 1), Vec3I::new(3, 0, 1)),
            Bounds::new(Vec3I::new(0, 0, 2), Vec3I::new(3, 0, 2)),
        )
        .unwrap();
        CommandBuffer::new(layout)
    }

    fn chain_commands(packet: &Packet, z: i32) -> Vec<String> {
        (0..4)
            .filter_map(|x| packet.structure.block(Vec3I::new(x, 0, z)))
            .filter_map(|block| block.nbt.as_ref()?.get_str("Command").map(str::to_string))
            .collect()
    }

    #[test]
    fn empty_buffer_yields_nothing() {
        let buffer = buffer();
        assert!(buffer.is_empty());
        assert!(buffer.create_structure(3).unwrap().is_none());
    }

    #[test]
    fn fetch_batches_are_wrapped() {
        let buffer = buffer();
        buffer.add_fetch_command(
            InjectionType::Impulse,
            Command::new("time query gametime").into_shared(),
        );
        buffer.add_command(InjectionType::Repeat, Command::new("say tick").into_shared());
        assert_eq!(buffer.len(InjectionType::Impulse), 1);

        let packet = buffer.create_structure(5).unwrap().unwrap();
        assert_eq!(
            chain_commands(&packet, 1),
            vec![ENABLE_OUTPUT, "time query gametime", DISABLE_OUTPUT]
        );
        assert_eq!(chain_commands(&packet, 2), vec!["say tick"]);
        assert_eq!(packet.commands.len(), 2);
        assert!(buffer.is_empty());
    }

    #[test]
    fn overflow_requeues_in_order() {
        let buffer = buffer();
        let first: Vec<_> = (0..5)
            .map(|i| Command::new(format!("say {i}")).into_shared())
            .collect();
        for command in &first {
            buffer.add_fetch_command(InjectionType::Impulse, Arc::clone(command));
        }
        let error = buffer.create_structure(1).unwrap_err();
        assert!(error.is_capacity());

        let drained = buffer.drain();
        assert!(drained.logged[InjectionType::Impulse.index()]);
        assert_eq!(drained.batches.impulse.len(), 5);
        for (a, b) in drained.batches.impulse.iter().zip(&first) {
            assert!(Arc::ptr_eq(a, b));
        }
    }

    #[test]
    fn unwritten_packet_goes_back_ahead_of_newer_commands() {
        let buffer = buffer();
        let early = Command::new("say early").into_shared();
        buffer.add_fetch_command(InjectionType::Impulse, Arc::clone(&early));
        let packet = buffer.create_structure(2).unwrap().unwrap();
        assert!(buffer.is_empty());

        let late = Command::new("say late").into_shared();
        buffer.add_command(InjectionType::Impulse, Arc::clone(&late));
        buffer.requeue(packet);

        let retry = buffer.create_structure(2).unwrap().unwrap();
        assert_eq!(
            chain_commands(&retry, 1),
            vec![ENABLE_OUTPUT, "say early", "say late", DISABLE_OUTPUT]
        );
        assert!(Arc::ptr_eq(&retry.commands[0], &early));
        assert!(Arc::ptr_eq(&retry.commands[1], &late));
    }

    #[test]
    fn growing_bounds_recovers_from_overflow() {
        let buffer = buffer();
        for i in 0..4 {
            buffer.add_command(InjectionType::Impulse, Command::new(format!("say {i}")).into_shared());
        }
        buffer.add_command(InjectionType::Impulse, Command::new("say 4").into_shared());
        assert!(buffer.create_structure(1).is_err());

        buffer
            .set_impulse_bounds(Bounds::new(Vec3I::new(0, 0, 1), Vec3I::new(7, 0, 1)))
            .unwrap();
        let packet = buffer.create_structure(1).unwrap().unwrap();
        assert_eq!(packet.commands.len(), 5);
    }

    #[test]
    fn flags_and_batches_drain_together() {
        const WRITERS: usize = 8;
        const PER_WRITER: usize = 500;

        let buffer = Arc::new(buffer());
        let writers: Vec<_> = (0..WRITERS)
            .map(|writer| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    for i in 0..PER_WRITER {
                        let command = Command::new(format!("say {writer}-{i}")).into_shared();
                        buffer.add_fetch_command(InjectionType::Impulse, command);
                    }
                })
            })
            .collect();

        let mut seen = Vec::new();
        let mut check = |drained: Drained| {
            let logged = drained.logged[InjectionType::Impulse.index()];
            assert_eq!(
                logged,
                !drained.batches.impulse.is_empty(),
                "flag and batch drained out of step"
            );
            seen.extend(drained.batches.impulse);
        };
        while writers.iter().any(|handle| !handle.is_finished()) {
            check(buffer.drain());
        }
        for handle in writers {
            handle.join().unwrap();
        }
        check(buffer.drain());

        assert_eq!(seen.len(), WRITERS * PER_WRITER);
        let mut texts: Vec<_> = seen.iter().map(|c| c.text().to_string()).collect();
        texts.sort();
        texts.dedup();
        assert_eq!(texts.len(), WRITERS * PER_WRITER);
    }
}
