//! The session object tying buffer, encoder, observer and tickers together.
//!
//! Packets are written as `<world>/structures/inject/<identifier>/<id>.nbt`.
//! Each one carries a structure block that loads `id + 1`, so the game walks
//! the chain on its own; the connection learns how far it got from probe
//! commands whose output shows up in the server log.

use std::collections::{BTreeMap, HashSet};
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use inject_proto::{NbtError, StructureEncoder};
use inject_runtime::{Bounds, ChatEvent, Command, InjectionType, LogEvent, SuccessEvent};
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::assembly::{structure_name, AssemblyError};
use crate::buffer::CommandBuffer;
use crate::config::{ConfigError, ConnectionConfig};
use crate::observer::{ListenerId, LogObserver};
use crate::session::{peek_next_id, session_dir, Session, SessionError};
use crate::ticker::Ticker;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Closed,
    Active,
    /// Open, but not writing packets on schedule.
    Paused,
    /// Paused automatically because the game stopped confirming packets.
    TimedOut,
}

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("session '{identifier}' is already open in {dir:?}")]
    DuplicateSession { identifier: String, dir: PathBuf },
    #[error("handshake was not confirmed within {0:?}")]
    HandshakeTimeout(Duration),
    #[error("connection is already open")]
    AlreadyOpen,
    #[error("connection is closed")]
    Closed,
    #[error(transparent)]
    Assembly(#[from] AssemblyError),
    #[error("failed to encode packet: {0}")]
    Encode(#[from] NbtError),
    #[error(transparent)]
    Session(SessionError),
    #[error("failed to read server log: {0}")]
    Log(#[source] io::Error),
    #[error("failed to start {name} ticker: {source}")]
    Ticker {
        name: &'static str,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl ConnectionError {
    /// True when a batch did not fit its bounds. The commands are still
    /// queued.
    pub fn is_capacity(&self) -> bool {
        matches!(self, ConnectionError::Assembly(err) if err.is_capacity())
    }
}

/// Packet id a probe travels in, or [`UNSENT`] until that packet is written.
type ProbeSlot = Arc<AtomicU64>;

const UNSENT: u64 = u64::MAX;

struct PendingListener {
    command: Arc<Command>,
    listener: ListenerId,
    probe: Option<ProbeSlot>,
}

struct Runtime {
    state: ConnectionState,
    session: Option<Session>,
    encoder: StructureEncoder,
    flush_ticker: Option<Ticker>,
    first_id: u64,
    last_confirmed: Option<u64>,
    written_since_probe: u64,
    pending: Vec<PendingListener>,
    bound: BTreeMap<u64, Vec<ListenerId>>,
}

struct Inner {
    config: ConnectionConfig,
    dir: PathBuf,
    buffer: CommandBuffer,
    observer: Arc<LogObserver>,
    flush_lock: Mutex<()>,
    runtime: Mutex<Runtime>,
    invokers: AtomicU64,
    next_id: AtomicU64,
    flush_interval_ms: AtomicU64,
}

/// A write-only channel into a running server, acknowledged through its log.
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    pub fn new(
        world: impl AsRef<Path>,
        log: impl Into<PathBuf>,
        config: ConnectionConfig,
    ) -> Result<Self, ConnectionError> {
        config.validate()?;
        let dir = session_dir(world.as_ref(), &config.identifier);
        let buffer = CommandBuffer::new(config.layout()?);
        let encoder = StructureEncoder::with_footprint(buffer.footprint());
        let next_id = peek_next_id(&dir);
        let inner = Inner {
            flush_interval_ms: AtomicU64::new(config.flush_interval_ms),
            config,
            dir,
            buffer,
            observer: Arc::new(LogObserver::new(log)),
            flush_lock: Mutex::new(()),
            runtime: Mutex::new(Runtime {
                state: ConnectionState::Closed,
                session: None,
                encoder,
                flush_ticker: None,
                first_id: next_id,
                last_confirmed: None,
                written_since_probe: 0,
                pending: Vec::new(),
                bound: BTreeMap::new(),
            }),
            invokers: AtomicU64::new(0),
            next_id: AtomicU64::new(next_id),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    /// Take the session lock, start tailing the log and wait for a probe to
    /// come back. `None` waits without a deadline.
    pub fn open(&self, timeout: Option<Duration>) -> Result<(), ConnectionError> {
        self.inner.open(timeout)
    }

    /// Stop both tickers, write whatever is still queued and release the
    /// session lock.
    pub fn close(&self) -> Result<(), ConnectionError> {
        self.inner.close()
    }

    pub fn pause(&self) {
        self.inner.pause();
    }

    pub fn resume(&self) -> Result<(), ConnectionError> {
        self.inner.resume()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.runtime.lock().state
    }

    /// Write the next packet now. Returns the id written, or `None` when
    /// nothing was queued or the connection is closed.
    pub fn flush(&self) -> Result<Option<u64>, ConnectionError> {
        self.inner.flush()
    }

    /// Queue `command`. Commands that track output get the logging wrapper.
    pub fn inject(&self, kind: InjectionType, command: Command) -> Arc<Command> {
        let command = command.into_shared();
        if command.tracks_output() {
            self.inner.buffer.add_fetch_command(kind, Arc::clone(&command));
        } else {
            self.inner.buffer.add_command(kind, Arc::clone(&command));
        }
        command
    }

    /// Queue `command` and call `on_success` with its logged output. Unnamed
    /// commands get a generated invoker name.
    pub fn inject_with_listener<F>(
        &self,
        kind: InjectionType,
        command: Command,
        on_success: F,
    ) -> Arc<Command>
    where
        F: Fn(&SuccessEvent) + Send + Sync + 'static,
    {
        let command = if command.name().is_some() {
            command
        } else {
            command.named(self.inner.next_invoker())
        };
        let command = command.tracked().into_shared();
        self.inner
            .register(kind, Arc::clone(&command), None, on_success);
        command
    }

    pub fn set_flush_interval(&self, interval: Duration) -> Result<(), ConnectionError> {
        self.inner.set_flush_interval(interval)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.inner.flush_interval_ms.load(Ordering::Acquire))
    }

    pub fn add_log_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&LogEvent) + Send + Sync + 'static,
    {
        self.inner.observer.add_log_listener(callback)
    }

    pub fn add_chat_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        self.inner.observer.add_chat_listener(callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.observer.remove_listener(id)
    }

    pub fn impulse_bounds(&self) -> Bounds {
        self.inner.buffer.impulse_bounds()
    }

    pub fn set_impulse_bounds(&self, bounds: Bounds) -> Result<(), ConnectionError> {
        Ok(self.inner.buffer.set_impulse_bounds(bounds)?)
    }

    pub fn repeat_bounds(&self) -> Bounds {
        self.inner.buffer.repeat_bounds()
    }

    pub fn set_repeat_bounds(&self, bounds: Bounds) -> Result<(), ConnectionError> {
        Ok(self.inner.buffer.set_repeat_bounds(bounds)?)
    }

    /// Id the next packet will be written under.
    pub fn structure_id(&self) -> u64 {
        self.inner.next_id.load(Ordering::Acquire)
    }

    pub fn last_confirmed_id(&self) -> Option<u64> {
        self.inner.runtime.lock().last_confirmed
    }

    pub fn identifier(&self) -> &str {
        &self.inner.config.identifier
    }

    pub fn session_dir(&self) -> &Path {
        &self.inner.dir
    }

    /// Command an operator runs once, then powers the placed block, to start
    /// the game loading this session's packets.
    pub fn bootstrap_command(&self) -> String {
        format!(
            "setblock ~ ~ ~ minecraft:structure_block 1 replace {{name:\"{}\",mode:\"LOAD\",posX:0,posY:0,posZ:0,ignoreEntities:0b,integrity:1.0f}}",
            structure_name(&self.inner.config.identifier, self.structure_id())
        )
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state() != ConnectionState::Closed {
            if let Err(err) = self.close() {
                warn!(
                    target: "inject::connection",
                    identifier = %self.inner.config.identifier,
                    error = %err,
                    "connection.close_on_drop_failed"
                );
            }
        }
    }
}

impl Inner {
    fn next_invoker(&self) -> String {
        let n = self.invokers.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}", self.config.invoker_prefix(), n)
    }

    fn register<F>(
        &self,
        kind: InjectionType,
        command: Arc<Command>,
        probe: Option<ProbeSlot>,
        on_success: F,
    ) where
        F: Fn(&SuccessEvent) + Send + Sync + 'static,
    {
        let invoker = command.name().unwrap_or_default().to_string();
        let listener =
            self.observer
                .add_success_listener(invoker, kind == InjectionType::Repeat, on_success);
        self.runtime.lock().pending.push(PendingListener {
            command: Arc::clone(&command),
            listener,
            probe,
        });
        self.buffer.add_fetch_command(kind, command);
    }

    /// Queue a probe whose success confirms the packet it lands in.
    fn inject_probe(self: &Arc<Self>, handshake: Option<Sender<u64>>) {
        let slot: ProbeSlot = Arc::new(AtomicU64::new(UNSENT));
        let command = Command::new(self.config.probe_command.clone())
            .named(self.next_invoker())
            .tracked()
            .into_shared();
        let weak: Weak<Inner> = Arc::downgrade(self);
        let packet = Arc::clone(&slot);
        debug!(
            target: "inject::connection",
            invoker = command.name().unwrap_or_default(),
            "probe.queued"
        );
        self.register(
            InjectionType::Impulse,
            command,
            Some(slot),
            move |_event| {
                let id = packet.load(Ordering::Acquire);
                if id == UNSENT {
                    return;
                }
                if let Some(inner) = weak.upgrade() {
                    inner.confirm(id);
                }
                if let Some(handshake) = &handshake {
                    let _ = handshake.try_send(id);
                }
            },
        );
    }

    fn open(self: &Arc<Self>, timeout: Option<Duration>) -> Result<(), ConnectionError> {
        {
            let mut runtime = self.runtime.lock();
            if runtime.state != ConnectionState::Closed {
                return Err(ConnectionError::AlreadyOpen);
            }
            let session = Session::acquire(&self.dir).map_err(|err| match err {
                SessionError::Locked { .. } => ConnectionError::DuplicateSession {
                    identifier: self.config.identifier.clone(),
                    dir: self.dir.clone(),
                },
                other => ConnectionError::Session(other),
            })?;
            let next_id = session.next_id();
            self.next_id.store(next_id, Ordering::Release);
            runtime.first_id = next_id;
            runtime.last_confirmed = None;
            runtime.written_since_probe = 0;
            runtime.session = Some(session);
            runtime.state = ConnectionState::Paused;
        }

        if let Err(err) = self.start_observer() {
            self.teardown();
            return Err(err);
        }

        let (handshake, confirmed) = bounded::<u64>(1);
        self.inject_probe(Some(handshake));
        if let Err(err) = self.flush() {
            self.teardown();
            return Err(err);
        }

        let received = match timeout {
            Some(timeout) => confirmed.recv_timeout(timeout),
            None => confirmed.recv().map_err(|_| RecvTimeoutError::Disconnected),
        };
        let id = match received {
            Ok(id) => id,
            Err(_) => {
                self.teardown();
                return Err(ConnectionError::HandshakeTimeout(timeout.unwrap_or_default()));
            }
        };

        let replaced = {
            let mut runtime = self.runtime.lock();
            if runtime.state != ConnectionState::Paused {
                return Err(ConnectionError::Closed);
            }
            let ticker = self.spawn_flush_ticker()?;
            runtime.state = ConnectionState::Active;
            runtime.flush_ticker.replace(ticker)
        };
        drop(replaced);
        info!(
            target: "inject::connection",
            identifier = %self.config.identifier,
            dir = %self.dir.display(),
            confirmed = id,
            "connection.opened"
        );
        Ok(())
    }

    fn start_observer(self: &Arc<Self>) -> Result<(), ConnectionError> {
        self.observer.open().map_err(ConnectionError::Log)?;
        let weak = Arc::downgrade(self);
        self.observer
            .start(self.config.poll_interval(), move |err| {
                if let Some(inner) = weak.upgrade() {
                    error!(
                        target: "inject::connection",
                        identifier = %inner.config.identifier,
                        error = %err,
                        "connection.log_failed"
                    );
                    if let Err(err) = inner.close() {
                        warn!(target: "inject::connection", error = %err, "connection.close_failed");
                    }
                }
            })
            .map_err(|source| ConnectionError::Ticker {
                name: "log poll",
                source,
            })
    }

    fn spawn_flush_ticker(self: &Arc<Self>) -> Result<Ticker, ConnectionError> {
        let weak = Arc::downgrade(self);
        let period = Duration::from_millis(self.flush_interval_ms.load(Ordering::Acquire));
        Ticker::spawn("inject-flush", period, move || {
            let Some(inner) = weak.upgrade() else {
                return ControlFlow::Break(());
            };
            match inner.flush() {
                Ok(_) => ControlFlow::Continue(()),
                Err(err) if err.is_capacity() => {
                    warn!(
                        target: "inject::connection",
                        identifier = %inner.config.identifier,
                        error = %err,
                        "flush.capacity_exceeded=paused"
                    );
                    inner.pause();
                    ControlFlow::Break(())
                }
                Err(err) => {
                    error!(
                        target: "inject::connection",
                        identifier = %inner.config.identifier,
                        error = %err,
                        "flush.failed=closing"
                    );
                    if let Err(err) = inner.close() {
                        warn!(target: "inject::connection", error = %err, "connection.close_failed");
                    }
                    ControlFlow::Break(())
                }
            }
        })
        .map_err(|source| ConnectionError::Ticker {
            name: "flush",
            source,
        })
    }

    fn flush(self: &Arc<Self>) -> Result<Option<u64>, ConnectionError> {
        self.flush_with(false)
    }

    fn flush_with(self: &Arc<Self>, closing: bool) -> Result<Option<u64>, ConnectionError> {
        let flushing = self.flush_lock.lock();

        let probe_due = {
            let runtime = self.runtime.lock();
            if runtime.state == ConnectionState::Closed && !closing {
                return Ok(None);
            }
            runtime.written_since_probe >= self.config.probe_interval
        };
        if probe_due && !closing && !self.buffer.is_empty() {
            self.inject_probe(None);
        }

        let (written, unrecorded, stopped) = {
            let mut runtime = self.runtime.lock();
            let Some(id) = runtime.session.as_ref().map(Session::next_id) else {
                return Ok(None);
            };
            let Some(packet) = self.buffer.create_structure(id)? else {
                return Ok(None);
            };

            let carried: HashSet<*const Command> =
                packet.commands.iter().map(Arc::as_ptr).collect();
            let carries = |entry: &PendingListener| carried.contains(&Arc::as_ptr(&entry.command));
            // The game may run a probe as soon as its file lands, so slots
            // are filled before the write and reset if it fails.
            let mut carried_probe = false;
            for slot in runtime
                .pending
                .iter()
                .filter(|entry| carries(entry))
                .filter_map(|entry| entry.probe.as_ref())
            {
                slot.store(id, Ordering::Release);
                carried_probe = true;
            }

            let outcome = runtime
                .encoder
                .encode(&packet.structure)
                .to_bytes()
                .map_err(ConnectionError::from)
                .and_then(|bytes| {
                    let session = runtime.session.as_mut().ok_or(ConnectionError::Closed)?;
                    match session.write_structure(&bytes) {
                        Ok(written) => Ok((written, bytes.len(), None)),
                        Err(err) => match err.written_id() {
                            Some(written) => Ok((written, bytes.len(), Some(err))),
                            None => Err(ConnectionError::Session(err)),
                        },
                    }
                });
            let (written, size, unrecorded) = match outcome {
                Ok(outcome) => outcome,
                Err(err) => {
                    for slot in runtime
                        .pending
                        .iter()
                        .filter(|entry| carries(entry))
                        .filter_map(|entry| entry.probe.as_ref())
                    {
                        slot.store(UNSENT, Ordering::Release);
                    }
                    self.buffer.requeue(packet);
                    warn!(
                        target: "inject::connection",
                        id,
                        error = %err,
                        "structure.write_failed"
                    );
                    return Err(err);
                }
            };
            self.next_id.store(written + 1, Ordering::Release);

            let mut bound = Vec::new();
            runtime.pending.retain(|entry| {
                if !carries(entry) {
                    return true;
                }
                bound.push(entry.listener);
                false
            });
            if !bound.is_empty() {
                runtime.bound.entry(written).or_default().extend(bound);
            }

            runtime.written_since_probe = if carried_probe {
                0
            } else {
                runtime.written_since_probe + 1
            };
            debug!(
                target: "inject::connection",
                id = written,
                commands = packet.commands.len(),
                bytes = size,
                "structure.written"
            );

            let confirmed_through = runtime
                .last_confirmed
                .map(|id| id + 1)
                .unwrap_or(runtime.first_id);
            let unconfirmed = (written + 1).saturating_sub(confirmed_through);
            let timed_out = runtime.state == ConnectionState::Active
                && unconfirmed > self.config.timeout_flushes;
            if timed_out {
                runtime.state = ConnectionState::TimedOut;
                warn!(
                    target: "inject::connection",
                    identifier = %self.config.identifier,
                    unconfirmed,
                    "connection.timed_out"
                );
            }
            (
                written,
                unrecorded,
                timed_out.then(|| runtime.flush_ticker.take()).flatten(),
            )
        };
        // Joining the ticker may wait on a tick blocked on the flush lock.
        drop(flushing);
        drop(stopped);
        match unrecorded {
            Some(err) => Err(ConnectionError::Session(err)),
            None => Ok(Some(written)),
        }
    }

    fn confirm(self: &Arc<Self>, id: u64) {
        let (stale_listeners, removed, resumed) = {
            let mut runtime = self.runtime.lock();
            if runtime.last_confirmed.is_some_and(|confirmed| id <= confirmed) {
                debug!(
                    target: "inject::connection",
                    id,
                    last_confirmed = runtime.last_confirmed,
                    "confirmation.stale"
                );
                return;
            }
            runtime.last_confirmed = Some(id);
            let removed = runtime
                .session
                .as_ref()
                .map_or(0, |session| session.remove_structures_through(id));

            let current = runtime.bound.split_off(&id);
            let stale: Vec<ListenerId> = std::mem::replace(&mut runtime.bound, current)
                .into_values()
                .flatten()
                .collect();

            let mut resumed = None;
            if runtime.state == ConnectionState::TimedOut {
                match self.spawn_flush_ticker() {
                    Ok(ticker) => {
                        runtime.state = ConnectionState::Active;
                        resumed = Some(runtime.flush_ticker.replace(ticker));
                    }
                    Err(err) => warn!(
                        target: "inject::connection",
                        error = %err,
                        "connection.resume_failed"
                    ),
                }
            }
            (stale, removed, resumed)
        };
        self.observer.remove_success_listeners(&stale_listeners);
        debug!(
            target: "inject::connection",
            id,
            removed,
            released_listeners = stale_listeners.len(),
            "structure.confirmed"
        );
        if resumed.is_some() {
            info!(
                target: "inject::connection",
                identifier = %self.config.identifier,
                id,
                "connection.resumed=confirmed"
            );
        }
        drop(resumed);
    }

    fn pause(&self) {
        let stopped = {
            let mut runtime = self.runtime.lock();
            match runtime.state {
                ConnectionState::Active | ConnectionState::TimedOut => {
                    runtime.state = ConnectionState::Paused;
                    runtime.flush_ticker.take()
                }
                ConnectionState::Paused | ConnectionState::Closed => None,
            }
        };
        if stopped.is_some() {
            info!(
                target: "inject::connection",
                identifier = %self.config.identifier,
                "connection.paused"
            );
        }
        drop(stopped);
    }

    fn resume(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let replaced = {
            let mut runtime = self.runtime.lock();
            match runtime.state {
                ConnectionState::Closed => return Err(ConnectionError::Closed),
                ConnectionState::Active => return Ok(()),
                ConnectionState::Paused | ConnectionState::TimedOut => {
                    let ticker = self.spawn_flush_ticker()?;
                    runtime.state = ConnectionState::Active;
                    runtime.flush_ticker.replace(ticker)
                }
            }
        };
        drop(replaced);
        info!(
            target: "inject::connection",
            identifier = %self.config.identifier,
            "connection.resumed"
        );
        Ok(())
    }

    fn set_flush_interval(self: &Arc<Self>, interval: Duration) -> Result<(), ConnectionError> {
        let millis = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        if millis == 0 {
            return Err(ConfigError::NotPositive {
                field: "flush_interval_ms",
            }
            .into());
        }
        self.flush_interval_ms.store(millis, Ordering::Release);
        let replaced = {
            let mut runtime = self.runtime.lock();
            if runtime.state != ConnectionState::Active {
                return Ok(());
            }
            let ticker = self.spawn_flush_ticker()?;
            runtime.flush_ticker.replace(ticker)
        };
        drop(replaced);
        Ok(())
    }

    fn close(self: &Arc<Self>) -> Result<(), ConnectionError> {
        let stopped = {
            let mut runtime = self.runtime.lock();
            if runtime.state == ConnectionState::Closed {
                return Ok(());
            }
            runtime.state = ConnectionState::Closed;
            runtime.flush_ticker.take()
        };
        drop(stopped);
        self.observer.close();

        let result = self.flush_with(true);
        self.release();
        info!(
            target: "inject::connection",
            identifier = %self.config.identifier,
            "connection.closed"
        );
        result.map(|_| ())
    }

    /// Undo a partial open.
    fn teardown(&self) {
        let stopped = {
            let mut runtime = self.runtime.lock();
            runtime.state = ConnectionState::Closed;
            runtime.flush_ticker.take()
        };
        drop(stopped);
        self.observer.close();
        self.release();
    }

    fn release(&self) {
        let listeners: Vec<ListenerId> = {
            let mut runtime = self.runtime.lock();
            runtime.session = None;
            let pending = std::mem::take(&mut runtime.pending)
                .into_iter()
                .map(|entry| entry.listener);
            let bound = std::mem::take(&mut runtime.bound).into_values().flatten();
            pending.chain(bound).collect()
        };
        self.observer.remove_success_listeners(&listeners);
    }
}
