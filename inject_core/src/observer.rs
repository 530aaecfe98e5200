use std::fs::{File, Metadata};
use std::io::{self, Read, Seek, SeekFrom};
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use inject_runtime::{ChatEvent, LogEvent, SuccessEvent};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::ticker::Ticker;

/// Handle returned when registering a listener, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

type LogCallback = Arc<dyn Fn(&LogEvent) + Send + Sync>;
type ChatCallback = Arc<dyn Fn(&ChatEvent) + Send + Sync>;
type SuccessCallback = Arc<dyn Fn(&SuccessEvent) + Send + Sync>;

struct SuccessEntry {
    id: ListenerId,
    invoker: String,
    repeat: bool,
    callback: SuccessCallback,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    log: Vec<(ListenerId, LogCallback)>,
    chat: Vec<(ListenerId, ChatCallback)>,
    success: Vec<SuccessEntry>,
}

impl Registry {
    fn allocate(&mut self) -> ListenerId {
        self.next_id += 1;
        ListenerId(self.next_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    offset: u64,
    identity: Option<u64>,
}

/// Tails an append-only log file and fans its lines out to listeners.
///
/// Only whole lines are consumed; a trailing partial line stays on disk until
/// its newline arrives. Listener callbacks run on the checking thread with
/// the cursor held, so they must not call [`LogObserver::check_once`].
pub struct LogObserver {
    path: PathBuf,
    active: AtomicBool,
    cursor: Mutex<Option<Cursor>>,
    registry: Mutex<Registry>,
    poller: Mutex<Option<Ticker>>,
}

impl LogObserver {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            active: AtomicBool::new(false),
            cursor: Mutex::new(None),
            registry: Mutex::new(Registry::default()),
            poller: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Start tailing from the file's current end. A missing file is tailed
    /// from its beginning once it appears.
    pub fn open(&self) -> io::Result<()> {
        let cursor = match File::open(&self.path).and_then(|file| file.metadata()) {
            Ok(metadata) => Cursor {
                offset: metadata.len(),
                identity: file_identity(&metadata),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => Cursor {
                offset: 0,
                identity: None,
            },
            Err(err) => return Err(err),
        };
        info!(
            target: "inject::observer",
            path = %self.path.display(),
            offset = cursor.offset,
            "log.opened"
        );
        *self.cursor.lock() = Some(cursor);
        self.active.store(true, Ordering::Release);
        Ok(())
    }

    pub fn is_open(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Byte offset of the next unread line, if open.
    pub fn offset(&self) -> Option<u64> {
        self.cursor.lock().as_ref().map(|cursor| cursor.offset)
    }

    /// Poll the file every `period` on a dedicated thread. `on_failure` is
    /// called once if a check fails with an error other than rotation, after
    /// which polling stops.
    pub fn start<F>(self: &Arc<Self>, period: Duration, on_failure: F) -> io::Result<()>
    where
        F: Fn(io::Error) + Send + 'static,
    {
        let observer: Weak<Self> = Arc::downgrade(self);
        let ticker = Ticker::spawn("inject-log-poll", period, move || {
            let Some(observer) = observer.upgrade() else {
                return ControlFlow::Break(());
            };
            match observer.check_once() {
                Ok(_) => ControlFlow::Continue(()),
                Err(err) => {
                    warn!(
                        target: "inject::observer",
                        path = %observer.path.display(),
                        error = %err,
                        "log.poll_failed"
                    );
                    on_failure(err);
                    ControlFlow::Break(())
                }
            }
        })?;
        let previous = self.poller.lock().replace(ticker);
        if let Some(mut previous) = previous {
            previous.cancel();
        }
        Ok(())
    }

    /// Stop polling. Listeners stay registered; a later [`open`] starts
    /// again from the end of the file. Safe to call from a listener.
    ///
    /// [`open`]: LogObserver::open
    pub fn close(&self) {
        self.active.store(false, Ordering::Release);
        let poller = self.poller.lock().take();
        if let Some(mut poller) = poller {
            poller.cancel();
        }
    }

    /// Read and dispatch every complete line appended since the last check.
    /// Returns the number of lines consumed.
    pub fn check_once(&self) -> io::Result<usize> {
        if !self.is_open() {
            return Ok(0);
        }
        let mut guard = self.cursor.lock();
        let Some(cursor) = guard.as_mut() else {
            return Ok(0);
        };

        let opened = File::open(&self.path).and_then(|file| {
            let metadata = file.metadata()?;
            Ok((file, metadata))
        });
        let (mut file, metadata) = match opened {
            Ok(opened) => opened,
            Err(err) => {
                if cursor.offset != 0 {
                    debug!(
                        target: "inject::observer",
                        path = %self.path.display(),
                        error = %err,
                        "log.unreadable=reset"
                    );
                }
                *cursor = Cursor {
                    offset: 0,
                    identity: None,
                };
                return Ok(0);
            }
        };

        let identity = file_identity(&metadata);
        let replaced = cursor.identity.is_some() && identity.is_some() && cursor.identity != identity;
        if metadata.len() < cursor.offset || replaced {
            info!(
                target: "inject::observer",
                path = %self.path.display(),
                previous_offset = cursor.offset,
                length = metadata.len(),
                "log.rotated"
            );
            cursor.offset = 0;
        }
        cursor.identity = identity;

        if metadata.len() == cursor.offset {
            return Ok(0);
        }
        file.seek(SeekFrom::Start(cursor.offset))?;
        let mut pending = Vec::new();
        file.take(metadata.len() - cursor.offset)
            .read_to_end(&mut pending)?;

        let Some(last_newline) = pending.iter().rposition(|byte| *byte == b'\n') else {
            return Ok(0);
        };
        let complete = &pending[..=last_newline];
        cursor.offset += complete.len() as u64;

        let text = String::from_utf8_lossy(complete);
        let mut consumed = 0;
        for line in text.split_terminator('\n') {
            let line = line.strip_suffix('\r').unwrap_or(line);
            self.dispatch(line);
            consumed += 1;
        }
        Ok(consumed)
    }

    pub fn add_log_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&LogEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.allocate();
        registry.log.push((id, Arc::new(callback)));
        id
    }

    pub fn add_chat_listener<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&ChatEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.allocate();
        registry.chat.push((id, Arc::new(callback)));
        id
    }

    /// Fire `callback` for success lines reported by `invoker`. A
    /// non-repeating listener is removed by the first line that fires it.
    pub fn add_success_listener<F>(&self, invoker: impl Into<String>, repeat: bool, callback: F) -> ListenerId
    where
        F: Fn(&SuccessEvent) + Send + Sync + 'static,
    {
        let mut registry = self.registry.lock();
        let id = registry.allocate();
        registry.success.push(SuccessEntry {
            id,
            invoker: invoker.into(),
            repeat,
            callback: Arc::new(callback),
        });
        id
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut registry = self.registry.lock();
        let before = registry.log.len() + registry.chat.len() + registry.success.len();
        registry.log.retain(|(entry, _)| *entry != id);
        registry.chat.retain(|(entry, _)| *entry != id);
        registry.success.retain(|entry| entry.id != id);
        before != registry.log.len() + registry.chat.len() + registry.success.len()
    }

    pub fn remove_success_listeners(&self, ids: &[ListenerId]) {
        if ids.is_empty() {
            return;
        }
        self.registry
            .lock()
            .success
            .retain(|entry| !ids.contains(&entry.id));
    }

    pub fn success_listener_count(&self) -> usize {
        self.registry.lock().success.len()
    }

    fn dispatch(&self, line: &str) {
        let Some(event) = LogEvent::parse(line) else {
            return;
        };
        let (log, chat) = {
            let registry = self.registry.lock();
            let log: Vec<LogCallback> = registry.log.iter().map(|(_, cb)| Arc::clone(cb)).collect();
            let chat: Vec<ChatCallback> =
                registry.chat.iter().map(|(_, cb)| Arc::clone(cb)).collect();
            (log, chat)
        };
        for callback in &log {
            callback(&event);
        }

        if let Some(chat_event) = ChatEvent::parse(line) {
            for callback in &chat {
                callback(&chat_event);
            }
        }

        if let Some(success) = SuccessEvent::parse(line) {
            let fired: Vec<SuccessCallback> = {
                let mut registry = self.registry.lock();
                let mut fired = Vec::new();
                registry.success.retain(|entry| {
                    if entry.invoker != success.invoker {
                        return true;
                    }
                    fired.push(Arc::clone(&entry.callback));
                    entry.repeat
                });
                fired
            };
            for callback in &fired {
                callback(&success);
            }
        }
    }
}

impl Drop for LogObserver {
    fn drop(&mut self) {
        if let Some(mut poller) = self.poller.get_mut().take() {
            poller.cancel();
        }
    }
}

#[cfg(unix)]
fn file_identity(metadata: &Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(metadata.ino())
}

#[cfg(not(unix))]
fn file_identity(_metadata: &Metadata) -> Option<u64> {
    None
}
