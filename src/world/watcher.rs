//! Region folder watching
//!
//! Turns file system events in a region folder into region coordinates, so
//! callers can invalidate the matching cache entries.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, Receiver, Sender};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;

use crate::world::position::RegionPos;
use crate::world::region::RegionTypeRegistry;

#[derive(Debug, thiserror::Error)]
pub enum WatchError {
    #[error("file watcher error: {0}")]
    Notify(#[from] notify::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("watch service closed")]
    Closed,
}

pub type WatchResult<T> = Result<T, WatchError>;

/// Reports region files that were created, modified or removed
pub struct RegionWatchService {
    folder: PathBuf,
    watcher: Mutex<Option<RecommendedWatcher>>,
    debouncer: Mutex<Option<JoinHandle<()>>>,
    events: Receiver<RegionPos>,
    close_tx: Mutex<Option<Sender<()>>>,
    close_rx: Receiver<()>,
}

impl RegionWatchService {
    /// Watch `folder` (non-recursively)
    ///
    /// A region is reported once `debounce` has passed without a further event
    /// for it, so a burst of writes yields a single report after its last
    /// write.
    pub fn new(folder: impl Into<PathBuf>, registry: RegionTypeRegistry, debounce: Duration) -> WatchResult<Self> {
        let folder = folder.into();
        let (raw_tx, raw_rx) = crossbeam_channel::unbounded();
        let (tx, events) = crossbeam_channel::unbounded();
        let (close_tx, close_rx) = crossbeam_channel::bounded(0);

        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| {
            let event = match res {
                Ok(event) => event,
                Err(e) => {
                    log::warn!("Region watcher error: {}", e);
                    return;
                }
            };
            if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)) {
                return;
            }

            for pos in event.paths.iter().filter_map(|path| region_of(&registry, path)) {
                let _ = raw_tx.send(pos);
            }
        })?;
        watcher.watch(&folder, RecursiveMode::NonRecursive)?;

        let debouncer = {
            let close_rx = close_rx.clone();
            thread::Builder::new()
                .name("region-watch".into())
                .spawn(move || debounce_loop(raw_rx, tx, close_rx, debounce))?
        };
        log::debug!("Watching region folder {}", folder.display());

        Ok(Self {
            folder,
            watcher: Mutex::new(Some(watcher)),
            debouncer: Mutex::new(Some(debouncer)),
            events,
            close_tx: Mutex::new(Some(close_tx)),
            close_rx,
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// Next changed region if one is queued
    pub fn poll(&self) -> WatchResult<Option<RegionPos>> {
        if self.is_closed() {
            return Err(WatchError::Closed);
        }
        Ok(self.events.try_recv().ok())
    }

    /// Wait up to `timeout` for a changed region
    pub fn poll_timeout(&self, timeout: Duration) -> WatchResult<Option<RegionPos>> {
        select! {
            recv(self.events) -> pos => pos.map(Some).map_err(|_| WatchError::Closed),
            recv(self.close_rx) -> _ => Err(WatchError::Closed),
            default(timeout) => Ok(None),
        }
    }

    /// Block until a region changes or the service is closed
    pub fn take(&self) -> WatchResult<RegionPos> {
        select! {
            recv(self.events) -> pos => pos.map_err(|_| WatchError::Closed),
            recv(self.close_rx) -> _ => Err(WatchError::Closed),
        }
    }

    /// Stop watching and wake every blocked caller
    pub fn close(&self) {
        self.watcher.lock().take();
        self.close_tx.lock().take();
        if let Some(handle) = self.debouncer.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.close_tx.lock().is_none()
    }
}

impl Drop for RegionWatchService {
    fn drop(&mut self) {
        self.close();
    }
}

/// Hold each region until it has been quiet for `debounce`, then forward it
fn debounce_loop(raw: Receiver<RegionPos>, events: Sender<RegionPos>, close: Receiver<()>, debounce: Duration) {
    let mut pending: HashMap<RegionPos, Instant> = HashMap::new();

    loop {
        let deadline = match pending.values().min() {
            Some(&last) => crossbeam_channel::after((last + debounce).saturating_duration_since(Instant::now())),
            None => crossbeam_channel::never(),
        };

        select! {
            recv(raw) -> pos => match pos {
                Ok(pos) => {
                    pending.insert(pos, Instant::now());
                }
                Err(_) => return,
            },
            recv(close) -> _ => return,
            recv(deadline) -> _ => {}
        }

        let now = Instant::now();
        pending.retain(|pos, last| {
            if now.duration_since(*last) < debounce {
                return true;
            }
            let _ = events.send(*pos);
            false
        });
    }
}

fn region_of(registry: &RegionTypeRegistry, path: &Path) -> Option<RegionPos> {
    let name = path.file_name()?.to_str()?;
    registry.parse_file_name(name).map(|(_, pos)| pos)
}
