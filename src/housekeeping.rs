//! Background maintenance of the caches

use std::io;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crate::config::HousekeepingConfig;
use crate::lowres::LowresTileManager;
use crate::util::Interrupt;
use crate::world::World;

/// Thread that periodically evicts expired world cache entries and saves
/// stale lowres tiles. Stopping it wakes the thread immediately.
pub struct Housekeeper {
    interrupt: Interrupt,
    thread: Option<thread::JoinHandle<()>>,
}

impl Housekeeper {
    pub fn start(
        config: &HousekeepingConfig,
        worlds: Vec<Arc<World>>,
        pyramids: Vec<Arc<LowresTileManager>>,
    ) -> io::Result<Self> {
        let interrupt = Interrupt::new();
        let interval = config.interval;
        let thread = thread::Builder::new().name("housekeeping".into()).spawn({
            let interrupt = interrupt.clone();
            move || run(&interrupt, interval, &worlds, &pyramids)
        })?;

        log::debug!("Housekeeping every {:?}", interval);
        Ok(Self {
            interrupt,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().map_or(false, |thread| !thread.is_finished())
    }

    /// Stop the thread and wait for a pass in progress to finish
    pub fn stop(&mut self) {
        self.interrupt.interrupt();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Housekeeping thread panicked");
            }
        }
    }
}

impl Drop for Housekeeper {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run(interrupt: &Interrupt, interval: Duration, worlds: &[Arc<World>], pyramids: &[Arc<LowresTileManager>]) {
    while interrupt.sleep(interval).is_ok() {
        for world in worlds {
            world.clean_up();
        }
        for pyramid in pyramids {
            pyramid.housekeeping();
        }
    }
    log::trace!("Housekeeping stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compression::Compression;
    use crate::lowres::{Color, LowresConfig, Sample};
    use crate::storage::{FileStorage, Storage};
    use crate::world::WorldCacheConfig;
    use std::time::Instant;

    #[test]
    fn test_stop_is_prompt() {
        let config = HousekeepingConfig {
            interval: Duration::from_secs(3600),
        };
        let mut housekeeper = Housekeeper::start(&config, Vec::new(), Vec::new()).expect("start");
        assert!(housekeeper.is_running());

        let started = Instant::now();
        housekeeper.stop();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert!(!housekeeper.is_running());
    }

    #[test]
    fn test_saves_stale_tiles_in_background() {
        let dir = tempfile::tempdir().expect("temp dir");
        let map = Storage::new(Arc::new(FileStorage::new(dir.path(), Compression::None))).map("world");
        let lowres = LowresConfig {
            tile_size: 4,
            lod_count: 1,
            lod_factor: 2,
            save_interval: Duration::ZERO,
            ..Default::default()
        };
        let pyramid = Arc::new(LowresTileManager::new(&map, lowres).expect("pyramid"));
        let world = Arc::new(World::new(dir.path().join("region"), &WorldCacheConfig::default()));

        pyramid.update(1, 1, &Sample::new(5, 0, Color::premultiplied(1.0, 1.0, 1.0, 1.0)));

        let config = HousekeepingConfig {
            interval: Duration::from_millis(10),
        };
        let mut housekeeper = Housekeeper::start(&config, vec![world], vec![pyramid]).expect("start");

        let deadline = Instant::now() + Duration::from_secs(5);
        while !map.lowres_tiles(1).exists(0, 0).expect("exists") {
            assert!(Instant::now() < deadline, "tile was never saved");
            thread::sleep(Duration::from_millis(10));
        }
        housekeeper.stop();
    }
}
