//! Platform abstraction: timers, datastore and the one-shot event of the scheduler.

use super::{OptigaStatus, PalDatastore, PalTimer};
use log::{debug, warn};
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// Wall clock timer counting from its creation
pub struct SystemTimer {
    start: Instant,
}

impl Default for SystemTimer {
    fn default() -> SystemTimer {
        SystemTimer {
            start: Instant::now(),
        }
    }
}

impl PalTimer for SystemTimer {
    fn now_ms(&self) -> u32 {
        self.start.elapsed().as_millis() as u32
    }
    fn now_us(&self) -> u32 {
        self.start.elapsed().as_micros() as u32
    }
}

/// Timer advanced explicitly, for deterministic stepping of the stack
#[derive(Default)]
pub struct ManualTimer {
    us: AtomicU32,
}

impl ManualTimer {
    pub fn advance_ms(&self, ms: u32) {
        self.advance_us(ms.wrapping_mul(1000));
    }

    pub fn advance_us(&self, us: u32) {
        let now = self.us.load(Ordering::SeqCst);
        self.us.store(now.wrapping_add(us), Ordering::SeqCst);
    }

    pub fn set_us(&self, us: u32) {
        self.us.store(us, Ordering::SeqCst);
    }
}

impl PalTimer for ManualTimer {
    fn now_ms(&self) -> u32 {
        self.us.load(Ordering::SeqCst) / 1000
    }
    fn now_us(&self) -> u32 {
        self.us.load(Ordering::SeqCst)
    }
}

/// Datastore kept in memory; clones share the same storage
#[derive(Clone, Default)]
pub struct MemoryDatastore {
    slots: Arc<Mutex<HashMap<u16, Vec<u8>>>>,
}

impl PalDatastore for MemoryDatastore {
    fn read(&self, id: u16) -> Result<Vec<u8>, OptigaStatus> {
        let slots = self.slots.lock().map_err(|_| OptigaStatus::UtilError)?;
        slots.get(&id).cloned().ok_or(OptigaStatus::UtilError)
    }

    fn write(&self, id: u16, data: &[u8]) -> Result<(), OptigaStatus> {
        let mut slots = self.slots.lock().map_err(|_| OptigaStatus::UtilError)?;
        slots.insert(id, data.to_vec());
        Ok(())
    }
}

/// Datastore keeping one file per slot in a directory
pub struct FileDatastore {
    directory: PathBuf,
}

impl FileDatastore {
    pub fn new(directory: &str) -> FileDatastore {
        FileDatastore {
            directory: PathBuf::from(directory),
        }
    }

    fn slot_path(&self, id: u16) -> PathBuf {
        self.directory.join(format!("optiga_datastore_{:04x}.bin", id))
    }
}

impl PalDatastore for FileDatastore {
    fn read(&self, id: u16) -> Result<Vec<u8>, OptigaStatus> {
        fs::read(self.slot_path(id)).map_err(|err| {
            warn!("Datastore slot {:#06x} not readable: {}", id, err);
            OptigaStatus::UtilError
        })
    }

    fn write(&self, id: u16, data: &[u8]) -> Result<(), OptigaStatus> {
        fs::create_dir_all(&self.directory)
            .and_then(|_| fs::write(self.slot_path(id), data))
            .map_err(|err| {
                warn!("Datastore slot {:#06x} not writable: {}", id, err);
                OptigaStatus::UtilError
            })
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
struct Registration<T> {
    callback: T,
    registered_at_ms: u32,
    delay_ms: u32,
}

/// Single one-shot timer event.
///
/// Only one callback is pending at a time; a registration replaces the
/// previous one. `start` arms the event with the default callback unless the
/// event is already running.
pub struct PalOsEvent<T: Copy> {
    default_callback: T,
    triggered: bool,
    registration: Option<Registration<T>>,
}

/// Delay of the callback armed by `PalOsEvent::start`
pub const PAL_OS_EVENT_START_DELAY_MS: u32 = 2;

impl<T: Copy + std::fmt::Debug> PalOsEvent<T> {
    pub fn new(default_callback: T) -> PalOsEvent<T> {
        PalOsEvent {
            default_callback,
            triggered: false,
            registration: None,
        }
    }

    pub fn start(&mut self, now_ms: u32) {
        if !self.triggered {
            self.triggered = true;
            self.register_oneshot(self.default_callback, now_ms, PAL_OS_EVENT_START_DELAY_MS);
        }
    }

    pub fn stop(&mut self) {
        self.triggered = false;
    }

    pub fn is_triggered(&self) -> bool {
        self.triggered
    }

    pub fn register_oneshot(&mut self, callback: T, now_ms: u32, delay_ms: u32) {
        debug!("Event {:?} registered in {} ms", callback, delay_ms);
        self.registration = Some(Registration {
            callback,
            registered_at_ms: now_ms,
            delay_ms,
        });
    }

    /// Removes the pending callback if its delay elapsed
    pub fn take_due(&mut self, now_ms: u32) -> Option<T> {
        match self.registration {
            Some(reg) if now_ms.wrapping_sub(reg.registered_at_ms) >= reg.delay_ms => {
                self.registration = None;
                Some(reg.callback)
            }
            _ => None,
        }
    }

    /// Removes the pending callback regardless of its delay
    pub fn take(&mut self) -> Option<T> {
        self.registration.take().map(|reg| reg.callback)
    }

    pub fn pending(&self) -> Option<T> {
        self.registration.map(|reg| reg.callback)
    }
}
