/*!
Fausse source GPU pour développement sans carte NVIDIA

Simule des sessions de monitoring avec des lectures configurables, des pannes
par appareil et des pannes d'ouverture de session pour un cycle donné.
Compte les sessions ouvertes et libérées.
*/

use nvcw_agent::error::HardwareError;
use nvcw_agent::hardware::{HardwareSession, HardwareSource, RawDeviceReading};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const MB: u64 = 1024 * 1024;

/// Lecture type: 512/1024 MB, 150/300 W
pub fn sample_reading(index: u32) -> RawDeviceReading {
    RawDeviceReading {
        name: format!("NVIDIA RTX A4000 #{}", index),
        fan_speed_pct: 40,
        temperature_c: 65,
        performance_state: 2,
        power_usage_mw: 150_000,
        power_limit_mw: 300_000,
        memory_used_bytes: 512 * MB,
        memory_total_bytes: 1024 * MB,
    }
}

#[derive(Default)]
struct GpuState {
    readings: Vec<RawDeviceReading>,
    failing_devices: HashMap<u32, &'static str>,
    /// Numéros d'ouverture (1 = première) qui échouent
    failing_acquires: HashSet<usize>,
}

/// Source GPU simulée, partageable entre le test et le pipeline
#[derive(Clone, Default)]
pub struct FakeGpuSource {
    state: Arc<Mutex<GpuState>>,
    attempts: Arc<AtomicUsize>,
    acquisitions: Arc<AtomicUsize>,
    releases: Arc<AtomicUsize>,
}

impl FakeGpuSource {
    pub fn with_gpus(count: u32) -> Self {
        let source = Self::default();
        source.state.lock().unwrap().readings = (0..count).map(sample_reading).collect();
        source
    }

    /// Remplace la lecture d'un GPU existant
    pub fn set_reading(&self, index: u32, reading: RawDeviceReading) -> &Self {
        if let Some(slot) = self.state.lock().unwrap().readings.get_mut(index as usize) {
            *slot = reading;
        }
        self
    }

    /// La requête `field` du GPU `index` échoue à chaque lecture
    pub fn fail_device(&self, index: u32, field: &'static str) -> &Self {
        self.state.lock().unwrap().failing_devices.insert(index, field);
        self
    }

    pub fn heal_device(&self, index: u32) -> &Self {
        self.state.lock().unwrap().failing_devices.remove(&index);
        self
    }

    /// La `ordinal`-ième ouverture de session échoue (1 = la première)
    pub fn fail_acquire_on(&self, ordinal: usize) -> &Self {
        self.state.lock().unwrap().failing_acquires.insert(ordinal);
        self
    }

    /// Sessions ouvertes avec succès
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }

    /// Sessions ouvertes et pas encore libérées
    pub fn open_sessions(&self) -> usize {
        self.acquisitions() - self.releases()
    }
}

impl HardwareSource for FakeGpuSource {
    fn acquire(&self) -> Result<Box<dyn HardwareSession + '_>, HardwareError> {
        let ordinal = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
        if self.state.lock().unwrap().failing_acquires.contains(&ordinal) {
            log::info!("🚫 [FAKE GPU] Session {} refused", ordinal);
            return Err(HardwareError::Unavailable("simulated driver failure".to_string()));
        }
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeGpuSession { source: self }))
    }
}

struct FakeGpuSession<'a> {
    source: &'a FakeGpuSource,
}

impl HardwareSession for FakeGpuSession<'_> {
    fn device_count(&self) -> Result<u32, HardwareError> {
        Ok(self.source.state.lock().unwrap().readings.len() as u32)
    }

    fn read_device(&self, index: u32) -> Result<RawDeviceReading, HardwareError> {
        let state = self.source.state.lock().unwrap();
        if let Some(&field) = state.failing_devices.get(&index) {
            return Err(HardwareError::query(field, "simulated query failure"));
        }
        state
            .readings
            .get(index as usize)
            .cloned()
            .ok_or_else(|| HardwareError::query("handle", format!("no GPU at index {}", index)))
    }
}

impl Drop for FakeGpuSession<'_> {
    fn drop(&mut self) {
        self.source.releases.fetch_add(1, Ordering::SeqCst);
    }
}
