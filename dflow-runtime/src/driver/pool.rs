use super::{FlowDriver, FlowState};
use dflow_core::FlowId;

const DEFAULT_CAPACITY: usize = 16;

/// Reuses idle drivers across runs.
///
/// Acquiring takes `&mut self`, so handing out a driver and assigning it a
/// flow id can't interleave with another acquisition.
#[derive(Debug)]
pub struct DriverPool {
    idle: Vec<FlowDriver>,
    capacity: usize,
}

impl Default for DriverPool {
    fn default() -> Self {
        Self::new()
    }
}

impl DriverPool {
    pub fn new() -> Self {
        Self {
            idle: Vec::new(),
            capacity: DEFAULT_CAPACITY,
        }
    }

    /// Keep at most `capacity` idle drivers.
    #[must_use]
    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self.idle.truncate(capacity);
        self
    }

    /// Take an idle driver (or a new one) assigned to `id`.
    pub fn acquire(&mut self, id: FlowId) -> FlowDriver {
        let mut driver = self.idle.pop().unwrap_or_default();
        driver.assign(id);
        tracing::trace!(flow_id = %id, idle = self.idle.len(), "Driver acquired");
        driver
    }

    /// Return a driver to the pool.
    pub fn release(&mut self, mut driver: FlowDriver) {
        driver.reset();
        debug_assert_eq!(driver.state(), FlowState::Idling);
        if self.idle.len() < self.capacity {
            self.idle.push(driver);
        }
    }

    pub fn idle(&self) -> usize {
        self.idle.len()
    }
}
