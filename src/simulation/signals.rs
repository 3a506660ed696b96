//! Signalling seam
//!
//! Signal logic lives outside the kernel. The simulator drives whatever
//! implementation it is given through [`SignalSystem`] and asks it about the
//! signal ahead of a train when a passenger stop needs to know whether the
//! train may depart.

use anyhow::Result;
use std::io::{Read, Write};

use super::save::{SaveReader, SaveWriter};
use super::train::Train;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalAspect {
    Stop,
    StopAndProceed,
    Restricting,
    Approach,
    Clear,
}

/// The first signal ahead of a train.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NextSignal {
    pub distance_m: f32,
    pub aspect: SignalAspect,
    /// The dispatcher has granted permission to pass at stop.
    pub permission_granted: bool,
}

impl NextSignal {
    pub fn holds_train(&self) -> bool {
        self.aspect == SignalAspect::Stop && !self.permission_granted
    }
}

pub trait SignalSystem {
    /// Advances signal states. `preupdate` is set while AI trains are being
    /// pre-run before the player joins.
    fn update(&mut self, preupdate: bool, trains: &[Train]);

    fn next_signal(&self, train: &Train) -> Option<NextSignal>;

    fn save(&self, out: &mut SaveWriter<&mut dyn Write>) -> Result<()>;

    fn restore(&mut self, input: &mut SaveReader<&mut dyn Read>) -> Result<()>;

    /// Re-links train references after the train list was restored.
    fn restore_trains(&mut self, trains: &[Train]);
}

/// A route without signals.
#[derive(Debug, Default)]
pub struct NullSignals {
    updates: u64,
}

impl NullSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update_count(&self) -> u64 {
        self.updates
    }
}

impl SignalSystem for NullSignals {
    fn update(&mut self, _preupdate: bool, _trains: &[Train]) {
        self.updates += 1;
    }

    fn next_signal(&self, _train: &Train) -> Option<NextSignal> {
        None
    }

    fn save(&self, out: &mut SaveWriter<&mut dyn Write>) -> Result<()> {
        out.write_i32(0)
    }

    fn restore(&mut self, input: &mut SaveReader<&mut dyn Read>) -> Result<()> {
        let count = input.read_i32()?;
        if count != 0 {
            anyhow::bail!("Save holds {} signals but the route has none", count);
        }
        Ok(())
    }

    fn restore_trains(&mut self, _trains: &[Train]) {}
}
