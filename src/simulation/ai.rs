//! AI train manager
//!
//! Keeps the list of AI-driven trains and moves them each tick. Path
//! following and dispatching are outside the kernel: an AI train here runs
//! at its set speed until the track ends, then waits for a restart.

use anyhow::Result;
use log::{debug, info};
use std::io::{Read, Write};

use super::save::{SaveReader, SaveWriter};
use super::train::{Train, TrainType};
use super::types::TrainId;

#[derive(Debug, Default)]
pub struct AiManager {
    pub ai_trains: Vec<TrainId>,
    pub trains_to_remove: Vec<TrainId>,
    /// Set whenever the AI list changes, cleared by the consumer.
    pub list_changed: bool,
}

impl AiManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, train: TrainId) {
        if !self.ai_trains.contains(&train) {
            self.ai_trains.push(train);
            self.list_changed = true;
        }
    }

    pub fn contains(&self, train: TrainId) -> bool {
        self.ai_trains.contains(&train)
    }

    pub fn activity_update(&mut self, elapsed_s: f32, trains: &mut [Train]) {
        self.update(elapsed_s, trains);
    }

    pub fn timetable_update(&mut self, elapsed_s: f32, trains: &mut [Train]) {
        self.update(elapsed_s, trains);
    }

    fn update(&mut self, elapsed_s: f32, trains: &mut [Train]) {
        for train in trains.iter_mut() {
            if !self.ai_trains.contains(&train.number) {
                continue;
            }
            if let Some(delay) = train.restart_delay_s.as_mut() {
                *delay -= elapsed_s;
                if *delay <= 0.0 {
                    train.restart_delay_s = None;
                    train.speed_mps = train.max_speed_mps.min(10.0);
                    info!("AI train {} ({}) restarted", train.number, train.name);
                }
                continue;
            }
            if matches!(train.train_type, TrainType::Ai | TrainType::AiPlayerHosting) {
                train.update(elapsed_s);
            }
        }
        self.remove_pending();
    }

    /// Drops trains queued for removal from the AI list.
    pub fn remove_pending(&mut self) {
        if self.trains_to_remove.is_empty() {
            return;
        }
        for id in self.trains_to_remove.drain(..) {
            if let Some(pos) = self.ai_trains.iter().position(|t| *t == id) {
                self.ai_trains.remove(pos);
                debug!("Train {} removed from AI", id);
            }
        }
        self.list_changed = true;
    }

    pub fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_i32(self.ai_trains.len() as i32)?;
        for id in &self.ai_trains {
            out.write_i32(id.0 as i32)?;
        }
        Ok(())
    }

    pub fn restore<R: Read>(input: &mut SaveReader<R>) -> Result<Self> {
        let count = input.read_i32()?;
        let mut manager = Self::new();
        for _ in 0..count {
            manager.ai_trains.push(TrainId(input.read_i32()? as u32));
        }
        Ok(manager)
    }
}
