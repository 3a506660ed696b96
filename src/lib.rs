//! Rail Simulation Library
//!
//! Headless train and track simulation: travellers on a track database,
//! trains, moving tables, level crossings and activities.

pub mod simulation;
