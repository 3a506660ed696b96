//! Simulation settings

use super::confirmer::ConfirmLevel;

/// Role of this simulator in a shared session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NetworkRole {
    #[default]
    Offline,
    Host,
    Client,
}

impl NetworkRole {
    /// Whether this node owns signal and coupling decisions.
    pub fn is_authoritative(self) -> bool {
        !matches!(self, NetworkRole::Client)
    }
}

#[derive(Debug, Clone)]
pub struct SimSettings {
    /// Clock multiplier; 1.0 is real time.
    pub game_speed: f32,
    pub paused: bool,
    /// Messages at or below this level are dropped. `None` keeps everything.
    pub suppress_confirmations: ConfirmLevel,
    pub confirmation_duration_s: f64,
    pub network_role: NetworkRole,
    pub timetable_mode: bool,
    pub turntable_speed_rad_s: f32,
    pub transfertable_speed_mps: f32,
    pub use_super_elevation: bool,
    pub super_elevation_gauge_m: f32,
    pub super_elevation_min_radius_m: f32,
    /// Settle delay after a crane lowers a container onto a wagon.
    pub crane_delay_after_load_s: f32,
    /// Settle delay before a crane lifts a container off a wagon.
    pub crane_delay_before_unload_s: f32,
}

impl Default for SimSettings {
    fn default() -> Self {
        Self {
            game_speed: 1.0,
            paused: false,
            suppress_confirmations: ConfirmLevel::None,
            confirmation_duration_s: 3.0,
            network_role: NetworkRole::Offline,
            timetable_mode: false,
            turntable_speed_rad_s: 0.06,
            transfertable_speed_mps: 1.0,
            use_super_elevation: true,
            super_elevation_gauge_m: 1.435,
            super_elevation_min_radius_m: 100.0,
            crane_delay_after_load_s: 3.0,
            crane_delay_before_unload_s: 2.0,
        }
    }
}
