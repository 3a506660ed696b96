//! Confirmer
//!
//! Collects leveled messages for the user interface. The simulation only
//! assembles text and severity; presenting it is up to whoever drains the
//! queue.

use log::{error, info, warn};
use std::collections::VecDeque;
use std::fmt;

use super::context::Catalog;

/// Message severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum ConfirmLevel {
    #[default]
    None,
    Information,
    Warning,
    Error,
    Msg,
}

impl fmt::Display for ConfirmLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConfirmLevel::None => "None",
            ConfirmLevel::Information => "Information",
            ConfirmLevel::Warning => "Warning",
            ConfirmLevel::Error => "Error",
            ConfirmLevel::Msg => "MSG",
        };
        f.write_str(name)
    }
}

/// Cab controls named in confirmations. Only those the kernel itself
/// reports are listed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CabControl {
    None,
    Reverser,
    Throttle,
    Horn,
    Uncouple,
    Activity,
    SwitchAhead,
    SwitchBehind,
    SimulationSpeed,
    DieselFuel,
    TenderWater,
    TenderCoal,
}

impl fmt::Display for CabControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CabControl::None => "",
            CabControl::Reverser => "Reverser",
            CabControl::Throttle => "Throttle",
            CabControl::Horn => "Horn",
            CabControl::Uncouple => "Uncouple",
            CabControl::Activity => "Activity",
            CabControl::SwitchAhead => "Switch Ahead",
            CabControl::SwitchBehind => "Switch Behind",
            CabControl::SimulationSpeed => "Simulation Speed",
            CabControl::DieselFuel => "Diesel Fuel",
            CabControl::TenderWater => "Tender Water",
            CabControl::TenderCoal => "Tender Coal",
        };
        f.write_str(name)
    }
}

/// A message ready for display.
#[derive(Debug, Clone, PartialEq)]
pub struct DisplayMessage {
    pub key: String,
    pub text: String,
    pub duration_s: f64,
    pub level: ConfirmLevel,
}

#[derive(Debug, Clone)]
pub struct Confirmer {
    default_duration_s: f64,
    suppress: ConfirmLevel,
    catalog: Catalog,
    queue: VecDeque<DisplayMessage>,
}

impl Confirmer {
    pub fn new(default_duration_s: f64, suppress: ConfirmLevel) -> Self {
        Self {
            default_duration_s,
            suppress,
            catalog: Catalog::new(),
            queue: VecDeque::new(),
        }
    }

    pub fn with_catalog(mut self, catalog: Catalog) -> Self {
        self.catalog = catalog;
        self
    }

    pub fn set_suppress_level(&mut self, level: ConfirmLevel) {
        self.suppress = level;
    }

    pub fn information(&mut self, message: &str) {
        self.message_for(CabControl::None, ConfirmLevel::Information, message);
    }

    pub fn warning(&mut self, message: &str) {
        self.message_for(CabControl::None, ConfirmLevel::Warning, message);
    }

    pub fn error(&mut self, message: &str) {
        self.message_for(CabControl::None, ConfirmLevel::Error, message);
    }

    pub fn msg(&mut self, message: &str) {
        self.message_for(CabControl::None, ConfirmLevel::Msg, message);
    }

    pub fn message(&mut self, level: ConfirmLevel, message: &str) {
        self.message_for(CabControl::None, level, message);
    }

    /// Control confirmation at level `None`.
    pub fn confirm(&mut self, control: CabControl, message: &str) {
        self.message_for(control, ConfirmLevel::None, message);
    }

    pub fn message_for(&mut self, control: CabControl, level: ConfirmLevel, message: &str) {
        if self.suppress != ConfirmLevel::None && self.suppress < ConfirmLevel::Msg && level <= self.suppress {
            return;
        }

        let mut text = message.to_string();
        if control != CabControl::None {
            text = format!("{}: {}", self.catalog.get_string(&control.to_string()), text);
        }
        if level >= ConfirmLevel::Information {
            text = format!("{} - {}", self.catalog.get_string(&level.to_string()), text);
        }

        let mut duration_s = self.default_duration_s;
        if level >= ConfirmLevel::Warning {
            duration_s *= 2.0;
        }
        if level >= ConfirmLevel::Msg {
            duration_s *= 5.0;
        }

        match level {
            ConfirmLevel::Warning => warn!("{}", text),
            ConfirmLevel::Error => error!("{}", text),
            _ => info!("{}", text),
        }

        self.queue.push_back(DisplayMessage {
            key: format!("{:?}/{:?}", control, level),
            text,
            duration_s,
            level,
        });
    }

    /// Takes every queued message, oldest first.
    pub fn drain(&mut self) -> Vec<DisplayMessage> {
        self.queue.drain(..).collect()
    }

    pub fn pending(&self) -> impl Iterator<Item = &DisplayMessage> {
        self.queue.iter()
    }

    /// True if any queued message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.queue.iter().any(|m| m.text.contains(needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_prefix_and_stretch_duration() {
        let mut confirmer = Confirmer::new(3.0, ConfirmLevel::None);
        confirmer.information("Boarding");
        confirmer.warning("Signal at danger");
        confirmer.msg("Activity complete");
        confirmer.confirm(CabControl::Horn, "Sounding");

        let shown = confirmer.drain();
        assert_eq!(shown[0].text, "Information - Boarding");
        assert_eq!(shown[0].duration_s, 3.0);
        assert_eq!(shown[1].duration_s, 6.0);
        assert_eq!(shown[2].text, "MSG - Activity complete");
        assert_eq!(shown[2].duration_s, 30.0);
        assert_eq!(shown[3].text, "Horn: Sounding");
        assert!(confirmer.drain().is_empty());
    }

    #[test]
    fn test_suppress_level_drops_lesser_messages() {
        let mut confirmer = Confirmer::new(3.0, ConfirmLevel::Warning);
        confirmer.information("dropped");
        confirmer.warning("dropped too");
        confirmer.error("kept");
        assert!(!confirmer.contains("dropped"));
        assert!(confirmer.contains("Error - kept"));

        confirmer.set_suppress_level(ConfirmLevel::Msg);
        confirmer.information("back");
        assert!(confirmer.contains("back"));
    }

    #[test]
    fn test_catalog_translates_prefixes() {
        let mut catalog = Catalog::new();
        catalog.insert("Warning", "Avertissement");
        let mut confirmer = Confirmer::new(3.0, ConfirmLevel::None).with_catalog(catalog);
        confirmer.warning("Frein");
        assert!(confirmer.contains("Avertissement - Frein"));
    }
}
