//! Train and track simulation kernel
//!
//! Everything here runs headless: track travellers, trains and coupling,
//! moving tables, level crossings, activities and the container cranes.
//! A viewer can drive it through [`Simulator`] and read its state back.

mod activity;
mod ai;
mod confirmer;
mod container;
mod context;
mod fuel;
mod hazard;
mod level_crossing;
mod moving_table;
mod save;
mod settings;
mod signals;
mod simulator;
mod super_elevation;
mod track_db;
mod train;
mod traveller;
mod types;

// Re-export public types for external use
// These may not be used within this crate but are part of the public API
#[allow(unused_imports)]
pub use activity::{
    boarding_time_s, calculate_to_point, clock_string, ActionKind, Activity, ActivityDef, ActivityEnv,
    ActivityEventType, ActivityRequest, ActivityTask, DistanceResult, EventCategory, EventDef, EventWrapper,
    Outcomes, PassengerStopAt, PlatformEnd, ServiceStop, TaskColor, TaskKind, MISSED_PLATFORM_MARGIN_M,
    PLAYER_STOPPED_MPS, TICKS_PER_SECOND, TRIGGER_ON_STOP_MPS,
};
#[allow(unused_imports)]
pub use ai::AiManager;
#[allow(unused_imports)]
pub use confirmer::{CabControl, ConfirmLevel, Confirmer, DisplayMessage};
#[allow(unused_imports)]
pub use container::{
    Container, ContainerHandlingItem, ContainerManager, ContainerType, CraneDefinition, CraneStatus,
    FreightSlot, LinkedWagon, StackLocation, StackLocationDef, LENGTH_20FT_M, LENGTH_40FT_M,
};
#[allow(unused_imports)]
pub use context::{format_positional, Catalog, SimContext};
#[allow(unused_imports)]
pub use fuel::{FuelManager, FuelPickupItem, PickupMatch, PICKUP_REACH_M};
#[allow(unused_imports)]
pub use hazard::{Hazard, HazardManager, HazardState, LOOK_DISTANCE_M, SCARE_DISTANCE_M};
#[allow(unused_imports)]
pub use level_crossing::{
    HornRequest, LevelCrossing, LevelCrossingItem, LevelCrossings, MAX_HORN_DISTANCE_M, MIN_ACTIVATION_SPEED_MPS,
    REVERSE_CLEAR_M, SLOW_APPROACH_MARGIN_M, STOPPED_HYSTERESIS_M,
};
#[allow(unused_imports)]
pub use moving_table::{MovingTable, TableCommon, TableEnd, TrainOnTable, Transfertable, Turntable};
#[allow(unused_imports)]
pub use save::{SaveReader, SaveWriter, MAGIC, SCHEMA_VERSION};
#[allow(unused_imports)]
pub use settings::{NetworkRole, SimSettings};
#[allow(unused_imports)]
pub use signals::{NextSignal, NullSignals, SignalAspect, SignalSystem};
pub use simulator::{
    LocoLoaded, Season, SimEvent, Simulator, SwitchMode, TrainSetup, WagonRef, Weather, OVERSPEED_COUPLING_MPS,
    UNCOUPLE_SEPARATION_M,
};
#[allow(unused_imports)]
pub use super_elevation::{CurveRun, SuperElevation, SuperElevationStandard};
#[allow(unused_imports)]
pub use track_db::{
    FuelKind, TrItemType, TrPin, TrVectorNode, TrVectorSection, TrackDb, TrackDbBuilder, TrackItem, TrackItemKind,
    TrackNode, TrackNodeKind, TrackSection, TrackShape, VectorEnd, STANDARD_GAUGE_M,
};
#[allow(unused_imports)]
pub use train::{ControlMode, FuelLoad, OutOfControlReason, Reverser, Train, TrainCar, TrainType};
#[allow(unused_imports)]
pub use traveller::{Traveller, TravellerError, INIT_ERROR_MARGIN_M, MAXIMUM_CENTERLINE_OFFSET_M};
#[allow(unused_imports)]
pub use types::{
    heading, right_of, wrap_angle, TrItemId, TrainId, TravellerDirection, WorldLocation, WorldPosition,
    HALF_TILE_M, MAX_STOPPED_MPS, TILE_SIZE_M,
};
