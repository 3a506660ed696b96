//! Container cranes and stacking yards
//!
//! A container handling item is a gantry crane standing over a stacking
//! yard next to the track. The yard is a fixed set of stack locations, each
//! holding containers bottom-up. When the yard's bays are 40 ft long every
//! bay also offers a second 20 ft half-slot; the half-slot can only be used
//! while the bay's main slot holds 20 ft containers.
//!
//! The crane moves one axis group at a time towards a target, in local
//! coordinates of the crane shape. Loading and unloading are each a fixed
//! sequence of raise, travel, lower and wait steps.

use anyhow::{bail, Context, Result};
use glam::{Mat4, Vec3};
use log::{debug, info, warn};
use ordered_float::OrderedFloat;
use std::io::{Read, Write};

use super::confirmer::{ConfirmLevel, Confirmer};
use super::context::SimContext;
use super::save::{SaveReader, SaveWriter};
use super::track_db::{TrItemType, TrackDb};
use super::train::Train;
use super::types::{TrItemId, TrainId, WorldLocation, WorldPosition};

pub const LENGTH_20FT_M: f32 = 6.095;
pub const LENGTH_40FT_M: f32 = 12.19;

const LENGTH_TOLERANCE_M: f32 = 0.01;
const CRANE_SPEED_XZ_MPS: f32 = 1.0;
const CRANE_SPEED_Y_MPS: f32 = 0.5;
const GRABBER_SPEED_MPS: f32 = 0.25;
const WAGON_STOPPED_MPS: f32 = 0.01;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ContainerType {
    None,
    C20ft,
    #[default]
    C40ft,
    C40ftHC,
    C45ft,
    C48ft,
    C53ft,
}

impl ContainerType {
    pub fn code(self) -> i32 {
        match self {
            ContainerType::None => 0,
            ContainerType::C20ft => 1,
            ContainerType::C40ft => 2,
            ContainerType::C40ftHC => 3,
            ContainerType::C45ft => 4,
            ContainerType::C48ft => 5,
            ContainerType::C53ft => 6,
        }
    }

    pub fn from_code(code: i32) -> Self {
        match code {
            1 => ContainerType::C20ft,
            2 => ContainerType::C40ft,
            3 => ContainerType::C40ftHC,
            4 => ContainerType::C45ft,
            5 => ContainerType::C48ft,
            6 => ContainerType::C53ft,
            _ => ContainerType::None,
        }
    }

    /// Length and height in metres.
    pub fn dimensions(self) -> (f32, f32) {
        match self {
            ContainerType::C20ft => (LENGTH_20FT_M, 2.59),
            ContainerType::C40ftHC => (LENGTH_40FT_M, 2.9),
            ContainerType::C45ft => (13.7, 2.59),
            ContainerType::C48ft => (14.6, 2.59),
            ContainerType::C53ft => (16.15, 2.59),
            ContainerType::None | ContainerType::C40ft => (LENGTH_40FT_M, 2.59),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub name: String,
    pub base_folder: String,
    pub shape_file: String,
    pub intrinsic_offset: Vec3,
    pub container_type: ContainerType,
    pub flipped: bool,
    pub mass_kg: f32,
    pub length_m: f32,
    pub height_m: f32,
    pub width_m: f32,
    pub world_position: WorldPosition,
}

impl Container {
    pub fn new(name: &str, container_type: ContainerType) -> Self {
        let (length_m, height_m) = container_type.dimensions();
        Self {
            name: name.to_string(),
            base_folder: String::new(),
            shape_file: String::new(),
            intrinsic_offset: Vec3::ZERO,
            container_type,
            flipped: false,
            mass_kg: 2000.0,
            length_m,
            height_m,
            width_m: 2.44,
            world_position: WorldPosition::default(),
        }
    }

    pub fn with_shape(mut self, base_folder: &str, shape_file: &str) -> Self {
        self.base_folder = base_folder.to_string();
        self.shape_file = shape_file.to_string();
        self
    }

    pub fn with_mass(mut self, mass_kg: f32) -> Self {
        self.mass_kg = mass_kg;
        self
    }

    pub fn is_20ft(&self) -> bool {
        self.container_type == ContainerType::C20ft
    }

    pub fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_string(&self.name)?;
        out.write_string(&self.base_folder)?;
        out.write_string(&self.shape_file)?;
        out.write_f32(self.intrinsic_offset.x)?;
        out.write_f32(self.intrinsic_offset.y)?;
        out.write_f32(self.intrinsic_offset.z)?;
        out.write_i32(self.container_type.code())?;
        out.write_bool(self.flipped)?;
        out.write_f32(self.mass_kg)
    }

    pub fn restore<R: Read>(input: &mut SaveReader<R>) -> Result<Self> {
        let name = input.read_string()?;
        let base_folder = input.read_string()?;
        let shape_file = input.read_string()?;
        let intrinsic_offset = Vec3::new(input.read_f32()?, input.read_f32()?, input.read_f32()?);
        let container_type = ContainerType::from_code(input.read_i32()?);
        let flipped = input.read_bool()?;
        let mass_kg = input.read_f32()?;
        Ok(Self {
            base_folder,
            shape_file,
            intrinsic_offset,
            flipped,
            mass_kg,
            ..Self::new(&name, container_type)
        })
    }
}

/// The part of a wagon able to carry a container.
#[derive(Debug, Clone, PartialEq)]
pub struct FreightSlot {
    pub loading_area_length_m: f32,
    /// Offset of the loading area centre from the wagon origin.
    pub offset: Vec3,
    pub container: Option<Container>,
}

impl FreightSlot {
    pub fn new(loading_area_length_m: f32, offset: Vec3) -> Self {
        Self {
            loading_area_length_m,
            offset,
            container: None,
        }
    }

    /// Whether `container` fits this slot while it is empty.
    pub fn accepts(&self, container: &Container) -> bool {
        self.container.is_none() && container.length_m <= self.loading_area_length_m + LENGTH_TOLERANCE_M
    }

    pub fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_f32(self.loading_area_length_m)?;
        out.write_vec3(self.offset)?;
        out.write_bool(self.container.is_some())?;
        if let Some(container) = &self.container {
            container.save(out)?;
        }
        Ok(())
    }

    pub fn restore<R: Read>(input: &mut SaveReader<R>) -> Result<Self> {
        let loading_area_length_m = input.read_f32()?;
        let offset = input.read_vec3()?;
        let container = if input.read_bool()? {
            Some(Container::restore(input)?)
        } else {
            None
        };
        Ok(Self {
            loading_area_length_m,
            offset,
            container,
        })
    }
}

/// Layout of one stack location as given by the world file.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StackLocationDef {
    pub position: Vec3,
    pub max_stacked: usize,
    pub length_m: f32,
    pub flipped: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StackLocation {
    pub position: Vec3,
    pub max_stacked: usize,
    pub length_m: f32,
    pub flipped: bool,
    pub containers: Vec<Container>,
    pub usable: bool,
}

impl StackLocation {
    pub fn new(def: &StackLocationDef) -> Self {
        Self {
            position: def.position,
            max_stacked: def.max_stacked,
            length_m: def.length_m,
            flipped: def.flipped,
            containers: Vec::new(),
            usable: true,
        }
    }

    /// The rear 20 ft half of a 40 ft bay. Starts unusable.
    fn half_slot(&self) -> Self {
        let shift = if self.flipped { -LENGTH_20FT_M } else { LENGTH_20FT_M };
        Self {
            position: self.position + Vec3::new(0.0, 0.0, shift),
            max_stacked: self.max_stacked,
            length_m: LENGTH_20FT_M,
            flipped: self.flipped,
            containers: Vec::new(),
            usable: false,
        }
    }

    fn is_full(&self) -> bool {
        self.containers.len() >= self.max_stacked
    }

    fn holds_length(&self, length_m: f32) -> bool {
        self.containers
            .first()
            .map_or(true, |c| (c.length_m - length_m).abs() < LENGTH_TOLERANCE_M)
    }
}

/// Static description of a crane and its yard.
#[derive(Debug, Clone, PartialEq)]
pub struct CraneDefinition {
    pub max_stacked: usize,
    pub stack_locations_length_m: f32,
    pub stack_locations: Vec<StackLocationDef>,
    pub picking_surface_y_offset: f32,
    /// Rest position of the grabber, in crane coordinates.
    pub picking_surface_top_start: Vec3,
    pub max_grabber_span_m: f32,
    pub grabber01_max: f32,
    pub grabber02_max: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CraneStatus {
    #[default]
    Idle,
    LoadRaiseToPick,
    LoadHorizontallyMoveToPick,
    LoadLowerToPick,
    LoadWaitingForPick,
    LoadRaiseToLayOnWagon,
    LoadHorizontallyMoveToLayOnWagon,
    LoadLowerToLayOnWagon,
    LoadWaitingForLayingOnWagon,
    UnloadRaiseToPick,
    UnloadHorizontallyMoveToPick,
    UnloadLowerToPick,
    UnloadWaitingForPick,
    UnloadRaiseToLayOnEarth,
    UnloadHorizontallyMoveToLayOnEarth,
    UnloadLowerToLayOnEarth,
    UnloadWaitingForLayingOnEarth,
    RaiseToIdle,
}

impl CraneStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Self {
        const ALL: [CraneStatus; 18] = [
            CraneStatus::Idle,
            CraneStatus::LoadRaiseToPick,
            CraneStatus::LoadHorizontallyMoveToPick,
            CraneStatus::LoadLowerToPick,
            CraneStatus::LoadWaitingForPick,
            CraneStatus::LoadRaiseToLayOnWagon,
            CraneStatus::LoadHorizontallyMoveToLayOnWagon,
            CraneStatus::LoadLowerToLayOnWagon,
            CraneStatus::LoadWaitingForLayingOnWagon,
            CraneStatus::UnloadRaiseToPick,
            CraneStatus::UnloadHorizontallyMoveToPick,
            CraneStatus::UnloadLowerToPick,
            CraneStatus::UnloadWaitingForPick,
            CraneStatus::UnloadRaiseToLayOnEarth,
            CraneStatus::UnloadHorizontallyMoveToLayOnEarth,
            CraneStatus::UnloadLowerToLayOnEarth,
            CraneStatus::UnloadWaitingForLayingOnEarth,
            CraneStatus::RaiseToIdle,
        ];
        usize::try_from(code)
            .ok()
            .and_then(|i| ALL.get(i).copied())
            .unwrap_or(CraneStatus::Idle)
    }
}

/// The wagon a crane is working on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkedWagon {
    pub train: TrainId,
    pub car_index: usize,
}

/// Per-axis motion of the crane towards its targets.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct CraneAxes {
    actual: Vec3,
    target: Vec3,
    move_x: bool,
    move_y: bool,
    move_z: bool,
    grabbers: (f32, f32),
    grabber_targets: (f32, f32),
    move_grabber: bool,
}

fn approach(actual: &mut f32, target: f32, step: f32) -> bool {
    let delta = target - *actual;
    if delta.abs() <= step {
        *actual = target;
        true
    } else {
        *actual += step * delta.signum();
        false
    }
}

impl CraneAxes {
    fn idle(&self) -> bool {
        !self.move_x && !self.move_y && !self.move_z
    }

    fn advance(&mut self, elapsed_s: f32) {
        let xz = CRANE_SPEED_XZ_MPS * elapsed_s;
        if self.move_x && approach(&mut self.actual.x, self.target.x, xz) {
            self.move_x = false;
        }
        if self.move_z && approach(&mut self.actual.z, self.target.z, xz) {
            self.move_z = false;
        }
        if self.move_y && approach(&mut self.actual.y, self.target.y, CRANE_SPEED_Y_MPS * elapsed_s) {
            self.move_y = false;
        }
        if self.move_grabber {
            let step = GRABBER_SPEED_MPS * elapsed_s;
            let a = approach(&mut self.grabbers.0, self.grabber_targets.0, step);
            let b = approach(&mut self.grabbers.1, self.grabber_targets.1, step);
            if a && b {
                self.move_grabber = false;
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerHandlingItem {
    pub id: TrItemId,
    pub track_node: usize,
    pub location: WorldLocation,
    pub shape_position: WorldPosition,
    pub definition: CraneDefinition,
    pub stack_locations: Vec<StackLocation>,
    pub status: CraneStatus,
    pub container_attached: bool,
    pub handled_container: Option<Container>,
    pub linked_wagon: Option<LinkedWagon>,
    /// Container offset from the grabber while attached.
    pub relative_container_position: Mat4,
    general_vertical_offset: f32,
    axes: CraneAxes,
    delay_s: Option<f32>,
    selected_stack: Option<usize>,
    free_position_vertical: usize,
    position_horizontal: usize,
    message_written: bool,
    loading_end_delay_s: f32,
    unloading_start_delay_s: f32,
}

impl ContainerHandlingItem {
    pub fn new(
        id: TrItemId,
        track_node: usize,
        location: WorldLocation,
        shape_position: WorldPosition,
        definition: CraneDefinition,
    ) -> Self {
        let mut stack_locations: Vec<StackLocation> =
            definition.stack_locations.iter().map(StackLocation::new).collect();
        if definition.stack_locations_length_m + LENGTH_TOLERANCE_M > LENGTH_40FT_M {
            let halves: Vec<StackLocation> = stack_locations.iter().map(StackLocation::half_slot).collect();
            stack_locations.extend(halves);
        }
        let axes = CraneAxes {
            actual: definition.picking_surface_top_start,
            target: definition.picking_surface_top_start,
            grabbers: (definition.grabber01_max, definition.grabber02_max),
            grabber_targets: (definition.grabber01_max, definition.grabber02_max),
            ..CraneAxes::default()
        };
        Self {
            id,
            track_node,
            location,
            shape_position,
            definition,
            stack_locations,
            status: CraneStatus::Idle,
            container_attached: false,
            handled_container: None,
            linked_wagon: None,
            relative_container_position: Mat4::IDENTITY,
            general_vertical_offset: 0.0,
            axes,
            delay_s: None,
            selected_stack: None,
            free_position_vertical: 0,
            position_horizontal: 0,
            message_written: false,
            loading_end_delay_s: 3.0,
            unloading_start_delay_s: 2.0,
        }
    }

    pub fn with_delays(mut self, loading_end_delay_s: f32, unloading_start_delay_s: f32) -> Self {
        self.loading_end_delay_s = loading_end_delay_s;
        self.unloading_start_delay_s = unloading_start_delay_s;
        self
    }

    /// Whether bays are doubled into 20 ft half-slots.
    pub fn has_half_slots(&self) -> bool {
        self.definition.stack_locations_length_m + LENGTH_TOLERANCE_M > LENGTH_40FT_M
    }

    fn half(&self) -> usize {
        if self.has_half_slots() {
            self.stack_locations.len() / 2
        } else {
            self.stack_locations.len()
        }
    }

    /// Paired slot of a doubled bay: main slot for a half-slot and the
    /// other way round.
    pub fn paired_slot(&self, index: usize) -> Option<usize> {
        if !self.has_half_slots() || index >= self.stack_locations.len() {
            return None;
        }
        let half = self.half();
        Some(if index < half { index + half } else { index - half })
    }

    /// Crane grabber position in shape coordinates.
    pub fn crane_position(&self) -> Vec3 {
        self.axes.actual
    }

    pub fn container_count(&self) -> usize {
        self.stack_locations.iter().map(|s| s.containers.len()).sum()
    }

    /// Places a container in the yard at load time.
    pub fn preload(&mut self, mut container: Container, stack_index: usize) -> Result<()> {
        let half = self.half();
        let has_half_slots = self.has_half_slots();
        let stack = self
            .stack_locations
            .get(stack_index)
            .with_context(|| format!("Stack location {} does not exist", stack_index))?;
        if stack.is_full() {
            bail!("Stack Location {} is full, can't lay down container", stack_index);
        }
        if !stack.holds_length(container.length_m) {
            bail!("Stack Location {} is occupied with containers of different length", stack_index);
        }
        if stack.length_m + LENGTH_TOLERANCE_M < container.length_m {
            bail!("Stack Location {} is too short for container {}", stack_index, container.name);
        }
        if stack_index >= half && !stack.usable {
            let main = &self.stack_locations[stack_index - half];
            if main.containers.first().map_or(true, |c| !c.is_20ft()) {
                bail!("Stack Location {} is not usable", stack_index);
            }
        }

        if !container.is_20ft() && stack_index < half {
            if let Some(pair) = self.paired_slot(stack_index) {
                if !self.stack_locations[pair].containers.is_empty() {
                    bail!("Stack Location {} shares its bay with 20ft containers", stack_index);
                }
            }
        }

        let vertical = stack.containers.len();
        container.world_position = self.stack_world_position(stack_index, vertical, &container);
        let is_20ft = container.is_20ft();
        self.stack_locations[stack_index].containers.push(container);
        if has_half_slots && stack_index < half {
            self.stack_locations[stack_index + half].usable = is_20ft;
        }
        Ok(())
    }

    /// World transform of a container lying at `vertical` in a stack.
    fn stack_world_position(&self, stack_index: usize, vertical: usize, container: &Container) -> WorldPosition {
        let stack = &self.stack_locations[stack_index];
        let mut offset = stack.position - Vec3::new(container.intrinsic_offset.x, container.intrinsic_offset.y, -container.intrinsic_offset.z);
        offset.z += container.length_m * if stack.flipped { -1.0 } else { 1.0 } / 2.0;
        offset.y += stack.containers.iter().take(vertical).map(|c| c.height_m).sum::<f32>();
        offset.z = -offset.z;
        let translation = self.shape_position.matrix.transform_point3(offset);
        let mut matrix = self.shape_position.matrix;
        matrix.w_axis = translation.extend(1.0);
        WorldPosition::new(self.shape_position.tile_x, self.shape_position.tile_z, matrix)
    }

    /// Top of the stack after `vertical + 1` containers.
    fn target_y_base(&self, vertical: usize, stack_index: usize) -> f32 {
        let stack = &self.stack_locations[stack_index];
        stack.position.y + stack.containers.iter().take(vertical + 1).map(|c| c.height_m).sum::<f32>()
    }

    /// A wagon's origin in crane coordinates.
    fn wagon_local(&self, wagon: &WorldPosition) -> Vec3 {
        let mut wagon = *wagon;
        wagon.normalize_to(self.shape_position.tile_x, self.shape_position.tile_z);
        self.shape_position.matrix.inverse().transform_point3(wagon.translation())
    }

    /// True if some slot could take `container`.
    pub fn check_for_eligible_stack_position(&self, container: &Container) -> bool {
        self.unload_candidates(container).next().is_some()
    }

    fn unload_candidates<'a>(&'a self, container: &'a Container) -> impl Iterator<Item = usize> + 'a {
        let check = if container.length_m > LENGTH_20FT_M + LENGTH_TOLERANCE_M && self.has_half_slots() {
            self.half()
        } else {
            self.stack_locations.len()
        };
        (0..check).filter(move |&i| {
            let stack = &self.stack_locations[i];
            if !stack.usable || stack.is_full() || !stack.holds_length(container.length_m) {
                return false;
            }
            if !container.is_20ft() {
                if let Some(pair) = self.paired_slot(i) {
                    return self.stack_locations[pair].containers.is_empty();
                }
            }
            true
        })
    }

    /// Nearest stack whose top container fits the wagon's freight slot.
    pub fn select_load_position(
        &self,
        slot: &FreightSlot,
        wagon: &WorldPosition,
        confirmer: &mut Confirmer,
        ctx: &SimContext,
    ) -> Option<usize> {
        let wagon_z = self.wagon_local(wagon).z + slot.offset.z;
        let reference = self.definition.picking_surface_top_start;
        let best = self
            .stack_locations
            .iter()
            .enumerate()
            .filter_map(|(i, s)| s.containers.last().map(|top| (i, s, top)))
            .filter(|(_, _, top)| slot.accepts(top))
            .map(|(i, s, _)| {
                let dx = reference.x - s.position.x;
                let dz = wagon_z - s.position.z;
                (i, dx * dx + dz * dz)
            })
            .min_by_key(|(_, d)| OrderedFloat(*d))
            .map(|(i, _)| i);
        if best.is_none() {
            confirmer.message(ConfirmLevel::None, &ctx.get_string("No suitable container to load"));
        }
        best
    }

    /// Nearest usable slot for the handled container, measured from the
    /// crane's current position.
    pub fn select_unload_position(&mut self, confirmer: &mut Confirmer, ctx: &SimContext) -> Option<usize> {
        let container = self.handled_container.as_ref()?;
        let is_20ft = container.is_20ft();
        let length = container.length_m;
        let at = self.axes.actual;
        let best = self
            .unload_candidates(container)
            .map(|i| {
                let p = self.stack_locations[i].position;
                (i, (at.x - p.x).powi(2) + (at.z - p.z).powi(2))
            })
            .min_by_key(|(_, d)| OrderedFloat(*d))
            .map(|(i, _)| i);
        let Some(index) = best else {
            if !self.message_written {
                confirmer.message(ConfirmLevel::None, &ctx.get_string("No suitable position to unload"));
                self.message_written = true;
            }
            return None;
        };

        self.position_horizontal = index;
        self.free_position_vertical = self.stack_locations[index].containers.len();
        if let Some(pair) = self.paired_slot(index) {
            if index < self.half() {
                self.stack_locations[pair].usable = is_20ft;
            }
        }
        let stack = &self.stack_locations[index];
        self.axes.target.x = stack.position.x;
        self.axes.target.z = stack.position.z + length * if stack.flipped { -1.0 } else { 1.0 } / 2.0;
        Some(index)
    }

    fn set_grabbers(&mut self, length_m: f32) {
        let d = &self.definition;
        self.axes.grabber_targets = (
            d.grabber01_max.min((length_m - d.max_grabber_span_m) / 2.0 + d.grabber01_max),
            d.grabber02_max.max((-length_m + d.max_grabber_span_m) / 2.0 + d.grabber02_max),
        );
        self.axes.move_grabber = true;
    }

    fn raise_to_top(&mut self) {
        self.axes.target.y = self.definition.picking_surface_top_start.y;
        self.axes.move_y = true;
    }

    /// Starts moving the top container of the nearest stack onto a wagon.
    pub fn prepare_for_load(
        &mut self,
        wagon: LinkedWagon,
        trains: &[Train],
        confirmer: &mut Confirmer,
        ctx: &SimContext,
    ) -> bool {
        if self.status != CraneStatus::Idle {
            return false;
        }
        let Some(car) = trains
            .iter()
            .find(|t| t.number == wagon.train)
            .and_then(|t| t.cars.get(wagon.car_index))
        else {
            return false;
        };
        let Some(slot) = car.freight.as_ref() else {
            return false;
        };
        let Some(index) = self.select_load_position(slot, &car.world_position, confirmer, ctx) else {
            return false;
        };
        let Some(top) = self.stack_locations[index].containers.last() else {
            return false;
        };
        let length = top.length_m;
        let offset = top.intrinsic_offset;
        self.linked_wagon = Some(wagon);
        self.selected_stack = Some(index);
        self.relative_container_position = Mat4::from_translation(-offset);
        self.status = CraneStatus::LoadRaiseToPick;
        self.raise_to_top();
        self.set_grabbers(length);
        debug!("Crane {} loading from stack {}", self.id.0, index);
        true
    }

    /// Starts lifting the container off a wagon into the yard.
    pub fn prepare_for_unload(
        &mut self,
        wagon: LinkedWagon,
        trains: &[Train],
        confirmer: &mut Confirmer,
        ctx: &SimContext,
    ) -> bool {
        if self.status != CraneStatus::Idle {
            return false;
        }
        let Some(container) = trains
            .iter()
            .find(|t| t.number == wagon.train)
            .and_then(|t| t.cars.get(wagon.car_index))
            .and_then(|c| c.freight.as_ref())
            .and_then(|f| f.container.as_ref())
        else {
            return false;
        };
        if !self.check_for_eligible_stack_position(container) {
            confirmer.message(ConfirmLevel::None, &ctx.get_string("No suitable position to unload"));
            return false;
        }
        let length = container.length_m;
        self.general_vertical_offset = self.definition.picking_surface_y_offset;
        self.linked_wagon = Some(wagon);
        self.status = CraneStatus::UnloadRaiseToPick;
        self.message_written = false;
        self.raise_to_top();
        self.set_grabbers(length);
        true
    }

    fn start_delay(&mut self, seconds: f32) {
        self.delay_s = Some(seconds);
    }

    fn delay_elapsed(&mut self, elapsed_s: f32) -> bool {
        match self.delay_s.as_mut() {
            Some(remaining) => {
                *remaining -= elapsed_s;
                if *remaining <= 0.0 {
                    self.delay_s = None;
                    true
                } else {
                    false
                }
            }
            None => true,
        }
    }

    fn linked_car<'a>(&self, trains: &'a mut [Train]) -> Option<(&'a mut super::train::TrainCar, f32)> {
        let wagon = self.linked_wagon?;
        let train = trains.iter_mut().find(|t| t.number == wagon.train)?;
        let speed = train.speed_mps;
        train.cars.get_mut(wagon.car_index).map(|c| (c, speed))
    }

    /// Advances the crane cycle by one tick.
    pub fn update(&mut self, elapsed_s: f32, trains: &mut [Train], confirmer: &mut Confirmer, ctx: &SimContext) {
        self.axes.advance(elapsed_s);
        let done = self.axes.idle();

        match self.status {
            CraneStatus::Idle => {}
            CraneStatus::LoadRaiseToPick => {
                if done {
                    let Some(index) = self.selected_stack else {
                        self.status = CraneStatus::RaiseToIdle;
                        return;
                    };
                    let stack = &self.stack_locations[index];
                    let length = stack.containers.last().map_or(0.0, |c| c.length_m);
                    self.axes.target.x = stack.position.x;
                    self.axes.target.z = stack.position.z + length * if stack.flipped { -1.0 } else { 1.0 } / 2.0;
                    self.axes.move_x = true;
                    self.axes.move_z = true;
                    self.status = CraneStatus::LoadHorizontallyMoveToPick;
                }
            }
            CraneStatus::LoadHorizontallyMoveToPick => {
                if done && !self.axes.move_grabber {
                    if let Some(index) = self.selected_stack {
                        let top = self.stack_locations[index].containers.len().saturating_sub(1);
                        self.axes.target.y = self.target_y_base(top, index) - self.definition.picking_surface_y_offset;
                        self.axes.move_y = true;
                    }
                    self.status = CraneStatus::LoadLowerToPick;
                }
            }
            CraneStatus::LoadLowerToPick => {
                if done {
                    self.start_delay(self.unloading_start_delay_s);
                    self.status = CraneStatus::LoadWaitingForPick;
                }
            }
            CraneStatus::LoadWaitingForPick => {
                if self.delay_elapsed(elapsed_s) {
                    self.container_attached = true;
                    self.raise_to_top();
                    self.message_written = false;
                    self.status = CraneStatus::LoadRaiseToLayOnWagon;
                }
            }
            CraneStatus::LoadRaiseToLayOnWagon => {
                if done || self.message_written {
                    let Some((car, speed)) = self.linked_car(trains) else {
                        warn!("Crane {} lost its wagon, aborting load", self.id.0);
                        self.container_attached = false;
                        self.status = CraneStatus::RaiseToIdle;
                        return;
                    };
                    if speed.abs() < WAGON_STOPPED_MPS {
                        let slot_z = car.freight.as_ref().map_or(0.0, |f| f.offset.z);
                        let flip = if car.flipped { -1.0 } else { 1.0 };
                        let wagon_z = self.wagon_local(&car.world_position).z;
                        self.axes.target.x = self.definition.picking_surface_top_start.x;
                        self.axes.target.z = wagon_z + slot_z * flip;
                        self.axes.move_x = true;
                        self.axes.move_z = true;
                        self.status = CraneStatus::LoadHorizontallyMoveToLayOnWagon;
                    }
                }
            }
            CraneStatus::LoadHorizontallyMoveToLayOnWagon => {
                if done {
                    let height = self
                        .selected_stack
                        .and_then(|i| self.stack_locations[i].containers.last())
                        .map_or(0.0, |c| c.height_m);
                    if let Some((car, _)) = self.linked_car(trains) {
                        let slot_y = car.freight.as_ref().map_or(0.0, |f| f.offset.y);
                        let wagon_y = self.wagon_local(&car.world_position).y;
                        self.axes.target.y = height + wagon_y + slot_y - self.definition.picking_surface_y_offset;
                    }
                    self.axes.move_y = true;
                    self.status = CraneStatus::LoadLowerToLayOnWagon;
                }
            }
            CraneStatus::LoadLowerToLayOnWagon => {
                if done {
                    self.lay_on_wagon(trains);
                    self.start_delay(self.loading_end_delay_s);
                    self.status = CraneStatus::LoadWaitingForLayingOnWagon;
                }
            }
            CraneStatus::LoadWaitingForLayingOnWagon => {
                if self.delay_elapsed(elapsed_s) {
                    self.raise_to_top();
                    self.message_written = false;
                    self.status = CraneStatus::RaiseToIdle;
                }
            }
            CraneStatus::UnloadRaiseToPick => {
                if done || self.message_written {
                    let Some((car, speed)) = self.linked_car(trains) else {
                        self.status = CraneStatus::RaiseToIdle;
                        return;
                    };
                    if speed.abs() < WAGON_STOPPED_MPS {
                        let slot_z = car.freight.as_ref().map_or(0.0, |f| f.offset.z);
                        let flip = if car.flipped { -1.0 } else { 1.0 };
                        let wagon_z = self.wagon_local(&car.world_position).z;
                        self.axes.target.x = self.definition.picking_surface_top_start.x;
                        self.axes.target.z = wagon_z + slot_z * flip;
                        self.axes.move_x = true;
                        self.axes.move_z = true;
                        self.status = CraneStatus::UnloadHorizontallyMoveToPick;
                    }
                }
            }
            CraneStatus::UnloadHorizontallyMoveToPick => {
                if done && !self.axes.move_grabber {
                    if let Some((car, _)) = self.linked_car(trains) {
                        let (slot_y, height) = car
                            .freight
                            .as_ref()
                            .map_or((0.0, 0.0), |f| (f.offset.y, f.container.as_ref().map_or(0.0, |c| c.height_m)));
                        let wagon_y = self.wagon_local(&car.world_position).y;
                        self.axes.target.y = wagon_y + slot_y + height - self.general_vertical_offset;
                    }
                    self.axes.move_y = true;
                    self.status = CraneStatus::UnloadLowerToPick;
                }
            }
            CraneStatus::UnloadLowerToPick => {
                if done {
                    self.start_delay(self.unloading_start_delay_s);
                    self.status = CraneStatus::UnloadWaitingForPick;
                }
            }
            CraneStatus::UnloadWaitingForPick => {
                if self.delay_elapsed(elapsed_s) {
                    let taken = self
                        .linked_car(trains)
                        .and_then(|(car, _)| car.freight.as_mut())
                        .and_then(|f| f.container.take());
                    if let Some(container) = taken {
                        self.relative_container_position = Mat4::from_translation(-container.intrinsic_offset);
                        self.handled_container = Some(container);
                        self.container_attached = true;
                    }
                    self.linked_wagon = None;
                    self.raise_to_top();
                    self.status = CraneStatus::UnloadRaiseToLayOnEarth;
                }
            }
            CraneStatus::UnloadRaiseToLayOnEarth => {
                if done {
                    if self.handled_container.is_none() {
                        self.status = CraneStatus::RaiseToIdle;
                        return;
                    }
                    if self.select_unload_position(confirmer, ctx).is_some() {
                        self.axes.move_x = true;
                        self.axes.move_z = true;
                        self.status = CraneStatus::UnloadHorizontallyMoveToLayOnEarth;
                    }
                }
            }
            CraneStatus::UnloadHorizontallyMoveToLayOnEarth => {
                if done {
                    let index = self.position_horizontal;
                    if let Some(container) = self.handled_container.take() {
                        self.stack_locations[index].containers.push(container);
                    }
                    self.axes.target.y = self.target_y_base(self.free_position_vertical, index)
                        - self.definition.picking_surface_y_offset;
                    self.axes.move_y = true;
                    self.status = CraneStatus::UnloadLowerToLayOnEarth;
                }
            }
            CraneStatus::UnloadLowerToLayOnEarth => {
                if done {
                    self.start_delay(self.loading_end_delay_s);
                    self.status = CraneStatus::UnloadWaitingForLayingOnEarth;
                }
            }
            CraneStatus::UnloadWaitingForLayingOnEarth => {
                if self.delay_elapsed(elapsed_s) {
                    let index = self.position_horizontal;
                    let vertical = self.free_position_vertical;
                    if let Some(container) = self.stack_locations[index].containers.get(vertical).cloned() {
                        let position = self.stack_world_position(index, vertical, &container);
                        self.stack_locations[index].containers[vertical].world_position = position;
                    }
                    self.container_attached = false;
                    self.relative_container_position = Mat4::IDENTITY;
                    self.raise_to_top();
                    self.status = CraneStatus::RaiseToIdle;
                    info!("Crane {} unloaded a container to stack {}", self.id.0, index);
                }
            }
            CraneStatus::RaiseToIdle => {
                if done {
                    self.selected_stack = None;
                    self.linked_wagon = None;
                    self.status = CraneStatus::Idle;
                }
            }
        }

        if self.container_attached {
            let grabber = self.shape_position.matrix * Mat4::from_translation(self.axes.actual);
            let matrix = grabber * self.relative_container_position;
            let position = WorldPosition::new(self.shape_position.tile_x, self.shape_position.tile_z, matrix);
            if let Some(container) = self.handled_container.as_mut() {
                container.world_position = position;
            } else if let Some(top) = self
                .selected_stack
                .and_then(|i| self.stack_locations.get_mut(i))
                .and_then(|s| s.containers.last_mut())
            {
                top.world_position = position;
            }
        }
    }

    /// Moves the picked container from its stack onto the linked wagon and
    /// fixes up the half-slot bookkeeping. Leaves the stack untouched if the
    /// wagon has no free slot.
    fn lay_on_wagon(&mut self, trains: &mut [Train]) {
        self.container_attached = false;
        let Some(index) = self.selected_stack else { return };
        let Some(slot) = self
            .linked_car(trains)
            .and_then(|(car, _)| car.freight.as_mut())
            .filter(|slot| slot.container.is_none())
        else {
            warn!("Crane {} has no free wagon slot for stack {}", self.id.0, index);
            return;
        };
        let Some(container) = self.stack_locations[index].containers.pop() else {
            return;
        };
        let was_20ft = container.is_20ft();
        if self.stack_locations[index].containers.is_empty() {
            if let Some(pair) = self.paired_slot(index) {
                let half = self.half();
                if index < half {
                    if was_20ft && self.stack_locations[pair].containers.is_empty() {
                        self.stack_locations[pair].usable = false;
                    }
                } else if self.stack_locations[pair].containers.is_empty() {
                    self.stack_locations[index].usable = false;
                }
            }
        }
        slot.container = Some(container);
        info!("Crane {} loaded a container onto a wagon", self.id.0);
    }

    pub fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_i32(self.status.code())?;
        out.write_f32(self.general_vertical_offset)?;
        out.write_mat4(&self.relative_container_position)?;
        for stack in &self.stack_locations {
            out.write_bool(stack.usable)?;
            out.write_i32(stack.containers.len() as i32)?;
            for container in &stack.containers {
                container.save(out)?;
            }
        }
        Ok(())
    }

    /// Reads the yard back. A crane saved mid-cycle comes back idle.
    pub fn restore<R: Read>(&mut self, input: &mut SaveReader<R>) -> Result<()> {
        let status = CraneStatus::from_code(input.read_i32()?);
        if status != CraneStatus::Idle {
            debug!("Crane {} was {:?} when saved, restoring idle", self.id.0, status);
        }
        self.status = CraneStatus::Idle;
        self.container_attached = false;
        self.handled_container = None;
        self.linked_wagon = None;
        self.general_vertical_offset = input.read_f32()?;
        self.relative_container_position = input.read_mat4()?;
        for index in 0..self.stack_locations.len() {
            self.stack_locations[index].usable = input.read_bool()?;
            let count = input.read_i32()?;
            self.stack_locations[index].containers.clear();
            for vertical in 0..count.max(0) as usize {
                let mut container = Container::restore(input)
                    .with_context(|| format!("Restoring container {} of stack {}", vertical, index))?;
                container.world_position = self.stack_world_position(index, vertical, &container);
                self.stack_locations[index].containers.push(container);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct ContainerManager {
    pub items: Vec<ContainerHandlingItem>,
}

impl ContainerManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a crane over a pickup item of the track database.
    pub fn create_container_station(
        &mut self,
        db: &TrackDb,
        pickup: TrItemId,
        shape_position: WorldPosition,
        definition: CraneDefinition,
        loading_end_delay_s: f32,
        unloading_start_delay_s: f32,
    ) -> Result<usize> {
        let item = db
            .item(pickup)
            .with_context(|| format!("Container station refers to unknown item {}", pickup.0))?;
        if item.item_type() != TrItemType::Pickup {
            bail!("Track item {} is not a pickup", pickup.0);
        }
        let crane = ContainerHandlingItem::new(pickup, item.node, item.location, shape_position, definition)
            .with_delays(loading_end_delay_s, unloading_start_delay_s);
        self.items.push(crane);
        Ok(self.items.len() - 1)
    }

    pub fn update(&mut self, elapsed_s: f32, trains: &mut [Train], confirmer: &mut Confirmer, ctx: &SimContext) {
        for item in self.items.iter_mut() {
            item.update(elapsed_s, trains, confirmer, ctx);
        }
    }

    pub fn save<W: Write>(&self, out: &mut SaveWriter<W>) -> Result<()> {
        out.write_i32(self.items.len() as i32)?;
        for item in &self.items {
            item.save(out)?;
        }
        Ok(())
    }

    pub fn restore<R: Read>(&mut self, input: &mut SaveReader<R>) -> Result<()> {
        let count = input.read_i32()?;
        if count as usize != self.items.len() {
            bail!("Save holds {} container stations, route has {}", count, self.items.len());
        }
        for item in self.items.iter_mut() {
            item.restore(input)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn yard(length_m: f32) -> ContainerHandlingItem {
        let definition = CraneDefinition {
            max_stacked: 2,
            stack_locations_length_m: length_m,
            stack_locations: vec![
                StackLocationDef {
                    position: Vec3::new(5.0, 0.0, 0.0),
                    max_stacked: 2,
                    length_m,
                    flipped: false,
                },
                StackLocationDef {
                    position: Vec3::new(10.0, 0.0, 0.0),
                    max_stacked: 2,
                    length_m,
                    flipped: false,
                },
            ],
            picking_surface_y_offset: 0.0,
            picking_surface_top_start: Vec3::new(0.0, 10.0, 0.0),
            max_grabber_span_m: 12.19,
            grabber01_max: 0.0,
            grabber02_max: 0.0,
        };
        ContainerHandlingItem::new(TrItemId(0), 1, WorldLocation::default(), WorldPosition::default(), definition)
    }

    #[test]
    fn test_long_bays_gain_half_slots() {
        let crane = yard(LENGTH_40FT_M);
        assert_eq!(crane.stack_locations.len(), 4);
        assert!(!crane.stack_locations[2].usable);
        assert!((crane.stack_locations[2].length_m - LENGTH_20FT_M).abs() < 1e-6);
        assert_eq!(crane.paired_slot(1), Some(3));

        let short = yard(LENGTH_20FT_M);
        assert_eq!(short.stack_locations.len(), 2);
        assert_eq!(short.paired_slot(0), None);
    }

    #[test]
    fn test_preload_20ft_opens_half_slot() {
        let mut crane = yard(LENGTH_40FT_M);
        crane.preload(Container::new("a", ContainerType::C20ft), 0).unwrap();
        assert!(crane.stack_locations[2].usable);

        crane.preload(Container::new("b", ContainerType::C40ft), 1).unwrap();
        assert!(!crane.stack_locations[3].usable);
    }

    #[test]
    fn test_preload_rejects_mixed_lengths() {
        let mut crane = yard(LENGTH_40FT_M);
        crane.preload(Container::new("a", ContainerType::C20ft), 0).unwrap();
        assert!(crane.preload(Container::new("b", ContainerType::C40ft), 0).is_err());
        assert_eq!(crane.container_count(), 1);
    }

    #[test]
    fn test_preload_rejects_full_stack() {
        let mut crane = yard(LENGTH_40FT_M);
        crane.preload(Container::new("a", ContainerType::C40ft), 0).unwrap();
        crane.preload(Container::new("b", ContainerType::C40ft), 0).unwrap();
        assert!(crane.preload(Container::new("c", ContainerType::C40ft), 0).is_err());
    }

    #[test]
    fn test_40ft_needs_empty_half_slot() {
        let mut crane = yard(LENGTH_40FT_M);
        crane.preload(Container::new("a", ContainerType::C20ft), 0).unwrap();
        crane.preload(Container::new("b", ContainerType::C20ft), 2).unwrap();
        crane.stack_locations[0].containers.clear();
        let forty = Container::new("c", ContainerType::C40ft);
        let candidates: Vec<usize> = crane.unload_candidates(&forty).collect();
        assert_eq!(candidates, vec![1]);
    }

    fn flat_wagon(load: Option<Container>) -> Train {
        use super::super::track_db::{TrackDbBuilder, TrackShape};
        use super::super::train::{TrainCar, TrainType};
        use super::super::traveller::Traveller;
        use std::sync::Arc;

        let mut b = TrackDbBuilder::new();
        let node = b.add_vector_node(WorldLocation::default(), 0.0, &[TrackShape::Straight { length_m: 100.0 }]);
        let db = Arc::new(b.build());
        let mut front = Traveller::from_node(&db, node).unwrap();
        front.move_by(50.0);
        let mut slot = FreightSlot::new(LENGTH_40FT_M, Vec3::ZERO);
        slot.container = load;
        let car = TrainCar::new("7 - 1", 15.0, 20_000.0).with_freight(slot);
        Train::new(TrainId(1), "Freight", TrainType::Static, front, vec![car])
    }

    #[test]
    fn test_failed_lay_keeps_half_slots() {
        let mut crane = yard(LENGTH_40FT_M);
        crane.preload(Container::new("a", ContainerType::C20ft), 0).unwrap();
        assert!(crane.stack_locations[2].usable);
        crane.selected_stack = Some(0);

        // No wagon linked.
        crane.lay_on_wagon(&mut []);
        assert_eq!(crane.stack_locations[0].containers.len(), 1);
        assert!(crane.stack_locations[2].usable);

        // Wagon already loaded.
        let mut trains = [flat_wagon(Some(Container::new("b", ContainerType::C40ft)))];
        crane.linked_wagon = Some(LinkedWagon {
            train: TrainId(1),
            car_index: 0,
        });
        crane.lay_on_wagon(&mut trains);
        assert_eq!(crane.stack_locations[0].containers.len(), 1);
        assert!(crane.stack_locations[2].usable);
        assert_eq!(trains[0].cars[0].freight.as_ref().unwrap().container.as_ref().unwrap().name, "b");
    }

    #[test]
    fn test_lay_on_wagon_closes_half_slot() {
        let mut crane = yard(LENGTH_40FT_M);
        crane.preload(Container::new("a", ContainerType::C20ft), 0).unwrap();
        crane.selected_stack = Some(0);
        crane.linked_wagon = Some(LinkedWagon {
            train: TrainId(1),
            car_index: 0,
        });
        let mut trains = [flat_wagon(None)];

        crane.lay_on_wagon(&mut trains);
        assert!(crane.stack_locations[0].containers.is_empty());
        assert!(!crane.stack_locations[2].usable);
        assert_eq!(trains[0].cars[0].freight.as_ref().unwrap().container.as_ref().unwrap().name, "a");
    }

    #[test]
    fn test_status_codes() {
        assert_eq!(CraneStatus::from_code(CraneStatus::RaiseToIdle.code()), CraneStatus::RaiseToIdle);
        assert_eq!(CraneStatus::from_code(99), CraneStatus::Idle);
    }
}
