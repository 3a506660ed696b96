//! Track database
//!
//! Static route geometry consumed by travellers and the per-feature
//! managers: track nodes linked by pins, the vector sections of each vector
//! node, the shared table of section shapes, and the item tables of the
//! track and road networks.

use anyhow::{bail, Context, Result};
use glam::Vec3;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::types::{heading, right_of, TrItemId, TravellerDirection, WorldLocation};

/// Standard gauge in metres
pub const STANDARD_GAUGE_M: f32 = 1.435;

/// Geometry of a track section shape.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TrackShape {
    Straight { length_m: f32 },
    /// Positive angles turn right when travelling forward.
    Curved { radius_m: f32, angle_deg: f32 },
}

/// An entry of the shared section table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackSection {
    pub index: u32,
    pub gauge_m: f32,
    pub shape: TrackShape,
}

impl TrackSection {
    /// Length along the centreline in metres.
    pub fn length_m(&self) -> f32 {
        match self.shape {
            TrackShape::Straight { length_m } => length_m,
            TrackShape::Curved {
                radius_m,
                angle_deg,
            } => radius_m * angle_deg.to_radians().abs(),
        }
    }

    pub fn is_curved(&self) -> bool {
        matches!(self.shape, TrackShape::Curved { .. })
    }

    /// Radius for curves, 0 for straight track.
    pub fn radius_m(&self) -> f32 {
        match self.shape {
            TrackShape::Curved { radius_m, .. } => radius_m,
            TrackShape::Straight { .. } => 0.0,
        }
    }

    pub fn angle_deg(&self) -> f32 {
        match self.shape {
            TrackShape::Curved { angle_deg, .. } => angle_deg,
            TrackShape::Straight { .. } => 0.0,
        }
    }
}

/// One straight or curved piece of a vector node.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TrVectorSection {
    pub section_index: u32,
    pub shape_index: u32,
    pub tile_x: i32,
    pub tile_z: i32,
    pub x: f32,
    pub y: f32,
    pub z: f32,
    /// Pitch, yaw and roll of the section start, in radians.
    pub ax: f32,
    pub ay: f32,
    pub az: f32,
    /// Super-elevation profile written by the super-elevation pass.
    pub start_elev: f32,
    pub end_elev: f32,
    pub max_elev: f32,
    /// Tile of the world file that placed this section.
    pub wf_name_x: i32,
    pub wf_name_z: i32,
    pub world_file_uid: u32,
    /// For moving-table track: twice the table exit index, plus one if the
    /// section runs away from the table.
    pub flag1: i32,
    pub pass_speed_mps: f32,
    pub freight_speed_mps: f32,
}

impl TrVectorSection {
    pub fn start_location(&self) -> WorldLocation {
        WorldLocation::new(self.tile_x, self.tile_z, self.x, self.y, self.z)
    }

    /// Location and yaw at `offset_m` metres along the section.
    pub fn point_at(&self, section: &TrackSection, offset_m: f32) -> (WorldLocation, f32) {
        let mut loc = self.start_location();
        let (delta, yaw) = match section.shape {
            TrackShape::Straight { .. } => {
                let (hx, hz) = heading(self.ay);
                let horizontal = offset_m * self.ax.cos();
                (
                    Vec3::new(hx * horizontal, -offset_m * self.ax.sin(), hz * horizontal),
                    self.ay,
                )
            }
            TrackShape::Curved {
                radius_m,
                angle_deg,
            } => {
                let hand = angle_deg.signum();
                let turned = offset_m / radius_m;
                let end_yaw = self.ay + hand * turned;
                let (r0x, r0z) = right_of(self.ay);
                let (r1x, r1z) = right_of(end_yaw);
                (
                    Vec3::new(
                        radius_m * hand * (r0x - r1x),
                        -offset_m * self.ax.sin(),
                        radius_m * hand * (r0z - r1z),
                    ),
                    end_yaw,
                )
            }
        };
        loc.location += delta;
        (loc, yaw)
    }
}

/// A pin joins one end of a node to another node.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrPin {
    /// Index of the linked node; 0 when unlinked.
    pub link: usize,
    /// Direction a traveller takes on entering the linked node.
    pub direction: TravellerDirection,
}

impl Default for TrPin {
    fn default() -> Self {
        Self {
            link: 0,
            direction: TravellerDirection::Forward,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TrVectorNode {
    pub sections: Vec<TrVectorSection>,
    /// Items attached to this node, ordered by offset.
    pub item_refs: Vec<TrItemId>,
}

/// Junction state. The selected route is switched at run time while the
/// database is shared, hence the atomic.
#[derive(Debug, Default)]
pub struct TrJunctionNode {
    pub selected_route: AtomicUsize,
}

#[derive(Debug)]
pub enum TrackNodeKind {
    Vector(TrVectorNode),
    Junction(TrJunctionNode),
    End,
}

#[derive(Debug)]
pub struct TrackNode {
    pub index: usize,
    pub kind: TrackNodeKind,
    pub pins: Vec<TrPin>,
    pub inpins: usize,
    pub outpins: usize,
    /// Placement of junction and end nodes.
    pub location: WorldLocation,
}

impl TrackNode {
    pub fn vector(&self) -> Option<&TrVectorNode> {
        match &self.kind {
            TrackNodeKind::Vector(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_junction(&self) -> bool {
        matches!(self.kind, TrackNodeKind::Junction(_))
    }

    pub fn is_end(&self) -> bool {
        matches!(self.kind, TrackNodeKind::End)
    }

    pub fn selected_route(&self) -> usize {
        match &self.kind {
            TrackNodeKind::Junction(j) => j.selected_route.load(Ordering::Relaxed),
            _ => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FuelKind {
    Diesel,
    Water,
    Coal,
}

/// Type tag used when querying the item table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrItemType {
    LevelCrossing,
    Platform,
    Siding,
    Hazard,
    Pickup,
    Signal,
    SpeedPost,
}

#[derive(Debug, Clone, PartialEq)]
pub enum TrackItemKind {
    LevelCrossing,
    Platform {
        station: String,
        min_waiting_s: f32,
        linked: TrItemId,
    },
    Siding {
        linked: TrItemId,
    },
    Hazard {
        file_name: String,
    },
    Pickup {
        fuel: FuelKind,
        capacity: f32,
        feed_rate_per_s: f32,
    },
    Signal,
    SpeedPost,
}

/// A point item placed on the track or road network.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackItem {
    pub id: TrItemId,
    pub name: String,
    /// Node the item lies on.
    pub node: usize,
    pub location: WorldLocation,
    pub kind: TrackItemKind,
}

impl TrackItem {
    pub fn item_type(&self) -> TrItemType {
        match self.kind {
            TrackItemKind::LevelCrossing => TrItemType::LevelCrossing,
            TrackItemKind::Platform { .. } => TrItemType::Platform,
            TrackItemKind::Siding { .. } => TrItemType::Siding,
            TrackItemKind::Hazard { .. } => TrItemType::Hazard,
            TrackItemKind::Pickup { .. } => TrItemType::Pickup,
            TrackItemKind::Signal => TrItemType::Signal,
            TrackItemKind::SpeedPost => TrItemType::SpeedPost,
        }
    }
}

/// The route's track network. Node 0 is never used so that a pin link of 0
/// means "unlinked".
#[derive(Debug)]
pub struct TrackDb {
    pub nodes: Vec<Option<TrackNode>>,
    pub sections: HashMap<u32, TrackSection>,
    pub items: Vec<Option<TrackItem>>,
    pub road_items: Vec<Option<TrackItem>>,
}

impl Default for TrackDb {
    fn default() -> Self {
        Self {
            nodes: vec![None],
            sections: HashMap::new(),
            items: Vec::new(),
            road_items: Vec::new(),
        }
    }
}

impl TrackDb {
    pub fn node(&self, index: usize) -> Option<&TrackNode> {
        self.nodes.get(index).and_then(|n| n.as_ref())
    }

    pub fn vector_node(&self, index: usize) -> Option<&TrVectorNode> {
        self.node(index).and_then(|n| n.vector())
    }

    pub fn vector_section(&self, node: usize, section: usize) -> Option<&TrVectorSection> {
        self.vector_node(node).and_then(|v| v.sections.get(section))
    }

    /// Looks up a section shape. Missing shapes are tolerated by callers.
    pub fn section(&self, index: u32) -> Option<&TrackSection> {
        self.sections.get(&index)
    }

    pub fn item(&self, id: TrItemId) -> Option<&TrackItem> {
        self.items.get(id.0).and_then(|i| i.as_ref())
    }

    pub fn road_item(&self, id: TrItemId) -> Option<&TrackItem> {
        self.road_items.get(id.0).and_then(|i| i.as_ref())
    }

    pub fn items_of_type(&self, item_type: TrItemType) -> impl Iterator<Item = &TrackItem> {
        self.items
            .iter()
            .flatten()
            .filter(move |i| i.item_type() == item_type)
    }

    /// Number of track nodes, including the unused slot 0.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Sets the route a junction sends forward-leaving travellers along.
    pub fn throw_switch(&self, node: usize, route: usize) -> Result<()> {
        let track_node = self
            .node(node)
            .with_context(|| format!("Track node {} not found", node))?;
        match &track_node.kind {
            TrackNodeKind::Junction(j) => {
                if route >= track_node.outpins {
                    bail!(
                        "Junction {} has {} routes, cannot select route {}",
                        node,
                        track_node.outpins,
                        route
                    );
                }
                j.selected_route.store(route, Ordering::Relaxed);
                Ok(())
            }
            _ => bail!("Track node {} is not a junction", node),
        }
    }
}

/// Which end of a vector node a link attaches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VectorEnd {
    Start,
    End,
}

/// Programmatic route construction. Section starts are chained from the
/// geometry of the preceding section, and pin directions are derived from
/// the pins they connect.
pub struct TrackDbBuilder {
    db: TrackDb,
    gauge_m: f32,
    next_section_index: u32,
    next_uid: u32,
}

impl Default for TrackDbBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl TrackDbBuilder {
    pub fn new() -> Self {
        Self {
            db: TrackDb::default(),
            gauge_m: STANDARD_GAUGE_M,
            next_section_index: 1,
            next_uid: 1,
        }
    }

    pub fn with_gauge(mut self, gauge_m: f32) -> Self {
        self.gauge_m = gauge_m;
        self
    }

    fn register_shape(&mut self, shape: TrackShape) -> u32 {
        let index = self.next_section_index;
        self.next_section_index += 1;
        self.db.sections.insert(
            index,
            TrackSection {
                index,
                gauge_m: self.gauge_m,
                shape,
            },
        );
        index
    }

    /// Adds a vector node made of `shapes`, starting at `start` heading `yaw`.
    pub fn add_vector_node(&mut self, start: WorldLocation, yaw: f32, shapes: &[TrackShape]) -> usize {
        self.add_vector_node_with(start, yaw, shapes, |_, _| {})
    }

    /// Like [`add_vector_node`](Self::add_vector_node), letting the caller
    /// adjust each section (speeds, world file tags) as it is created.
    pub fn add_vector_node_with<F>(
        &mut self,
        start: WorldLocation,
        yaw: f32,
        shapes: &[TrackShape],
        mut adjust: F,
    ) -> usize
    where
        F: FnMut(usize, &mut TrVectorSection),
    {
        let mut sections = Vec::with_capacity(shapes.len());
        let mut loc = start;
        loc.normalize();
        let mut current_yaw = yaw;
        for (i, shape) in shapes.iter().enumerate() {
            let index = self.register_shape(*shape);
            let mut section = TrVectorSection {
                section_index: index,
                shape_index: index,
                tile_x: loc.tile_x,
                tile_z: loc.tile_z,
                x: loc.location.x,
                y: loc.location.y,
                z: loc.location.z,
                ay: current_yaw,
                wf_name_x: loc.tile_x,
                wf_name_z: loc.tile_z,
                world_file_uid: self.next_uid,
                pass_speed_mps: 40.0,
                freight_speed_mps: 30.0,
                ..Default::default()
            };
            self.next_uid += 1;
            adjust(i, &mut section);
            let track_section = self.db.sections[&index];
            let (mut end, end_yaw) = section.point_at(&track_section, track_section.length_m());
            end.normalize();
            loc = end;
            current_yaw = end_yaw;
            sections.push(section);
        }
        let index = self.db.nodes.len();
        self.db.nodes.push(Some(TrackNode {
            index,
            kind: TrackNodeKind::Vector(TrVectorNode {
                sections,
                item_refs: Vec::new(),
            }),
            pins: vec![TrPin::default(); 2],
            inpins: 1,
            outpins: 1,
            location: start,
        }));
        index
    }

    /// Adds a junction with one trunk pin and `routes` branch pins.
    pub fn add_junction(&mut self, location: WorldLocation, routes: usize) -> usize {
        let index = self.db.nodes.len();
        self.db.nodes.push(Some(TrackNode {
            index,
            kind: TrackNodeKind::Junction(TrJunctionNode::default()),
            pins: vec![TrPin::default(); 1 + routes],
            inpins: 1,
            outpins: routes,
            location,
        }));
        index
    }

    pub fn add_end_node(&mut self, location: WorldLocation) -> usize {
        let index = self.db.nodes.len();
        self.db.nodes.push(Some(TrackNode {
            index,
            kind: TrackNodeKind::End,
            pins: vec![TrPin::default()],
            inpins: 1,
            outpins: 0,
            location,
        }));
        index
    }

    /// World location and heading at one end of a vector node. The heading
    /// always points along the node's forward direction.
    pub fn end_of(&self, node: usize, end: VectorEnd) -> Option<(WorldLocation, f32)> {
        let v = self.db.vector_node(node)?;
        let section = match end {
            VectorEnd::Start => v.sections.first()?,
            VectorEnd::End => v.sections.last()?,
        };
        match end {
            VectorEnd::Start => Some((section.start_location(), section.ay)),
            VectorEnd::End => {
                let shape = self.db.section(section.section_index)?;
                let (mut loc, yaw) = section.point_at(shape, shape.length_m());
                loc.normalize();
                Some((loc, yaw))
            }
        }
    }

    fn entry_direction(&self, node: usize, pin: usize) -> TravellerDirection {
        match self.db.node(node).map(|n| &n.kind) {
            Some(TrackNodeKind::Vector(_)) | Some(TrackNodeKind::Junction(_)) if pin > 0 => {
                TravellerDirection::Backward
            }
            _ => TravellerDirection::Forward,
        }
    }

    /// Links pin `a_pin` of node `a` to pin `b_pin` of node `b` in both
    /// directions. For vector nodes pin 0 is the start and pin 1 the end;
    /// for junctions pin 0 is the trunk.
    pub fn link(&mut self, a: usize, a_pin: usize, b: usize, b_pin: usize) -> Result<()> {
        let a_dir = self.entry_direction(b, b_pin);
        let b_dir = self.entry_direction(a, a_pin);
        for (node, pin, link, direction) in [(a, a_pin, b, a_dir), (b, b_pin, a, b_dir)] {
            let track_node = self
                .db
                .nodes
                .get_mut(node)
                .and_then(|n| n.as_mut())
                .with_context(|| format!("Track node {} not found", node))?;
            let slot = track_node
                .pins
                .get_mut(pin)
                .with_context(|| format!("Track node {} has no pin {}", node, pin))?;
            *slot = TrPin { link, direction };
        }
        Ok(())
    }

    pub fn link_vector(&mut self, a: usize, a_end: VectorEnd, b: usize, b_pin: usize) -> Result<()> {
        let a_pin = match a_end {
            VectorEnd::Start => 0,
            VectorEnd::End => 1,
        };
        self.link(a, a_pin, b, b_pin)
    }

    fn push_item(items: &mut Vec<Option<TrackItem>>, name: &str, node: usize, location: WorldLocation, kind: TrackItemKind) -> TrItemId {
        let id = TrItemId(items.len());
        items.push(Some(TrackItem {
            id,
            name: name.to_string(),
            node,
            location,
            kind,
        }));
        id
    }

    /// Adds an item on a vector node, `offset_m` metres from its start.
    pub fn add_item(&mut self, node: usize, offset_m: f32, name: &str, kind: TrackItemKind) -> Result<TrItemId> {
        let location = self.location_along(node, offset_m)?;
        let id = Self::push_item(&mut self.db.items, name, node, location, kind);
        if let Some(Some(TrackNode {
            kind: TrackNodeKind::Vector(v),
            ..
        })) = self.db.nodes.get_mut(node)
        {
            v.item_refs.push(id);
        }
        Ok(id)
    }

    /// Adds a road network item at an arbitrary location.
    pub fn add_road_item(&mut self, location: WorldLocation, name: &str, kind: TrackItemKind) -> TrItemId {
        Self::push_item(&mut self.db.road_items, name, 0, location, kind)
    }

    /// Points an item's `linked` field at another item (platforms, sidings).
    pub fn pair_items(&mut self, a: TrItemId, b: TrItemId) -> Result<()> {
        for (id, other) in [(a, b), (b, a)] {
            let item = self
                .db
                .items
                .get_mut(id.0)
                .and_then(|i| i.as_mut())
                .with_context(|| format!("Track item {} not found", id.0))?;
            match &mut item.kind {
                TrackItemKind::Platform { linked, .. } | TrackItemKind::Siding { linked } => *linked = other,
                _ => bail!("Track item {} cannot be paired", id.0),
            }
        }
        Ok(())
    }

    /// World location `offset_m` metres from the start of a vector node.
    pub fn location_along(&self, node: usize, offset_m: f32) -> Result<WorldLocation> {
        let v = self
            .db
            .vector_node(node)
            .with_context(|| format!("Track node {} is not a vector node", node))?;
        let mut remaining = offset_m;
        for (i, section) in v.sections.iter().enumerate() {
            let shape = self
                .db
                .section(section.section_index)
                .with_context(|| format!("Track section {} missing", section.section_index))?;
            let length = shape.length_m();
            if remaining <= length || i + 1 == v.sections.len() {
                let (mut loc, _) = section.point_at(shape, remaining.min(length));
                loc.normalize();
                return Ok(loc);
            }
            remaining -= length;
        }
        bail!("Track node {} has no sections", node)
    }

    /// Mutable access to a vector section, for tests and loaders that patch
    /// geometry after construction.
    pub fn vector_section_mut(&mut self, node: usize, section: usize) -> Option<&mut TrVectorSection> {
        match self.db.nodes.get_mut(node)?.as_mut()?.kind {
            TrackNodeKind::Vector(ref mut v) => v.sections.get_mut(section),
            _ => None,
        }
    }

    pub fn db(&self) -> &TrackDb {
        &self.db
    }

    pub fn db_mut(&mut self) -> &mut TrackDb {
        &mut self.db
    }

    pub fn build(self) -> TrackDb {
        self.db
    }
}
