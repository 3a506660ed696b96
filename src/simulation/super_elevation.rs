//! Super-elevation pass
//!
//! Runs once over the track database before the simulation starts. Each
//! vector node is split into runs of consecutive curves bending the same way;
//! every run gets a cant derived from its line speed, written back into the
//! vector sections where travellers read it.

use log::debug;
use std::collections::HashMap;

use super::track_db::{TrackDb, TrackNodeKind, TrackShape};

/// Curves at either end of a node shorter than this are left flat.
const MIN_END_CURVE_LENGTH_M: f32 = 15.0;

/// Sections whose gauge differs from the route gauge by more than this are
/// not canted.
const GAUGE_TOLERANCE_M: f32 = 0.2;

const GRAVITY_MPS2: f32 = 9.81;

/// Speed band and cant limits of one super-elevation standard.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SuperElevationStandard {
    pub min_speed_mps: f32,
    pub max_speed_mps: f32,
    pub min_cant_m: f32,
    pub max_pax_underbalance_m: f32,
    pub max_freight_underbalance_m: f32,
    pub precision_m: f32,
    pub runoff_slope: f32,
    pub runoff_speed_mps: f32,
}

impl Default for SuperElevationStandard {
    fn default() -> Self {
        Self {
            min_speed_mps: 0.0,
            max_speed_mps: 100.0,
            min_cant_m: 0.0125,
            max_pax_underbalance_m: 0.075,
            max_freight_underbalance_m: 0.05,
            precision_m: 0.005,
            runoff_slope: 0.003,
            runoff_speed_mps: 0.0375,
        }
    }
}

impl SuperElevationStandard {
    fn covers(&self, speed_mps: f32) -> bool {
        speed_mps < self.max_speed_mps + 0.05 && speed_mps > self.min_speed_mps - 0.05
    }

    fn effective_runoff_slope(&self, speed_mps: f32) -> f32 {
        if speed_mps > 0.0 {
            self.runoff_slope.min(self.runoff_speed_mps / speed_mps)
        } else {
            self.runoff_slope
        }
    }
}

/// A run of same-hand curves within one vector node.
#[derive(Debug, Clone, PartialEq)]
pub struct CurveRun {
    pub node: usize,
    pub sections: Vec<usize>,
    /// +1 for right-hand, -1 for left-hand.
    pub hand: i32,
    pub length_m: f32,
    pub max_elev_m: f32,
}

#[derive(Debug, Default)]
pub struct SuperElevation {
    pub curves: Vec<CurveRun>,
    /// Canted sections keyed by world file tile `|X| + |Z|`.
    sections_by_tile: HashMap<i32, Vec<(usize, usize)>>,
}

#[derive(Default)]
struct RunBuilder {
    sections: Vec<usize>,
    lengths: Vec<f32>,
    hand: i32,
}

impl SuperElevation {
    /// Classifies every curve run and writes cant into the database.
    pub fn compute(db: &mut TrackDb, gauge_m: f32, standards: &[SuperElevationStandard]) -> Self {
        let mut result = SuperElevation::default();
        let section_table = db.sections.clone();

        for node in db.nodes.iter_mut().flatten() {
            let node_index = node.index;
            let TrackNodeKind::Vector(vector) = &mut node.kind else {
                continue;
            };
            let count = vector.sections.len();
            let mut run: Option<RunBuilder> = None;
            let mut finished: Vec<RunBuilder> = Vec::new();

            for (i, tvs) in vector.sections.iter().enumerate() {
                let Some(shape) = section_table.get(&tvs.section_index) else {
                    continue;
                };
                if (shape.gauge_m - gauge_m).abs() > GAUGE_TOLERANCE_M {
                    continue;
                }
                match shape.shape {
                    TrackShape::Curved { angle_deg, .. } if angle_deg.abs() > 0.01 => {
                        let length = shape.length_m();
                        if (i == 0 || i + 1 == count) && length < MIN_END_CURVE_LENGTH_M {
                            continue;
                        }
                        let hand = if angle_deg > 0.0 { 1 } else { -1 };
                        let current = run.get_or_insert_with(|| RunBuilder {
                            hand,
                            ..Default::default()
                        });
                        if current.hand != hand {
                            finished.push(std::mem::replace(
                                current,
                                RunBuilder {
                                    hand,
                                    ..Default::default()
                                },
                            ));
                        }
                        current.sections.push(i);
                        current.lengths.push(length);
                    }
                    _ => {
                        if let Some(done) = run.take() {
                            finished.push(done);
                        }
                    }
                }
            }
            if let Some(done) = run.take() {
                finished.push(done);
            }

            for builder in finished {
                if builder.sections.is_empty() {
                    continue;
                }
                let length_m: f32 = builder.lengths.iter().sum();
                let max_speed = builder
                    .sections
                    .iter()
                    .map(|&s| {
                        let tvs = &vector.sections[s];
                        tvs.pass_speed_mps.max(tvs.freight_speed_mps)
                    })
                    .fold(0.0_f32, f32::max);
                let Some(standard) = standards.iter().find(|s| s.covers(max_speed)) else {
                    continue;
                };
                let slope = standard.effective_runoff_slope(max_speed);
                if slope <= 0.0 || (standard.min_cant_m / slope) * 2.0 > length_m * 0.75 {
                    continue;
                }

                let mut max_elev = 0.0_f32;
                for &s in &builder.sections {
                    let tvs = &vector.sections[s];
                    let radius = section_table
                        .get(&tvs.section_index)
                        .map_or(0.0, |t| t.radius_m());
                    if radius <= 0.0 {
                        continue;
                    }
                    let factor = gauge_m / (GRAVITY_MPS2 * radius);
                    let pax = factor * tvs.pass_speed_mps * tvs.pass_speed_mps
                        - standard.max_pax_underbalance_m;
                    let freight = factor * tvs.freight_speed_mps * tvs.freight_speed_mps
                        - standard.max_freight_underbalance_m;
                    let mut cant = pax.max(freight);
                    cant = (cant / standard.precision_m).round() * standard.precision_m;
                    cant = cant.clamp(standard.min_cant_m, gauge_m);
                    max_elev = max_elev.max(cant);
                }

                let last = builder.sections.len() - 1;
                for (k, &s) in builder.sections.iter().enumerate() {
                    let tvs = &mut vector.sections[s];
                    tvs.max_elev = max_elev;
                    tvs.start_elev = if k == 0 { 0.0 } else { max_elev };
                    tvs.end_elev = if k == last { 0.0 } else { max_elev };
                    let key = tvs.wf_name_x.abs() + tvs.wf_name_z.abs();
                    result
                        .sections_by_tile
                        .entry(key)
                        .or_default()
                        .push((node_index, s));
                }
                debug!(
                    "Curve run on node {} over {} sections: {:.1} m, cant {:.3} m",
                    node_index,
                    builder.sections.len(),
                    length_m,
                    max_elev
                );
                result.curves.push(CurveRun {
                    node: node_index,
                    sections: builder.sections,
                    hand: builder.hand,
                    length_m,
                    max_elev_m: max_elev,
                });
            }
        }
        result
    }

    /// Canted `(node, section)` pairs placed by the world file at the given tile.
    pub fn sections_for_tile(&self, tile_x: i32, tile_z: i32) -> &[(usize, usize)] {
        self.sections_by_tile
            .get(&(tile_x.abs() + tile_z.abs()))
            .map_or(&[], |v| v.as_slice())
    }
}
