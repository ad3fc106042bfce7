//! Body-part templates, edges and deferred wiring.

use super::graph::PartId;
use crate::config::NetworkConfig;
use crate::neural::{mutate_scalar, ExternalInput, Network, Signal};
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::f32::consts::{FRAC_PI_2, PI};

pub const SCALE_MIN: f32 = 0.2;
pub const SCALE_MAX: f32 = 5.0;
pub const RECURSIVE_LIMIT_MAX: u8 = 3;
pub const FRICTION_MIN: f32 = 0.1;
pub const FRICTION_MAX: f32 = 2.0;

/// Joint connecting a part to its parent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JointKind {
    Hinge,
    Universal,
    Ball,
}

impl JointKind {
    pub const ALL: [JointKind; 3] = [JointKind::Hinge, JointKind::Universal, JointKind::Ball];

    /// Motor slots (and matching joint-angle sensors) this joint drives
    pub fn motor_slots(&self) -> &'static [u8] {
        match self {
            JointKind::Hinge => &[2],
            JointKind::Universal => &[0, 1],
            JointKind::Ball => &[0, 1, 2],
        }
    }

    /// Axes carrying angular stops
    pub fn stop_axes(&self) -> &'static [u8] {
        match self {
            JointKind::Hinge => &[2],
            JointKind::Universal => &[0, 2],
            JointKind::Ball => &[0, 1, 2],
        }
    }

    pub fn enables(&self, slot: u8) -> bool {
        self.motor_slots().contains(&slot)
    }
}

/// Directed edge from a part to one of its children
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Edge {
    pub child: PartId,
    /// Parent cap the child attaches to (-1 or +1)
    pub joint_end: i8,
    /// Only traversed on the final instance of the parent
    pub terminal_only: bool,
}

impl Edge {
    pub fn new(child: PartId, joint_end: i8, terminal_only: bool) -> Self {
        Self {
            child,
            joint_end: if joint_end < 0 { -1 } else { 1 },
            terminal_only,
        }
    }

    pub fn random<R: Rng + ?Sized>(child: PartId, rng: &mut R) -> Self {
        let end = if rng.gen_bool(0.5) { 1 } else { -1 };
        Self::new(child, end, rng.gen_bool(0.5))
    }
}

/// A remembered wiring choice: signal `signal` of genotype part `part`
/// feeds the socket, scaled by `weight`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct InputSource {
    pub part: PartId,
    pub signal: Signal,
    pub weight: f32,
}

/// Socket (input node or motor slot) to candidate sources, oldest first
pub type InputMap = BTreeMap<Signal, Vec<InputSource>>;

/// A capped-cylinder body segment.
///
/// The same struct serves as genotype template and phenotype instance.
/// Genotype parts own `edges` into the genotype arena and the back-annotated
/// `input_map`; phenotype parts point back at their template through
/// `genotype` and carry the resolved `motor_input` slots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BodyPart {
    /// Length relative to the parent, in [0.2, 5.0]
    pub scale: f32,
    /// Rotation relative to the parent as (angle, unit axis)
    pub rotation_angle: f32,
    pub rotation_axis: [f32; 3],
    pub joint: JointKind,
    pub axis1: [f32; 3],
    /// Always orthogonal to `axis1`
    pub axis2: [f32; 3],
    pub lostops: [f32; 3],
    pub histops: [f32; 3],
    pub friction: f32,
    /// Times this part may recurse into itself when unrolled, in [0, 3]
    pub recursive_limit: u8,
    pub edges: Vec<Edge>,
    /// `None` on phenotypes unrolled for a structural test only
    pub network: Option<Network>,
    pub input_map: InputMap,
    /// Template this phenotype part was unrolled from
    pub genotype: Option<PartId>,
    pub motor_input: [Option<ExternalInput>; 3],
}

impl BodyPart {
    /// Draw a random part with a fresh control network
    pub fn random<R: Rng + ?Sized>(net: &NetworkConfig, rng: &mut R) -> Self {
        let axis1 = random_unit(rng);
        let mut lostops = [0.0; 3];
        let mut histops = [0.0; 3];
        for a in 0..3 {
            lostops[a] = rng.gen_range(-PI..=0.0);
            histops[a] = rng.gen_range(0.0..=PI);
        }
        let mut part = Self {
            scale: rng.gen_range(SCALE_MIN..=SCALE_MAX),
            rotation_angle: rng.gen_range(0.0..2.0 * PI),
            rotation_axis: random_unit(rng),
            joint: JointKind::ALL[rng.gen_range(0..JointKind::ALL.len())],
            axis1,
            axis2: orthogonal(axis1),
            lostops,
            histops,
            friction: rng.gen_range(FRICTION_MIN..=FRICTION_MAX),
            recursive_limit: rng.gen_range(0..=RECURSIVE_LIMIT_MAX),
            edges: Vec::new(),
            network: Some(Network::random(net, rng)),
            input_map: InputMap::new(),
            genotype: None,
            motor_input: [None; 3],
        };
        part.normalise_stops();
        part
    }

    /// Children reached by outgoing edges, in insertion order
    pub fn children(&self) -> impl Iterator<Item = PartId> + '_ {
        self.edges.iter().map(|e| e.child)
    }

    /// Mutate numeric genes and the control network.
    ///
    /// Returns (scalar edits, network edits).
    pub fn mutate_scalars<R: Rng + ?Sized>(
        &mut self,
        p: f32,
        gauss: bool,
        rng: &mut R,
    ) -> (usize, usize) {
        let mut count = 0;
        let hit = |rng: &mut R| rng.gen::<f32>() < p;

        if hit(rng) {
            self.scale = mutate_scalar(self.scale, SCALE_MIN, SCALE_MAX, gauss, rng);
            count += 1;
        }
        if hit(rng) {
            self.recursive_limit = if gauss {
                let step: i8 = if rng.gen_bool(0.5) { 1 } else { -1 };
                (self.recursive_limit as i8 + step).clamp(0, RECURSIVE_LIMIT_MAX as i8) as u8
            } else {
                rng.gen_range(0..=RECURSIVE_LIMIT_MAX)
            };
            count += 1;
        }
        if hit(rng) {
            self.joint = JointKind::ALL[rng.gen_range(0..JointKind::ALL.len())];
            count += 1;
        }
        if hit(rng) {
            self.axis1 = mutate_unit(self.axis1, gauss, rng);
            count += 1;
        }
        if hit(rng) {
            self.rotation_angle =
                mutate_scalar(self.rotation_angle, 0.0, 2.0 * PI - f32::EPSILON, gauss, rng);
            count += 1;
        }
        if hit(rng) {
            self.rotation_axis = mutate_unit(self.rotation_axis, gauss, rng);
            count += 1;
        }
        for a in 0..3 {
            if hit(rng) {
                self.lostops[a] = mutate_scalar(self.lostops[a], -PI, PI, gauss, rng);
                count += 1;
            }
            if hit(rng) {
                self.histops[a] = mutate_scalar(self.histops[a], -PI, PI, gauss, rng);
                count += 1;
            }
        }
        if hit(rng) {
            self.friction = mutate_scalar(self.friction, FRICTION_MIN, FRICTION_MAX, gauss, rng);
            count += 1;
        }
        self.axis2 = orthogonal(self.axis1);
        self.normalise_stops();

        let network_edits = self
            .network
            .as_mut()
            .map(|net| net.mutate(p, gauss, rng))
            .unwrap_or(0);
        (count, network_edits)
    }

    /// Swap inverted stop pairs and keep axis-1 stops inside ±π/2
    pub fn normalise_stops(&mut self) {
        for a in 0..3 {
            if self.lostops[a] > self.histops[a] {
                std::mem::swap(&mut self.lostops[a], &mut self.histops[a]);
            }
        }
        self.lostops[1] = self.lostops[1].clamp(-FRAC_PI_2, FRAC_PI_2);
        self.histops[1] = self.histops[1].clamp(-FRAC_PI_2, FRAC_PI_2);
    }

    /// Total entries across every socket of the input map
    pub fn input_map_len(&self) -> usize {
        self.input_map.values().map(Vec::len).sum()
    }
}

/// Uniformly distributed unit vector
pub fn random_unit<R: Rng + ?Sized>(rng: &mut R) -> [f32; 3] {
    loop {
        let v = [
            rng.gen_range(-1.0..=1.0f32),
            rng.gen_range(-1.0..=1.0f32),
            rng.gen_range(-1.0..=1.0f32),
        ];
        let n = norm(v);
        if n > 1e-3 && n <= 1.0 {
            return [v[0] / n, v[1] / n, v[2] / n];
        }
    }
}

fn mutate_unit<R: Rng + ?Sized>(v: [f32; 3], gauss: bool, rng: &mut R) -> [f32; 3] {
    if !gauss {
        return random_unit(rng);
    }
    let nudged = [
        mutate_scalar(v[0], -1.0, 1.0, true, rng),
        mutate_scalar(v[1], -1.0, 1.0, true, rng),
        mutate_scalar(v[2], -1.0, 1.0, true, rng),
    ];
    let n = norm(nudged);
    if n < 1e-3 {
        random_unit(rng)
    } else {
        [nudged[0] / n, nudged[1] / n, nudged[2] / n]
    }
}

fn norm(v: [f32; 3]) -> f32 {
    (v[0] * v[0] + v[1] * v[1] + v[2] * v[2]).sqrt()
}

/// `(0, 0, 1) x axis1`, falling back to `(1, 0, 0) x axis1` when parallel
pub fn orthogonal(axis1: [f32; 3]) -> [f32; 3] {
    let cross = |a: [f32; 3], b: [f32; 3]| {
        [
            a[1] * b[2] - a[2] * b[1],
            a[2] * b[0] - a[0] * b[2],
            a[0] * b[1] - a[1] * b[0],
        ]
    };
    let mut v = cross([0.0, 0.0, 1.0], axis1);
    if norm(v) < 1e-4 {
        v = cross([1.0, 0.0, 0.0], axis1);
    }
    let n = norm(v).max(1e-6);
    [v[0] / n, v[1] / n, v[2] / n]
}
