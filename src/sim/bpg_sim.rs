//! Rigid-body simulation of an unrolled body-part graph.
//!
//! Every phenotype part becomes a capsule body (radius 0.5, density 5)
//! joined to its parent by a hinge, universal or ball joint with one angular
//! motor per enabled slot. The world is z-up with a flat ground whose top
//! face is the plane z = 0.

use super::fitness::Fitness;
use super::trace::TraceWriter;
use super::{SimError, SimOutcome};
use crate::bpg::{check_connected, connect_input_nodes, BodyPart, BodyPartGraph, BpgError, JointKind, PartId};
use crate::config::{FitnessConfig, SimConfig};
use crate::neural::{Signal, DT, WEIGHT_MAX};
use crate::rng;
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use rapier3d::na::{Isometry3, Matrix3, Rotation3, Translation3, Unit, UnitQuaternion, Vector3};
use rapier3d::prelude::*;
use std::collections::VecDeque;
use std::f32::consts::PI;
use std::io::Write;

const RADIUS: f32 = 0.5;
const DENSITY: f32 = 5.0;
/// Gap left between the lowest capsule and the ground after placement
const CLEARANCE: f32 = 0.01;
/// Damping factor of the velocity motors
const MOTOR_DAMPING: f32 = 1000.0;
const GROUND_HALF_EXTENT: f32 = 500.0;
const GROUND_FRICTION: f32 = 1.0;

/// Rapier axis, euler component and stop index driven by a motor slot
fn slot_axis(kind: JointKind, slot: u8) -> Option<(JointAxis, usize, usize)> {
    match (kind, slot) {
        (JointKind::Hinge, 2) => Some((JointAxis::AngX, 0, 2)),
        (JointKind::Universal, 0) => Some((JointAxis::AngX, 0, 0)),
        (JointKind::Universal, 1) => Some((JointAxis::AngZ, 2, 2)),
        (JointKind::Ball, 0) => Some((JointAxis::AngX, 0, 0)),
        (JointKind::Ball, 1) => Some((JointAxis::AngY, 1, 1)),
        (JointKind::Ball, 2) => Some((JointAxis::AngZ, 2, 2)),
        _ => None,
    }
}

fn locked_axes(kind: JointKind) -> JointAxesMask {
    match kind {
        JointKind::Hinge => JointAxesMask::LOCKED_REVOLUTE_AXES,
        JointKind::Universal => JointAxesMask::LOCKED_SPHERICAL_AXES | JointAxesMask::ANG_Y,
        JointKind::Ball => JointAxesMask::LOCKED_SPHERICAL_AXES,
    }
}

fn vec3(v: [f32; 3]) -> Vector3<f32> {
    Vector3::new(v[0], v[1], v[2])
}

/// Rotation of a part relative to its parent
fn part_rotation(part: &BodyPart) -> UnitQuaternion<f32> {
    match Unit::try_new(vec3(part.rotation_axis), 1e-6) {
        Some(axis) => UnitQuaternion::from_axis_angle(&axis, part.rotation_angle),
        None => UnitQuaternion::identity(),
    }
}

/// Joint frame whose x axis is `axis1` and whose z axis is `axis2`
fn joint_basis(part: &BodyPart) -> UnitQuaternion<f32> {
    let x = Unit::try_new(vec3(part.axis1), 1e-6)
        .map(|u| u.into_inner())
        .unwrap_or_else(Vector3::x);
    let mut z = vec3(part.axis2);
    z -= x * z.dot(&x);
    let z = match Unit::try_new(z, 1e-4) {
        Some(u) => u.into_inner(),
        None => vec3(crate::bpg::orthogonal([x.x, x.y, x.z])),
    };
    let y = z.cross(&x);
    let rotation = Rotation3::from_matrix_unchecked(Matrix3::from_columns(&[x, y, z]));
    UnitQuaternion::from_rotation_matrix(&rotation)
}

/// Capsule pose before insertion
struct Layout {
    center: Vector3<f32>,
    rotation: UnitQuaternion<f32>,
    half_length: f32,
}

impl Layout {
    fn lowest_z(&self) -> f32 {
        let tip = self.rotation * Vector3::new(0.0, 0.0, self.half_length);
        self.center.z - tip.z.abs() - RADIUS
    }
}

/// Joint bookkeeping for a non-root part
struct PartJoint {
    handle: ImpulseJointHandle,
    parent: RigidBodyHandle,
    frame1: UnitQuaternion<f32>,
    frame2: UnitQuaternion<f32>,
    /// Axes whose motor was switched off after a rollover
    disabled: [bool; 3],
    last_angle: [f32; 3],
}

struct PhysPart {
    body: RigidBodyHandle,
    collider: ColliderHandle,
    joint: Option<PartJoint>,
}

/// Sensor readings of one part for the current tick
#[derive(Debug, Clone, Copy, Default)]
struct Sensors {
    /// Raw joint angles by motor slot
    angles: [f32; 3],
    /// Joint angles normalised to [0, 1] by the part's stops
    joints: [f32; 3],
    contact: f32,
}

/// One phenotype embedded in its own physics world
pub struct BpgSim {
    config: SimConfig,
    phenotype: BodyPartGraph,
    parts: Vec<PhysPart>,
    pipeline: PhysicsPipeline,
    gravity: Vector3<f32>,
    integration_parameters: IntegrationParameters,
    island_manager: IslandManager,
    broad_phase: BroadPhaseBvh,
    narrow_phase: NarrowPhase,
    bodies: RigidBodySet,
    colliders: ColliderSet,
    impulse_joints: ImpulseJointSet,
    multibody_joints: MultibodyJointSet,
    ccd_solver: CCDSolver,
    noise: Option<Normal<f32>>,
    noise_rng: ChaCha8Rng,
    network_rng: ChaCha8Rng,
    trace: Option<TraceWriter<Box<dyn Write>>>,
    relax_ticks: u64,
}

impl BpgSim {
    /// Unroll, wire and instantiate a genotype.
    ///
    /// New wiring choices are back-annotated onto `genotype`. A graph that is
    /// already unrolled is taken as the phenotype and must be fully wired.
    pub fn new(genotype: &mut BodyPartGraph, config: &SimConfig, seed: u64) -> Result<Self, SimError> {
        let mut phenotype = if genotype.unrolled {
            genotype.clone()
        } else {
            let mut phenotype = match genotype.unroll(false) {
                Ok(p) => p,
                Err(BpgError::UnrollTooLarge { limit }) => {
                    return Err(SimError::TooManyParts {
                        parts: limit,
                        limit: config.max_parts,
                    })
                }
                Err(e) => return Err(e.into()),
            };
            let mut resolver = rng::stream(seed, rng::RESOLVER, 0);
            let added = connect_input_nodes(&mut phenotype, genotype, &mut resolver)?;
            if added > 0 {
                log::trace!("sim: resolver added {} input-map entries", added);
            }
            phenotype
        };
        check_connected(&phenotype)?;
        phenotype.sanity_check()?;

        let n = phenotype.len();
        if n < 2 {
            return Err(SimError::TooFewParts { parts: n });
        }
        if n > config.max_parts {
            return Err(SimError::TooManyParts {
                parts: n,
                limit: config.max_parts,
            });
        }

        let mut network_rng = rng::stream(seed, rng::NETWORK, 0);
        for part in &mut phenotype.parts {
            if let Some(net) = part.network.as_mut() {
                net.reset(&mut network_rng);
            }
        }

        let noise = if config.sensor_noise > 0.0 {
            Normal::new(0.0, config.sensor_noise).ok()
        } else {
            None
        };

        let mut integration_parameters = IntegrationParameters::default();
        integration_parameters.dt = DT;

        let mut sim = Self {
            config: config.clone(),
            phenotype,
            parts: Vec::with_capacity(n),
            pipeline: PhysicsPipeline::new(),
            gravity: Vector3::new(0.0, 0.0, config.gravity),
            integration_parameters,
            island_manager: IslandManager::new(),
            broad_phase: BroadPhaseBvh::new(),
            narrow_phase: NarrowPhase::new(),
            bodies: RigidBodySet::new(),
            colliders: ColliderSet::new(),
            impulse_joints: ImpulseJointSet::new(),
            multibody_joints: MultibodyJointSet::new(),
            ccd_solver: CCDSolver::new(),
            noise,
            noise_rng: rng::stream(seed, rng::NOISE, 0),
            network_rng,
            trace: None,
            relax_ticks: 0,
        };
        sim.build()?;
        Ok(sim)
    }

    /// Lay out every capsule, lift the assembly clear of the ground, then
    /// create bodies, colliders and joints.
    fn build(&mut self) -> Result<(), SimError> {
        let order = self.phenotype.bfs();
        let n = self.phenotype.len();
        if order.len() != n {
            return Err(BpgError::Structural("phenotype is not a tree".to_string()).into());
        }

        let mut layout: Vec<Option<Layout>> = (0..n).map(|_| None).collect();
        for &pid in &order {
            let part = &self.phenotype.parts[pid];
            let placed = match self.phenotype.parent(pid) {
                None => Layout {
                    center: Vector3::zeros(),
                    rotation: part_rotation(part),
                    half_length: self.config.root_length() / 2.0,
                },
                Some(parent) => {
                    let p = layout[parent].as_ref().ok_or_else(|| {
                        BpgError::Structural(format!("part {} placed before its parent", pid))
                    })?;
                    let end = self.joint_end(parent, pid) as f32;
                    let length = (2.0 * p.half_length * part.scale)
                        .clamp(self.config.min_length, self.config.max_length);
                    let rotation = p.rotation * part_rotation(part);
                    let anchor = p.center + p.rotation * Vector3::new(0.0, 0.0, end * p.half_length);
                    Layout {
                        center: anchor + rotation * Vector3::new(0.0, 0.0, length / 2.0),
                        rotation,
                        half_length: length / 2.0,
                    }
                }
            };
            layout[pid] = Some(placed);
        }
        let layout: Vec<Layout> = layout.into_iter().flatten().collect();

        let lowest = layout.iter().map(Layout::lowest_z).fold(f32::INFINITY, f32::min);
        let lift = if lowest < CLEARANCE { CLEARANCE - lowest } else { 0.0 };

        let ground = self.bodies.insert(RigidBodyBuilder::fixed().build());
        let ground_collider = ColliderBuilder::cuboid(GROUND_HALF_EXTENT, GROUND_HALF_EXTENT, 5.0)
            .translation(Vector3::new(0.0, 0.0, -5.0))
            .friction(GROUND_FRICTION)
            .build();
        self.colliders
            .insert_with_parent(ground_collider, ground, &mut self.bodies);

        for (pid, placed) in layout.iter().enumerate() {
            let part = &self.phenotype.parts[pid];
            let position = Isometry3::from_parts(
                Translation3::from(placed.center + Vector3::new(0.0, 0.0, lift)),
                placed.rotation,
            );
            let body = self
                .bodies
                .insert(RigidBodyBuilder::dynamic().position(position).build());
            let collider = ColliderBuilder::capsule_z(placed.half_length, RADIUS)
                .density(DENSITY)
                .friction(part.friction)
                .build();
            let collider = self
                .colliders
                .insert_with_parent(collider, body, &mut self.bodies);
            self.parts.push(PhysPart {
                body,
                collider,
                joint: None,
            });
        }

        for pid in 0..n {
            let Some(parent) = self.phenotype.parent(pid) else {
                continue;
            };
            let part = &self.phenotype.parts[pid];
            let end = self.joint_end(parent, pid) as f32;
            let (p, c) = (&layout[parent], &layout[pid]);
            let basis = joint_basis(part);
            let frame1 = basis;
            let frame2 = c.rotation.inverse() * p.rotation * basis;

            let mut joint = GenericJointBuilder::new(locked_axes(part.joint))
                .local_frame1(Isometry3::from_parts(
                    Translation3::new(0.0, 0.0, end * p.half_length),
                    frame1,
                ))
                .local_frame2(Isometry3::from_parts(
                    Translation3::new(0.0, 0.0, -c.half_length),
                    frame2,
                ))
                .contacts_enabled(false);
            for &slot in part.joint.motor_slots() {
                if let Some((axis, _, stop)) = slot_axis(part.joint, slot) {
                    joint = joint
                        .limits(axis, [part.lostops[stop], part.histops[stop]])
                        .motor_model(axis, MotorModel::ForceBased)
                        .motor_velocity(axis, 0.0, MOTOR_DAMPING)
                        .motor_max_force(axis, 0.0);
                }
            }
            let parent_body = self.parts[parent].body;
            let handle = self
                .impulse_joints
                .insert(parent_body, self.parts[pid].body, joint, true);
            self.parts[pid].joint = Some(PartJoint {
                handle,
                parent: parent_body,
                frame1,
                frame2,
                disabled: [false; 3],
                last_angle: [0.0; 3],
            });
        }
        log::debug!(
            "sim: built {} bodies, {} joints, lifted {:.3}",
            self.parts.len(),
            self.impulse_joints.len(),
            lift
        );
        Ok(())
    }

    fn joint_end(&self, parent: PartId, child: PartId) -> i8 {
        self.phenotype.parts[parent]
            .edges
            .iter()
            .find(|e| e.child == child)
            .map_or(1, |e| e.joint_end)
    }

    pub fn phenotype(&self) -> &BodyPartGraph {
        &self.phenotype
    }

    pub fn body_count(&self) -> usize {
        self.parts.len()
    }

    pub fn joint_count(&self) -> usize {
        self.impulse_joints.len()
    }

    pub fn relax_ticks(&self) -> u64 {
        self.relax_ticks
    }

    /// Stream the scored phase into a signal log
    pub fn attach_trace(&mut self, out: Box<dyn Write>) -> Result<(), SimError> {
        self.trace = Some(TraceWriter::new(out, &self.trace_columns())?);
        Ok(())
    }

    /// Signal-log header: time, then nodes, motors, joints and contact of
    /// every part
    pub fn trace_columns(&self) -> Vec<String> {
        let mut columns = vec!["time".to_string()];
        for (pid, part) in self.phenotype.parts.iter().enumerate() {
            let mut push = |signal: Signal| columns.push(format!("p{}_{}", pid, signal.label()));
            let nodes = part.network.as_ref().map_or(0, |n| n.nodes.len());
            for i in 0..nodes {
                push(Signal::Node(i));
            }
            if self.phenotype.root != Some(pid) {
                for &slot in part.joint.motor_slots() {
                    push(Signal::Motor(slot));
                }
                for &slot in part.joint.motor_slots() {
                    push(Signal::Joint(slot));
                }
            }
            push(Signal::Contact);
        }
        columns
    }

    /// Unweighted body centres
    pub fn positions(&self) -> Vec<[f32; 3]> {
        self.parts
            .iter()
            .filter_map(|p| self.bodies.get(p.body))
            .map(|b| {
                let t = b.translation();
                [t.x, t.y, t.z]
            })
            .collect()
    }

    /// Current joint angle of part `pid` on motor slot `slot`
    pub fn joint_angle(&self, pid: PartId, slot: u8) -> Option<f32> {
        let joint = self.parts.get(pid)?.joint.as_ref()?;
        let (_, euler, _) = slot_axis(self.phenotype.parts[pid].joint, slot)?;
        let angles = self.euler_angles(joint, self.parts[pid].body)?;
        Some(angles[euler])
    }

    fn euler_angles(&self, joint: &PartJoint, child: RigidBodyHandle) -> Option<[f32; 3]> {
        let parent = self.bodies.get(joint.parent)?;
        let child = self.bodies.get(child)?;
        let rot1 = parent.rotation() * joint.frame1;
        let rot2 = child.rotation() * joint.frame2;
        let (roll, pitch, yaw) = (rot1.inverse() * rot2).euler_angles();
        Some([roll, pitch, yaw])
    }

    fn step_physics(&mut self) {
        self.pipeline.step(
            &self.gravity,
            &self.integration_parameters,
            &mut self.island_manager,
            &mut self.broad_phase,
            &mut self.narrow_phase,
            &mut self.bodies,
            &mut self.colliders,
            &mut self.impulse_joints,
            &mut self.multibody_joints,
            &mut self.ccd_solver,
            &(),
            &(),
        );
    }

    /// Sum of body speeds, failing on runaway or non-finite bodies
    fn check_bodies(&self, tick: u64) -> Result<f32, SimError> {
        let mut total = 0.0;
        for part in &self.parts {
            let Some(body) = self.bodies.get(part.body) else {
                continue;
            };
            let speed = body.linvel().norm();
            let t = body.translation();
            if !speed.is_finite() || !(t.x.is_finite() && t.y.is_finite() && t.z.is_finite()) {
                return Err(SimError::NonFinite { tick });
            }
            if speed > self.config.blowup_speed {
                return Err(SimError::BlowUp { tick, speed });
            }
            total += speed;
        }
        Ok(total)
    }

    /// Settle the body with passive motors.
    ///
    /// Converges once the summed body speed, averaged over the relax window,
    /// drops below the configured threshold. Returns the ticks taken.
    pub fn relax(&mut self) -> Result<u64, SimError> {
        let window = ((self.config.relax_window / DT).round() as usize).max(1);
        let max_ticks = (self.config.relax_time / DT).round() as u64;
        let limit = self.config.relax_limit();
        let mut speeds = VecDeque::with_capacity(window + 1);
        for tick in 0..max_ticks {
            self.step_physics();
            speeds.push_back(self.check_bodies(tick)?);
            if speeds.len() > window {
                speeds.pop_front();
            }
            if speeds.len() == window {
                let average = speeds.iter().sum::<f32>() / window as f32;
                if average < limit {
                    self.relax_ticks = tick + 1;
                    log::debug!("sim: relaxed after {} ticks (speed {:.5})", tick + 1, average);
                    return Ok(self.relax_ticks);
                }
            }
        }
        Err(SimError::RelaxFailed {
            seconds: self.config.relax_time,
        })
    }

    fn perturb(&mut self, v: f32) -> f32 {
        match &self.noise {
            Some(normal) => (v + normal.sample(&mut self.noise_rng)).clamp(0.0, 1.0),
            None => v,
        }
    }

    /// Contacts and joint angles of every part; notes motor rollovers
    fn read_sensors(&mut self) -> Vec<Sensors> {
        let mut out = vec![Sensors::default(); self.parts.len()];
        for pid in 0..self.parts.len() {
            let touching = self
                .narrow_phase
                .contact_pairs_with(self.parts[pid].collider)
                .any(|pair| pair.has_any_active_contact);
            out[pid].contact = if touching { 1.0 } else { 0.0 };

            let part = &self.phenotype.parts[pid];
            let Some(joint) = self.parts[pid].joint.as_ref() else {
                continue;
            };
            let Some(euler) = self.euler_angles(joint, self.parts[pid].body) else {
                continue;
            };
            let mut rolled = Vec::new();
            for &slot in part.joint.motor_slots() {
                let Some((_, e, stop)) = slot_axis(part.joint, slot) else {
                    continue;
                };
                let s = slot as usize;
                let angle = euler[e];
                if (angle - joint.last_angle[s]).abs() > PI && !joint.disabled[s] {
                    rolled.push(s);
                }
                let (lo, hi) = (part.lostops[stop], part.histops[stop]);
                out[pid].angles[s] = angle;
                out[pid].joints[s] = if hi - lo > 1e-6 {
                    ((angle - lo) / (hi - lo)).clamp(0.0, 1.0)
                } else {
                    0.5
                };
            }
            if let Some(joint) = self.parts[pid].joint.as_mut() {
                for s in rolled {
                    log::debug!("sim: part {} axis {} rolled over, motor disabled", pid, s);
                    joint.disabled[s] = true;
                }
                joint.last_angle = out[pid].angles;
            }
        }
        for sensors in &mut out {
            sensors.contact = self.perturb(sensors.contact);
            for s in 0..3 {
                sensors.joints[s] = self.perturb(sensors.joints[s]);
            }
        }
        out
    }

    /// Output of every node of every network, as its neighbours see it
    fn read_nodes(&mut self) -> Vec<Vec<f32>> {
        let mut nodes: Vec<Vec<f32>> = self
            .phenotype
            .parts
            .iter()
            .map(|part| match &part.network {
                Some(net) => (0..net.nodes.len()).map(|i| net.signal(i)).collect(),
                None => Vec::new(),
            })
            .collect();
        for v in nodes.iter_mut().flatten() {
            *v = self.perturb(*v);
        }
        nodes
    }

    /// Run the scored phase, accumulating `fitness` every tick
    pub fn run(&mut self, fitness: &FitnessConfig) -> Result<SimOutcome, SimError> {
        let ticks = (self.config.trial_time / DT).round() as u64;
        let mut score = Fitness::new(
            fitness.metric,
            &self.positions(),
            self.config.trial_time,
            fitness.after_time,
        );
        let root = self.phenotype.root;
        let n = self.parts.len();

        for tick in 0..ticks {
            let sensors = self.read_sensors();
            let nodes = self.read_nodes();
            let read = |part: PartId, signal: Signal| -> f32 {
                match signal {
                    Signal::Node(i) => nodes.get(part).and_then(|n| n.get(i)).copied().unwrap_or(0.0),
                    Signal::Joint(a) => sensors
                        .get(part)
                        .and_then(|s| s.joints.get(a as usize))
                        .copied()
                        .unwrap_or(0.0),
                    Signal::Contact => sensors.get(part).map_or(0.0, |s| s.contact),
                    Signal::Motor(_) => 0.0,
                }
            };

            for part in &mut self.phenotype.parts {
                if let Some(net) = part.network.as_mut() {
                    for node in &mut net.nodes {
                        for input in &mut node.external {
                            input.value = read(input.part, input.signal);
                        }
                    }
                }
            }

            let mut motor_values = vec![[0.0f32; 3]; n];
            for pid in 0..n {
                if root == Some(pid) {
                    continue;
                }
                let Some(joint) = self.parts[pid].joint.as_ref() else {
                    continue;
                };
                let part = &mut self.phenotype.parts[pid];
                let kind = part.joint;
                for &slot in kind.motor_slots() {
                    let s = slot as usize;
                    let Some((axis, _, _)) = slot_axis(kind, slot) else {
                        continue;
                    };
                    let Some(input) = part.motor_input[s].as_mut() else {
                        continue;
                    };
                    input.value = read(input.part, input.signal);
                    motor_values[pid][s] = input.value;
                    // the target may lie past a stop; the joint limit holds the angle there
                    let desired = (input.value - 0.5) * 2.0 * input.weight.abs() / WEIGHT_MAX * PI;
                    let velocity = self.config.motor_gain * (desired - sensors[pid].angles[s]);
                    let force = if joint.disabled[s] {
                        0.0
                    } else {
                        self.config.motor_force
                    };
                    if let Some(handle) = self.impulse_joints.get_mut(joint.handle, true) {
                        handle
                            .data
                            .set_motor_velocity(axis, velocity, MOTOR_DAMPING)
                            .set_motor_max_force(axis, force);
                    }
                }
            }

            for part in &mut self.phenotype.parts {
                if let Some(net) = part.network.as_mut() {
                    net.step(&mut self.network_rng);
                }
            }

            self.step_physics();
            self.check_bodies(tick)?;
            score.update(&self.positions(), DT);

            if self.trace.is_some() {
                let row = self.trace_row(tick, &sensors, &motor_values);
                if let Some(trace) = self.trace.as_mut() {
                    trace.row(&row)?;
                }
            }
        }
        if let Some(trace) = self.trace.as_mut() {
            trace.flush()?;
        }

        let outcome = SimOutcome {
            score: score.score(),
            ticks,
            relax_ticks: self.relax_ticks,
        };
        if !outcome.score.is_finite() {
            return Err(SimError::NonFinite { tick: ticks });
        }
        Ok(outcome)
    }

    fn trace_row(&self, tick: u64, sensors: &[Sensors], motors: &[[f32; 3]]) -> Vec<f32> {
        let mut row = vec![tick as f32 * DT];
        for (pid, part) in self.phenotype.parts.iter().enumerate() {
            if let Some(net) = &part.network {
                row.extend((0..net.nodes.len()).map(|i| net.signal(i)));
            }
            if self.phenotype.root != Some(pid) {
                for &slot in part.joint.motor_slots() {
                    row.push(motors[pid][slot as usize]);
                }
                for &slot in part.joint.motor_slots() {
                    row.push(sensors[pid].joints[slot as usize]);
                }
            }
            row.push(sensors[pid].contact);
        }
        row
    }
}
