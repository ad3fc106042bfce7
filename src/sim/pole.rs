//! Pole-balance companion simulation.
//!
//! Classic cart-pole dynamics integrated with explicit Euler at the network
//! tick rate. A controller maps the (normalised) state to a horizontal force
//! in [-MAXF, MAXF]; the score is the number of seconds before the pole
//! falls past π/2 or the cart leaves the track.

use crate::neural::{ExternalInput, Network, Signal, DT, WEIGHT_MAX};
use rand::Rng;
use std::f32::consts::{FRAC_PI_2, PI};

/// Largest force the controller may apply
pub const MAXF: f32 = 10.0;
/// Half-length of the track
pub const TRACK_LIMIT: f32 = 5.0;

const GRAVITY: f32 = 9.8;
const CART_MASS: f32 = 1.0;
const POLE_MASS: f32 = 0.1;
const POLE_HALF_LENGTH: f32 = 0.5;
/// Velocity range used to normalise the state
const SPEED_RANGE: f32 = 5.0;

/// Cart position and velocity, pole angle and angular velocity
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PoleState {
    pub x: f32,
    pub x_dot: f32,
    pub theta: f32,
    pub theta_dot: f32,
}

impl PoleState {
    pub fn new(theta: f32) -> Self {
        Self {
            x: 0.0,
            x_dot: 0.0,
            theta,
            theta_dot: 0.0,
        }
    }

    /// Each state variable mapped to [0, 1]
    pub fn normalised(&self) -> [f32; 4] {
        let n = |v: f32, range: f32| ((v / range + 1.0) / 2.0).clamp(0.0, 1.0);
        [
            n(self.x, TRACK_LIMIT),
            n(self.x_dot, SPEED_RANGE),
            n(self.theta, FRAC_PI_2),
            n(self.theta_dot, PI),
        ]
    }

    pub fn failed(&self) -> bool {
        !self.theta.is_finite() || self.theta.abs() > FRAC_PI_2 || self.x.abs() > TRACK_LIMIT
    }

    /// Advance one tick under `force`
    pub fn step(&mut self, force: f32) {
        let force = force.clamp(-MAXF, MAXF);
        let total_mass = CART_MASS + POLE_MASS;
        let (sin, cos) = self.theta.sin_cos();
        let temp =
            (force + POLE_MASS * POLE_HALF_LENGTH * self.theta_dot * self.theta_dot * sin) / total_mass;
        let theta_acc = (GRAVITY * sin - cos * temp)
            / (POLE_HALF_LENGTH * (4.0 / 3.0 - POLE_MASS * cos * cos / total_mass));
        let x_acc = temp - POLE_MASS * POLE_HALF_LENGTH * theta_acc * cos / total_mass;

        self.x += DT * self.x_dot;
        self.x_dot += DT * x_acc;
        self.theta += DT * self.theta_dot;
        self.theta_dot += DT * theta_acc;
    }
}

/// Anything that can push the cart
pub trait PoleController {
    /// Force for the current state, before clamping to [-MAXF, MAXF]
    fn force(&mut self, state: &PoleState) -> f32;
}

/// Proportional-derivative feedback on the pole angle and its rate.
/// Cart position and velocity are ignored.
#[derive(Debug, Clone, Copy)]
pub struct PdController {
    pub k_theta: f32,
    pub k_omega: f32,
}

impl Default for PdController {
    fn default() -> Self {
        Self {
            k_theta: 30.0,
            k_omega: 6.0,
        }
    }
}

impl PoleController for PdController {
    fn force(&mut self, state: &PoleState) -> f32 {
        self.k_theta * state.theta + self.k_omega * state.theta_dot
    }
}

/// Drives the cart from a control network.
///
/// Every normalised state variable (x, x', theta, theta') is fed to an
/// input node, round-robin over the network's inputs: a single-input network
/// sees the sum of all four on its one input, a network with four or more
/// inputs gets one variable per node. A network without input nodes is fed
/// through its first nodes instead. The first output node is mapped to a
/// force in [-MAXF, MAXF].
pub struct NetworkController<R: Rng> {
    network: Network,
    rng: R,
    /// (node, state variable) pairs receiving the state each tick
    taps: Vec<(usize, usize)>,
    output: usize,
}

impl<R: Rng> NetworkController<R> {
    pub fn new(mut network: Network, mut rng: R) -> Self {
        network.clear_external();
        network.reset(&mut rng);
        let n = network.nodes.len().max(1);
        let targets: Vec<usize> = if network.inputs.is_empty() {
            (0..n).collect()
        } else {
            network.inputs.clone()
        };
        let mut taps = Vec::with_capacity(4);
        for var in 0..4 {
            let node = targets[var % targets.len()];
            if let Some(target) = network.nodes.get_mut(node) {
                target
                    .external
                    .push(ExternalInput::new(0, Signal::Joint(var as u8), WEIGHT_MAX));
                taps.push((node, target.external.len() - 1));
            }
        }
        let output = network.outputs.first().copied().unwrap_or(0);
        Self {
            network,
            rng,
            taps,
            output,
        }
    }
}

impl<R: Rng> PoleController for NetworkController<R> {
    fn force(&mut self, state: &PoleState) -> f32 {
        let inputs = state.normalised();
        for (var, &(node, slot)) in self.taps.iter().enumerate() {
            if let Some(ext) = self.network.nodes[node].external.get_mut(slot) {
                ext.value = inputs[var];
            }
        }
        let out = self.network.signal(self.output);
        self.network.step(&mut self.rng);
        (out - 0.5) * 2.0 * MAXF
    }
}

/// Run one balance trial; returns the number of seconds survived
pub fn balance<C: PoleController>(controller: &mut C, initial_theta: f32, trial_time: f32) -> f32 {
    let ticks_per_second = (1.0 / DT).round();
    let max_ticks = (trial_time * ticks_per_second).round() as u64;
    let mut state = PoleState::new(initial_theta);
    let mut ticks = 0u64;
    while ticks < max_ticks {
        let force = controller.force(&state);
        state.step(force);
        if state.failed() {
            break;
        }
        ticks += 1;
    }
    ticks as f32 / ticks_per_second
}
