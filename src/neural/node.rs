//! Neuron kinds and their update dynamics.
//!
//! Every node follows the same three-phase contract:
//! - `reset` randomises the internal state,
//! - `pre_update` computes the next state from the current inputs,
//! - `post_update` commits it and recomputes `output` in [0, 1].
//!
//! Kind parameters live behind an `Arc` so that a network running a uniform
//! parameter sweep can point every node at one block.

use super::signal::ExternalInput;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::f32::consts::PI;
use std::sync::Arc;

/// Integration step (seconds per tick)
pub const DT: f32 = 1.0 / 50.0;

/// Absolute bound on connection weights
pub const WEIGHT_MAX: f32 = 7.0;

/// Leaky-integrator state domain (Beer, IF, Taga `u`)
const LEAKY_MIN: f32 = -4.0;
const LEAKY_MAX: f32 = 4.0;

/// Bias domain for Beer / IF nodes
const BIAS_MIN: f32 = -4.0;
const BIAS_MAX: f32 = 4.0;

const TAU_MIN: f32 = 0.05;
const TAU_MAX: f32 = 0.5;

const THRESHOLD_MIN: f32 = 0.5;
const THRESHOLD_MAX: f32 = 3.5;

const REFRACTORY_MIN: u32 = 5;
const REFRACTORY_MAX: u32 = 25;

/// SRM spike history
const SRM_MAX_SPIKES: usize = 10;
const SRM_AGE_STEP: u32 = 2;
const SRM_MAX_AGE: u32 = 60;

/// Taga oscillator constants
const TAGA_BETA: f32 = 2.5;
const TAGA_B: f32 = 1.0;
const TAGA_TAU0: f32 = 0.2;
const TAGA_TAU1: f32 = 0.2;

/// Wallén dendritic state domain
const WALLEN_Y_MAX: f32 = 8.0;

/// Largest logical lookup table
pub const LOGICAL_TABLE_MAX: usize = 4096;

/// Wallén neuron kinds: (theta, r, tau_d, mu, tau_a)
pub const WALLEN_KINDS: [(f32, f32, f32, f32, f32); 4] = [
    (-0.2, 1.8, 0.03, 0.3, 0.4),
    (0.5, 1.0, 0.02, 0.3, 0.2),
    (0.1, 0.5, 0.05, 0.0, 0.4),
    (0.4, 0.3, 0.02, 0.1, 0.3),
];

/// Neuron kind selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeKind {
    Sigmoid,
    Sine,
    Beer,
    If,
    Srm,
    Taga,
    Wallen,
    Logical,
}

impl NodeKind {
    /// Spiking kinds expose their state to sensors instead of their output.
    pub fn is_spiking(&self) -> bool {
        matches!(self, NodeKind::If | NodeKind::Srm)
    }
}

/// Logistic function
#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

/// Snap `x` to one of `q` evenly spaced levels over `[lo, hi]`.
///
/// `q == 0` means continuous; the value is only clamped.
#[inline]
pub fn quantise(x: f32, lo: f32, hi: f32, q: u32) -> f32 {
    let x = x.clamp(lo, hi);
    if q < 2 {
        return x;
    }
    let step = (hi - lo) / (q - 1) as f32;
    lo + ((x - lo) / step).round() * step
}

/// Draw a connection weight, quantised when `q > 0`.
pub fn random_weight<R: Rng + ?Sized>(rng: &mut R, q: u32) -> f32 {
    quantise(rng.gen_range(-WEIGHT_MAX..=WEIGHT_MAX), -WEIGHT_MAX, WEIGHT_MAX, q)
}

/// Per-kind parameters (shared between nodes during uniform sweeps)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Params {
    Sigmoid,
    Sine {
        step: f32,
        amplitude: f32,
        offset: f32,
    },
    Beer {
        tau: f32,
        bias: f32,
    },
    If {
        tau: f32,
        bias: f32,
        threshold: f32,
        refractory: u32,
    },
    Srm {
        threshold: f32,
    },
    Taga,
    Wallen {
        kind: u8,
        inhibitory: bool,
    },
    Logical {
        /// Output digits in `0..base`
        table: Vec<u8>,
    },
}

impl Params {
    /// Draw fresh parameters for `kind`
    pub fn random<R: Rng + ?Sized>(kind: NodeKind, q: u32, rng: &mut R) -> Self {
        match kind {
            NodeKind::Sigmoid => Params::Sigmoid,
            NodeKind::Sine => Params::Sine {
                step: rng.gen_range(PI / 50.0..=4.0 * PI / 50.0),
                amplitude: rng.gen_range(0.25..=1.0),
                offset: rng.gen_range(0.0..2.0 * PI),
            },
            NodeKind::Beer => Params::Beer {
                tau: rng.gen_range(TAU_MIN..=TAU_MAX),
                bias: quantise(rng.gen_range(BIAS_MIN..=BIAS_MAX), BIAS_MIN, BIAS_MAX, q),
            },
            NodeKind::If => Params::If {
                tau: rng.gen_range(TAU_MIN..=TAU_MAX),
                bias: quantise(rng.gen_range(BIAS_MIN..=BIAS_MAX), BIAS_MIN, BIAS_MAX, q),
                threshold: rng.gen_range(THRESHOLD_MIN..=THRESHOLD_MAX),
                refractory: rng.gen_range(REFRACTORY_MIN..=REFRACTORY_MAX),
            },
            NodeKind::Srm => Params::Srm {
                threshold: rng.gen_range(THRESHOLD_MIN..=THRESHOLD_MAX),
            },
            NodeKind::Taga => Params::Taga,
            NodeKind::Wallen => Params::Wallen {
                kind: rng.gen_range(0..WALLEN_KINDS.len() as u8),
                inhibitory: rng.gen_bool(0.5),
            },
            NodeKind::Logical => Params::Logical { table: vec![0] },
        }
    }

    pub fn kind(&self) -> NodeKind {
        match self {
            Params::Sigmoid => NodeKind::Sigmoid,
            Params::Sine { .. } => NodeKind::Sine,
            Params::Beer { .. } => NodeKind::Beer,
            Params::If { .. } => NodeKind::If,
            Params::Srm { .. } => NodeKind::Srm,
            Params::Taga => NodeKind::Taga,
            Params::Wallen { .. } => NodeKind::Wallen,
            Params::Logical { .. } => NodeKind::Logical,
        }
    }

    /// Mutate each scalar independently with probability `p`.
    ///
    /// `gauss` perturbs around the current value, otherwise the scalar is
    /// redrawn. Returns the number of scalars touched.
    pub fn mutate<R: Rng + ?Sized>(&mut self, p: f32, gauss: bool, q: u32, rng: &mut R) -> usize {
        let mut count = 0;
        let scalar = |v: &mut f32, lo: f32, hi: f32, rng: &mut R| -> usize {
            if rng.gen::<f32>() < p {
                *v = mutate_scalar(*v, lo, hi, gauss, rng);
                1
            } else {
                0
            }
        };
        match self {
            Params::Sigmoid | Params::Taga => {}
            Params::Sine {
                step,
                amplitude,
                offset,
            } => {
                count += scalar(step, PI / 50.0, 4.0 * PI / 50.0, rng);
                count += scalar(amplitude, 0.25, 1.0, rng);
                count += scalar(offset, 0.0, 2.0 * PI - f32::EPSILON, rng);
            }
            Params::Beer { tau, bias } => {
                count += scalar(tau, TAU_MIN, TAU_MAX, rng);
                count += scalar(bias, BIAS_MIN, BIAS_MAX, rng);
                *bias = quantise(*bias, BIAS_MIN, BIAS_MAX, q);
            }
            Params::If {
                tau,
                bias,
                threshold,
                refractory,
            } => {
                count += scalar(tau, TAU_MIN, TAU_MAX, rng);
                count += scalar(bias, BIAS_MIN, BIAS_MAX, rng);
                count += scalar(threshold, THRESHOLD_MIN, THRESHOLD_MAX, rng);
                *bias = quantise(*bias, BIAS_MIN, BIAS_MAX, q);
                if rng.gen::<f32>() < p {
                    *refractory = rng.gen_range(REFRACTORY_MIN..=REFRACTORY_MAX);
                    count += 1;
                }
            }
            Params::Srm { threshold } => {
                count += scalar(threshold, THRESHOLD_MIN, THRESHOLD_MAX, rng);
            }
            Params::Wallen { kind, inhibitory } => {
                if rng.gen::<f32>() < p {
                    *kind = rng.gen_range(0..WALLEN_KINDS.len() as u8);
                    count += 1;
                }
                if rng.gen::<f32>() < p {
                    *inhibitory = !*inhibitory;
                    count += 1;
                }
            }
            Params::Logical { table } => {
                let base = logical_base(q) as u8;
                for digit in table.iter_mut() {
                    if rng.gen::<f32>() < p {
                        *digit = rng.gen_range(0..base);
                        count += 1;
                    }
                }
            }
        }
        count
    }
}

/// Mutate one scalar inside `[lo, hi]`.
pub fn mutate_scalar<R: Rng + ?Sized>(v: f32, lo: f32, hi: f32, gauss: bool, rng: &mut R) -> f32 {
    if gauss {
        let n: f32 = rng.sample(rand_distr::StandardNormal);
        (v + n * 0.1 * (hi - lo)).clamp(lo, hi)
    } else {
        rng.gen_range(lo..=hi)
    }
}

/// Base used for logical tables (continuous networks fall back to binary)
#[inline]
pub fn logical_base(q: u32) -> usize {
    q.max(2) as usize
}

/// Internal state, one variant per family of dynamics
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum State {
    Stateless {
        next: f32,
    },
    Phase {
        phase: f32,
        next: f32,
    },
    Leaky {
        x: f32,
        next: f32,
        refractory_left: u32,
        next_refractory: u32,
        fired: bool,
    },
    Spikes {
        ages: Vec<u32>,
        eps: f32,
        eta: f32,
        fired: bool,
    },
    Taga {
        u: f32,
        v: f32,
        next_u: f32,
        next_v: f32,
    },
    Wallen {
        ye: f32,
        yi: f32,
        yt: f32,
        next: [f32; 3],
    },
    Logical {
        next: u8,
    },
}

impl State {
    fn initial(kind: NodeKind) -> Self {
        match kind {
            NodeKind::Sigmoid => State::Stateless { next: 0.5 },
            NodeKind::Sine => State::Phase {
                phase: 0.0,
                next: 0.0,
            },
            NodeKind::Beer | NodeKind::If => State::Leaky {
                x: 0.0,
                next: 0.0,
                refractory_left: 0,
                next_refractory: 0,
                fired: false,
            },
            NodeKind::Srm => State::Spikes {
                ages: Vec::new(),
                eps: 0.0,
                eta: 0.0,
                fired: false,
            },
            NodeKind::Taga => State::Taga {
                u: 0.0,
                v: 0.0,
                next_u: 0.0,
                next_v: 0.0,
            },
            NodeKind::Wallen => State::Wallen {
                ye: 0.0,
                yi: 0.0,
                yt: 0.0,
                next: [0.0; 3],
            },
            NodeKind::Logical => State::Logical { next: 0 },
        }
    }
}

/// What a node exposes to the nodes it feeds
#[derive(Debug, Clone, Copy, Default)]
pub struct Tap {
    pub value: f32,
    /// Forced sign for Wallén sources (+1 excitatory, -1 inhibitory)
    pub polarity: Option<f32>,
}

/// Weighted input, split by sign for the Wallén dendrites
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InputSums {
    pub total: f32,
    pub excitatory: f32,
    pub inhibitory: f32,
}

impl InputSums {
    fn push(&mut self, v: f32) {
        self.total += v;
        if v >= 0.0 {
            self.excitatory += v;
        } else {
            self.inhibitory -= v;
        }
    }
}

/// A single neuron
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub params: Arc<Params>,
    pub state: State,
    pub output: f32,
    /// Internal inputs (indices into the owning network)
    pub inputs: Vec<usize>,
    /// One weight per internal input
    pub weights: Vec<f32>,
    /// Cross-network inputs installed by the resolver
    pub external: Vec<ExternalInput>,
}

impl Node {
    pub fn new(params: Arc<Params>) -> Self {
        let state = State::initial(params.kind());
        Self {
            params,
            state,
            output: 0.0,
            inputs: Vec::new(),
            weights: Vec::new(),
            external: Vec::new(),
        }
    }

    pub fn kind(&self) -> NodeKind {
        self.params.kind()
    }

    /// Value seen by downstream nodes (SRM sources expose `eps`)
    pub fn tap(&self) -> Tap {
        let value = match &self.state {
            State::Spikes { eps, .. } => eps.clamp(0.0, 1.0),
            _ => self.output,
        };
        let polarity = match *self.params {
            Params::Wallen { inhibitory, .. } => Some(if inhibitory { -1.0 } else { 1.0 }),
            _ => None,
        };
        Tap { value, polarity }
    }

    /// Value read by sensors and motors: spiking nodes report their state.
    pub fn sensor_value(&self) -> f32 {
        match &self.state {
            State::Leaky { x, .. } if self.kind() == NodeKind::If => {
                (x - LEAKY_MIN) / (LEAKY_MAX - LEAKY_MIN)
            }
            State::Spikes { eps, .. } => eps.clamp(0.0, 1.0),
            _ => self.output,
        }
    }

    /// Randomise internal state and recompute the output. Sine nodes are
    /// the exception: their phase is reset to the offset parameter.
    pub fn reset<R: Rng + ?Sized>(&mut self, q: u32, rng: &mut R) {
        self.state = match (&*self.params, State::initial(self.kind())) {
            // oscillators always restart at their offset; nothing is drawn
            (Params::Sine { offset, .. }, _) => State::Phase {
                phase: *offset,
                next: *offset,
            },
            (Params::Beer { .. }, _) => {
                let x = quantise(rng.gen_range(LEAKY_MIN..=LEAKY_MAX), LEAKY_MIN, LEAKY_MAX, q);
                State::Leaky {
                    x,
                    next: x,
                    refractory_left: 0,
                    next_refractory: 0,
                    fired: false,
                }
            }
            (Params::If { threshold, .. }, _) => {
                let x = quantise(rng.gen_range(LEAKY_MIN..*threshold), LEAKY_MIN, LEAKY_MAX, q);
                State::Leaky {
                    x,
                    next: x,
                    refractory_left: 0,
                    next_refractory: 0,
                    fired: false,
                }
            }
            (Params::Taga, _) => {
                let u = quantise(rng.gen_range(0.0..=1.0), LEAKY_MIN, LEAKY_MAX, q);
                let v = quantise(rng.gen_range(0.0..=1.0), 0.0, 1.0, q);
                State::Taga {
                    u,
                    v,
                    next_u: u,
                    next_v: v,
                }
            }
            (Params::Wallen { .. }, _) => {
                let ye = quantise(rng.gen_range(0.0..=1.0), 0.0, WALLEN_Y_MAX, q);
                let yi = quantise(rng.gen_range(0.0..=1.0), 0.0, WALLEN_Y_MAX, q);
                let yt = quantise(rng.gen_range(0.0..=1.0), 0.0, 1.0, q);
                State::Wallen {
                    ye,
                    yi,
                    yt,
                    next: [ye, yi, yt],
                }
            }
            (Params::Logical { table }, _) => State::Logical {
                next: table.first().copied().unwrap_or(0),
            },
            (_, initial) => initial,
        };
        self.post_update(q);
    }

    /// Weighted sum over internal and external inputs
    pub fn input_sums(&self, taps: &[Tap], q: u32) -> InputSums {
        let mut sums = InputSums::default();
        for (&src, &w) in self.inputs.iter().zip(&self.weights) {
            let tap = taps.get(src).copied().unwrap_or_default();
            let w = match tap.polarity {
                Some(sign) => sign * w.abs(),
                None => w,
            };
            sums.push(w * quantise(tap.value, 0.0, 1.0, q));
        }
        for ext in &self.external {
            sums.push(ext.weight * quantise(ext.value, 0.0, 1.0, q));
        }
        sums
    }

    /// Lookup address for logical nodes: internal inputs are base-Q digits,
    /// external inputs are hashed into the same space.
    pub fn logical_address(&self, taps: &[Tap], q: u32, table_len: usize) -> usize {
        let base = logical_base(q);
        let mut addr: u64 = 0;
        let mut place: u64 = 1;
        for &src in &self.inputs {
            let v = taps.get(src).map(|t| t.value).unwrap_or(0.0);
            addr = addr.wrapping_add(digit(v, base) as u64 * place);
            place = place.saturating_mul(base as u64);
        }
        for (k, ext) in self.external.iter().enumerate() {
            let h = (k as u64 + 1).wrapping_mul(0x9e37_79b9_7f4a_7c15) >> 17;
            addr = addr.wrapping_add(h.wrapping_mul(digit(ext.value, base) as u64 + 1));
        }
        (addr % table_len.max(1) as u64) as usize
    }

    /// Resize the logical table to `base^k` entries for the current fan-in.
    pub fn fit_logical_table<R: Rng + ?Sized>(&mut self, q: u32, rng: &mut R) {
        if let Params::Logical { table } = &*self.params {
            let want = logical_table_len(self.inputs.len(), q);
            if table.len() != want {
                let base = logical_base(q) as u8;
                let mut grown = table.clone();
                grown.resize_with(want, || rng.gen_range(0..base));
                self.params = Arc::new(Params::Logical { table: grown });
            }
        }
    }

    /// Compute the next state
    pub fn pre_update(&mut self, taps: &[Tap], q: u32) {
        let sums = self.input_sums(taps, q);
        let output = self.output;
        let lookup = match &*self.params {
            Params::Logical { table } => {
                let addr = self.logical_address(taps, q, table.len());
                Some(table.get(addr).copied().unwrap_or(0))
            }
            _ => None,
        };
        match (&*self.params, &mut self.state) {
            (Params::Sigmoid, State::Stateless { next }) => {
                *next = sigmoid(sums.total);
            }
            (Params::Sine { step, .. }, State::Phase { phase, next }) => {
                *next = (*phase + step) % (2.0 * PI);
            }
            (
                Params::Beer { tau, .. },
                State::Leaky {
                    x, next, ..
                },
            ) => {
                *next = leaky(*x, sums.total, *tau, q);
            }
            (
                Params::If {
                    tau,
                    bias,
                    threshold,
                    refractory,
                },
                State::Leaky {
                    x,
                    next,
                    refractory_left,
                    next_refractory,
                    fired,
                },
            ) => {
                if *refractory_left > 0 {
                    *next = 0.0;
                    *next_refractory = *refractory_left - 1;
                    *fired = false;
                } else {
                    let nx = leaky(*x, sums.total + bias, *tau, q);
                    if nx >= *threshold {
                        *next = 0.0;
                        *next_refractory = *refractory;
                        *fired = true;
                    } else {
                        *next = nx;
                        *next_refractory = 0;
                        *fired = false;
                    }
                }
            }
            (
                Params::Srm { threshold },
                State::Spikes {
                    ages,
                    eps,
                    eta,
                    fired,
                },
            ) => {
                for age in ages.iter_mut() {
                    *age += SRM_AGE_STEP;
                }
                ages.retain(|&a| a <= SRM_MAX_AGE);
                let (e, n) = srm_kernels(ages);
                *fired = sums.total + n > *threshold;
                if *fired {
                    ages.insert(0, 0);
                    ages.truncate(SRM_MAX_SPIKES);
                }
                let (e, n) = if *fired { srm_kernels(ages) } else { (e, n) };
                *eps = quantise(e, 0.0, 1.0, q);
                *eta = n;
            }
            (
                Params::Taga,
                State::Taga {
                    u,
                    v,
                    next_u,
                    next_v,
                },
            ) => {
                let du = (-*u - TAGA_BETA * v.max(0.0) + sums.total + TAGA_B) / TAGA_TAU0;
                let dv = (-*v + output) / TAGA_TAU1;
                *next_u = quantise(*u + DT * du, LEAKY_MIN, LEAKY_MAX, q);
                *next_v = quantise(*v + DT * dv, 0.0, 1.0, q);
            }
            (Params::Wallen { kind, .. }, State::Wallen { ye, yi, yt, next }) => {
                let (_, _, tau_d, _, tau_a) = WALLEN_KINDS[*kind as usize % WALLEN_KINDS.len()];
                let nye = *ye + DT * (sums.excitatory - *ye) / tau_d;
                let nyi = *yi + DT * (sums.inhibitory - *yi) / tau_d;
                let nyt = *yt + DT * (output - *yt) / tau_a;
                *next = [
                    quantise(nye, 0.0, WALLEN_Y_MAX, q),
                    quantise(nyi, 0.0, WALLEN_Y_MAX, q),
                    quantise(nyt, 0.0, 1.0, q),
                ];
            }
            (Params::Logical { .. }, State::Logical { next }) => {
                if let Some(value) = lookup {
                    *next = value;
                }
            }
            _ => {}
        }
    }

    /// Commit the next state and recompute `output`
    pub fn post_update(&mut self, q: u32) {
        let out = match (&*self.params, &mut self.state) {
            (Params::Sigmoid, State::Stateless { next }) => *next,
            (Params::Sine { amplitude, .. }, State::Phase { phase, next }) => {
                *phase = *next;
                (phase.sin() * amplitude + 1.0) / 2.0
            }
            (Params::Beer { bias, .. }, State::Leaky { x, next, .. }) => {
                *x = *next;
                sigmoid(*x + bias)
            }
            (
                Params::If { .. },
                State::Leaky {
                    x,
                    next,
                    refractory_left,
                    next_refractory,
                    fired,
                },
            ) => {
                *x = *next;
                *refractory_left = *next_refractory;
                if *fired {
                    1.0
                } else {
                    0.0
                }
            }
            (Params::Srm { .. }, State::Spikes { fired, .. }) => {
                if *fired {
                    1.0
                } else {
                    0.0
                }
            }
            (Params::Taga, State::Taga { u, v, next_u, next_v }) => {
                *u = *next_u;
                *v = *next_v;
                u.max(0.0)
            }
            (Params::Wallen { kind, .. }, State::Wallen { ye, yi, yt, next }) => {
                let (theta, r, _, mu, _) = WALLEN_KINDS[*kind as usize % WALLEN_KINDS.len()];
                *ye = next[0];
                *yi = next[1];
                *yt = next[2];
                (1.0 - (r * (theta - *ye)).exp() - *yi - mu * *yt).max(0.0)
            }
            (Params::Logical { .. }, State::Logical { next }) => {
                let base = logical_base(q);
                *next as f32 / (base - 1) as f32
            }
            _ => self.output,
        };
        self.output = quantise(out, 0.0, 1.0, q);
    }

    /// True if any internal state sits outside its clamped domain
    pub fn state_in_domain(&self) -> bool {
        let inside = |v: f32, lo: f32, hi: f32| v.is_finite() && v >= lo && v <= hi;
        let state_ok = match &self.state {
            State::Stateless { .. } | State::Phase { .. } | State::Logical { .. } => true,
            State::Leaky { x, .. } => inside(*x, LEAKY_MIN, LEAKY_MAX),
            State::Spikes { ages, eps, .. } => ages.len() <= SRM_MAX_SPIKES && inside(*eps, 0.0, 1.0),
            State::Taga { u, v, .. } => inside(*u, LEAKY_MIN, LEAKY_MAX) && inside(*v, 0.0, 1.0),
            State::Wallen { ye, yi, yt, .. } => {
                inside(*ye, 0.0, WALLEN_Y_MAX)
                    && inside(*yi, 0.0, WALLEN_Y_MAX)
                    && inside(*yt, 0.0, 1.0)
            }
        };
        state_ok && inside(self.output, 0.0, 1.0)
    }
}

/// One Euler step of `x' = (input - x) / tau`, clamped and quantised
#[inline]
fn leaky(x: f32, input: f32, tau: f32, q: u32) -> f32 {
    quantise(x + DT * (input - x) / tau, LEAKY_MIN, LEAKY_MAX, q)
}

/// SRM response kernels over spike ages: (eps, eta)
fn srm_kernels(ages: &[u32]) -> (f32, f32) {
    let mut eps = 0.0;
    let mut eta = 0.0;
    for &age in ages {
        let s = age as f32;
        if age >= 2 {
            eps += (-(s - 2.0) / 4.0).exp() * (1.0 - (-(s - 2.0) / 10.0).exp());
        }
        eta -= (-s / 4.0).exp();
    }
    (eps, eta)
}

fn digit(v: f32, base: usize) -> usize {
    (v.clamp(0.0, 1.0) * (base - 1) as f32).round() as usize
}

/// Table length for a logical node with `k` internal inputs
pub fn logical_table_len(k: usize, q: u32) -> usize {
    let base = logical_base(q);
    let mut len = 1usize;
    for _ in 0..k {
        len = len.saturating_mul(base);
        if len >= LOGICAL_TABLE_MAX {
            return LOGICAL_TABLE_MAX;
        }
    }
    len
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn node(kind: NodeKind, q: u32, rng: &mut ChaCha8Rng) -> Node {
        let mut n = Node::new(Arc::new(Params::random(kind, q, rng)));
        n.reset(q, rng);
        n
    }

    #[test]
    fn test_quantise_levels() {
        assert_eq!(quantise(0.3, 0.0, 1.0, 2), 0.0);
        assert_eq!(quantise(0.7, 0.0, 1.0, 2), 1.0);
        assert_eq!(quantise(0.5, 0.0, 1.0, 3), 0.5);
        assert_eq!(quantise(1.7, 0.0, 1.0, 0), 1.0);
    }

    #[test]
    fn test_sigmoid_follows_weighted_sum() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let mut n = node(NodeKind::Sigmoid, 0, &mut rng);
        n.inputs = vec![0];
        n.weights = vec![4.0];
        let taps = [Tap {
            value: 1.0,
            polarity: None,
        }];
        n.pre_update(&taps, 0);
        n.post_update(0);
        assert!((n.output - sigmoid(4.0)).abs() < 1e-6);
    }

    #[test]
    fn test_sine_advances_phase() {
        let params = Params::Sine {
            step: PI / 2.0,
            amplitude: 1.0,
            offset: 0.0,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        let mut n = Node::new(Arc::new(params));
        n.reset(0, &mut rng);
        assert!((n.output - 0.5).abs() < 1e-6);
        n.pre_update(&[], 0);
        n.post_update(0);
        assert!((n.output - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_if_spikes_then_refracts() {
        let params = Params::If {
            tau: 0.05,
            bias: 0.0,
            threshold: 0.5,
            refractory: 5,
        };
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mut n = Node::new(Arc::new(params));
        n.reset(0, &mut rng);
        n.external.push(ExternalInput {
            part: 0,
            signal: crate::neural::Signal::Contact,
            weight: 7.0,
            value: 1.0,
        });
        let mut spikes = Vec::new();
        for _ in 0..40 {
            n.pre_update(&[], 0);
            n.post_update(0);
            spikes.push(n.output);
        }
        let first = spikes.iter().position(|&o| o == 1.0).expect("IF node should fire");
        // refractory ticks follow every spike
        for s in &spikes[first + 1..first + 6] {
            assert_eq!(*s, 0.0);
        }
    }

    #[test]
    fn test_if_bias_drives_firing_without_input() {
        let spikes = |bias: f32| {
            let params = Params::If {
                tau: 0.05,
                bias,
                threshold: 1.0,
                refractory: 5,
            };
            let mut rng = ChaCha8Rng::seed_from_u64(6);
            let mut n = Node::new(Arc::new(params));
            n.reset(0, &mut rng);
            let mut count = 0;
            for _ in 0..40 {
                n.pre_update(&[], 0);
                n.post_update(0);
                if n.output == 1.0 {
                    count += 1;
                }
            }
            count
        };
        assert_eq!(spikes(0.0), 0);
        assert!(spikes(3.0) > 0);
    }

    #[test]
    fn test_sine_reset_starts_at_offset() {
        let params = Arc::new(Params::Sine {
            step: 0.1,
            amplitude: 0.5,
            offset: 1.25,
        });
        let mut a = Node::new(params.clone());
        let mut b = Node::new(params);
        a.reset(0, &mut ChaCha8Rng::seed_from_u64(7));
        b.reset(0, &mut ChaCha8Rng::seed_from_u64(8));
        assert_eq!(a, b);
        match a.state {
            State::Phase { phase, .. } => assert_eq!(phase, 1.25),
            ref other => panic!("unexpected state {:?}", other),
        }
    }

    #[test]
    fn test_srm_history_is_bounded() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let mut n = Node::new(Arc::new(Params::Srm { threshold: 0.5 }));
        n.reset(0, &mut rng);
        n.external.push(ExternalInput::new(0, crate::neural::Signal::Contact, 7.0));
        n.external[0].value = 1.0;
        for _ in 0..200 {
            n.pre_update(&[], 0);
            n.post_update(0);
            assert!(n.state_in_domain());
        }
        if let State::Spikes { ages, .. } = &n.state {
            assert!(ages.len() <= SRM_MAX_SPIKES);
        }
    }

    #[test]
    fn test_all_kinds_stay_in_domain() {
        let kinds = [
            NodeKind::Sigmoid,
            NodeKind::Sine,
            NodeKind::Beer,
            NodeKind::If,
            NodeKind::Srm,
            NodeKind::Taga,
            NodeKind::Wallen,
            NodeKind::Logical,
        ];
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        for kind in kinds {
            for q in [0, 2, 5] {
                let mut n = node(kind, q, &mut rng);
                n.inputs = vec![0, 1];
                n.weights = vec![random_weight(&mut rng, q), random_weight(&mut rng, q)];
                n.fit_logical_table(q, &mut rng);
                for t in 0..300 {
                    let taps = [
                        Tap {
                            value: (t as f32 * 0.37).sin().abs(),
                            polarity: None,
                        },
                        Tap {
                            value: 1.0,
                            polarity: Some(-1.0),
                        },
                    ];
                    n.pre_update(&taps, q);
                    n.post_update(q);
                    assert!(n.state_in_domain(), "{:?} q={} left its domain", kind, q);
                    if q == 2 {
                        assert!(n.output == 0.0 || n.output == 1.0);
                    }
                }
            }
        }
    }

    #[test]
    fn test_logical_table_size() {
        assert_eq!(logical_table_len(0, 0), 1);
        assert_eq!(logical_table_len(3, 2), 8);
        assert_eq!(logical_table_len(2, 3), 9);
        assert_eq!(logical_table_len(64, 2), LOGICAL_TABLE_MAX);
    }

    #[test]
    fn test_params_mutation_respects_rate() {
        let mut rng = ChaCha8Rng::seed_from_u64(6);
        let mut p = Params::random(NodeKind::Beer, 0, &mut rng);
        let before = p.clone();
        assert_eq!(p.mutate(0.0, false, 0, &mut rng), 0);
        assert_eq!(p, before);
        assert!(p.mutate(1.0, true, 0, &mut rng) > 0);
    }
}
