use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Uniform};
use serde::{Deserialize, Serialize};

/// PPO2 used for the maximum operating depth of the diluent.
pub const MOD_PPO2_LIMIT: f64 = 1.4;

pub const CELL_COUNT: usize = 3;

/// Absolute pressure in ATA at a seawater depth (10 m per atmosphere).
pub fn ambient_pressure_ata(depth_m: f64) -> f64 {
    1.0 + depth_m / 10.0
}

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Diluent {
    pub fo2: f64,
    pub fhe: f64,
}

impl Diluent {
    pub const AIR: Diluent = Diluent { fo2: 0.21, fhe: 0.0 };

    pub fn ppo2_at(&self, ambient_ata: f64) -> f64 {
        self.fo2 * ambient_ata
    }

    /// END in metres, treating everything that is not helium as narcotic.
    pub fn equivalent_narcotic_depth(&self, depth_m: f64) -> f64 {
        (depth_m + 10.0) * (1.0 - self.fhe) - 10.0
    }

    /// MOD in metres at a PPO2 of 1.4. Infinite for an oxygen-free diluent.
    pub fn max_operating_depth(&self) -> f64 {
        MOD_PPO2_LIMIT / self.fo2 * 10.0 - 10.0
    }
}

impl Default for Diluent {
    fn default() -> Self {
        Self::AIR
    }
}

#[derive(Clone, Copy, Debug)]
pub struct LoopParams {
    pub loop_volume_l: f64,
    /// Manual O2 add-valve flow.
    pub mav_o2_l_per_min: f64,
    /// Fraction of the gap to diluent PPO2 closed per flush tick.
    pub flush_mixing: f64,
}

impl Default for LoopParams {
    fn default() -> Self {
        Self {
            loop_volume_l: 6.0,
            mav_o2_l_per_min: 30.0,
            flush_mixing: 0.05,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LoopState {
    pub depth_m: f64,
    /// ATA of oxygen in the loop
    pub ppo2: f64,
    pub metabolism_l_per_min: f64,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            depth_m: 10.0,
            ppo2: 1.0,
            metabolism_l_per_min: 1.0,
        }
    }
}

impl LoopState {
    pub fn ambient_ata(&self) -> f64 {
        ambient_pressure_ata(self.depth_m)
    }

    /// Linear approximation: PPO2 drop = O2 volume removed / loop volume.
    pub fn consume(&mut self, p: &LoopParams, dt_s: f64) {
        self.ppo2 -= (self.metabolism_l_per_min / 60.0 * dt_s) / p.loop_volume_l;
    }

    /// Adds oxygen flowing at `flow_l_per_min` for `dt_s` seconds.
    pub fn inject(&mut self, p: &LoopParams, flow_l_per_min: f64, dt_s: f64) {
        self.ppo2 += (flow_l_per_min / 60.0 * dt_s) / p.loop_volume_l;
    }

    /// Moves PPO2 a fixed fraction of the way toward the diluent's PPO2 at depth.
    pub fn flush_toward(&mut self, p: &LoopParams, diluent: &Diluent) {
        let target = diluent.ppo2_at(self.ambient_ata());
        self.ppo2 += (target - self.ppo2) * p.flush_mixing;
    }

    /// Keep PPO2 between zero and pure oxygen at ambient pressure.
    pub fn clamp_to_ambient(&mut self) {
        if self.ppo2.is_nan() {
            self.ppo2 = 0.0;
        }
        self.ppo2 = self.ppo2.clamp(0.0, self.ambient_ata());
    }
}

/// Source of per-reading cell error.
pub trait CellNoise {
    fn offset(&mut self) -> f64;
}

#[derive(Clone, Debug)]
pub struct UniformNoise {
    rng: StdRng,
    dist: Uniform<f64>,
}

impl UniformNoise {
    pub const DEFAULT_AMPLITUDE: f64 = 0.02;
    /// Widest half-width accepted; larger values are clamped to it.
    pub const MAX_AMPLITUDE: f64 = 1.0;

    pub fn new(seed: u64) -> Self {
        Self::with_amplitude(seed, Self::DEFAULT_AMPLITUDE)
    }

    pub fn with_amplitude(seed: u64, amplitude: f64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed), amplitude)
    }

    pub fn from_entropy() -> Self {
        Self::entropy_with_amplitude(Self::DEFAULT_AMPLITUDE)
    }

    pub fn entropy_with_amplitude(amplitude: f64) -> Self {
        Self::from_rng(StdRng::from_entropy(), amplitude)
    }

    fn from_rng(rng: StdRng, amplitude: f64) -> Self {
        let a = if amplitude.is_finite() {
            amplitude.abs().min(Self::MAX_AMPLITUDE)
        } else {
            0.0
        };
        Self {
            rng,
            dist: Uniform::new_inclusive(-a, a),
        }
    }
}

impl CellNoise for UniformNoise {
    fn offset(&mut self) -> f64 {
        self.dist.sample(&mut self.rng)
    }
}

/// Three galvanic oxygen cells reading the loop. Each reading is an
/// independent sample per tick; there is no bias or drift between ticks.
#[derive(Clone, Debug)]
pub struct OxygenCells<N = UniformNoise> {
    noise: N,
    readings: [f64; CELL_COUNT],
}

impl<N: CellNoise> OxygenCells<N> {
    pub fn new(noise: N, ppo2: f64) -> Self {
        Self {
            noise,
            readings: [ppo2; CELL_COUNT],
        }
    }

    pub fn sample(&mut self, ppo2: f64) -> [f64; CELL_COUNT] {
        for r in self.readings.iter_mut() {
            *r = (ppo2 + self.noise.offset()).max(0.0);
        }
        self.readings
    }

    pub fn readings(&self) -> [f64; CELL_COUNT] {
        self.readings
    }

    pub fn reset(&mut self, ppo2: f64) {
        self.readings = [ppo2; CELL_COUNT];
    }
}
