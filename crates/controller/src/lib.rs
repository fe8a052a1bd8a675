//! Oxygen control for a closed-circuit rebreather loop.
//!
//! [`LoopController`] owns the loop gas, the injection settings, the solenoid,
//! the oxygen cells and the derived safety flags. A caller configures it
//! between ticks and calls [`LoopController::advance`] once per time step.

mod config;
mod error;
mod mode;

pub use config::{ConfigCommands, InjectionSettings};
pub use error::{CcrError, CcrResult};
pub use mode::{
    needle_flow_l_per_min, InjectionMode, Solenoid, SolenoidParams, NEEDLE_SUPPLY_BAR,
};

use safety::{SafetyLimits, SafetyStatus};
use serde::{Deserialize, Serialize};
use sim::{CellNoise, LoopParams, LoopState, OxygenCells, UniformNoise, CELL_COUNT};

/// Manual valves held down for the current tick only.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MomentaryInputs {
    /// Manual O2 add valve
    pub o2_add: bool,
    /// Manual diluent flush
    pub diluent_flush: bool,
}

impl MomentaryInputs {
    pub const NONE: MomentaryInputs = MomentaryInputs {
        o2_add: false,
        diluent_flush: false,
    };
}

/// Read-only view of the controller after a tick.
#[derive(Clone, Copy, Debug, PartialEq, Serialize)]
pub struct Snapshot {
    pub ppo2: f64,
    pub cell_readings: [f64; CELL_COUNT],
    pub depth_m: f64,
    pub ambient_ata: f64,
    pub setpoint: f64,
    pub mode: InjectionMode,
    pub solenoid_active: bool,
    pub hypoxic: bool,
    pub hyperoxic: bool,
    pub fatal: bool,
    pub equivalent_narcotic_depth: f64,
    pub max_operating_depth: f64,
}

/// A time step must be finite and strictly positive.
pub fn check_time_step(dt_s: f64) -> CcrResult<()> {
    if dt_s.is_finite() && dt_s > 0.0 {
        Ok(())
    } else {
        Err(CcrError::InvalidTimeStep(dt_s))
    }
}

#[derive(Clone, Debug, Default)]
struct ControllerState {
    plant: LoopState,
    settings: InjectionSettings,
    solenoid: Solenoid,
    inputs: MomentaryInputs,
    status: SafetyStatus,
}

#[derive(Clone, Debug)]
pub struct LoopController<N = UniformNoise> {
    params: LoopParams,
    solenoid_params: SolenoidParams,
    limits: SafetyLimits,
    state: ControllerState,
    cells: OxygenCells<N>,
}

impl LoopController<UniformNoise> {
    /// Controller with entropy-seeded cell noise.
    pub fn new() -> Self {
        Self::with_noise(UniformNoise::from_entropy())
    }

    pub fn seeded(seed: u64) -> Self {
        Self::with_noise(UniformNoise::new(seed))
    }
}

impl Default for LoopController<UniformNoise> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: CellNoise> LoopController<N> {
    pub fn with_noise(noise: N) -> Self {
        let state = ControllerState::default();
        Self {
            params: LoopParams::default(),
            solenoid_params: SolenoidParams::default(),
            limits: SafetyLimits::default(),
            cells: OxygenCells::new(noise, state.plant.ppo2),
            state,
        }
    }

    /// Drop all session state and return to the power-on defaults.
    /// The noise source is kept.
    pub fn reset(&mut self) {
        self.state = ControllerState::default();
        self.cells.reset(self.state.plant.ppo2);
        tracing::debug!("loop controller reset");
    }

    /// Apply a batch of configuration changes. Nothing is written unless the
    /// whole batch is valid.
    pub fn configure(&mut self, cmds: &ConfigCommands) -> CcrResult<()> {
        cmds.validate()?;

        let s = &mut self.state;
        if let Some(v) = cmds.depth_m {
            s.plant.depth_m = v;
        }
        if let Some(v) = cmds.setpoint {
            s.settings.setpoint = v;
        }
        if let Some(m) = cmds.mode {
            if m != s.settings.mode {
                tracing::debug!(from = %s.settings.mode, to = %m, "injection mode changed");
            }
            s.settings.mode = m;
        }
        if let Some(v) = cmds.metabolism_l_per_min {
            s.plant.metabolism_l_per_min = v;
        }
        if let Some(d) = cmds.diluent {
            s.settings.diluent = d;
        }
        if let Some(v) = cmds.cmf_rate {
            s.settings.cmf_rate = v;
        }
        if let Some(v) = cmds.needle_base_rate {
            s.settings.needle_base_rate = v;
        }
        if let Some(v) = cmds.needle_uncompensated {
            s.settings.needle_uncompensated = v;
        }

        if !cmds.is_empty() {
            tracing::debug!(?cmds, "configuration applied");
        }
        Ok(())
    }

    /// Advance the loop by `dt_s` seconds.
    ///
    /// Order per tick: consumption, manual add, manual flush, CMF, needle,
    /// solenoid, clamp, cells, safety.
    pub fn advance(&mut self, dt_s: f64, inputs: MomentaryInputs) -> CcrResult<Snapshot> {
        check_time_step(dt_s)?;

        let p = &self.params;
        let s = &mut self.state;
        let ambient = s.plant.ambient_ata();
        s.inputs = inputs;

        s.plant.consume(p, dt_s);

        if inputs.o2_add {
            s.plant.inject(p, p.mav_o2_l_per_min, dt_s);
        }
        if inputs.diluent_flush {
            s.plant.flush_toward(p, &s.settings.diluent);
        }

        let mode = s.settings.mode;
        if mode.uses_cmf() {
            s.plant.inject(p, s.settings.cmf_rate, dt_s);
        }
        if mode.uses_needle() {
            let flow = needle_flow_l_per_min(
                s.settings.needle_base_rate,
                s.settings.needle_uncompensated,
                ambient,
            );
            s.plant.inject(p, flow, dt_s);
        }

        let flow = s.solenoid.update(
            &self.solenoid_params,
            mode.uses_solenoid(),
            s.plant.ppo2,
            s.settings.setpoint,
            dt_s,
        );
        if flow > 0.0 {
            s.plant.inject(p, flow, dt_s);
        }

        s.plant.clamp_to_ambient();
        let ppo2 = s.plant.ppo2;

        self.cells.sample(ppo2);

        let status = safety::evaluate(&self.limits, ppo2);
        match (s.status.hazard(), status.hazard()) {
            (None, Some(h)) => tracing::warn!(ppo2, hazard = ?h, "diver in danger"),
            (Some(h), None) => tracing::info!(ppo2, cleared = ?h, "PPO2 back in range"),
            _ => {}
        }
        s.status = status;

        Ok(self.snapshot())
    }

    pub fn snapshot(&self) -> Snapshot {
        let s = &self.state;
        Snapshot {
            ppo2: s.plant.ppo2,
            cell_readings: self.cells.readings(),
            depth_m: s.plant.depth_m,
            ambient_ata: s.plant.ambient_ata(),
            setpoint: s.settings.setpoint,
            mode: s.settings.mode,
            solenoid_active: s.solenoid.is_active(),
            hypoxic: s.status.hypoxic,
            hyperoxic: s.status.hyperoxic,
            fatal: s.status.fatal,
            equivalent_narcotic_depth: s.settings.diluent.equivalent_narcotic_depth(s.plant.depth_m),
            max_operating_depth: s.settings.diluent.max_operating_depth(),
        }
    }

    pub fn ppo2(&self) -> f64 {
        self.state.plant.ppo2
    }

    pub fn loop_state(&self) -> &LoopState {
        &self.state.plant
    }

    pub fn settings(&self) -> &InjectionSettings {
        &self.state.settings
    }

    pub fn loop_params(&self) -> &LoopParams {
        &self.params
    }

    pub fn solenoid_timer_s(&self) -> f64 {
        self.state.solenoid.timer_s()
    }

    pub fn solenoid_active(&self) -> bool {
        self.state.solenoid.is_active()
    }

    /// Momentary inputs seen on the last tick.
    pub fn last_inputs(&self) -> MomentaryInputs {
        self.state.inputs
    }

    pub fn status(&self) -> SafetyStatus {
        self.state.status
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sim::Diluent;

    struct Quiet;

    impl CellNoise for Quiet {
        fn offset(&mut self) -> f64 {
            0.0
        }
    }

    fn quiet() -> LoopController<Quiet> {
        LoopController::with_noise(Quiet)
    }

    fn cfg() -> ConfigCommands {
        ConfigCommands::default()
    }

    #[test]
    fn defaults_match_power_on_state() {
        let c = quiet();
        let snap = c.snapshot();
        assert_eq!(snap.depth_m, 10.0);
        assert_eq!(snap.ppo2, 1.0);
        assert_eq!(snap.setpoint, 1.2);
        assert_eq!(snap.mode, InjectionMode::Manual);
        assert_eq!(c.settings().diluent, Diluent::AIR);
        assert_eq!(c.loop_params().loop_volume_l, 6.0);
        assert!(!snap.fatal);
    }

    #[test]
    fn rejects_non_positive_dt_without_touching_state() {
        let mut c = quiet();
        for dt in [0.0, -0.1, f64::NAN] {
            assert!(matches!(
                c.advance(dt, MomentaryInputs::NONE),
                Err(CcrError::InvalidTimeStep(_))
            ));
        }
        assert_eq!(c.ppo2(), 1.0);
    }

    #[test]
    fn entropy_seeded_controller_starts_at_power_on_defaults() {
        let mut c = LoopController::new();
        assert_eq!(c.snapshot(), LoopController::default().snapshot());

        let snap = c.advance(0.05, MomentaryInputs::NONE).unwrap();
        for r in snap.cell_readings {
            assert!((r - snap.ppo2).abs() <= UniformNoise::DEFAULT_AMPLITUDE + 1e-12);
        }
    }

    #[test]
    fn time_step_check_matches_advance() {
        assert!(check_time_step(0.016).is_ok());
        for dt in [0.0, -1.0, f64::INFINITY, f64::NAN] {
            assert!(matches!(check_time_step(dt), Err(CcrError::InvalidTimeStep(_))));
        }
    }

    #[test]
    fn manual_without_metabolism_is_steady() {
        let mut c = quiet();
        c.configure(&ConfigCommands {
            metabolism_l_per_min: Some(0.0),
            ..cfg()
        })
        .unwrap();
        for dt in [0.016, 0.05, 1.0, 30.0] {
            let snap = c.advance(dt, MomentaryInputs::NONE).unwrap();
            assert!((snap.ppo2 - 1.0).abs() < 1e-12);
        }
    }

    #[test]
    fn metabolism_drop_is_volume_ratio() {
        let mut c = quiet();
        c.configure(&ConfigCommands {
            metabolism_l_per_min: Some(6.0),
            ..cfg()
        })
        .unwrap();
        let snap = c.advance(1.0, MomentaryInputs::NONE).unwrap();
        assert!((1.0 - snap.ppo2 - 6.0 / 60.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn manual_add_valve_injects_thirty_litres_per_minute() {
        let mut c = quiet();
        c.configure(&ConfigCommands {
            metabolism_l_per_min: Some(0.0),
            ..cfg()
        })
        .unwrap();
        let inputs = MomentaryInputs {
            o2_add: true,
            ..MomentaryInputs::NONE
        };
        let snap = c.advance(0.5, inputs).unwrap();
        assert!((snap.ppo2 - (1.0 + 0.25 / 6.0)).abs() < 1e-12);
        assert!(c.last_inputs().o2_add);
    }

    #[test]
    fn diluent_flush_converges_on_diluent_ppo2() {
        let mut c = quiet();
        c.configure(&ConfigCommands {
            metabolism_l_per_min: Some(0.0),
            depth_m: Some(30.0),
            ..cfg()
        })
        .unwrap();
        let flush = MomentaryInputs {
            diluent_flush: true,
            ..MomentaryInputs::NONE
        };
        for _ in 0..400 {
            c.advance(0.05, flush).unwrap();
        }
        // air at 4 ATA
        assert!((c.ppo2() - 0.84).abs() < 1e-3);
    }

    #[test]
    fn manual_valves_work_in_every_mode() {
        for mode in InjectionMode::ALL {
            let mut c = quiet();
            c.configure(&ConfigCommands {
                mode: Some(mode),
                metabolism_l_per_min: Some(0.0),
                setpoint: Some(0.5),
                cmf_rate: Some(0.0),
                needle_base_rate: Some(0.0),
                ..cfg()
            })
            .unwrap();
            let inputs = MomentaryInputs {
                o2_add: true,
                ..MomentaryInputs::NONE
            };
            let snap = c.advance(0.1, inputs).unwrap();
            assert!(snap.ppo2 > 1.0, "{mode:?}");
        }
    }

    #[test]
    fn cmf_ignores_depth_and_only_runs_in_cmf_modes() {
        let run = |mode, depth| {
            let mut c = quiet();
            c.configure(&ConfigCommands {
                mode: Some(mode),
                depth_m: Some(depth),
                metabolism_l_per_min: Some(0.0),
                cmf_rate: Some(1.2),
                setpoint: Some(0.2),
                ..cfg()
            })
            .unwrap();
            c.advance(1.0, MomentaryInputs::NONE).unwrap().ppo2 - 1.0
        };
        let shallow = run(InjectionMode::ConstantMassFlow, 5.0);
        let deep = run(InjectionMode::ConstantMassFlow, 60.0);
        assert!((shallow - 1.2 / 60.0 / 6.0).abs() < 1e-12);
        assert!((shallow - deep).abs() < 1e-12);
        assert!((run(InjectionMode::Hybrid, 20.0) - shallow).abs() < 1e-12);
        assert_eq!(run(InjectionMode::Manual, 20.0), 0.0);
        // needle runs on its own base rate, not the CMF rate
        assert!((run(InjectionMode::NeedleValve, 20.0) - 0.8 / 60.0 / 6.0).abs() < 1e-12);
    }

    #[test]
    fn needle_uncompensated_flow_falls_with_depth() {
        let gain = |depth: f64| {
            let mut c = quiet();
            c.configure(&ConfigCommands {
                mode: Some(InjectionMode::NeedleValve),
                depth_m: Some(depth),
                metabolism_l_per_min: Some(0.0),
                needle_base_rate: Some(0.9),
                needle_uncompensated: Some(true),
                ..cfg()
            })
            .unwrap();
            c.advance(1.0, MomentaryInputs::NONE).unwrap().ppo2 - 1.0
        };
        let mut prev = f64::INFINITY;
        for depth in (10..=80).step_by(10) {
            let g = gain(depth as f64);
            assert!(g < prev, "flow did not fall at {depth} m");
            prev = g;
        }
        assert!(gain(90.0).abs() < 1e-12);
    }

    #[test]
    fn solenoid_fires_below_band_and_runs_out() {
        let mut c = quiet();
        c.configure(&ConfigCommands {
            mode: Some(InjectionMode::Solenoid),
            ..cfg()
        })
        .unwrap();

        let snap = c.advance(0.05, MomentaryInputs::NONE).unwrap();
        assert!(snap.solenoid_active);
        assert!((c.solenoid_timer_s() - 0.15).abs() < 1e-12);

        // lift PPO2 out of the band; the running pulse still finishes
        c.configure(&ConfigCommands {
            setpoint: Some(0.5),
            ..cfg()
        })
        .unwrap();
        let mut ticks = 1;
        while c.advance(0.05, MomentaryInputs::NONE).unwrap().solenoid_active {
            assert!(c.solenoid_timer_s() >= 0.0);
            ticks += 1;
            assert!(ticks < 10);
        }
        assert_eq!(c.solenoid_timer_s(), 0.0);
        assert!(!c.solenoid_active());
    }

    #[test]
    fn solenoid_holds_setpoint() {
        let mut c = quiet();
        c.configure(&ConfigCommands {
            mode: Some(InjectionMode::Solenoid),
            setpoint: Some(1.3),
            depth_m: Some(30.0),
            ..cfg()
        })
        .unwrap();
        for _ in 0..(20 * 600) {
            c.advance(0.05, MomentaryInputs::NONE).unwrap();
        }
        assert!((c.ppo2() - 1.3).abs() < 0.06, "ppo2 = {}", c.ppo2());
    }

    #[test]
    fn ppo2_is_clamped_to_pure_oxygen_at_depth() {
        let mut c = quiet();
        c.configure(&ConfigCommands {
            depth_m: Some(0.0),
            metabolism_l_per_min: Some(0.0),
            ..cfg()
        })
        .unwrap();
        let add = MomentaryInputs {
            o2_add: true,
            ..MomentaryInputs::NONE
        };
        for _ in 0..50 {
            let snap = c.advance(1.0, add).unwrap();
            assert!(snap.ppo2 <= snap.ambient_ata);
        }
        assert_eq!(c.ppo2(), 1.0);
    }

    #[test]
    fn hypoxia_sets_fatal_and_clears_again() {
        let mut c = quiet();
        c.configure(&ConfigCommands {
            metabolism_l_per_min: Some(3.0),
            ..cfg()
        })
        .unwrap();
        let mut snap = c.snapshot();
        for _ in 0..200 {
            snap = c.advance(1.0, MomentaryInputs::NONE).unwrap();
        }
        assert_eq!(snap.ppo2, 0.0);
        assert!(snap.hypoxic && snap.fatal && !snap.hyperoxic);

        // simulation keeps running after the diver is lost
        let add = MomentaryInputs {
            o2_add: true,
            ..MomentaryInputs::NONE
        };
        for _ in 0..5 {
            snap = c.advance(1.0, add).unwrap();
        }
        assert!(!snap.fatal);
    }

    #[test]
    fn hyperoxia_at_depth() {
        let mut c = quiet();
        c.configure(&ConfigCommands {
            depth_m: Some(40.0),
            ..cfg()
        })
        .unwrap();
        let add = MomentaryInputs {
            o2_add: true,
            ..MomentaryInputs::NONE
        };
        let mut snap = c.snapshot();
        for _ in 0..30 {
            snap = c.advance(1.0, add).unwrap();
        }
        assert!(snap.hyperoxic && snap.fatal);
        assert_eq!(c.status().hazard(), Some(safety::Hazard::Hyperoxia));
    }

    #[test]
    fn rejected_configuration_leaves_state_untouched() {
        let mut c = quiet();
        let before = c.snapshot();
        let err = c
            .configure(&ConfigCommands {
                depth_m: Some(30.0),
                diluent: Some(Diluent { fo2: 0.6, fhe: 0.5 }),
                ..cfg()
            })
            .unwrap_err();
        assert!(matches!(err, CcrError::InvalidConfiguration { field: "diluent", .. }));
        assert_eq!(c.snapshot(), before);

        assert!(c
            .configure(&ConfigCommands {
                cmf_rate: Some(-1.0),
                ..cfg()
            })
            .is_err());
        assert_eq!(c.settings().cmf_rate, 0.8);
    }

    #[test]
    fn snapshot_reports_end_and_mod_from_diluent() {
        let mut c = quiet();
        c.configure(&ConfigCommands {
            depth_m: Some(50.0),
            diluent: Some(Diluent { fo2: 0.2, fhe: 0.4 }),
            ..cfg()
        })
        .unwrap();
        let snap = c.advance(0.05, MomentaryInputs::NONE).unwrap();
        assert!((snap.equivalent_narcotic_depth - 26.0).abs() < 1e-9);
        assert!((snap.max_operating_depth - 60.0).abs() < 1e-9);
    }

    #[test]
    fn reset_restores_defaults_but_keeps_noise_source() {
        let mut c = quiet();
        c.configure(&ConfigCommands {
            mode: Some(InjectionMode::Hybrid),
            depth_m: Some(45.0),
            ..cfg()
        })
        .unwrap();
        for _ in 0..40 {
            c.advance(0.05, MomentaryInputs::NONE).unwrap();
        }
        c.reset();
        let mut fresh = quiet();
        assert_eq!(c.snapshot(), fresh.snapshot());
        for _ in 0..40 {
            assert_eq!(
                c.advance(0.05, MomentaryInputs::NONE).unwrap(),
                fresh.advance(0.05, MomentaryInputs::NONE).unwrap()
            );
        }
    }

    #[test]
    fn seeded_controllers_agree_on_cells() {
        let mut a = LoopController::seeded(9);
        let mut b = LoopController::seeded(9);
        for _ in 0..10 {
            let sa = a.advance(0.05, MomentaryInputs::NONE).unwrap();
            let sb = b.advance(0.05, MomentaryInputs::NONE).unwrap();
            assert_eq!(sa.cell_readings, sb.cell_readings);
            for r in sa.cell_readings {
                assert!((r - sa.ppo2).abs() <= 0.02 + 1e-12);
            }
        }
    }

    #[test]
    fn snapshot_serializes_mode_by_name() {
        let c = quiet();
        let v = serde_json::to_value(c.snapshot()).unwrap();
        assert_eq!(v["mode"], "manual");
        assert_eq!(v["cell_readings"].as_array().map(Vec::len), Some(3));
    }
}
