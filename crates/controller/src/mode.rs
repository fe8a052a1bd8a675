use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::CcrError;

/// Fixed intermediate pressure feeding the needle valve.
pub const NEEDLE_SUPPLY_BAR: f64 = 10.0;

/// Automatic injection strategy. Manual add/flush valves are orthogonal to this
/// and work in every mode.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InjectionMode {
    #[default]
    Manual,
    #[serde(alias = "cmf")]
    ConstantMassFlow,
    #[serde(alias = "needle")]
    NeedleValve,
    Solenoid,
    /// CMF plus solenoid top-up
    Hybrid,
}

impl InjectionMode {
    pub const ALL: [InjectionMode; 5] = [
        InjectionMode::Manual,
        InjectionMode::ConstantMassFlow,
        InjectionMode::NeedleValve,
        InjectionMode::Solenoid,
        InjectionMode::Hybrid,
    ];

    pub fn label(self) -> &'static str {
        match self {
            InjectionMode::Manual => "Manual (mCCR)",
            InjectionMode::ConstantMassFlow => "Constant mass flow",
            InjectionMode::NeedleValve => "Needle valve",
            InjectionMode::Solenoid => "Solenoid (eCCR)",
            InjectionMode::Hybrid => "Hybrid (CMF + solenoid)",
        }
    }

    pub fn uses_cmf(self) -> bool {
        matches!(self, InjectionMode::ConstantMassFlow | InjectionMode::Hybrid)
    }

    pub fn uses_needle(self) -> bool {
        matches!(self, InjectionMode::NeedleValve)
    }

    pub fn uses_solenoid(self) -> bool {
        matches!(self, InjectionMode::Solenoid | InjectionMode::Hybrid)
    }
}

impl fmt::Display for InjectionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InjectionMode::Manual => "manual",
            InjectionMode::ConstantMassFlow => "cmf",
            InjectionMode::NeedleValve => "needle",
            InjectionMode::Solenoid => "solenoid",
            InjectionMode::Hybrid => "hybrid",
        };
        f.write_str(s)
    }
}

impl FromStr for InjectionMode {
    type Err = CcrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Ok(InjectionMode::Manual),
            "cmf" | "constant_mass_flow" => Ok(InjectionMode::ConstantMassFlow),
            "needle" | "needle_valve" => Ok(InjectionMode::NeedleValve),
            "solenoid" => Ok(InjectionMode::Solenoid),
            "hybrid" => Ok(InjectionMode::Hybrid),
            other => Err(CcrError::config(
                "mode",
                format!("unknown injection mode {other:?}"),
            )),
        }
    }
}

/// Needle valve flow in L/min.
///
/// A compensated valve delivers `base` at any depth. An uncompensated one loses
/// drive pressure as ambient rises toward the supply pressure; flow is scaled so
/// it equals `base` at the surface and reaches zero at 10 ATA.
pub fn needle_flow_l_per_min(base: f64, uncompensated: bool, ambient_ata: f64) -> f64 {
    if !uncompensated {
        return base;
    }
    let drive = (NEEDLE_SUPPLY_BAR - ambient_ata).max(0.0);
    base * drive / (NEEDLE_SUPPLY_BAR - 1.0)
}

#[derive(Clone, Copy, Debug)]
pub struct SolenoidParams {
    pub flow_l_per_min: f64,
    /// Minimum open time per firing
    pub pulse_s: f64,
    /// Fire only when PPO2 is this far below setpoint
    pub hysteresis: f64,
}

impl Default for SolenoidParams {
    fn default() -> Self {
        Self {
            flow_l_per_min: 10.0,
            pulse_s: 0.2,
            hysteresis: 0.03,
        }
    }
}

/// Bang-bang solenoid with a minimum pulse width.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct Solenoid {
    timer_s: f64,
    active: bool,
}

impl Solenoid {
    pub fn timer_s(&self) -> f64 {
        self.timer_s
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Advance the valve one tick and return the flow it delivers (L/min).
    ///
    /// A new pulse only starts while `armed`; a pulse already running always
    /// finishes.
    pub fn update(
        &mut self,
        p: &SolenoidParams,
        armed: bool,
        ppo2: f64,
        setpoint: f64,
        dt_s: f64,
    ) -> f64 {
        self.active = false;

        if armed && self.timer_s <= 0.0 && ppo2 < setpoint - p.hysteresis {
            self.timer_s = p.pulse_s;
            tracing::trace!(ppo2, setpoint, "solenoid fired");
        }

        if self.timer_s > 0.0 {
            self.active = true;
            self.timer_s = (self.timer_s - dt_s).max(0.0);
            p.flow_l_per_min
        } else {
            0.0
        }
    }
}
