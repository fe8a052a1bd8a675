use serde::{Deserialize, Serialize};
use sim::Diluent;

use crate::error::{CcrError, CcrResult};
use crate::mode::InjectionMode;

/// A batch of configuration changes applied between ticks.
///
/// Every field is optional; `None` leaves the current value alone. A batch is
/// validated as a whole before anything is written.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ConfigCommands {
    pub depth_m: Option<f64>,
    pub setpoint: Option<f64>,
    pub mode: Option<InjectionMode>,
    pub metabolism_l_per_min: Option<f64>,
    pub diluent: Option<Diluent>,
    pub cmf_rate: Option<f64>,
    pub needle_base_rate: Option<f64>,
    pub needle_uncompensated: Option<bool>,
}

impl ConfigCommands {
    pub fn is_empty(&self) -> bool {
        *self == ConfigCommands::default()
    }

    /// Layer `other` on top of `self`; fields set in `other` win.
    pub fn merge(&mut self, other: ConfigCommands) {
        self.depth_m = other.depth_m.or(self.depth_m);
        self.setpoint = other.setpoint.or(self.setpoint);
        self.mode = other.mode.or(self.mode);
        self.metabolism_l_per_min = other.metabolism_l_per_min.or(self.metabolism_l_per_min);
        self.diluent = other.diluent.or(self.diluent);
        self.cmf_rate = other.cmf_rate.or(self.cmf_rate);
        self.needle_base_rate = other.needle_base_rate.or(self.needle_base_rate);
        self.needle_uncompensated = other.needle_uncompensated.or(self.needle_uncompensated);
    }

    pub fn validate(&self) -> CcrResult<()> {
        if let Some(v) = self.depth_m {
            non_negative("depth_m", v)?;
        }
        if let Some(v) = self.setpoint {
            finite("setpoint", v)?;
            if v <= 0.0 {
                return Err(CcrError::config("setpoint", format!("{v} must be > 0")));
            }
        }
        if let Some(v) = self.metabolism_l_per_min {
            non_negative("metabolism_l_per_min", v)?;
        }
        if let Some(d) = self.diluent {
            fraction("diluent.fo2", d.fo2)?;
            fraction("diluent.fhe", d.fhe)?;
            if d.fo2 + d.fhe > 1.0 {
                return Err(CcrError::config(
                    "diluent",
                    format!("fo2 + fhe = {} exceeds 1", d.fo2 + d.fhe),
                ));
            }
        }
        if let Some(v) = self.cmf_rate {
            non_negative("cmf_rate", v)?;
        }
        if let Some(v) = self.needle_base_rate {
            non_negative("needle_base_rate", v)?;
        }
        Ok(())
    }
}

fn finite(field: &'static str, v: f64) -> CcrResult<()> {
    if v.is_finite() {
        Ok(())
    } else {
        Err(CcrError::config(field, format!("{v} is not a finite number")))
    }
}

fn non_negative(field: &'static str, v: f64) -> CcrResult<()> {
    finite(field, v)?;
    if v < 0.0 {
        return Err(CcrError::config(field, format!("{v} must be >= 0")));
    }
    Ok(())
}

fn fraction(field: &'static str, v: f64) -> CcrResult<()> {
    non_negative(field, v)?;
    if v > 1.0 {
        return Err(CcrError::config(field, format!("{v} must be <= 1")));
    }
    Ok(())
}

/// Injection-side settings owned by the controller.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct InjectionSettings {
    pub mode: InjectionMode,
    pub setpoint: f64,
    pub diluent: Diluent,
    /// L/min
    pub cmf_rate: f64,
    /// L/min at the surface
    pub needle_base_rate: f64,
    pub needle_uncompensated: bool,
}

impl Default for InjectionSettings {
    fn default() -> Self {
        Self {
            mode: InjectionMode::Manual,
            setpoint: 1.2,
            diluent: Diluent::AIR,
            cmf_rate: 0.8,
            needle_base_rate: 0.8,
            needle_uncompensated: false,
        }
    }
}
