//! Line-oriented JSON protocol for driving a controller from another process.
//!
//! One request per line, one response per line:
//!
//! ```text
//! {"op":"tick","dt":0.05,"inputs":{"mav_o2":true,"set_depth":"30"}}
//! {"op":"reset"}
//! ```

use controller::{
    check_time_step, CcrError, CcrResult, ConfigCommands, InjectionMode, LoopController,
    MomentaryInputs, Snapshot,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sim::{CellNoise, Diluent, CELL_COUNT};

/// Step used when a tick omits `dt` (about 60 Hz).
pub const DEFAULT_DT_S: f64 = 0.016;

fn default_dt() -> f64 {
    DEFAULT_DT_S
}

#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    Tick {
        #[serde(default = "default_dt")]
        dt: f64,
        #[serde(default)]
        inputs: TickInputs,
    },
    Reset,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TickInputs {
    pub mav_o2: bool,
    pub mav_dil: bool,
    pub set_depth: Option<Value>,
    pub set_sp: Option<Value>,
    pub set_mode: Option<String>,
    pub set_vo2: Option<Value>,
    pub set_dil: Option<DiluentInput>,
    pub set_cmf: Option<Value>,
    pub set_needle: Option<Value>,
    pub set_uncomp: Option<bool>,
}

#[derive(Debug, Deserialize)]
pub struct DiluentInput {
    pub fo2: Value,
    pub fhe: Value,
}

impl TickInputs {
    pub fn momentary(&self) -> MomentaryInputs {
        MomentaryInputs {
            o2_add: self.mav_o2,
            diluent_flush: self.mav_dil,
        }
    }

    /// Map the `set_*` keys onto controller configuration. Values may arrive as
    /// JSON numbers or numeric strings.
    pub fn commands(&self) -> CcrResult<ConfigCommands> {
        let diluent = match &self.set_dil {
            Some(d) => Some(Diluent {
                fo2: number("diluent.fo2", &d.fo2)?,
                fhe: number("diluent.fhe", &d.fhe)?,
            }),
            None => None,
        };

        Ok(ConfigCommands {
            depth_m: opt_number("depth_m", &self.set_depth)?,
            setpoint: opt_number("setpoint", &self.set_sp)?,
            mode: self
                .set_mode
                .as_deref()
                .map(|m| m.parse::<InjectionMode>())
                .transpose()?,
            metabolism_l_per_min: opt_number("metabolism_l_per_min", &self.set_vo2)?,
            diluent,
            cmf_rate: opt_number("cmf_rate", &self.set_cmf)?,
            needle_base_rate: opt_number("needle_base_rate", &self.set_needle)?,
            needle_uncompensated: self.set_uncomp,
        })
    }
}

fn number(field: &'static str, v: &Value) -> CcrResult<f64> {
    match v {
        Value::Number(n) => n
            .as_f64()
            .ok_or_else(|| CcrError::config(field, format!("{n} is not representable"))),
        Value::String(s) => s
            .trim()
            .parse::<f64>()
            .map_err(|_| CcrError::config(field, format!("{s:?} is not a number"))),
        other => Err(CcrError::config(field, format!("{other} is not a number"))),
    }
}

fn opt_number(field: &'static str, v: &Option<Value>) -> CcrResult<Option<f64>> {
    v.as_ref().map(|v| number(field, v)).transpose()
}

/// Tick response using the short keys the browser client expects.
#[derive(Debug, Serialize)]
pub struct TickResponse {
    pub po2: f64,
    pub cells: [f64; CELL_COUNT],
    pub depth: f64,
    pub sp: f64,
    pub solenoid_active: bool,
    pub hypoxia: bool,
    pub hyperoxia: bool,
    pub dead: bool,
    pub end: f64,
    #[serde(rename = "mod")]
    pub mod_m: f64,
}

impl From<&Snapshot> for TickResponse {
    fn from(s: &Snapshot) -> Self {
        Self {
            po2: s.ppo2,
            cells: s.cell_readings,
            depth: s.depth_m,
            sp: s.setpoint,
            solenoid_active: s.solenoid_active,
            hypoxia: s.hypoxic,
            hyperoxia: s.hyperoxic,
            dead: s.fatal,
            end: s.equivalent_narcotic_depth,
            mod_m: s.max_operating_depth,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum Response {
    Tick(TickResponse),
    Status { status: &'static str },
    Error { error: String },
}

/// Handle one request line. Errors are reported in the response; the session
/// carries on.
pub fn handle<N: CellNoise>(ctl: &mut LoopController<N>, line: &str) -> Response {
    let req: Request = match serde_json::from_str(line) {
        Ok(r) => r,
        Err(e) => {
            tracing::debug!(error = %e, "malformed request");
            return Response::Error {
                error: format!("malformed request: {e}"),
            };
        }
    };

    match req {
        Request::Reset => {
            ctl.reset();
            Response::Status { status: "reset" }
        }
        Request::Tick { dt, inputs } => match tick(ctl, dt, &inputs) {
            Ok(snap) => Response::Tick(TickResponse::from(&snap)),
            Err(e) => {
                tracing::debug!(error = %e, "tick rejected");
                Response::Error {
                    error: e.to_string(),
                }
            }
        },
    }
}

fn tick<N: CellNoise>(
    ctl: &mut LoopController<N>,
    dt: f64,
    inputs: &TickInputs,
) -> CcrResult<Snapshot> {
    // before any setting is applied
    check_time_step(dt)?;
    let cmds = inputs.commands()?;
    ctl.configure(&cmds)?;
    ctl.advance(dt, inputs.momentary())
}
