use std::fs;
use std::io::{self, BufRead, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use controller::{ConfigCommands, InjectionMode, LoopController, MomentaryInputs, Snapshot};
use safety::Hazard;
use sim::{Diluent, UniformNoise};
use tracing_subscriber::EnvFilter;

mod wire;

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Scenario {
    /// Solenoid holding setpoint at 30 m
    SolenoidHold,
    /// CMF slightly under metabolism; diver tops up by hand
    CmfDrift,
    /// Uncompensated needle valve on a descent to 90 m
    NeedleDescent,
    /// Hybrid loop on a 0-40 m descent
    Hybrid,
    /// Manual loop with no oxygen added
    Hypoxia,
    /// Add valve stuck open at 40 m
    Hyperoxia,
}

#[derive(Parser, Debug)]
#[command(
    name = "ccr-loop-sim",
    version,
    about = "Closed-circuit rebreather loop and oxygen control simulation"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a scripted dive and print a JSONL trace to stdout
    Run(RunArgs),
    /// Answer tick/reset requests, one JSON object per line on stdin
    Serve(ServeArgs),
}

#[derive(Args, Debug)]
struct RunArgs {
    #[arg(value_enum, long, default_value = "solenoid-hold")]
    scenario: Scenario,

    /// Total simulation time in seconds
    #[arg(long, default_value_t = 120.0)]
    seconds: f64,

    /// Fixed time step in milliseconds
    #[arg(long, default_value_t = 50)]
    dt_ms: u64,

    /// RNG seed for deterministic cell noise
    #[arg(long, default_value_t = 12345)]
    seed: u64,

    /// Cell noise half-width (ATA)
    #[arg(long, default_value_t = UniformNoise::DEFAULT_AMPLITUDE)]
    cell_noise: f64,

    /// JSON file of configuration applied after the scenario
    #[arg(long)]
    config: Option<PathBuf>,

    /// Injection mode: manual, cmf, needle, solenoid, hybrid
    #[arg(long)]
    mode: Option<InjectionMode>,

    /// Depth (m)
    #[arg(long)]
    depth: Option<f64>,

    /// Solenoid setpoint (ATA)
    #[arg(long)]
    setpoint: Option<f64>,

    /// O2 consumption (L/min)
    #[arg(long)]
    metabolism: Option<f64>,

    /// Diluent O2 fraction
    #[arg(long)]
    fo2: Option<f64>,

    /// Diluent helium fraction
    #[arg(long)]
    fhe: Option<f64>,

    /// Constant mass flow rate (L/min)
    #[arg(long)]
    cmf_rate: Option<f64>,

    /// Needle valve flow at the surface (L/min)
    #[arg(long)]
    needle_base: Option<f64>,

    /// Needle valve loses flow with depth
    #[arg(long)]
    uncompensated: bool,

    /// Stop the trace at the first hypoxic or hyperoxic tick
    #[arg(long)]
    stop_on_fatal: bool,
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// RNG seed; entropy-seeded when absent
    #[arg(long)]
    seed: Option<u64>,

    /// Cell noise half-width (ATA)
    #[arg(long, default_value_t = UniformNoise::DEFAULT_AMPLITUDE)]
    cell_noise: f64,
}

#[derive(serde::Serialize)]
struct TraceRow<'a> {
    t_s: f64,
    #[serde(flatten)]
    snapshot: &'a Snapshot,
    hazard: Option<Hazard>,
}

fn check_cell_noise(a: f64) -> Result<()> {
    anyhow::ensure!(
        a.is_finite() && (0.0..=UniformNoise::MAX_AMPLITUDE).contains(&a),
        "--cell-noise must be between 0 and {} ATA, got {a}",
        UniformNoise::MAX_AMPLITUDE
    );
    Ok(())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(io::stderr)
        .init();

    match Cli::parse().command {
        Command::Run(args) => run(args),
        Command::Serve(args) => serve(args),
    }
}

fn run(args: RunArgs) -> Result<()> {
    anyhow::ensure!(args.dt_ms > 0, "--dt-ms must be positive");
    check_cell_noise(args.cell_noise)?;
    let dt_s = (args.dt_ms as f64) / 1000.0;
    let steps = (args.seconds / dt_s).ceil() as u64;

    let mut ctl = LoopController::with_noise(UniformNoise::with_amplitude(
        args.seed,
        args.cell_noise,
    ));

    let mut cmds = scenario_setup(args.scenario);
    if let Some(path) = &args.config {
        let text = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let file: ConfigCommands = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        cmds.merge(file);
    }
    cmds.merge(overrides(&args));
    ctl.configure(&cmds)?;

    tracing::info!(
        scenario = ?args.scenario,
        mode = %ctl.settings().mode,
        steps,
        dt_s,
        "starting run"
    );

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let mut first_fatal: Option<f64> = None;

    for k in 0..steps {
        let t_s = (k as f64) * dt_s;

        let (script, inputs) = scenario_tick(args.scenario, t_s, args.seconds, &ctl.snapshot());
        ctl.configure(&script)?;
        let snap = ctl.advance(dt_s, inputs)?;

        let row = TraceRow {
            t_s,
            snapshot: &snap,
            hazard: ctl.status().hazard(),
        };
        writeln!(out, "{}", serde_json::to_string(&row)?)?;

        if snap.fatal && first_fatal.is_none() {
            first_fatal = Some(t_s);
            if args.stop_on_fatal {
                break;
            }
        }
    }

    let end = ctl.snapshot();
    match first_fatal {
        Some(t) => tracing::warn!(t_s = t, final_ppo2 = end.ppo2, "diver lost during run"),
        None => tracing::info!(final_ppo2 = end.ppo2, "run complete"),
    }
    Ok(())
}

fn serve(args: ServeArgs) -> Result<()> {
    check_cell_noise(args.cell_noise)?;
    let noise = match args.seed {
        Some(seed) => UniformNoise::with_amplitude(seed, args.cell_noise),
        None => UniformNoise::entropy_with_amplitude(args.cell_noise),
    };
    let mut ctl = LoopController::with_noise(noise);
    tracing::info!("serving tick/reset requests on stdin");

    let stdin = io::stdin();
    let stdout = io::stdout();
    let mut out = stdout.lock();
    for line in stdin.lock().lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let resp = wire::handle(&mut ctl, &line);
        writeln!(out, "{}", serde_json::to_string(&resp)?)?;
        out.flush()?;
    }
    Ok(())
}

/// Command-line settings, layered over the scenario and config file.
fn overrides(args: &RunArgs) -> ConfigCommands {
    let diluent = match (args.fo2, args.fhe) {
        (None, None) => None,
        (fo2, fhe) => Some(Diluent {
            fo2: fo2.unwrap_or(Diluent::AIR.fo2),
            fhe: fhe.unwrap_or(0.0),
        }),
    };
    ConfigCommands {
        depth_m: args.depth,
        setpoint: args.setpoint,
        mode: args.mode,
        metabolism_l_per_min: args.metabolism,
        diluent,
        cmf_rate: args.cmf_rate,
        needle_base_rate: args.needle_base,
        needle_uncompensated: args.uncompensated.then_some(true),
    }
}

fn scenario_setup(s: Scenario) -> ConfigCommands {
    let base = ConfigCommands::default();
    match s {
        Scenario::SolenoidHold => ConfigCommands {
            mode: Some(InjectionMode::Solenoid),
            depth_m: Some(30.0),
            setpoint: Some(1.3),
            ..base
        },
        Scenario::CmfDrift => ConfigCommands {
            mode: Some(InjectionMode::ConstantMassFlow),
            depth_m: Some(20.0),
            cmf_rate: Some(0.8),
            metabolism_l_per_min: Some(1.2),
            ..base
        },
        Scenario::NeedleDescent => ConfigCommands {
            mode: Some(InjectionMode::NeedleValve),
            depth_m: Some(0.0),
            needle_base_rate: Some(1.0),
            needle_uncompensated: Some(true),
            ..base
        },
        Scenario::Hybrid => ConfigCommands {
            mode: Some(InjectionMode::Hybrid),
            depth_m: Some(0.0),
            setpoint: Some(1.2),
            cmf_rate: Some(0.6),
            diluent: Some(Diluent { fo2: 0.18, fhe: 0.45 }),
            ..base
        },
        Scenario::Hypoxia => ConfigCommands {
            mode: Some(InjectionMode::Manual),
            metabolism_l_per_min: Some(3.0),
            ..base
        },
        Scenario::Hyperoxia => ConfigCommands {
            mode: Some(InjectionMode::Manual),
            depth_m: Some(40.0),
            ..base
        },
    }
}

/// Per-tick script: depth changes and what the diver does with the manual valves.
fn scenario_tick(
    s: Scenario,
    t_s: f64,
    seconds: f64,
    last: &Snapshot,
) -> (ConfigCommands, MomentaryInputs) {
    let mut cmds = ConfigCommands::default();
    let mut inputs = MomentaryInputs::NONE;
    let progress = if seconds > 0.0 { (t_s / seconds).min(1.0) } else { 1.0 };

    match s {
        Scenario::CmfDrift => {
            // diver tops up once the loop drifts under 0.9
            inputs.o2_add = last.ppo2 < 0.9;
        }
        Scenario::NeedleDescent => {
            cmds.depth_m = Some(90.0 * progress);
        }
        Scenario::Hybrid => {
            cmds.depth_m = Some(40.0 * progress);
            // flush with diluent on the way down if the loop spikes
            inputs.diluent_flush = last.ppo2 > 1.5;
        }
        Scenario::Hyperoxia => {
            inputs.o2_add = true;
        }
        Scenario::SolenoidHold | Scenario::Hypoxia => {}
    }

    (cmds, inputs)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cell_noise_outside_range_is_refused() {
        assert!(check_cell_noise(UniformNoise::DEFAULT_AMPLITUDE).is_ok());
        assert!(check_cell_noise(0.0).is_ok());
        for a in [1e308, -0.01, f64::NAN, f64::INFINITY] {
            assert!(check_cell_noise(a).is_err(), "{a}");
        }
    }
}
