use controller::{ConfigCommands, InjectionMode, LoopController, MomentaryInputs, Snapshot};
use eframe::egui;
use egui_plot::{Line, Plot, PlotPoints};
use safety::{
    beyond_mod, diver_condition, evaluate, reading_alarm, AlarmLimits, DiverCondition, Hazard,
    ReadingAlarm, SafetyLimits,
};
use serde::Deserialize;
use sim::{Diluent, UniformNoise, CELL_COUNT};
use std::collections::VecDeque;
use std::fs;

/// Samples kept for the plots: two minutes at the default 50 ms step.
const HISTORY_LEN: usize = 2400;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Debug)]
struct Sample {
    t: f64,
    ppo2: f64,
    cells: [f64; CELL_COUNT],
    depth: f64,
    setpoint: f64,
    solenoid: bool,
    fatal: bool,
    end: f64,
    mod_m: f64,
}

impl Sample {
    fn from_snapshot(t: f64, s: &Snapshot) -> Self {
        Self {
            t,
            ppo2: s.ppo2,
            cells: s.cell_readings,
            depth: s.depth_m,
            setpoint: s.setpoint,
            solenoid: s.solenoid_active,
            fatal: s.fatal,
            end: s.equivalent_narcotic_depth,
            mod_m: s.max_operating_depth,
        }
    }

    fn condition(&self, limits: &SafetyLimits, alarms: &AlarmLimits) -> DiverCondition {
        diver_condition(&evaluate(limits, self.ppo2), alarms, self.end)
    }
}

fn alarm_color(a: ReadingAlarm) -> egui::Color32 {
    match a {
        ReadingAlarm::Normal => egui::Color32::LIGHT_GRAY,
        ReadingAlarm::Warning => egui::Color32::RED,
        ReadingAlarm::Hypoxic => egui::Color32::from_rgb(0xe0, 0xaa, 0xff),
    }
}

fn condition_label(c: DiverCondition) -> (&'static str, egui::Color32) {
    match c {
        DiverCondition::Ok => ("STATUS: OK", egui::Color32::GREEN),
        DiverCondition::Narcosis => ("NARCOSIS", egui::Color32::from_rgb(0xff, 0x88, 0xff)),
        DiverCondition::Hypoxia => ("HYPOXIA", egui::Color32::from_rgb(0xe0, 0xaa, 0xff)),
        DiverCondition::Hyperoxia => ("CNS TOXICITY", egui::Color32::RED),
    }
}

/// One row of a `ccr-loop-sim run` trace. Extra keys are ignored.
#[derive(Debug, Deserialize)]
struct TraceLine {
    t_s: f64,
    ppo2: f64,
    cell_readings: [f64; CELL_COUNT],
    depth_m: f64,
    setpoint: f64,
    solenoid_active: bool,
    fatal: bool,
    equivalent_narcotic_depth: f64,
    /// `null` for an oxygen-free diluent
    max_operating_depth: Option<f64>,
    hazard: Option<Hazard>,
}

/// Widget values; edits are queued as configuration commands.
#[derive(Clone, Copy, Debug)]
struct Controls {
    mode: InjectionMode,
    depth: f64,
    setpoint: f64,
    metabolism: f64,
    fo2: f64,
    fhe: f64,
    cmf_rate: f64,
    needle_base: f64,
    uncompensated: bool,
}

impl Controls {
    fn from_controller(ctl: &LoopController) -> Self {
        let s = ctl.settings();
        let x = ctl.loop_state();
        Self {
            mode: s.mode,
            depth: x.depth_m,
            setpoint: s.setpoint,
            metabolism: x.metabolism_l_per_min,
            fo2: s.diluent.fo2,
            fhe: s.diluent.fhe,
            cmf_rate: s.cmf_rate,
            needle_base: s.needle_base_rate,
            uncompensated: s.needle_uncompensated,
        }
    }
}

struct App {
    // Settings
    dt_ms: u64,
    seed: u64,

    // Live simulation state
    running: bool,
    t: f64,
    ctl: LoopController,
    controls: Controls,
    pending: ConfigCommands,
    held: MomentaryInputs,

    // Data shown in plots, oldest dropped past HISTORY_LEN
    samples: VecDeque<Sample>,

    // Replay
    replay_loaded: bool,
    replay_path: String,
    replay_all: Vec<Sample>,
    replay_pos: usize,
    replay_playing: bool,
    replay_speed: usize, // samples per frame
    replay_hazard: Option<String>,
    last_error: Option<String>,
}

impl Default for App {
    fn default() -> Self {
        let seed = 12345;
        let ctl = LoopController::with_noise(UniformNoise::new(seed));
        let controls = Controls::from_controller(&ctl);

        Self {
            dt_ms: 50,
            seed,

            running: false,
            t: 0.0,
            ctl,
            controls,
            pending: ConfigCommands::default(),
            held: MomentaryInputs::NONE,

            samples: VecDeque::with_capacity(HISTORY_LEN),

            replay_loaded: false,
            replay_path: "out/solenoid_hold.jsonl".to_string(),
            replay_all: Vec::new(),
            replay_pos: 0,
            replay_playing: false,
            replay_speed: 50,
            replay_hazard: None,
            last_error: None,
        }
    }
}

impl App {
    fn dt_s(&self) -> f64 {
        self.dt_ms as f64 / 1000.0
    }

    fn clear_replay(&mut self) {
        self.replay_loaded = false;
        self.replay_all.clear();
        self.replay_pos = 0;
        self.replay_playing = false;
        self.replay_hazard = None;
        self.last_error = None;
    }

    /// Fresh controller, same as a new dive.
    fn reset_live(&mut self) {
        self.running = false;
        self.t = 0.0;
        self.ctl = LoopController::with_noise(UniformNoise::new(self.seed));
        self.controls = Controls::from_controller(&self.ctl);
        self.pending = ConfigCommands::default();
        self.samples.clear();
    }

    fn reset(&mut self) {
        self.clear_replay();
        self.reset_live();
    }

    /// Push queued edits into the controller. A rejected batch leaves the
    /// controller untouched, so the widgets are resynced from it.
    fn apply_pending(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        let cmds = std::mem::take(&mut self.pending);
        match self.ctl.configure(&cmds) {
            Ok(()) => self.last_error = None,
            Err(e) => {
                tracing::warn!(error = %e, "configuration rejected");
                self.last_error = Some(e.to_string());
                self.controls = Controls::from_controller(&self.ctl);
            }
        }
    }

    fn load_jsonl(&mut self, path: &str) {
        self.last_error = None;

        let text = match fs::read_to_string(path) {
            Ok(t) => t,
            Err(e) => {
                self.last_error = Some(format!("Failed to read {path}: {e}"));
                return;
            }
        };

        let mut loaded: Vec<Sample> = Vec::new();
        let mut first_hazard: Option<String> = None;

        for (i, raw) in text.lines().enumerate() {
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }

            let row: TraceLine = match serde_json::from_str(line) {
                Ok(v) => v,
                Err(e) => {
                    self.last_error = Some(format!("JSON parse error at line {}: {}", i + 1, e));
                    return;
                }
            };

            if first_hazard.is_none() {
                first_hazard = row.hazard.map(|h| format!("{h:?}"));
            }

            loaded.push(Sample {
                t: row.t_s,
                ppo2: row.ppo2,
                cells: row.cell_readings,
                depth: row.depth_m,
                setpoint: row.setpoint,
                solenoid: row.solenoid_active,
                fatal: row.fatal,
                end: row.equivalent_narcotic_depth,
                mod_m: row.max_operating_depth.unwrap_or(f64::INFINITY),
            });
        }

        if loaded.is_empty() {
            self.last_error = Some(format!("No samples found in {path}"));
            return;
        }

        self.running = false;
        self.clear_replay();
        self.replay_loaded = true;
        self.replay_hazard = first_hazard;
        tracing::info!(path, samples = loaded.len(), "replay loaded");

        self.replay_all = loaded;
        self.samples.clear();
        self.replay_advance(self.replay_speed);
    }

    fn replay_advance(&mut self, n: usize) {
        if self.replay_pos >= self.replay_all.len() {
            self.replay_playing = false;
            return;
        }
        let end = (self.replay_pos + n.max(1)).min(self.replay_all.len());
        let batch = self.replay_all[self.replay_pos..end].to_vec();
        for s in batch {
            self.push_sample(s);
        }
        self.replay_pos = end;
        self.t = self.samples.back().map(|s| s.t).unwrap_or(self.t);

        if self.replay_pos >= self.replay_all.len() {
            self.replay_playing = false;
        }
    }

    fn push_sample(&mut self, s: Sample) {
        if self.samples.len() == HISTORY_LEN {
            self.samples.pop_front();
        }
        self.samples.push_back(s);
    }

    fn replay_tick(&mut self) {
        if self.replay_loaded && self.replay_playing {
            self.replay_advance(self.replay_speed);
        }
    }

    fn fatal_time_for_plot(&self) -> Option<f64> {
        if self.replay_loaded {
            self.replay_all.iter().find(|s| s.fatal).map(|s| s.t)
        } else {
            self.samples.iter().find(|s| s.fatal).map(|s| s.t)
        }
    }

    fn hazard_text(&self) -> String {
        if let Some(h) = self.replay_hazard.as_ref() {
            return h.clone();
        }
        self.ctl
            .status()
            .hazard()
            .map(|h| format!("{h:?}"))
            .unwrap_or_else(|| "—".to_string())
    }

    fn step_once_live(&mut self) {
        self.apply_pending();

        let dt_s = self.dt_s();
        match self.ctl.advance(dt_s, self.held) {
            Ok(snap) => {
                self.push_sample(Sample::from_snapshot(self.t, &snap));
                self.t += dt_s;
            }
            Err(e) => {
                self.last_error = Some(e.to_string());
                self.running = false;
            }
        }
    }

    fn controls_ui(&mut self, ui: &mut egui::Ui) {
        let c = &mut self.controls;
        let p = &mut self.pending;

        ui.label("Injection mode");
        for m in InjectionMode::ALL {
            if ui.selectable_value(&mut c.mode, m, m.label()).changed() {
                p.mode = Some(c.mode);
            }
        }

        ui.separator();
        if ui
            .add(egui::Slider::new(&mut c.depth, 0.0..=100.0).text("depth (m)"))
            .changed()
        {
            p.depth_m = Some(c.depth);
        }
        if ui
            .add(egui::Slider::new(&mut c.setpoint, 0.4..=1.6).text("setpoint (ATA)"))
            .changed()
        {
            p.setpoint = Some(c.setpoint);
        }
        if ui
            .add(egui::Slider::new(&mut c.metabolism, 0.0..=4.0).text("VO2 (L/min)"))
            .changed()
        {
            p.metabolism_l_per_min = Some(c.metabolism);
        }

        ui.separator();
        ui.label("Diluent");
        let fo2 = ui.add(egui::Slider::new(&mut c.fo2, 0.05..=1.0).text("FO2"));
        let fhe = ui.add(egui::Slider::new(&mut c.fhe, 0.0..=0.95).text("FHe"));
        if fo2.changed() || fhe.changed() {
            p.diluent = Some(Diluent {
                fo2: c.fo2,
                fhe: c.fhe,
            });
        }

        ui.separator();
        if ui
            .add(egui::Slider::new(&mut c.cmf_rate, 0.0..=3.0).text("CMF (L/min)"))
            .changed()
        {
            p.cmf_rate = Some(c.cmf_rate);
        }
        if ui
            .add(egui::Slider::new(&mut c.needle_base, 0.0..=3.0).text("needle (L/min)"))
            .changed()
        {
            p.needle_base_rate = Some(c.needle_base);
        }
        if ui
            .checkbox(&mut c.uncompensated, "needle uncompensated")
            .changed()
        {
            p.needle_uncompensated = Some(c.uncompensated);
        }

        ui.separator();
        ui.label("Manual valves (hold)");
        ui.horizontal(|ui| {
            let o2 = ui.add(egui::Button::new("O2 add"));
            let dil = ui.add(egui::Button::new("Diluent flush"));
            self.held = MomentaryInputs {
                o2_add: o2.is_pointer_button_down_on(),
                diluent_flush: dil.is_pointer_button_down_on(),
            };
        });
    }
}

impl eframe::App for App {
    fn update(&mut self, ctx: &egui::Context, _frame: &mut eframe::Frame) {
        self.replay_tick();
        if self.replay_playing {
            ctx.request_repaint();
        }

        let mode_txt = if self.replay_loaded { "REPLAY" } else { "LIVE" };
        let fatal_time = self.fatal_time_for_plot();
        let hazard_txt = self.hazard_text();
        let snap = self.ctl.snapshot();

        let limits = SafetyLimits::default();
        let alarms = AlarmLimits::default();
        let latest = match self.samples.back() {
            Some(s) => s.clone(),
            None => Sample::from_snapshot(self.t, &snap),
        };
        let (condition_txt, condition_color) = condition_label(latest.condition(&limits, &alarms));

        egui::TopBottomPanel::top("top").show(ctx, |ui| {
            ui.horizontal(|ui| {
                ui.heading("CCR Loop Sim");
                ui.separator();
                ui.label(format!("MODE: {mode_txt}"));
                ui.separator();

                ui.colored_label(condition_color, condition_txt);

                ui.separator();
                let depth_color = if beyond_mod(latest.depth, latest.mod_m) {
                    egui::Color32::RED
                } else {
                    egui::Color32::LIGHT_GRAY
                };
                ui.colored_label(depth_color, format!("DEPTH {:.0} m", latest.depth));
                ui.label(format!("END {:.0} m  MOD {:.0} m", latest.end, latest.mod_m));

                if let Some(t) = fatal_time {
                    ui.separator();
                    ui.label(format!("t_fatal = {:.2}s", t));
                    ui.separator();
                    ui.label(format!("hazard = {hazard_txt}"));
                }

                if latest.solenoid {
                    ui.separator();
                    ui.colored_label(egui::Color32::YELLOW, "SOLENOID");
                }
            });
        });

        egui::SidePanel::left("left")
            .resizable(false)
            .show(ctx, |ui| {
                let live_enabled = !self.replay_loaded;

                ui.add_enabled_ui(live_enabled, |ui| {
                    self.controls_ui(ui);
                });

                ui.separator();
                ui.label("Simulation settings");
                ui.add_enabled(
                    live_enabled,
                    egui::Slider::new(&mut self.dt_ms, 10..=200).text("dt (ms)"),
                );
                ui.add_enabled(
                    live_enabled,
                    egui::DragValue::new(&mut self.seed).prefix("seed: "),
                );

                ui.separator();
                ui.horizontal(|ui| {
                    if ui.button("Reset").clicked() {
                        self.reset();
                    }

                    let run_label = if self.running { "Pause" } else { "Run" };
                    if ui
                        .add_enabled(live_enabled, egui::Button::new(run_label))
                        .clicked()
                    {
                        self.running = !self.running;
                    }

                    if ui
                        .add_enabled(live_enabled, egui::Button::new("Step"))
                        .clicked()
                    {
                        self.step_once_live();
                    }
                });

                ui.separator();
                ui.label("Replay (JSONL)");
                ui.horizontal(|ui| {
                    ui.label("path:");
                    ui.text_edit_singleline(&mut self.replay_path);
                });

                ui.horizontal(|ui| {
                    if ui.button("Load").clicked() {
                        let p = self.replay_path.clone();
                        self.load_jsonl(&p);
                    }

                    if ui
                        .button(if self.replay_playing {
                            "Pause replay"
                        } else {
                            "Play replay"
                        })
                        .clicked()
                        && self.replay_loaded
                    {
                        self.replay_playing = !self.replay_playing;
                        ctx.request_repaint();
                    }

                    if ui.button("Step replay").clicked() && self.replay_loaded {
                        self.replay_advance(1);
                    }
                });

                ui.add(
                    egui::Slider::new(&mut self.replay_speed, 1..=500)
                        .text("replay speed (samples/frame)"),
                );

                if self.replay_loaded {
                    ui.small(format!(
                        "Loaded: {}/{} samples",
                        self.replay_pos,
                        self.replay_all.len()
                    ));
                } else {
                    ui.small("No replay loaded.");
                }

                if let Some(err) = &self.last_error {
                    ui.separator();
                    ui.colored_label(egui::Color32::RED, err);
                }

                ui.separator();
                ui.small("Tip: ccr-loop-sim run --scenario hypoxia > out/hypoxia.jsonl");
            });

        egui::CentralPanel::default().show(ctx, |ui| {
            if self.running && !self.replay_loaded {
                for _ in 0..5 {
                    if !self.running {
                        break;
                    }
                    self.step_once_live();
                }
                ctx.request_repaint();
            }

            let Some(last) = self.samples.back().cloned() else {
                ui.label("No data yet. Run LIVE or Load a REPLAY file.");
                return;
            };

            let t_start = self.samples.front().map(|s| s.t).unwrap_or(0.0);
            let t_end = last.t;

            let ppo2_points: PlotPoints = self.samples.iter().map(|s| [s.t, s.ppo2]).collect();
            let sp_points: PlotPoints = self.samples.iter().map(|s| [s.t, s.setpoint]).collect();
            let cell_lines: Vec<PlotPoints> = (0..CELL_COUNT)
                .map(|i| self.samples.iter().map(|s| [s.t, s.cells[i]]).collect())
                .collect();
            let depth_points: PlotPoints = self.samples.iter().map(|s| [s.t, -s.depth]).collect();
            let sol_points: PlotPoints = self
                .samples
                .iter()
                .map(|s| [s.t, if s.solenoid { 1.0 } else { 0.0 }])
                .collect();

            ui.heading("Traces");
            Plot::new("ppo2_plot").height(260.0).show(ui, |plot_ui| {
                plot_ui.line(Line::new(ppo2_points).name("PPO2 (ATA)"));
                for (i, pts) in cell_lines.into_iter().enumerate() {
                    plot_ui.line(Line::new(pts).name(format!("Cell {}", i + 1)));
                }
                plot_ui.line(Line::new(sp_points).name("Setpoint"));

                if t_end > t_start {
                    let hypo: PlotPoints = vec![
                        [t_start, limits.hypoxic_below],
                        [t_end, limits.hypoxic_below],
                    ]
                    .into();
                    let hyper: PlotPoints = vec![
                        [t_start, limits.hyperoxic_above],
                        [t_end, limits.hyperoxic_above],
                    ]
                    .into();
                    plot_ui.line(Line::new(hypo).name("Hypoxic limit"));
                    plot_ui.line(Line::new(hyper).name("Hyperoxic limit"));
                }

                if let Some(t) = fatal_time {
                    let vline: PlotPoints = vec![[t, 0.0], [t, limits.hyperoxic_above]].into();
                    plot_ui.line(Line::new(vline).name("Fatal"));
                }
            });

            Plot::new("depth_plot").height(160.0).show(ui, |plot_ui| {
                plot_ui.line(Line::new(depth_points).name("Depth (m)"));
            });

            Plot::new("solenoid_plot").height(80.0).show(ui, |plot_ui| {
                plot_ui.line(Line::new(sol_points).name("Solenoid open"));
            });

            ui.separator();
            ui.horizontal(|ui| {
                ui.label(format!("t={:.2}s", last.t));
                ui.colored_label(
                    alarm_color(reading_alarm(&limits, &alarms, last.ppo2)),
                    format!("PPO2 {:.3}", last.ppo2),
                );
                for (i, r) in last.cells.iter().enumerate() {
                    ui.colored_label(
                        alarm_color(reading_alarm(&limits, &alarms, *r)),
                        format!("C{} {:.2}", i + 1, r),
                    );
                }
                ui.label(format!("depth={:.1} m", last.depth));
            });
        });
    }
}

fn main() -> eframe::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let native_options = eframe::NativeOptions::default();
    eframe::run_native(
        "CCR Loop Sim",
        native_options,
        Box::new(|_cc| Ok(Box::new(App::default()))),
    )
}
