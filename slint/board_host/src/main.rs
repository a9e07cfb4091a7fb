use anyhow::{Context, anyhow};
use board_host_runtime::board::{InputState, OutputState};
use board_host_runtime::context::Notice;
use board_host_runtime::launch::{ActiveDocument, LaunchConfig, debug_file};
use board_host_runtime::{HostConfig, PanelBindings, TERMINAL_SCROLLBACK_LINES, append_scrollback};
use clap::Parser;
use clap_verbosity_flag::{Verbosity, WarnLevel};
use slint::{Color, ModelRc, VecModel};
use std::path::{Path, PathBuf};

slint::include_modules!();

/// Virtual FPGA board driven by a simulator process or a debug adapter.
#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Workspace root the simulator and build commands run in
    #[arg(short, long, value_name = "DIR")]
    workspace: Option<PathBuf>,

    /// Debug this file with the board adapter
    #[arg(short, long, value_name = "PROGRAM")]
    program: Option<PathBuf>,

    /// Launch configuration as a JSON file, used instead of `--program`
    #[arg(long, value_name = "LAUNCH_JSON", conflicts_with = "program")]
    launch_config: Option<PathBuf>,

    /// Adapter executable to use instead of searching for `Vtb`
    #[arg(long, value_name = "ADAPTER")]
    executable: Option<PathBuf>,

    /// File that stands in for the editor's active document
    #[arg(long, value_name = "FILE", requires = "language")]
    document: Option<PathBuf>,

    /// Language id of `--document` (riscv, assembly, verilog, "system verilog")
    #[arg(long, value_name = "LANGUAGE_ID")]
    language: Option<String>,

    /// Do not start the simulator process
    #[arg(long)]
    no_simulator: bool,

    /// Simulator program (defaults to python3)
    #[arg(long, value_name = "PROGRAM")]
    sim_program: Option<String>,

    /// Simulator arguments (defaults to verilator.py)
    #[arg(long, value_name = "ARG", num_args = 1.., allow_hyphen_values = true)]
    sim_args: Option<Vec<String>>,

    /// Capacity of the panel to host message queue
    #[arg(long, value_name = "MESSAGES")]
    queue_cap: Option<usize>,

    #[command(flatten)]
    verbosity: Verbosity<WarnLevel>,
}

impl Cli {
    /// Layers the command line over the environment and built-in defaults.
    fn into_config(self) -> anyhow::Result<HostConfig> {
        let mut config = HostConfig::from_env();

        if let Some(workspace) = self.workspace {
            config.set_workspace_root(workspace);
        }

        if self.no_simulator {
            config.simulator = None;
        } else if let Some(simulator) = config.simulator.as_mut() {
            if let Some(program) = self.sim_program {
                simulator.program = program;
            }
            if let Some(args) = self.sim_args {
                simulator.args = args;
            }
        }

        match self.queue_cap {
            Some(0) => return Err(anyhow!("--queue-cap must be at least 1")),
            Some(cap) => config.outbound_queue_cap = cap,
            None => {}
        }

        let launch = match (self.launch_config, self.program) {
            (Some(path), _) => Some(read_launch_config(&path)?),
            (None, Some(program)) => Some(debug_file(program)),
            (None, None) => None,
        };
        let executable = self.executable;
        config.launch = launch.map(|mut launch| {
            if executable.is_some() {
                launch.executable = executable;
            }
            launch
        });

        config.active_document = self
            .document
            .zip(self.language)
            .map(|(path, language_id)| ActiveDocument { path, language_id });

        Ok(config)
    }
}

fn read_launch_config(path: &Path) -> anyhow::Result<LaunchConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read launch configuration {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid launch configuration {}", path.display()))
}

struct Bindings;

fn led_colour((r, g, b): (bool, bool, bool)) -> Color {
    if !(r || g || b) {
        return Color::from_rgb_u8(0x30, 0x30, 0x30);
    }

    let level = |on: bool| if on { 0xff } else { 0x00 };
    Color::from_rgb_u8(level(r), level(g), level(b))
}

fn bool_model(values: &[bool]) -> ModelRc<bool> {
    ModelRc::new(VecModel::from(values.to_vec()))
}

impl PanelBindings for Bindings {
    type Ui = AppWindow;

    fn new_ui() -> Result<AppWindow, slint::PlatformError> {
        let ui = AppWindow::new()?;
        Self::render_inputs(&ui, &InputState::default());
        Self::render_outputs(&ui, &OutputState::default());
        Ok(ui)
    }

    fn bind_button<F>(ui: &AppWindow, handler: F)
    where
        F: Fn(String, bool) + Send + 'static,
    {
        ui.on_button_changed(move |name, pressed| handler(name.to_string(), pressed));
    }

    fn bind_joystick<F>(ui: &AppWindow, handler: F)
    where
        F: Fn(String, bool) + Send + 'static,
    {
        ui.on_joystick_changed(move |name, active| handler(name.to_string(), active));
    }

    fn bind_switch<F>(ui: &AppWindow, handler: F)
    where
        F: Fn(usize) + Send + 'static,
    {
        ui.on_switch_toggled(move |index| match usize::try_from(index) {
            Ok(index) => handler(index),
            Err(_) => log::warn!("ignoring negative switch index {index}"),
        });
    }

    fn bind_terminal_input<F>(ui: &AppWindow, handler: F)
    where
        F: Fn(String) + Send + 'static,
    {
        ui.on_terminal_submit(move |line| handler(line.to_string()));
    }

    fn render_inputs(ui: &AppWindow, inputs: &InputState) {
        let buttons = inputs.button;
        let joystick = inputs.joystick;

        ui.set_switches(bool_model(&inputs.dip_switches.positions()));
        ui.set_buttons(bool_model(
            &[
                buttons.top,
                buttons.bottom,
                buttons.left,
                buttons.right,
                buttons.center,
            ]
            .map(|pressed| pressed.unwrap_or(false)),
        ));
        ui.set_joystick(bool_model(
            &[
                joystick.up,
                joystick.down,
                joystick.left,
                joystick.right,
                joystick.pressed,
            ]
            .map(|active| active.unwrap_or(false)),
        ));
    }

    fn render_outputs(ui: &AppWindow, outputs: &OutputState) {
        let leds: Vec<Color> = outputs.led_cells().into_iter().map(led_colour).collect();
        ui.set_leds(ModelRc::new(VecModel::from(leds)));
        ui.set_segments(bool_model(&outputs.segment_flags()));
    }

    fn append_terminal(ui: &AppWindow, line: &str) {
        let text = append_scrollback(&ui.get_terminal_text(), line, TERMINAL_SCROLLBACK_LINES);
        ui.set_terminal_text(text.into());
    }

    fn set_status(ui: &AppWindow, notice: &Notice) {
        let (text, is_error) = match notice {
            Notice::Info(message) => (message, false),
            Notice::Error(message) => (message, true),
        };
        ui.set_status_text(text.as_str().into());
        ui.set_status_error(is_error);
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::new()
        .format_timestamp(None)
        .filter_level(cli.verbosity.log_level_filter())
        .init();

    let config = cli.into_config()?;
    log::info!(
        "board host starting in {}",
        config
            .workspace_root()
            .map(|root| root.display().to_string())
            .unwrap_or_default()
    );

    board_host_runtime::run::<Bindings>(config).map_err(|err| anyhow!("board host fatal error: {err}"))
}
