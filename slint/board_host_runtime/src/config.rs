use crate::launch::{ActiveDocument, LaunchConfig};
use crate::process::SimulatorCommand;
use std::path::PathBuf;

pub const DEFAULT_OUTBOUND_QUEUE_CAP: usize = 256;

pub const ENV_WORKSPACE: &str = "BOARD_HOST_WORKSPACE";
pub const ENV_SIM_PROGRAM: &str = "BOARD_HOST_SIM_PROGRAM";
pub const ENV_SIM_ARGS: &str = "BOARD_HOST_SIM_ARGS";
pub const ENV_OUTBOUND_QUEUE_CAP: &str = "BOARD_HOST_OUTBOUND_QUEUE_CAP";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    /// First entry is the workspace root the simulator runs in.
    pub workspace_folders: Vec<PathBuf>,
    pub simulator: Option<SimulatorCommand>,
    pub outbound_queue_cap: usize,
    pub launch: Option<LaunchConfig>,
    pub active_document: Option<ActiveDocument>,
}

impl HostConfig {
    pub fn from_env() -> Self {
        Self::from_vars(|key| std::env::var(key).ok())
    }

    /// Builds the environment layer from an arbitrary variable lookup.
    pub fn from_vars<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let workspace_root = lookup(ENV_WORKSPACE)
            .filter(|raw| !raw.is_empty())
            .map(PathBuf::from)
            .or_else(|| std::env::current_dir().ok())
            .unwrap_or_else(|| PathBuf::from("."));

        let mut simulator = SimulatorCommand::verilator(workspace_root.clone());
        if let Some(program) = lookup(ENV_SIM_PROGRAM).filter(|raw| !raw.is_empty()) {
            simulator.program = program;
        }
        if let Some(args) = lookup(ENV_SIM_ARGS) {
            simulator.args = args.split_whitespace().map(str::to_string).collect();
        }

        let outbound_queue_cap = lookup(ENV_OUTBOUND_QUEUE_CAP)
            .and_then(|raw| raw.parse::<usize>().ok())
            .filter(|value| *value > 0)
            .unwrap_or(DEFAULT_OUTBOUND_QUEUE_CAP);

        Self {
            workspace_folders: vec![workspace_root],
            simulator: Some(simulator),
            outbound_queue_cap,
            launch: None,
            active_document: None,
        }
    }

    pub fn workspace_root(&self) -> Option<&PathBuf> {
        self.workspace_folders.first()
    }

    /// Moves the workspace root, keeping the simulator's cwd in step.
    pub fn set_workspace_root(&mut self, root: PathBuf) {
        if let Some(simulator) = self.simulator.as_mut() {
            simulator.cwd = root.clone();
        }

        match self.workspace_folders.first_mut() {
            Some(first) => *first = root,
            None => self.workspace_folders.push(root),
        }
    }
}
