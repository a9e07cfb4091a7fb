use crate::context::Notifier;
use serde::{Deserialize, Serialize};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;
use thiserror::Error;

pub const DEBUG_TYPE: &str = "cs200";
pub const ADAPTER_EXECUTABLE: &str = "Vtb";

const DEBUGGABLE_LANGUAGES: &[&str] = &["riscv", "assembly", "verilog", "system verilog"];

#[derive(Debug, Error)]
pub enum LaunchError {
    #[error("failed to run `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("{stderr}")]
    Failed { command: String, stderr: String },
    #[error("program path has no directory or file name: {0}")]
    BadProgram(PathBuf),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LaunchConfig {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub program: Option<PathBuf>,
    #[serde(rename = "stopOnEntry", default)]
    pub stop_on_entry: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executable: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActiveDocument {
    pub path: PathBuf,
    pub language_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterDescriptor {
    pub executable: PathBuf,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

/// Launch configuration for debugging one file directly.
pub fn debug_file(path: impl Into<PathBuf>) -> LaunchConfig {
    LaunchConfig {
        kind: Some(DEBUG_TYPE.to_string()),
        name: Some("Debug File".to_string()),
        request: Some("launch".to_string()),
        program: Some(path.into()),
        stop_on_entry: true,
        executable: None,
    }
}

/// Fills an empty configuration from the active document and rejects one
/// that still has no program.
pub fn resolve_launch_config(
    mut config: LaunchConfig,
    active: Option<&ActiveDocument>,
    notifier: &dyn Notifier,
) -> Option<LaunchConfig> {
    let unconfigured = config.kind.is_none() && config.request.is_none() && config.name.is_none();

    if unconfigured {
        if let Some(document) =
            active.filter(|doc| DEBUGGABLE_LANGUAGES.contains(&doc.language_id.as_str()))
        {
            config.kind = Some(DEBUG_TYPE.to_string());
            config.name = Some("Launch".to_string());
            config.request = Some("launch".to_string());
            config.program = Some(document.path.clone());
            config.stop_on_entry = true;
        }
    }

    if config.program.is_none() {
        notifier.info("Cannot find a program to debug");
        return None;
    }

    Some(config)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub stderr: String,
}

/// Runs build tools. Calls block until the command finishes.
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[&str], cwd: &Path) -> io::Result<CommandOutput>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    fn run(&self, program: &str, args: &[&str], cwd: &Path) -> io::Result<CommandOutput> {
        let output = Command::new(program).args(args).current_dir(cwd).output()?;
        Ok(CommandOutput {
            success: output.status.success(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Directory a program builds and runs in. A bare file name lives in `.`.
fn program_dir(program: &Path) -> Option<&Path> {
    program
        .parent()
        .map(|dir| if dir.as_os_str().is_empty() { Path::new(".") } else { dir })
}

/// `make clean` then `make build_<stem>` in the program's directory.
pub fn build_program(runner: &dyn CommandRunner, program: &Path) -> Result<(), LaunchError> {
    let dir =
        program_dir(program).ok_or_else(|| LaunchError::BadProgram(program.to_path_buf()))?;
    let stem = program
        .file_stem()
        .and_then(|stem| stem.to_str())
        .ok_or_else(|| LaunchError::BadProgram(program.to_path_buf()))?;
    let target = format!("build_{stem}");

    for args in [vec!["clean"], vec![target.as_str()]] {
        let command = format!("make {}", args.join(" "));
        log::info!("running `{command}` in {}", dir.display());

        let output = runner
            .run("make", &args, dir)
            .map_err(|source| LaunchError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.success {
            return Err(LaunchError::Failed {
                command,
                stderr: output.stderr,
            });
        }
    }

    Ok(())
}

/// Search order: explicit executable, `Vtb` next to the program, then `Vtb`
/// in each workspace folder.
pub fn find_adapter_executable(
    program: &Path,
    explicit: Option<&Path>,
    workspace_folders: &[PathBuf],
) -> Option<PathBuf> {
    if let Some(explicit) = explicit {
        return Some(explicit.to_path_buf());
    }

    let beside_program = program_dir(program).map(|dir| dir.join(ADAPTER_EXECUTABLE));
    beside_program
        .into_iter()
        .chain(
            workspace_folders
                .iter()
                .map(|folder| folder.join(ADAPTER_EXECUTABLE)),
        )
        .find(|candidate| candidate.is_file())
}

/// Build, then locate the adapter. Every failure is reported through
/// `notifier` and yields `None`.
pub fn prepare_launch(
    runner: &dyn CommandRunner,
    config: &LaunchConfig,
    workspace_folders: &[PathBuf],
    notifier: &dyn Notifier,
) -> Option<AdapterDescriptor> {
    let Some(program) = config.program.as_deref() else {
        notifier.info("Cannot find a program to debug");
        return None;
    };

    if let Err(err) = build_program(runner, program) {
        log::error!("build failed for {}: {err:?}", program.display());
        notifier.error(&err.to_string());
        return None;
    }

    let Some(executable) =
        find_adapter_executable(program, config.executable.as_deref(), workspace_folders)
    else {
        notifier.error(&format!(
            "Could not find the debug adapter executable `{ADAPTER_EXECUTABLE}` next to {} or in the workspace",
            program.display()
        ));
        return None;
    };

    let cwd = program_dir(program)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    Some(AdapterDescriptor {
        executable,
        args: Vec::new(),
        cwd,
    })
}
