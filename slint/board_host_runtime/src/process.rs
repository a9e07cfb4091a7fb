use crate::context::Notifier;
use crate::error::BridgeError;
use crate::protocol::{SIM_TO_HOST_LINE_CAP, read_documents};
use serde_json::Value;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{ChildStdin, Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulatorCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
}

impl SimulatorCommand {
    pub fn verilator(workspace_root: PathBuf) -> Self {
        Self {
            program: "python3".to_string(),
            args: vec!["verilator.py".to_string()],
            cwd: workspace_root,
        }
    }
}

struct LiveProcess {
    pid: u32,
    stdin: Option<ChildStdin>,
}

/// Owns at most one simulator child process.
///
/// Stdout is read as newline-delimited JSON and each document is handed to
/// the `on_data` callback in order. Stderr lines go to the operator. When the
/// child exits the handle is cleared; nothing restarts it.
pub struct ProcessBridge {
    command: SimulatorCommand,
    notifier: Arc<dyn Notifier>,
    live: Arc<Mutex<Option<LiveProcess>>>,
}

impl ProcessBridge {
    pub fn new(command: SimulatorCommand, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            command,
            notifier,
            live: Arc::new(Mutex::new(None)),
        }
    }

    fn lock_live(live: &Mutex<Option<LiveProcess>>) -> MutexGuard<'_, Option<LiveProcess>> {
        live.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_live(&self) -> bool {
        Self::lock_live(&self.live).is_some()
    }

    /// Spawns the simulator. Failures are reported to the operator and leave
    /// the handle unset; returns whether a process is now running.
    pub fn start<F>(&self, on_data: F) -> bool
    where
        F: Fn(Value) + Send + 'static,
    {
        if self.is_live() {
            log::warn!("simulator already running; ignoring start request");
            return true;
        }

        match self.spawn(on_data) {
            Ok(pid) => {
                log::info!(
                    "simulator started: pid={pid} `{} {}` in {}",
                    self.command.program,
                    self.command.args.join(" "),
                    self.command.cwd.display()
                );
                true
            }
            Err(err) => {
                log::error!("{err}");
                self.notifier.error(&err.to_string());
                false
            }
        }
    }

    fn spawn<F>(&self, on_data: F) -> Result<u32, BridgeError>
    where
        F: Fn(Value) + Send + 'static,
    {
        let mut child = Command::new(&self.command.program)
            .args(&self.command.args)
            .current_dir(&self.command.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                program: self.command.program.clone(),
                source,
            })?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().ok_or(BridgeError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(BridgeError::MissingPipe("stderr"))?;

        *Self::lock_live(&self.live) = Some(LiveProcess { pid, stdin });

        let stdout_notifier = self.notifier.clone();
        thread::spawn(move || {
            let result = read_documents(
                BufReader::new(stdout),
                SIM_TO_HOST_LINE_CAP,
                |document| match document {
                    Ok(value) => on_data(value),
                    Err(err) => {
                        log::warn!("dropping malformed simulator output: {err}");
                        stdout_notifier.error(&format!("malformed simulator output: {err}"));
                    }
                },
            );

            if let Err(err) = result {
                log::error!("simulator stdout reader stopped: {err}");
                stdout_notifier.error(&format!("simulator output stream failed: {err}"));
            }
        });

        let stderr_notifier = self.notifier.clone();
        thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) if line.trim().is_empty() => {}
                    Ok(line) => stderr_notifier.error(&line),
                    Err(err) => {
                        log::warn!("simulator stderr reader stopped: {err}");
                        break;
                    }
                }
            }
        });

        let live = self.live.clone();
        thread::spawn(move || {
            match child.wait() {
                Ok(status) => log::info!("simulator pid={pid} exited with {status}"),
                Err(err) => log::error!("failed to wait for simulator pid={pid}: {err}"),
            }

            let mut live = Self::lock_live(&live);
            if live.as_ref().is_some_and(|process| process.pid == pid) {
                *live = None;
            }
        });

        Ok(pid)
    }

    /// Writes `line` plus a newline to the simulator's stdin. Without a live
    /// process this does nothing.
    pub fn write(&self, line: &str) {
        let mut live = Self::lock_live(&self.live);
        let Some(stdin) = live.as_mut().and_then(|process| process.stdin.as_mut()) else {
            log::debug!("no live simulator; dropping input line");
            return;
        };

        log::debug!("simulator <- {line}");
        if let Err(err) = write_line(stdin, line) {
            log::warn!("failed to write to simulator stdin: {err}");
        }
    }

    /// Closes the simulator's stdin. The process itself is left to exit on
    /// its own.
    pub fn dispose(&self) {
        if let Some(process) = Self::lock_live(&self.live).as_mut() {
            if process.stdin.take().is_some() {
                log::info!("closed simulator stdin (pid={})", process.pid);
            }
        }
    }
}

fn write_line(stdin: &mut ChildStdin, line: &str) -> io::Result<()> {
    stdin.write_all(line.as_bytes())?;
    stdin.write_all(b"\n")?;
    stdin.flush()
}

impl Drop for ProcessBridge {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::RecordingNotifier;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    const WAIT: Duration = Duration::from_secs(10);

    fn shell(script: &str) -> SimulatorCommand {
        SimulatorCommand {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            cwd: std::env::temp_dir(),
        }
    }

    fn wait_until(condition: impl Fn() -> bool) -> bool {
        let deadline = Instant::now() + WAIT;
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(10));
        }
        condition()
    }

    #[test]
    fn stdout_documents_arrive_in_order() {
        let notifier = Arc::new(RecordingNotifier::default());
        let bridge = ProcessBridge::new(
            shell(r#"printf '{"n":1}\n{"n":2}\nbroken\n{"n":3}\n'"#),
            notifier.clone(),
        );
        let (tx, rx) = mpsc::channel();

        assert!(bridge.start(move |value| {
            let _ = tx.send(value);
        }));

        let received: Vec<Value> = (0..3)
            .map(|_| rx.recv_timeout(WAIT).expect("simulator document"))
            .collect();
        assert_eq!(received[0]["n"], 1);
        assert_eq!(received[1]["n"], 2);
        assert_eq!(received[2]["n"], 3);
        assert!(wait_until(|| !notifier.errors().is_empty()));
        assert!(notifier.errors()[0].contains("malformed"));
    }

    #[test]
    fn stdin_lines_are_echoed_back() {
        let notifier = Arc::new(RecordingNotifier::default());
        let bridge = ProcessBridge::new(shell("read line; echo \"$line\""), notifier);
        let (tx, rx) = mpsc::channel();

        assert!(bridge.start(move |value| {
            let _ = tx.send(value);
        }));
        bridge.write(r#"{"command":"outputs"}"#);

        let echoed = rx.recv_timeout(WAIT).expect("echoed document");
        assert_eq!(echoed["command"], "outputs");
    }

    #[test]
    fn stderr_is_surfaced_and_exit_clears_handle() {
        let notifier = Arc::new(RecordingNotifier::default());
        let bridge = ProcessBridge::new(shell("echo boom >&2"), notifier.clone());

        assert!(bridge.start(|_| {}));
        assert!(wait_until(|| !bridge.is_live()));
        assert!(wait_until(|| notifier.errors().iter().any(|e| e == "boom")));

        bridge.write("ignored");
        bridge.dispose();
        bridge.dispose();
    }

    #[test]
    fn spawn_failure_is_reported_not_thrown() {
        let notifier = Arc::new(RecordingNotifier::default());
        let bridge = ProcessBridge::new(
            SimulatorCommand {
                program: "definitely-not-a-simulator-binary".to_string(),
                args: Vec::new(),
                cwd: std::env::temp_dir(),
            },
            notifier.clone(),
        );

        assert!(!bridge.start(|_| {}));
        assert!(!bridge.is_live());
        assert_eq!(notifier.errors().len(), 1);
        bridge.write("still a no-op");
    }

    #[test]
    fn dispose_ends_stdin() {
        let notifier = Arc::new(RecordingNotifier::default());
        let bridge = ProcessBridge::new(shell("cat; echo '{\"closed\":true}'"), notifier);
        let (tx, rx) = mpsc::channel();

        assert!(bridge.start(move |value| {
            let _ = tx.send(value);
        }));
        bridge.dispose();

        let last = rx.recv_timeout(WAIT).expect("document after stdin closed");
        assert_eq!(last["closed"], true);
        assert!(wait_until(|| !bridge.is_live()));
    }
}
