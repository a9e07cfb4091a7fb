//! Minimal Debug Adapter Protocol client: enough to launch an adapter, send
//! custom requests and receive its custom events.

use crate::error::{BridgeError, Result};
use crate::launch::{AdapterDescriptor, LaunchConfig};
use crate::protocol::json_error;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

pub const ADAPTER_FRAME_CAP: usize = 16 * 1_048_576;

const CONTENT_LENGTH: &str = "Content-Length";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum DapMessage {
    Request {
        seq: u64,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        arguments: Option<Value>,
    },
    Response {
        seq: u64,
        request_seq: u64,
        success: bool,
        command: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
    Event {
        seq: u64,
        event: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        body: Option<Value>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Custom { event: String, body: Value },
    RequestFailed { command: String, message: String },
    Terminated,
}

/// A live debug session the relay can forward requests into.
pub trait DebugSession: Send + Sync {
    fn id(&self) -> u64;
    fn custom_request(&self, command: &str, arguments: Value) -> Result<()>;
}

pub fn read_frame(reader: &mut impl BufRead, max_payload: usize) -> io::Result<Vec<u8>> {
    let mut content_length = None;
    let mut header = String::new();

    loop {
        header.clear();
        if reader.read_line(&mut header)? == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "stream ended inside frame header",
            ));
        }

        let line = header.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            break;
        }

        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                let len = value.trim().parse::<usize>().map_err(|_| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid content length: {value}"),
                    )
                })?;
                content_length = Some(len);
            }
        }
    }

    let len = content_length.ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidData, "frame header has no content length")
    })?;
    if len > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} > {max_payload}"),
        ));
    }

    let mut payload = vec![0_u8; len];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_frame(writer: &mut impl Write, payload: &[u8], max_payload: usize) -> io::Result<()> {
    if payload.len() > max_payload {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {} > {}", payload.len(), max_payload),
        ));
    }

    write!(writer, "{CONTENT_LENGTH}: {}\r\n\r\n", payload.len())?;
    writer.write_all(payload)?;
    Ok(())
}

pub fn encode_message(message: &DapMessage) -> io::Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(json_error)
}

pub fn decode_message(payload: &[u8]) -> io::Result<DapMessage> {
    serde_json::from_slice(payload).map_err(json_error)
}

pub fn writer_loop(rx: Receiver<DapMessage>, mut writer: impl Write) -> io::Result<()> {
    for message in rx {
        let payload = encode_message(&message)?;
        write_frame(&mut writer, &payload, ADAPTER_FRAME_CAP)?;
        writer.flush()?;
    }

    Ok(())
}

pub fn reader_loop<F>(mut reader: impl BufRead, mut on_message: F) -> io::Result<()>
where
    F: FnMut(DapMessage),
{
    loop {
        match read_frame(&mut reader, ADAPTER_FRAME_CAP) {
            Ok(payload) => match decode_message(&payload) {
                Ok(message) => on_message(message),
                Err(err) => log::warn!("dropping undecodable adapter message: {err}"),
            },
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(err) => return Err(err),
        }
    }
}

/// Maps one adapter message to the session event it produces, if any.
fn is_initialized_event(message: &DapMessage) -> bool {
    matches!(message, DapMessage::Event { event, .. } if event == "initialized")
}

pub fn session_event(message: DapMessage) -> Option<SessionEvent> {
    match message {
        DapMessage::Event { event, body, .. } => match event.as_str() {
            "terminated" | "exited" => Some(SessionEvent::Terminated),
            "output" => {
                let output = body
                    .as_ref()
                    .and_then(|body| body.get("output"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                log::info!("adapter output: {}", output.trim_end());
                None
            }
            "initialized" | "stopped" | "continued" | "thread" | "breakpoint" | "process" => {
                log::debug!("adapter event: {event}");
                None
            }
            _ => Some(SessionEvent::Custom {
                event,
                body: body.unwrap_or(Value::Null),
            }),
        },
        DapMessage::Response {
            success: false,
            command,
            message,
            ..
        } => Some(SessionEvent::RequestFailed {
            message: message.unwrap_or_else(|| format!("{command} failed")),
            command,
        }),
        DapMessage::Response { command, .. } => {
            log::debug!("adapter response: {command}");
            None
        }
        DapMessage::Request { command, .. } => {
            log::warn!("ignoring reverse request from adapter: {command}");
            None
        }
    }
}

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Client end of a debug session with an adapter child process.
pub struct DapSession {
    id: u64,
    next_seq: AtomicU64,
    tx: Mutex<Option<Sender<DapMessage>>>,
    closed: Arc<AtomicBool>,
    child: Mutex<Option<Child>>,
    handshake: Mutex<Handshake>,
}

/// `configurationDone` goes out once the launch request is queued and the
/// adapter has reported `initialized`, in whichever order those happen.
#[derive(Debug, Default)]
struct Handshake {
    armed: bool,
    launched: bool,
    initialized: bool,
}

impl DapSession {
    /// Spawns the adapter, wires its stdio and sends the launch handshake.
    /// `configurationDone` follows the launch request once the adapter
    /// reports `initialized`. `on_event` runs on the reader thread;
    /// `Terminated` is delivered at most once.
    pub fn start<F>(
        descriptor: &AdapterDescriptor,
        launch: &LaunchConfig,
        on_event: F,
    ) -> Result<Arc<DapSession>>
    where
        F: Fn(SessionEvent) + Send + 'static,
    {
        let mut child = Command::new(&descriptor.executable)
            .args(&descriptor.args)
            .current_dir(&descriptor.cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|source| BridgeError::Spawn {
                program: descriptor.executable.display().to_string(),
                source,
            })?;

        let stdin = child.stdin.take().ok_or(BridgeError::MissingPipe("stdin"))?;
        let stdout = child.stdout.take().ok_or(BridgeError::MissingPipe("stdout"))?;
        let stderr = child.stderr.take().ok_or(BridgeError::MissingPipe("stderr"))?;

        let session = Self::open(stdin, BufReader::new(stdout), Some(child), true, on_event);

        thread::spawn(move || {
            for line in BufReader::new(stderr).lines() {
                match line {
                    Ok(line) => log::warn!("adapter stderr: {line}"),
                    Err(_) => break,
                }
            }
        });

        session.send_request("initialize", Some(initialize_arguments()))?;
        session.send_request("launch", Some(launch_arguments(launch)))?;
        session.advance_handshake(|handshake| handshake.launched = true);
        log::info!(
            "debug session {} started with adapter {}",
            session.id,
            descriptor.executable.display()
        );

        Ok(session)
    }

    /// Runs a session over arbitrary streams. The child, when present, is
    /// reaped on [`DapSession::disconnect`].
    pub fn attach<W, R, F>(writer: W, reader: R, child: Option<Child>, on_event: F) -> Arc<DapSession>
    where
        W: Write + Send + 'static,
        R: BufRead + Send + 'static,
        F: Fn(SessionEvent) + Send + 'static,
    {
        Self::open(writer, reader, child, false, on_event)
    }

    fn open<W, R, F>(
        writer: W,
        reader: R,
        child: Option<Child>,
        configure_on_initialized: bool,
        on_event: F,
    ) -> Arc<DapSession>
    where
        W: Write + Send + 'static,
        R: BufRead + Send + 'static,
        F: Fn(SessionEvent) + Send + 'static,
    {
        let (tx, rx) = mpsc::channel();
        let closed = Arc::new(AtomicBool::new(false));
        let session = Arc::new(DapSession {
            id: NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed),
            next_seq: AtomicU64::new(1),
            tx: Mutex::new(Some(tx)),
            closed: closed.clone(),
            child: Mutex::new(child),
            handshake: Mutex::new(Handshake {
                armed: configure_on_initialized,
                ..Handshake::default()
            }),
        });

        let session_id = session.id;
        thread::spawn(move || {
            if let Err(err) = writer_loop(rx, writer) {
                log::warn!("debug session {session_id} writer stopped: {err}");
            }
        });

        let weak_session: Weak<DapSession> = Arc::downgrade(&session);
        thread::spawn(move || {
            let terminate = |on_event: &F| {
                if !closed.swap(true, Ordering::AcqRel) {
                    on_event(SessionEvent::Terminated);
                }
            };

            let result = reader_loop(reader, |message| {
                if is_initialized_event(&message) {
                    if let Some(session) = weak_session.upgrade() {
                        session.advance_handshake(|handshake| handshake.initialized = true);
                    }
                }
                match session_event(message) {
                    Some(SessionEvent::Terminated) => terminate(&on_event),
                    Some(event) => on_event(event),
                    None => {}
                }
            });

            if let Err(err) = result {
                log::error!("debug session {session_id} reader stopped: {err}");
            }
            terminate(&on_event);
        });

        session
    }

    fn advance_handshake(&self, step: impl FnOnce(&mut Handshake)) {
        let ready = {
            let mut handshake = self.handshake.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            step(&mut handshake);
            let ready = handshake.armed && handshake.launched && handshake.initialized;
            if ready {
                handshake.armed = false;
            }
            ready
        };

        if !ready {
            return;
        }
        if let Err(err) = self.send_request("configurationDone", None) {
            log::warn!("debug session {}: configurationDone not sent: {err}", self.id);
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn send_request(&self, command: &str, arguments: Option<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(BridgeError::SessionClosed(self.id));
        }

        let tx = self.tx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let Some(tx) = tx.as_ref() else {
            return Err(BridgeError::SessionClosed(self.id));
        };

        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
        log::debug!("debug session {} -> {command} (seq={seq})", self.id);
        tx.send(DapMessage::Request {
            seq,
            command: command.to_string(),
            arguments,
        })
        .map_err(|_| BridgeError::SessionClosed(self.id))
    }

    /// Asks the adapter to end the session, then closes its input.
    pub fn disconnect(&self) {
        if let Err(err) = self.send_request("disconnect", Some(json!({ "terminateDebuggee": true })))
        {
            log::debug!("disconnect not sent: {err}");
        }

        self.tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();

        let child = self
            .child
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(mut child) = child {
            thread::spawn(move || match child.wait() {
                Ok(status) => log::info!("debug adapter exited with {status}"),
                Err(err) => log::warn!("failed to wait for debug adapter: {err}"),
            });
        }
    }
}

impl DebugSession for DapSession {
    fn id(&self) -> u64 {
        self.id
    }

    fn custom_request(&self, command: &str, arguments: Value) -> Result<()> {
        self.send_request(command, Some(arguments))
    }
}

fn initialize_arguments() -> Value {
    json!({
        "clientID": "board_host",
        "clientName": "Board Host",
        "adapterID": "cs200",
        "linesStartAt1": true,
        "columnsStartAt1": true,
        "pathFormat": "path",
        "supportsRunInTerminalRequest": false,
    })
}

fn launch_arguments(launch: &LaunchConfig) -> Value {
    json!({
        "name": launch.name,
        "type": launch.kind,
        "request": launch.request,
        "program": launch.program,
        "stopOnEntry": launch.stop_on_entry,
    })
}
