use board_host_runtime::board::{InputState, OutputState};
use board_host_runtime::context::{HostContext, Notice, Notifier, Panel, PanelFactory};
use board_host_runtime::dap::{DapSession, DebugSession, SessionEvent};
use board_host_runtime::launch::{
    AdapterDescriptor, CommandOutput, CommandRunner, debug_file, prepare_launch,
};
use board_host_runtime::process::{ProcessBridge, SimulatorCommand};
use board_host_runtime::protocol::{HostMessage, PanelMessage, host_messages_for_document};
use board_host_runtime::relay::{DebugSessionRelay, MessageHub};
use board_host_runtime::sync::{PanelRenderer, PanelSync, host_channel};
use serde_json::json;
use std::io;
use std::path::Path;
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

#[derive(Default)]
struct Notices(Mutex<Vec<Notice>>);

impl Notices {
    fn errors(&self) -> Vec<String> {
        self.0
            .lock()
            .expect("notices lock")
            .iter()
            .filter_map(|notice| match notice {
                Notice::Error(message) => Some(message.clone()),
                Notice::Info(_) => None,
            })
            .collect()
    }
}

impl Notifier for Notices {
    fn notify(&self, notice: Notice) {
        self.0.lock().expect("notices lock").push(notice);
    }
}

#[derive(Default)]
struct Terminal(Mutex<Vec<String>>);

impl PanelRenderer for Terminal {
    fn render_inputs(&self, _inputs: &InputState) {}

    fn render_outputs(&self, _outputs: &OutputState) {}

    fn append_terminal(&self, line: &str) {
        self.0.lock().expect("terminal lock").push(line.to_string());
    }
}

#[derive(Debug)]
enum PanelEvent {
    Created,
    Posted(HostMessage),
    Disposed,
}

struct ChannelPanel(Sender<PanelEvent>);

impl Panel for ChannelPanel {
    fn post_message(&self, message: HostMessage) {
        let _ = self.0.send(PanelEvent::Posted(message));
    }

    fn dispose(&self) {
        let _ = self.0.send(PanelEvent::Disposed);
    }
}

struct ChannelPanelFactory(Sender<PanelEvent>);

impl PanelFactory for ChannelPanelFactory {
    fn create_panel(&self) -> Box<dyn Panel> {
        let _ = self.0.send(PanelEvent::Created);
        Box::new(ChannelPanel(self.0.clone()))
    }
}

fn shell(script: &str, cwd: &Path) -> SimulatorCommand {
    SimulatorCommand {
        program: "sh".to_string(),
        args: vec!["-c".to_string(), script.to_string()],
        cwd: cwd.to_path_buf(),
    }
}

fn drain<T>(rx: &Receiver<T>) -> Vec<T> {
    let mut items = Vec::new();
    while let Ok(item) = rx.recv_timeout(WAIT) {
        items.push(item);
    }
    items
}

#[test]
fn simulator_documents_drive_the_board_and_skip_garbage() {
    let dir = tempfile::tempdir().expect("tempdir");
    let notices = Arc::new(Notices::default());
    let bridge = ProcessBridge::new(
        shell(
            r#"printf '%s\n' '{"ledArray":{"r":[1,0]},"sevenSegment":{"zero":5}}' 'not json' '{"sevenSegment":{"one":6}}' '{"cycle":3}'"#,
            dir.path(),
        ),
        notices.clone(),
    );

    let (tx, rx) = mpsc::channel();
    assert!(bridge.start(move |document| {
        for message in host_messages_for_document(&document) {
            let _ = tx.send(message);
        }
    }));
    let messages = drain(&rx);

    let (channel, _inbox) = host_channel(16);
    let terminal = Arc::new(Terminal::default());
    let mut panel = PanelSync::mount(channel, terminal.clone());
    for message in messages {
        panel.handle_host_message(message);
    }

    let output = panel.view().output();
    assert_eq!(output.led_array.r, Some(vec![1, 0]));
    assert_eq!(output.seven_segment.zero, Some(5));
    assert_eq!(output.seven_segment.one, Some(6));
    assert_eq!(terminal.0.lock().expect("terminal lock").len(), 3);

    let errors = notices.errors();
    assert_eq!(errors.len(), 1, "errors: {errors:?}");
    assert!(errors[0].starts_with("malformed simulator output"));
}

#[test]
fn terminal_input_reaches_simulator_stdin() {
    let dir = tempfile::tempdir().expect("tempdir");
    let bridge = ProcessBridge::new(
        shell(r#"read line; printf '{"echo":"%s"}\n' "$line""#, dir.path()),
        Arc::new(Notices::default()),
    );

    let (tx, rx) = mpsc::channel();
    assert!(bridge.start(move |document| {
        let _ = tx.send(document);
    }));
    bridge.write("runcycle");

    let documents = drain(&rx);
    assert_eq!(documents, [json!({"echo": "runcycle"})]);
}

#[test]
fn switch_toggles_flow_to_the_debug_session_in_order() {
    struct Forwarded(Mutex<Vec<serde_json::Value>>);

    impl DebugSession for Forwarded {
        fn id(&self) -> u64 {
            7
        }

        fn custom_request(
            &self,
            command: &str,
            arguments: serde_json::Value,
        ) -> board_host_runtime::Result<()> {
            assert_eq!(command, "updateInput");
            self.0.lock().expect("forwarded lock").push(arguments);
            Ok(())
        }
    }

    let (panel_tx, _panel_rx) = mpsc::channel();
    let context = Arc::new(HostContext::new(
        Arc::new(Notices::default()),
        Box::new(ChannelPanelFactory(panel_tx)),
    ));
    let hub = Arc::new(MessageHub::default());
    let mut relay = DebugSessionRelay::new(context, hub.clone());
    let session = Arc::new(Forwarded(Mutex::new(Vec::new())));
    relay.session_started(session.clone());

    let (channel, inbox) = host_channel(16);
    let mut panel = PanelSync::mount(channel, Arc::new(Terminal::default()));
    panel.toggle_switch(0).expect("switch 0");
    panel.toggle_switch(7).expect("switch 7");
    assert!(panel.toggle_switch(8).is_err());

    while let Some(message) = inbox.try_recv() {
        assert!(matches!(message, PanelMessage::UpdateInput { .. }));
        assert!(hub.dispatch(&message));
    }

    let forwarded = session.0.lock().expect("forwarded lock");
    let switches: Vec<_> = forwarded.iter().map(|args| args["dip_switches"].clone()).collect();
    assert_eq!(switches, [json!(128), json!(129)]);
}

struct FailingBuild;

impl CommandRunner for FailingBuild {
    fn run(&self, _program: &str, args: &[&str], _cwd: &Path) -> io::Result<CommandOutput> {
        Ok(CommandOutput {
            success: args != ["clean"],
            stderr: "make: *** No rule to make target 'clean'.  Stop.".to_string(),
        })
    }
}

#[test]
fn failed_build_aborts_launch_with_its_stderr() {
    let dir = tempfile::tempdir().expect("tempdir");
    let notices = Notices::default();
    let config = debug_file(dir.path().join("blink.s"));

    let descriptor = prepare_launch(&FailingBuild, &config, &[dir.path().to_path_buf()], &notices);

    assert!(descriptor.is_none());
    assert_eq!(
        notices.errors(),
        ["make: *** No rule to make target 'clean'.  Stop."]
    );
}

fn dap_frame(message: serde_json::Value) -> String {
    let body = message.to_string();
    format!("Content-Length: {}\r\n\r\n{body}", body.len())
}

#[cfg(unix)]
#[test]
fn adapter_board_updates_reach_the_panel_until_termination() {
    use std::fs;
    use std::path::PathBuf;

    let dir = tempfile::tempdir().expect("tempdir");
    let frames = [
        dap_frame(json!({"seq": 1, "type": "event", "event": "initialized"})),
        dap_frame(json!({
            "seq": 2,
            "type": "event",
            "event": "boardUpdate",
            "body": {"ledArray": {"r": [1, 0]}, "sevenSegment": {"zero": 5}}
        })),
    ]
    .concat();

    let script = dir.path().join("adapter.sh");
    fs::write(&script, format!("printf '%s' '{frames}'\ncat > requests.log\n"))
        .expect("write adapter script");

    let (panel_tx, panel_rx) = mpsc::channel();
    let (exit_tx, exit_rx) = mpsc::channel();
    let exit_tx = Mutex::new(exit_tx);
    let context = Arc::new(
        HostContext::new(
            Arc::new(Notices::default()),
            Box::new(ChannelPanelFactory(panel_tx)),
        )
        .with_exit_hook(Box::new(move || {
            let _ = exit_tx.lock().expect("exit lock").send(());
        })),
    );
    let hub = Arc::new(MessageHub::default());
    let relay = Arc::new(Mutex::new(DebugSessionRelay::new(context.clone(), hub.clone())));

    let descriptor = AdapterDescriptor {
        executable: PathBuf::from("sh"),
        args: vec![script.display().to_string()],
        cwd: dir.path().to_path_buf(),
    };
    let event_relay = relay.clone();
    let session = {
        let mut guard = relay.lock().expect("relay lock");
        let session = DapSession::start(
            &descriptor,
            &debug_file(dir.path().join("blink.s")),
            move |event| {
                let mut relay = event_relay.lock().expect("relay lock");
                match event {
                    SessionEvent::Custom { event, body } => relay.custom_event(&event, body),
                    SessionEvent::Terminated => relay.session_terminated(),
                    SessionEvent::RequestFailed { .. } => {}
                }
            },
        )
        .expect("start adapter");
        guard.session_started(session.clone());
        session
    };

    match panel_rx.recv_timeout(WAIT).expect("panel created") {
        PanelEvent::Created => {}
        other => panic!("expected panel creation, got {other:?}"),
    }
    match panel_rx.recv_timeout(WAIT).expect("board update") {
        PanelEvent::Posted(HostMessage::BoardUpdate { body }) => {
            assert_eq!(body.led_array.r, Some(vec![1, 0]));
            assert_eq!(body.seven_segment.zero, Some(5));
        }
        other => panic!("expected board update, got {other:?}"),
    }
    assert!(hub.subscriber().is_some());

    session.disconnect();

    match panel_rx.recv_timeout(WAIT).expect("panel disposed") {
        PanelEvent::Disposed => {}
        other => panic!("expected panel disposal, got {other:?}"),
    }
    assert!(session.is_closed());
    assert_eq!(hub.subscriber(), None);
    exit_rx.recv_timeout(WAIT).expect("host asked to exit");
    assert!(context.exit_requested());

    let requests = fs::read_to_string(dir.path().join("requests.log")).expect("adapter stdin log");
    let position = |command: &str| {
        requests
            .find(&format!(r#""command":"{command}""#))
            .unwrap_or_else(|| panic!("{command} not sent: {requests}"))
    };
    assert!(position("initialize") < position("launch"));
    assert!(position("launch") < position("configurationDone"));
    assert!(position("configurationDone") < position("disconnect"));
}
