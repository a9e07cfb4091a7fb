pub mod board;
pub mod config;
pub mod context;
pub mod dap;
pub mod error;
pub mod launch;
pub mod process;
pub mod protocol;
pub mod relay;
pub mod store;
pub mod sync;

use crate::board::{Button, Direction, InputState, OutputState};
use crate::context::{HostContext, LogNotifier, Notice, Notifier, Panel, PanelFactory};
use crate::dap::{DapSession, SessionEvent};
use crate::launch::{LaunchConfig, SystemRunner, prepare_launch, resolve_launch_config};
use crate::process::ProcessBridge;
use crate::protocol::{HostMessage, PanelMessage, host_messages_for_document};
use crate::relay::{DebugSessionRelay, MessageHub};
use crate::sync::{HostChannel, HostInbox, PanelRenderer, PanelSync, host_channel};
use slint::ComponentHandle;
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

pub use crate::config::HostConfig;
pub use crate::error::{BridgeError, Result};
pub use serde_json;

pub const TERMINAL_SCROLLBACK_LINES: usize = 200;

/// Glue between the runtime and a concrete slint window.
pub trait PanelBindings: 'static {
    type Ui: ComponentHandle + 'static;

    fn new_ui() -> std::result::Result<Self::Ui, slint::PlatformError>;

    fn bind_button<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(String, bool) + Send + 'static;

    fn bind_joystick<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(String, bool) + Send + 'static;

    fn bind_switch<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(usize) + Send + 'static;

    fn bind_terminal_input<F>(ui: &Self::Ui, handler: F)
    where
        F: Fn(String) + Send + 'static;

    fn render_inputs(ui: &Self::Ui, inputs: &InputState);
    fn render_outputs(ui: &Self::Ui, outputs: &OutputState);
    fn append_terminal(ui: &Self::Ui, line: &str);
    fn set_status(ui: &Self::Ui, notice: &Notice);
}

type MountedPanel = Arc<Mutex<Option<PanelSync>>>;

fn lock_mounted(mounted: &Mutex<Option<PanelSync>>) -> MutexGuard<'_, Option<PanelSync>> {
    mounted
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

struct SlintRenderer<B: PanelBindings> {
    ui: slint::Weak<B::Ui>,
}

impl<B: PanelBindings> PanelRenderer for SlintRenderer<B> {
    fn render_inputs(&self, inputs: &InputState) {
        let inputs = *inputs;
        let _ = self
            .ui
            .upgrade_in_event_loop(move |ui| B::render_inputs(&ui, &inputs));
    }

    fn render_outputs(&self, outputs: &OutputState) {
        let outputs = outputs.clone();
        let _ = self
            .ui
            .upgrade_in_event_loop(move |ui| B::render_outputs(&ui, &outputs));
    }

    fn append_terminal(&self, line: &str) {
        let line = line.to_string();
        let _ = self
            .ui
            .upgrade_in_event_loop(move |ui| B::append_terminal(&ui, &line));
    }
}

struct PanelNotifier<B: PanelBindings> {
    ui: slint::Weak<B::Ui>,
}

impl<B: PanelBindings> Notifier for PanelNotifier<B> {
    fn notify(&self, notice: Notice) {
        LogNotifier.notify(notice.clone());
        let _ = self
            .ui
            .upgrade_in_event_loop(move |ui| B::set_status(&ui, &notice));
    }
}

struct SlintPanel<B: PanelBindings> {
    ui: slint::Weak<B::Ui>,
    mounted: MountedPanel,
}

impl<B: PanelBindings> Panel for SlintPanel<B> {
    fn post_message(&self, message: HostMessage) {
        let mounted = self.mounted.clone();
        let queued = self.ui.upgrade_in_event_loop(move |_ui| {
            match lock_mounted(&mounted).as_mut() {
                Some(sync) => sync.handle_host_message(message),
                None => log::debug!("panel unmounted; dropping host message"),
            }
        });

        if let Err(err) = queued {
            log::warn!("failed to queue host message for panel: {err}");
        }
    }

    fn dispose(&self) {
        let mounted = self.mounted.clone();
        let _ = self.ui.upgrade_in_event_loop(move |ui| {
            lock_mounted(&mounted).take();
            if let Err(err) = ui.hide() {
                log::warn!("failed to hide board panel: {err}");
            }
        });
    }
}

struct SlintPanelFactory<B: PanelBindings> {
    ui: slint::Weak<B::Ui>,
    mounted: MountedPanel,
    channel: HostChannel,
}

impl<B: PanelBindings> PanelFactory for SlintPanelFactory<B> {
    fn create_panel(&self) -> Box<dyn Panel> {
        let mounted = self.mounted.clone();
        let channel = self.channel.clone();
        let renderer: Arc<dyn PanelRenderer> = Arc::new(SlintRenderer::<B> {
            ui: self.ui.clone(),
        });

        // A fresh store per mount: state never outlives its panel.
        let queued = self.ui.upgrade_in_event_loop(move |ui| {
            *lock_mounted(&mounted) = Some(PanelSync::mount(channel, renderer));
            if let Err(err) = ui.show() {
                log::error!("failed to show board panel: {err}");
            }
        });
        if let Err(err) = queued {
            log::error!("failed to queue board panel creation: {err}");
        }

        Box::new(SlintPanel::<B> {
            ui: self.ui.clone(),
            mounted: self.mounted.clone(),
        })
    }
}

/// Appends one line to a terminal buffer, keeping at most `max_lines`.
pub fn append_scrollback(buffer: &str, line: &str, max_lines: usize) -> String {
    let mut lines: Vec<&str> = buffer.lines().collect();
    lines.extend(line.lines());

    let skip = lines.len().saturating_sub(max_lines);
    lines[skip..].join("\n")
}

pub fn run<B: PanelBindings>(config: HostConfig) -> std::result::Result<(), Box<dyn std::error::Error>> {
    let ui = B::new_ui()?;
    let ui_weak = ui.as_weak();

    let (channel, inbox) = host_channel(config.outbound_queue_cap);
    let mounted: MountedPanel = Arc::new(Mutex::new(None));

    let notifier: Arc<dyn Notifier> = Arc::new(PanelNotifier::<B> {
        ui: ui_weak.clone(),
    });
    let context = Arc::new(
        HostContext::new(
            notifier.clone(),
            Box::new(SlintPanelFactory::<B> {
                ui: ui_weak.clone(),
                mounted: mounted.clone(),
                channel: channel.clone(),
            }),
        )
        .with_exit_hook(Box::new(|| {
            let quit_result = slint::invoke_from_event_loop(|| {
                if let Err(err) = slint::quit_event_loop() {
                    log::error!("failed to quit UI event loop: {err}");
                }
            });
            if let Err(err) = quit_result {
                log::error!("failed to request UI event loop quit: {err}");
            }
        })),
    );

    install_callbacks::<B>(&ui, mounted, channel, notifier.clone());

    ui.window().on_close_requested(|| {
        if let Err(err) = slint::quit_event_loop() {
            log::error!("failed to request UI event loop quit: {err}");
        }
        slint::CloseRequestResponse::HideWindow
    });

    let bridge = config.simulator.clone().map(|command| {
        Arc::new(ProcessBridge::new(command, notifier.clone()))
    });
    if let Some(bridge) = &bridge {
        let data_context = context.clone();
        bridge.start(move |document| {
            for message in host_messages_for_document(&document) {
                if !data_context.panel().post(message) {
                    log::debug!("no board panel; simulator message dropped");
                }
            }
        });
    }

    let hub = Arc::new(MessageHub::default());
    let relay = Arc::new(Mutex::new(DebugSessionRelay::new(context.clone(), hub.clone())));
    let active_session: Arc<Mutex<Option<Arc<DapSession>>>> = Arc::new(Mutex::new(None));

    // Stdin writes get their own thread so a simulator that stops reading
    // cannot stall input forwarding.
    let terminal = bridge.clone().map(|bridge| {
        let (terminal_tx, terminal_rx) = mpsc::channel::<String>();
        thread::spawn(move || {
            for line in terminal_rx {
                bridge.write(&line);
            }
        });
        terminal_tx
    });

    let dispatcher_notifier = notifier.clone();
    let dispatcher_handle = thread::spawn(move || {
        dispatch_loop(inbox, &hub, terminal.as_ref(), dispatcher_notifier.as_ref());
    });

    match config.launch.clone() {
        Some(launch) => {
            let launch_config = config.clone();
            let launch_relay = relay.clone();
            let launch_session = active_session.clone();
            let launch_context = context.clone();
            thread::spawn(move || {
                let started = start_debug_session(
                    launch,
                    &launch_config,
                    launch_relay,
                    launch_session,
                    launch_context.notifier().clone(),
                );
                // Nothing will ever show the panel; stop instead of idling.
                if !started {
                    launch_context.request_exit();
                }
            });
        }
        None => context.panel().create_or_show(),
    }

    slint::run_event_loop_until_quit()?;

    if let Some(session) = lock_session(&active_session).take() {
        session.disconnect();
    }
    if let Some(bridge) = &bridge {
        bridge.dispose();
    }
    context.shutdown();

    // Drop UI first so callback closures release their channel clones.
    drop(ui);
    drop(context);
    drop(relay);

    if dispatcher_handle.is_finished() {
        if let Err(err) = dispatcher_handle.join() {
            log::error!("dispatcher thread join failed: {err:?}");
        }
    } else {
        // Panel clones of the channel may outlive the UI; do not block exit on them.
        log::debug!("dispatcher thread still active during shutdown; skipping join");
    }

    Ok(())
}

fn lock_session(
    session: &Mutex<Option<Arc<DapSession>>>,
) -> MutexGuard<'_, Option<Arc<DapSession>>> {
    session
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn install_callbacks<B: PanelBindings>(
    ui: &B::Ui,
    mounted: MountedPanel,
    channel: HostChannel,
    notifier: Arc<dyn Notifier>,
) {
    let button_panel = mounted.clone();
    B::bind_button(ui, move |name, pressed| {
        let Ok(button) = name.parse::<Button>() else {
            log::warn!("ignoring unknown button '{name}'");
            return;
        };
        if let Some(sync) = lock_mounted(&button_panel).as_mut() {
            sync.set_button(button, pressed);
        }
    });

    let joystick_panel = mounted.clone();
    B::bind_joystick(ui, move |name, active| {
        let Ok(direction) = name.parse::<Direction>() else {
            log::warn!("ignoring unknown joystick direction '{name}'");
            return;
        };
        if let Some(sync) = lock_mounted(&joystick_panel).as_mut() {
            sync.set_joystick(direction, active);
        }
    });

    let switch_panel = mounted;
    B::bind_switch(ui, move |index| {
        if let Some(sync) = lock_mounted(&switch_panel).as_mut() {
            if let Err(err) = sync.toggle_switch(index) {
                log::warn!("{err}");
            }
        }
    });

    B::bind_terminal_input(ui, move |line| {
        if line.is_empty() {
            return;
        }
        if let Err(err) = channel.send(PanelMessage::TerminalInput { value: line }) {
            notifier.error(&format!("terminal input not sent: {err}"));
        }
    });
}

/// Host side of the panel channel. Runs until every sender is gone.
fn dispatch_loop(
    inbox: HostInbox,
    hub: &MessageHub,
    terminal: Option<&Sender<String>>,
    notifier: &dyn Notifier,
) {
    for message in inbox {
        match &message {
            PanelMessage::UpdateInput { .. } => {
                if !hub.dispatch(&message) {
                    log::debug!("no debug session; input update not forwarded");
                }
            }
            PanelMessage::TerminalInput { value } => match terminal {
                Some(terminal) => {
                    if terminal.send(value.clone()).is_err() {
                        log::warn!("simulator stdin writer gone; terminal input dropped");
                    }
                }
                None => log::debug!("no simulator configured; terminal input dropped"),
            },
            PanelMessage::Info { value } => {
                if let Some(value) = value.as_deref().filter(|value| !value.is_empty()) {
                    notifier.info(value);
                }
            }
            PanelMessage::Error { value } => {
                if let Some(value) = value.as_deref().filter(|value| !value.is_empty()) {
                    notifier.error(value);
                }
            }
        }
    }

    log::debug!("panel channel closed; dispatcher exiting");
}

fn start_debug_session(
    launch: LaunchConfig,
    config: &HostConfig,
    relay: Arc<Mutex<DebugSessionRelay>>,
    active_session: Arc<Mutex<Option<Arc<DapSession>>>>,
    notifier: Arc<dyn Notifier>,
) -> bool {
    let Some(launch) =
        resolve_launch_config(launch, config.active_document.as_ref(), notifier.as_ref())
    else {
        return false;
    };

    let Some(descriptor) = prepare_launch(
        &SystemRunner,
        &launch,
        &config.workspace_folders,
        notifier.as_ref(),
    ) else {
        return false;
    };

    let event_relay = relay.clone();
    let event_notifier = notifier.clone();
    let on_event = move |event: SessionEvent| match event {
        SessionEvent::Custom { event, body } => lock_relay(&event_relay).custom_event(&event, body),
        SessionEvent::Terminated => lock_relay(&event_relay).session_terminated(),
        SessionEvent::RequestFailed { command, message } => {
            event_notifier.error(&format!("{command}: {message}"));
        }
    };

    // Hold the relay until the session is registered so early adapter events
    // queue behind the start transition.
    let mut relay = lock_relay(&relay);
    match DapSession::start(&descriptor, &launch, on_event) {
        Ok(session) => {
            relay.session_started(session.clone());
            *lock_session(&active_session) = Some(session);
            true
        }
        Err(err) => {
            log::error!("failed to start debug session: {err}");
            notifier.error(&err.to_string());
            false
        }
    }
}

fn lock_relay(relay: &Mutex<DebugSessionRelay>) -> MutexGuard<'_, DebugSessionRelay> {
    relay.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
