use crate::board::{
    Button, Buttons, DIP_SWITCH_COUNT, Direction, InputPatch, InputState, Joystick, OutputState,
};
use crate::error::{BridgeError, Result};
use crate::protocol::{HostMessage, PanelMessage, update_input_message};
use crate::store::{BoardStore, BoardView, InputWriter, OutputWriter, StoreChange};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::{Arc, Mutex, MutexGuard};

/// Draws board state. Implementations must not call back into the
/// [`PanelSync`] that owns them.
pub trait PanelRenderer: Send + Sync {
    fn render_inputs(&self, inputs: &InputState);
    fn render_outputs(&self, outputs: &OutputState);
    fn append_terminal(&self, line: &str);
}

/// Creates the bounded panel-to-host channel.
pub fn host_channel(capacity: usize) -> (HostChannel, HostInbox) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    let pending = Arc::new(Mutex::new(None));
    (
        HostChannel {
            tx,
            pending: pending.clone(),
            dropped: Arc::new(AtomicU64::new(0)),
            capacity,
        },
        HostInbox { rx, pending },
    )
}

fn lock_pending(pending: &Mutex<Option<InputState>>) -> MutexGuard<'_, Option<InputState>> {
    pending
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Panel side of the panel-to-host channel.
///
/// Input updates are whole snapshots, so when the queue is full only the
/// newest one is kept aside and delivered once the host drains the queue.
/// Other messages are dropped on a full queue.
#[derive(Clone)]
pub struct HostChannel {
    tx: SyncSender<PanelMessage>,
    pending: Arc<Mutex<Option<InputState>>>,
    dropped: Arc<AtomicU64>,
    capacity: usize,
}

impl HostChannel {
    /// Queues a message without blocking the UI thread.
    pub fn send(&self, message: PanelMessage) -> Result<()> {
        // The pending slot lock also serializes against `HostInbox`, so an
        // input set aside here is always seen by the host's next drain.
        let mut pending = lock_pending(&self.pending);
        let is_input = matches!(message, PanelMessage::UpdateInput { .. });

        match self.tx.try_send(message) {
            Ok(()) => {
                if is_input {
                    pending.take();
                }
                Ok(())
            }
            Err(TrySendError::Full(PanelMessage::UpdateInput { arguments })) => {
                if pending.replace(arguments).is_some() {
                    self.record_drop();
                }
                Ok(())
            }
            Err(TrySendError::Full(_message)) => {
                self.record_drop();
                Ok(())
            }
            Err(TrySendError::Disconnected(_message)) => Err(BridgeError::ChannelClosed),
        }
    }

    fn record_drop(&self) {
        let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if dropped == 1 || dropped.is_power_of_two() {
            log::warn!(
                "panel outbound queue full (cap={}); dropped {dropped} message(s)",
                self.capacity
            );
        }
    }

    /// Messages lost to a full queue, counting superseded input snapshots.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

/// Host side of the panel-to-host channel.
pub struct HostInbox {
    rx: Receiver<PanelMessage>,
    pending: Arc<Mutex<Option<InputState>>>,
}

impl HostInbox {
    /// Next queued message, or the input snapshot set aside while the queue
    /// was full. Never blocks.
    pub fn try_recv(&self) -> Option<PanelMessage> {
        let mut pending = lock_pending(&self.pending);
        match self.rx.try_recv() {
            Ok(message) => Some(message),
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => {
                pending.take().map(update_input_message)
            }
        }
    }

    /// Blocks for the next message. `None` once every sender is gone and
    /// nothing is left to deliver.
    pub fn recv(&self) -> Option<PanelMessage> {
        if let Some(message) = self.try_recv() {
            return Some(message);
        }

        let message = self.rx.recv().ok();
        message.or_else(|| lock_pending(&self.pending).take().map(update_input_message))
    }
}

impl Iterator for HostInbox {
    type Item = PanelMessage;

    fn next(&mut self) -> Option<PanelMessage> {
        self.recv()
    }
}

/// Binds one mounted panel's board store to the host channel.
///
/// Input-side store changes are sent to the host as `updateInput` in the same
/// call that made them. Board updates from the host are merged into the
/// output side.
pub struct PanelSync {
    input: InputWriter,
    output: OutputWriter,
    view: BoardView,
    renderer: Arc<dyn PanelRenderer>,
}

impl PanelSync {
    pub fn mount(channel: HostChannel, renderer: Arc<dyn PanelRenderer>) -> Self {
        let listener_renderer = renderer.clone();
        let (input, output, view) = BoardStore::split(Arc::new(move |change| match change {
            StoreChange::Input(inputs) => {
                listener_renderer.render_inputs(inputs);
                if let Err(err) = channel.send(update_input_message(*inputs)) {
                    log::warn!("failed to send input update: {err}");
                }
            }
            StoreChange::Output(outputs) => listener_renderer.render_outputs(outputs),
        }));

        renderer.render_inputs(&InputState::default());
        renderer.render_outputs(&OutputState::default());

        Self {
            input,
            output,
            view,
            renderer,
        }
    }

    pub fn view(&self) -> &BoardView {
        &self.view
    }

    pub fn set_button(&mut self, button: Button, pressed: bool) {
        self.input.apply_input(&InputPatch {
            button: Buttons::with(button, pressed),
            ..InputPatch::default()
        });
    }

    pub fn set_joystick(&mut self, direction: Direction, active: bool) {
        self.input.apply_input(&InputPatch {
            joystick: Joystick::with(direction, active),
            ..InputPatch::default()
        });
    }

    pub fn toggle_switch(&mut self, index: usize) -> Result<()> {
        if index >= DIP_SWITCH_COUNT {
            return Err(BridgeError::SwitchIndex(index));
        }

        self.input.update_input(|current| {
            let mut switches = current.dip_switches;
            switches.toggle(index);
            InputPatch {
                dip_switches: Some(switches),
                ..InputPatch::default()
            }
        });
        Ok(())
    }

    pub fn apply_input(&mut self, patch: &InputPatch) {
        self.input.apply_input(patch);
    }

    pub fn handle_host_message(&mut self, message: HostMessage) {
        match message {
            HostMessage::BoardUpdate { body } => {
                self.output.apply_output(&body);
            }
            HostMessage::TerminalOutput { value } => self.renderer.append_terminal(&value),
        }
    }
}
