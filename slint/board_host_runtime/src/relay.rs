use crate::context::HostContext;
use crate::dap::DebugSession;
use crate::protocol::{HostMessage, PanelMessage};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

pub const UPDATE_INPUT_REQUEST: &str = "updateInput";
pub const BOARD_UPDATE_EVENT: &str = "boardUpdate";

pub type PanelCallback = Box<dyn Fn(&PanelMessage) + Send>;

struct Subscription {
    id: u64,
    callback: PanelCallback,
}

/// Routes panel messages to a single subscriber. Subscribing replaces the
/// previous subscriber, so there is never more than one.
#[derive(Default)]
pub struct MessageHub {
    next_id: AtomicU64,
    current: Mutex<Option<Subscription>>,
}

impl MessageHub {
    fn lock(&self) -> MutexGuard<'_, Option<Subscription>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Installs `callback`, unsubscribing whatever was there before, and
    /// returns the new subscription id.
    pub fn replace(&self, callback: PanelCallback) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        let previous = self.lock().replace(Subscription { id, callback });
        if let Some(previous) = previous {
            log::debug!("unsubscribed panel callback {}", previous.id);
        }
        id
    }

    pub fn clear(&self) {
        if let Some(previous) = self.lock().take() {
            log::debug!("unsubscribed panel callback {}", previous.id);
        }
    }

    pub fn subscriber(&self) -> Option<u64> {
        self.lock().as_ref().map(|subscription| subscription.id)
    }

    /// Delivers `message` to the subscriber. Returns `false` if there is none.
    pub fn dispatch(&self, message: &PanelMessage) -> bool {
        match self.lock().as_ref() {
            Some(subscription) => {
                (subscription.callback)(message);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    Idle,
    Active { session: u64 },
}

/// Ties a debug session's lifetime to the board panel.
///
/// Starting a session opens the panel and routes its `updateInput` messages
/// into the session as custom requests. `boardUpdate` events from the
/// session go to the panel when one is open and are dropped otherwise. Ending
/// the session closes the panel and asks the host to exit.
pub struct DebugSessionRelay {
    context: Arc<HostContext>,
    hub: Arc<MessageHub>,
    state: RelayState,
}

impl DebugSessionRelay {
    pub fn new(context: Arc<HostContext>, hub: Arc<MessageHub>) -> Self {
        Self {
            context,
            hub,
            state: RelayState::Idle,
        }
    }

    pub fn state(&self) -> RelayState {
        self.state
    }

    pub fn session_started(&mut self, session: Arc<dyn DebugSession>) {
        let session_id = session.id();
        log::info!("debug session {session_id} started");

        self.context.panel().create_or_show();

        let subscription = self.hub.replace(Box::new(move |message| {
            let PanelMessage::UpdateInput { arguments } = message else {
                return;
            };

            let payload = match serde_json::to_value(arguments) {
                Ok(payload) => payload,
                Err(err) => {
                    log::error!("failed to encode input update: {err}");
                    return;
                }
            };

            if let Err(err) = session.custom_request(UPDATE_INPUT_REQUEST, payload) {
                log::warn!("input update not forwarded: {err}");
            }
        }));
        log::debug!("session {session_id} forwarding through subscription {subscription}");

        self.state = RelayState::Active {
            session: session_id,
        };
    }

    pub fn custom_event(&self, event: &str, body: Value) {
        if event != BOARD_UPDATE_EVENT {
            log::debug!("ignoring custom event {event}");
            return;
        }

        let body = match serde_json::from_value(body) {
            Ok(body) => body,
            Err(err) => {
                log::warn!("dropping undecodable board update: {err}");
                return;
            }
        };

        if !self.context.panel().post(HostMessage::BoardUpdate { body }) {
            log::debug!("no board panel; board update dropped");
        }
    }

    pub fn session_terminated(&mut self) {
        if let RelayState::Active { session } = self.state {
            log::info!("debug session {session} terminated");
        }

        self.context.panel().dispose();
        self.hub.clear();
        self.state = RelayState::Idle;
        self.context.request_exit();
    }
}
