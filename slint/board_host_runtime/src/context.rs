use crate::protocol::HostMessage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notice {
    Info(String),
    Error(String),
}

/// Operator-visible notifications. Every failure the host terminates ends up
/// here instead of unwinding.
pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);

    fn info(&self, message: &str) {
        self.notify(Notice::Info(message.to_string()));
    }

    fn error(&self, message: &str) {
        self.notify(Notice::Error(message.to_string()));
    }
}

/// Notifier that only writes to the log.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notice: Notice) {
        match notice {
            Notice::Info(message) => log::info!("{message}"),
            Notice::Error(message) => log::error!("{message}"),
        }
    }
}

/// A live UI surface.
pub trait Panel: Send {
    fn post_message(&self, message: HostMessage);
    fn dispose(&self);
}

pub trait PanelFactory: Send + Sync {
    fn create_panel(&self) -> Box<dyn Panel>;
}

/// Holds at most one panel.
pub struct PanelSlot {
    factory: Box<dyn PanelFactory>,
    current: Mutex<Option<Box<dyn Panel>>>,
}

impl PanelSlot {
    pub fn new(factory: Box<dyn PanelFactory>) -> Self {
        Self {
            factory,
            current: Mutex::new(None),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Option<Box<dyn Panel>>> {
        self.current
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Creates the panel unless one is already live.
    pub fn create_or_show(&self) {
        let mut current = self.lock();
        if current.is_none() {
            log::info!("creating board panel");
            *current = Some(self.factory.create_panel());
        }
    }

    /// Posts to the live panel. Returns `false` when there is none and the
    /// message was dropped.
    pub fn post(&self, message: HostMessage) -> bool {
        match self.lock().as_ref() {
            Some(panel) => {
                panel.post_message(message);
                true
            }
            None => false,
        }
    }

    pub fn is_live(&self) -> bool {
        self.lock().is_some()
    }

    pub fn dispose(&self) {
        if let Some(panel) = self.lock().take() {
            log::info!("disposing board panel");
            panel.dispose();
        }
    }
}

pub type ExitHook = Box<dyn Fn() + Send + Sync>;

/// Process-wide host state: one log sink and one panel slot. Built once by
/// the entry point and passed to every component that needs it.
pub struct HostContext {
    notifier: Arc<dyn Notifier>,
    panel: PanelSlot,
    exit: Option<ExitHook>,
    exit_requested: AtomicBool,
}

impl HostContext {
    pub fn new(notifier: Arc<dyn Notifier>, panel_factory: Box<dyn PanelFactory>) -> Self {
        Self {
            notifier,
            panel: PanelSlot::new(panel_factory),
            exit: None,
            exit_requested: AtomicBool::new(false),
        }
    }

    /// Installs what runs when a component asks the host to stop.
    pub fn with_exit_hook(mut self, hook: ExitHook) -> Self {
        self.exit = Some(hook);
        self
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    pub fn panel(&self) -> &PanelSlot {
        &self.panel
    }

    /// Asks the host to stop. Only the first request runs the exit hook.
    pub fn request_exit(&self) {
        if self.exit_requested.swap(true, Ordering::AcqRel) {
            return;
        }

        log::info!("host exit requested");
        if let Some(exit) = &self.exit {
            exit();
        }
    }

    pub fn exit_requested(&self) -> bool {
        self.exit_requested.load(Ordering::Acquire)
    }

    pub fn shutdown(&self) {
        self.panel.dispose();
    }
}
