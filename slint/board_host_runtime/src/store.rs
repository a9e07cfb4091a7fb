//! Board state shared between the operator-input role and the
//! simulator-output role.
//!
//! [`BoardStore::split`] hands out exactly one writer per role. Neither writer
//! is `Clone`, and each can only touch its own half of the board, so the role
//! separation holds by construction.

use crate::board::{BoardState, InputPatch, InputState, OutputState};
use std::sync::{Arc, Mutex, MutexGuard};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreChange {
    Input(InputState),
    Output(OutputState),
}

pub type StoreListener = Arc<dyn Fn(&StoreChange) + Send + Sync>;

struct Shared {
    state: Mutex<BoardState>,
    listener: StoreListener,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, BoardState> {
        // A panicking listener never runs under the lock, so a poisoned
        // state is still consistent.
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

pub struct BoardStore;

impl BoardStore {
    /// Creates an empty board and returns its two writers plus a read-only
    /// view. `listener` runs once per merge, after the lock is released.
    pub fn split(listener: StoreListener) -> (InputWriter, OutputWriter, BoardView) {
        let shared = Arc::new(Shared {
            state: Mutex::new(BoardState::default()),
            listener,
        });

        (
            InputWriter {
                shared: shared.clone(),
            },
            OutputWriter {
                shared: shared.clone(),
            },
            BoardView { shared },
        )
    }
}

pub struct InputWriter {
    shared: Arc<Shared>,
}

impl InputWriter {
    pub fn apply_input(&mut self, patch: &InputPatch) -> InputState {
        let snapshot = {
            let mut state = self.shared.lock();
            state.input.merge(patch);
            state.input
        };

        (self.shared.listener)(&StoreChange::Input(snapshot));
        snapshot
    }

    /// Merge computed from the current input, for updates such as a switch
    /// toggle that depend on the previous value.
    pub fn update_input<F>(&mut self, build: F) -> InputState
    where
        F: FnOnce(&InputState) -> InputPatch,
    {
        let snapshot = {
            let mut state = self.shared.lock();
            let patch = build(&state.input);
            state.input.merge(&patch);
            state.input
        };

        (self.shared.listener)(&StoreChange::Input(snapshot));
        snapshot
    }
}

pub struct OutputWriter {
    shared: Arc<Shared>,
}

impl OutputWriter {
    pub fn apply_output(&mut self, update: &OutputState) -> OutputState {
        let snapshot = {
            let mut state = self.shared.lock();
            state.output.merge(update);
            state.output.clone()
        };

        (self.shared.listener)(&StoreChange::Output(snapshot.clone()));
        snapshot
    }
}

#[derive(Clone)]
pub struct BoardView {
    shared: Arc<Shared>,
}

impl BoardView {
    pub fn snapshot(&self) -> BoardState {
        self.shared.lock().clone()
    }

    pub fn input(&self) -> InputState {
        self.shared.lock().input
    }

    pub fn output(&self) -> OutputState {
        self.shared.lock().output.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::board::{Button, Buttons, DipSwitches, LedArray, SevenSegment};

    fn recording_store() -> (
        InputWriter,
        OutputWriter,
        BoardView,
        Arc<Mutex<Vec<StoreChange>>>,
    ) {
        let changes = Arc::new(Mutex::new(Vec::new()));
        let sink = changes.clone();
        let (input, output, view) = BoardStore::split(Arc::new(move |change| {
            sink.lock().expect("changes lock").push(change.clone());
        }));
        (input, output, view, changes)
    }

    #[test]
    fn each_merge_notifies_exactly_once() {
        let (mut input, mut output, _view, changes) = recording_store();

        input.apply_input(&InputPatch {
            button: Buttons {
                top: Some(true),
                left: Some(true),
                ..Buttons::default()
            },
            dip_switches: Some(DipSwitches::from_packed(3)),
            ..InputPatch::default()
        });
        output.apply_output(&OutputState {
            led_array: LedArray {
                r: Some(vec![1]),
                ..LedArray::default()
            },
            seven_segment: SevenSegment {
                zero: Some(5),
                ..SevenSegment::default()
            },
        });

        let changes = changes.lock().expect("changes lock");
        assert_eq!(changes.len(), 2);
        assert!(matches!(changes[0], StoreChange::Input(_)));
        assert!(matches!(changes[1], StoreChange::Output(_)));
    }

    #[test]
    fn writers_only_touch_their_half() {
        let (mut input, mut output, view, _changes) = recording_store();

        output.apply_output(&OutputState {
            seven_segment: SevenSegment {
                two: Some(0x3f),
                ..SevenSegment::default()
            },
            ..OutputState::default()
        });
        input.apply_input(&InputPatch {
            button: Buttons::with(Button::Center, true),
            ..InputPatch::default()
        });

        let state = view.snapshot();
        assert_eq!(state.output.seven_segment.two, Some(0x3f));
        assert_eq!(state.input.button.center, Some(true));
    }

    #[test]
    fn repeated_output_update_is_idempotent() {
        let (_input, mut output, view, _changes) = recording_store();
        let update: OutputState =
            serde_json::from_str(r#"{"ledArray":{"r":[1,0,3]},"sevenSegment":{"zero":5}}"#)
                .expect("decode update");

        output.apply_output(&update);
        let once = view.output();
        output.apply_output(&update);

        assert_eq!(view.output(), once);
    }

    #[test]
    fn update_input_sees_previous_value() {
        let (mut input, _output, view, _changes) = recording_store();

        for _ in 0..2 {
            input.update_input(|current| {
                let mut switches = current.dip_switches;
                switches.toggle(0);
                InputPatch {
                    dip_switches: Some(switches),
                    ..InputPatch::default()
                }
            });
        }

        assert_eq!(view.input().dip_switches.packed(), 0);
    }
}
