use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const LED_ROWS: usize = 10;
pub const LED_COLUMNS: usize = 12;
pub const DIP_SWITCH_COUNT: usize = 8;
pub const SEVEN_SEGMENT_DIGITS: usize = 4;

fn merge_field<T: Clone>(dst: &mut Option<T>, src: &Option<T>) {
    if let Some(value) = src {
        *dst = Some(value.clone());
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Buttons {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bottom: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub center: Option<bool>,
}

impl Buttons {
    pub fn merge(&mut self, other: &Buttons) {
        merge_field(&mut self.top, &other.top);
        merge_field(&mut self.bottom, &other.bottom);
        merge_field(&mut self.left, &other.left);
        merge_field(&mut self.right, &other.right);
        merge_field(&mut self.center, &other.center);
    }

    pub fn with(button: Button, pressed: bool) -> Self {
        let mut buttons = Buttons::default();
        let slot = match button {
            Button::Top => &mut buttons.top,
            Button::Bottom => &mut buttons.bottom,
            Button::Left => &mut buttons.left,
            Button::Right => &mut buttons.right,
            Button::Center => &mut buttons.center,
        };
        *slot = Some(pressed);
        buttons
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Joystick {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub down: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub left: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub right: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pressed: Option<bool>,
}

impl Joystick {
    pub fn merge(&mut self, other: &Joystick) {
        merge_field(&mut self.up, &other.up);
        merge_field(&mut self.down, &other.down);
        merge_field(&mut self.left, &other.left);
        merge_field(&mut self.right, &other.right);
        merge_field(&mut self.pressed, &other.pressed);
    }

    pub fn with(direction: Direction, active: bool) -> Self {
        let mut joystick = Joystick::default();
        let slot = match direction {
            Direction::Up => &mut joystick.up,
            Direction::Down => &mut joystick.down,
            Direction::Left => &mut joystick.left,
            Direction::Right => &mut joystick.right,
            Direction::Pressed => &mut joystick.pressed,
        };
        *slot = Some(active);
        joystick
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Button {
    Top,
    Bottom,
    Left,
    Right,
    Center,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Up,
    Down,
    Left,
    Right,
    Pressed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownControl(pub String);

impl fmt::Display for UnknownControl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown control '{}'", self.0)
    }
}

impl std::error::Error for UnknownControl {}

impl FromStr for Button {
    type Err = UnknownControl;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "top" => Ok(Button::Top),
            "bottom" => Ok(Button::Bottom),
            "left" => Ok(Button::Left),
            "right" => Ok(Button::Right),
            "center" => Ok(Button::Center),
            other => Err(UnknownControl(other.to_string())),
        }
    }
}

impl FromStr for Direction {
    type Err = UnknownControl;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "up" => Ok(Direction::Up),
            "down" => Ok(Direction::Down),
            "left" => Ok(Direction::Left),
            "right" => Ok(Direction::Right),
            "pressed" => Ok(Direction::Pressed),
            other => Err(UnknownControl(other.to_string())),
        }
    }
}

/// Eight-position switch bank. Index 0 is the most significant bit of the
/// packed value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "u8", into = "u8")]
pub struct DipSwitches([bool; DIP_SWITCH_COUNT]);

impl DipSwitches {
    pub fn new(positions: [bool; DIP_SWITCH_COUNT]) -> Self {
        Self(positions)
    }

    pub fn from_packed(value: u8) -> Self {
        let mut positions = [false; DIP_SWITCH_COUNT];
        for (index, position) in positions.iter_mut().enumerate() {
            *position = value & (1 << (DIP_SWITCH_COUNT - 1 - index)) != 0;
        }
        Self(positions)
    }

    pub fn packed(&self) -> u8 {
        self.0
            .iter()
            .enumerate()
            .filter(|(_, on)| **on)
            .fold(0, |acc, (index, _)| acc | 1 << (DIP_SWITCH_COUNT - 1 - index))
    }

    pub fn positions(&self) -> [bool; DIP_SWITCH_COUNT] {
        self.0
    }

    pub fn get(&self, index: usize) -> Option<bool> {
        self.0.get(index).copied()
    }

    /// Flips one switch and returns its new position, or `None` when the
    /// index is outside the bank.
    pub fn toggle(&mut self, index: usize) -> Option<bool> {
        let position = self.0.get_mut(index)?;
        *position = !*position;
        Some(*position)
    }
}

impl From<u8> for DipSwitches {
    fn from(value: u8) -> Self {
        Self::from_packed(value)
    }
}

impl From<DipSwitches> for u8 {
    fn from(switches: DipSwitches) -> Self {
        switches.packed()
    }
}

/// Operator-driven half of the board.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputState {
    #[serde(default)]
    pub button: Buttons,
    #[serde(default)]
    pub joystick: Joystick,
    #[serde(default)]
    pub dip_switches: DipSwitches,
}

/// A partial input update. `None` leaves (and a `None` switch bank) keep the
/// current value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InputPatch {
    pub button: Buttons,
    pub joystick: Joystick,
    pub dip_switches: Option<DipSwitches>,
}

impl InputState {
    pub fn merge(&mut self, patch: &InputPatch) {
        self.button.merge(&patch.button);
        self.joystick.merge(&patch.joystick);
        if let Some(switches) = patch.dip_switches {
            self.dip_switches = switches;
        }
    }
}

/// Colour channels of the LED matrix. Each entry is one row; bit `i` lights
/// column `i`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedArray {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub r: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub g: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub b: Option<Vec<u32>>,
}

impl LedArray {
    pub fn merge(&mut self, other: &LedArray) {
        merge_field(&mut self.r, &other.r);
        merge_field(&mut self.g, &other.g);
        merge_field(&mut self.b, &other.b);
    }

    pub fn is_empty(&self) -> bool {
        self.r.is_none() && self.g.is_none() && self.b.is_none()
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SevenSegment {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zero: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub one: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub two: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub three: Option<u8>,
}

impl SevenSegment {
    pub fn merge(&mut self, other: &SevenSegment) {
        merge_field(&mut self.zero, &other.zero);
        merge_field(&mut self.one, &other.one);
        merge_field(&mut self.two, &other.two);
        merge_field(&mut self.three, &other.three);
    }

    pub fn is_empty(&self) -> bool {
        self.digits().iter().all(Option::is_none)
    }

    /// Digits in display order, left to right.
    pub fn digits(&self) -> [Option<u8>; SEVEN_SEGMENT_DIGITS] {
        [self.zero, self.one, self.two, self.three]
    }
}

/// Simulator-driven half of the board.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputState {
    #[serde(rename = "ledArray", default)]
    pub led_array: LedArray,
    #[serde(rename = "sevenSegment", default)]
    pub seven_segment: SevenSegment,
}

impl OutputState {
    pub fn merge(&mut self, other: &OutputState) {
        self.led_array.merge(&other.led_array);
        self.seven_segment.merge(&other.seven_segment);
    }

    pub fn is_empty(&self) -> bool {
        self.led_array.is_empty() && self.seven_segment.is_empty()
    }

    /// Every LED cell, row-major, as (r, g, b) on/off.
    pub fn led_cells(&self) -> Vec<(bool, bool, bool)> {
        (0..LED_ROWS)
            .flat_map(|row| (0..LED_COLUMNS).map(move |column| (row, column)))
            .map(|(row, column)| led_color(&self.led_array, row, column))
            .collect()
    }

    /// Segment flags for all digits, eight per digit (a..g, then the dot).
    /// Digits the simulator never sent are dark.
    pub fn segment_flags(&self) -> Vec<bool> {
        self.seven_segment
            .digits()
            .iter()
            .flat_map(|digit| Segments(digit.unwrap_or(0)).flags())
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BoardState {
    pub input: InputState,
    pub output: OutputState,
}

pub fn led_lit(channel_rows: &[u32], row: usize, column: usize) -> bool {
    if column >= LED_COLUMNS {
        return false;
    }

    channel_rows
        .get(row)
        .is_some_and(|bits| (bits >> column) & 1 == 1)
}

/// On/off state of the red, green and blue channel for one LED cell.
pub fn led_color(leds: &LedArray, row: usize, column: usize) -> (bool, bool, bool) {
    let channel = |rows: &Option<Vec<u32>>| {
        rows.as_deref()
            .is_some_and(|rows| led_lit(rows, row, column))
    };

    (channel(&leds.r), channel(&leds.g), channel(&leds.b))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Segment {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
}

impl Segment {
    pub const ALL: [Segment; 7] = [
        Segment::A,
        Segment::B,
        Segment::C,
        Segment::D,
        Segment::E,
        Segment::F,
        Segment::G,
    ];

    fn bit(self) -> u8 {
        match self {
            Segment::A => 0,
            Segment::B => 1,
            Segment::C => 2,
            Segment::D => 3,
            Segment::E => 4,
            Segment::F => 5,
            Segment::G => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Segments(pub u8);

impl Segments {
    pub fn is_lit(&self, segment: Segment) -> bool {
        self.0 & (1 << segment.bit()) != 0
    }

    pub fn dot(&self) -> bool {
        self.0 & 0x80 != 0
    }

    /// Segments a..g followed by the decimal point.
    pub fn flags(&self) -> [bool; 8] {
        let mut flags = [false; 8];
        for (slot, segment) in flags.iter_mut().zip(Segment::ALL) {
            *slot = self.is_lit(segment);
        }
        flags[7] = self.dot();
        flags
    }
}
