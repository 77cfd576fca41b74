use std::fmt::{self, Display};

pub const BTN_LEFT: u32 = 0x110;
pub const BTN_RIGHT: u32 = 0x111;
pub const BTN_MIDDLE: u32 = 0x112;
pub const BTN_BACK: u32 = 0x113;
pub const BTN_FORWARD: u32 = 0x114;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum KeyState {
    Released,
    Pressed,
}

impl KeyState {
    pub fn is_pressed(self) -> bool {
        self == KeyState::Pressed
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ButtonState {
    Released,
    Pressed,
}

/// What produced a scroll event. Wheel scrolls carry discrete detents,
/// finger / continuous scrolls are smooth deltas.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum ScrollSource {
    Wheel,
    Finger,
    Continuous,
}

/// Scroll delta along one axis. `v120` is nonzero only for wheel scrolls,
/// in 120ths of one detent.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct AxisDelta {
    pub value: f64,
    pub v120: i32,
}

/// A scroll event as decoded from one libinput frame. An axis that did not
/// move at all is `None`; an axis that is present with `value == 0.0` marks
/// the end of a scroll gesture.
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct ScrollEvent {
    pub source: ScrollSource,
    pub vertical: Option<AxisDelta>,
    pub horizontal: Option<AxisDelta>,
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Event {
    /// a key press / release event
    Key { key: u32, state: KeyState },
    /// mouse button event
    Button { button: u32, state: ButtonState },
    /// scroll event (wheel, two-finger or continuous)
    Scroll(ScrollEvent),
    /// relative pointer motion
    Motion { dx: f64, dy: f64 },
    /// absolute pointer motion, normalized to [0, 1] on both axes
    MotionAbsolute { x: f64, y: f64 },
}

impl Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::Key { key, state } => write!(f, "key({key}, {state:?})"),
            Event::Button { button, state } => {
                let name = match *button {
                    BTN_LEFT => Some("left"),
                    BTN_RIGHT => Some("right"),
                    BTN_MIDDLE => Some("middle"),
                    BTN_FORWARD => Some("forward"),
                    BTN_BACK => Some("back"),
                    _ => None,
                };
                if let Some(name) = name {
                    write!(f, "button({name}, {state:?})")
                } else {
                    write!(f, "button({button}, {state:?})")
                }
            }
            Event::Scroll(s) => write!(f, "{s}"),
            Event::Motion { dx, dy } => write!(f, "motion({dx},{dy})"),
            Event::MotionAbsolute { x, y } => write!(f, "motion-abs({x},{y})"),
        }
    }
}

impl Display for ScrollEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let axis = |d: Option<AxisDelta>| d.map(|d| d.value).unwrap_or(0.0);
        write!(
            f,
            "scroll({:?}, v: {}, h: {})",
            self.source,
            axis(self.vertical),
            axis(self.horizontal)
        )
    }
}
