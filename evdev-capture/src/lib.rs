use std::{
    collections::{HashMap, VecDeque},
    fs::OpenOptions,
    os::fd::{AsRawFd, OwnedFd, RawFd},
    os::unix::fs::OpenOptionsExt,
    path::Path,
    pin::Pin,
    task::{ready, Context, Poll},
};

use futures_core::Stream;
use input::{
    event::{
        keyboard::{KeyboardEvent, KeyboardEventTrait, KeyState as LibinputKeyState},
        pointer::{
            Axis, ButtonState as LibinputButtonState, PointerEvent, PointerScrollEvent,
            PointerScrollWheelEvent,
        },
        Event as LibinputEvent, EventTrait,
    },
    Device, Libinput, LibinputInterface,
};
use nix::ioctl_write_int;
use tokio::io::unix::AsyncFd;

use input_event::{AxisDelta, ButtonState, Event, KeyState, ScrollEvent, ScrollSource};

pub use error::{CaptureCreationError, CaptureError};
pub use hotplug::{enumerate_event_nodes, HotplugEvent, HotplugMonitor};

pub mod error;
mod hotplug;

/// Stable identity of an attached device, used to drain queued packets when
/// the device goes away before they are released.
pub type DeviceId = u64;

// EVIOCGRAB from <linux/input.h>
ioctl_write_int!(eviocgrab, b'E', 0x90);

/// Opens device nodes for libinput's path backend and takes the exclusive
/// grab. Without the grab the unmodified event stream stays readable by
/// other clients and the anonymization is trivially bypassable.
struct GrabInterface;

impl LibinputInterface for GrabInterface {
    fn open_restricted(&mut self, path: &Path, flags: i32) -> Result<OwnedFd, i32> {
        let file = OpenOptions::new()
            .custom_flags(flags | libc::O_CLOEXEC)
            .read((flags & libc::O_RDONLY != 0) | (flags & libc::O_RDWR != 0))
            .write((flags & libc::O_WRONLY != 0) | (flags & libc::O_RDWR != 0))
            .open(path)
            .map_err(|err| err.raw_os_error().unwrap_or(-1))?;
        let fd = OwnedFd::from(file);
        if let Err(errno) = unsafe { eviocgrab(fd.as_raw_fd(), 1) } {
            log::error!("EVIOCGRAB on {}: {errno}", path.display());
            return Err(errno as i32);
        }
        Ok(fd)
    }

    fn close_restricted(&mut self, fd: OwnedFd) {
        // the grab is released when the fd closes
        drop(fd);
    }
}

struct Inner {
    libinput: Libinput,
    fd: RawFd,
    devices: HashMap<String, (DeviceId, Device)>,
    next_id: DeviceId,
    pending: VecDeque<(DeviceId, Event)>,
}

impl AsRawFd for Inner {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

/// All physically attached input devices, exclusively grabbed and decoded
/// through libinput's path backend. Yields `(DeviceId, Event)` pairs.
pub struct EvdevCapture(AsyncFd<Inner>);

impl EvdevCapture {
    pub fn new() -> Result<Self, CaptureCreationError> {
        let libinput = Libinput::new_from_path(GrabInterface);
        let fd = libinput.as_raw_fd();
        let inner = Inner {
            libinput,
            fd,
            devices: HashMap::new(),
            next_id: 0,
            pending: VecDeque::new(),
        };
        Ok(Self(AsyncFd::new(inner).map_err(CaptureCreationError::Context)?))
    }

    /// Attach the device node at `path`. A node whose name is already
    /// tracked is detached first. Returns the id assigned to the device
    /// and, for a reattach, the id that was dropped.
    pub fn attach(&mut self, path: &Path) -> Result<(DeviceId, Option<DeviceId>), CaptureError> {
        let name = match path.file_name().and_then(|n| n.to_str()) {
            Some(name) => name.to_owned(),
            None => return Err(CaptureError::Grab(path.to_owned())),
        };
        let stale = self.detach(&name);

        let inner = self.0.get_mut();
        let path_str = path.to_str().ok_or_else(|| CaptureError::Grab(path.to_owned()))?;
        let device = inner
            .libinput
            .path_add_device(path_str)
            .ok_or_else(|| CaptureError::Grab(path.to_owned()))?;
        let id = inner.next_id;
        inner.next_id += 1;
        log::info!("grabbed {} ({})", path.display(), device.name());
        inner.devices.insert(name, (id, device));
        Ok((id, stale))
    }

    /// Detach the device named `name` (e.g. "event5"), dropping any of its
    /// decoded-but-undelivered events. Returns the id it was tracked under.
    pub fn detach(&mut self, name: &str) -> Option<DeviceId> {
        let inner = self.0.get_mut();
        let (id, device) = inner.devices.remove(name)?;
        inner.libinput.path_remove_device(device);
        inner.pending.retain(|(dev, _)| *dev != id);
        log::info!("released {name}");
        Some(id)
    }

    pub fn device_count(&self) -> usize {
        self.0.get_ref().devices.len()
    }
}

impl Inner {
    fn decode_pending(&mut self) {
        while let Some(event) = self.libinput.next() {
            let device = event.device();
            let id = match self.devices.get(device.sysname()) {
                Some((id, _)) => *id,
                // events raced with a detach, or libinput bookkeeping
                // events for a device we never tracked
                None => continue,
            };
            if let Some(decoded) = decode(&event) {
                self.pending.push_back((id, decoded));
            }
        }
    }
}

impl Stream for EvdevCapture {
    type Item = Result<(DeviceId, Event), CaptureError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.0.get_mut().pending.pop_front() {
            return Poll::Ready(Some(Ok(event)));
        }

        loop {
            let mut guard = ready!(self.0.poll_read_ready_mut(cx))?;

            {
                let inner = guard.get_inner_mut();
                if let Err(e) = inner.libinput.dispatch() {
                    return Poll::Ready(Some(Err(e.into())));
                }
                inner.decode_pending();
            }
            guard.clear_ready();

            match guard.get_inner_mut().pending.pop_front() {
                Some(event) => return Poll::Ready(Some(Ok(event))),
                None => continue,
            }
        }
    }
}

// absolute coordinates are normalized through a fixed transform range
const ABS_RANGE: u32 = 65535;

fn decode(event: &LibinputEvent) -> Option<Event> {
    match event {
        LibinputEvent::Keyboard(KeyboardEvent::Key(k)) => Some(Event::Key {
            key: k.key(),
            state: match k.key_state() {
                LibinputKeyState::Pressed => KeyState::Pressed,
                LibinputKeyState::Released => KeyState::Released,
            },
        }),
        LibinputEvent::Pointer(pointer) => match pointer {
            PointerEvent::Motion(m) => Some(Event::Motion {
                dx: m.dx(),
                dy: m.dy(),
            }),
            PointerEvent::MotionAbsolute(m) => Some(Event::MotionAbsolute {
                x: m.absolute_x_transformed(ABS_RANGE) / ABS_RANGE as f64,
                y: m.absolute_y_transformed(ABS_RANGE) / ABS_RANGE as f64,
            }),
            PointerEvent::Button(b) => Some(Event::Button {
                button: b.button(),
                state: match b.button_state() {
                    LibinputButtonState::Pressed => ButtonState::Pressed,
                    LibinputButtonState::Released => ButtonState::Released,
                },
            }),
            PointerEvent::ScrollWheel(s) => Some(Event::Scroll(ScrollEvent {
                source: ScrollSource::Wheel,
                vertical: wheel_axis(s, Axis::Vertical),
                horizontal: wheel_axis(s, Axis::Horizontal),
            })),
            PointerEvent::ScrollFinger(s) => Some(Event::Scroll(ScrollEvent {
                source: ScrollSource::Finger,
                vertical: scroll_axis(s, Axis::Vertical),
                horizontal: scroll_axis(s, Axis::Horizontal),
            })),
            PointerEvent::ScrollContinuous(s) => Some(Event::Scroll(ScrollEvent {
                source: ScrollSource::Continuous,
                vertical: scroll_axis(s, Axis::Vertical),
                horizontal: scroll_axis(s, Axis::Horizontal),
            })),
            _ => None,
        },
        _ => None,
    }
}

fn wheel_axis(event: &PointerScrollWheelEvent, axis: Axis) -> Option<AxisDelta> {
    event.has_axis(axis).then(|| AxisDelta {
        value: event.scroll_value(axis),
        v120: event.scroll_value_v120(axis) as i32,
    })
}

fn scroll_axis<E: PointerScrollEvent>(event: &E, axis: Axis) -> Option<AxisDelta> {
    event.has_axis(axis).then(|| AxisDelta {
        value: event.scroll_value(axis),
        v120: 0,
    })
}
