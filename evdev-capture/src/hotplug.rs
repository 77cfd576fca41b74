use std::{
    collections::VecDeque,
    io,
    path::PathBuf,
    pin::Pin,
    task::{ready, Context, Poll},
};

use futures_core::Stream;
use tokio::io::unix::AsyncFd;
use udev::{EventType, MonitorBuilder, MonitorSocket};

use crate::error::{CaptureCreationError, CaptureError};

/// A device node appearing or disappearing under the input directory.
/// Only `event*` nodes are reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HotplugEvent {
    Added { name: String, path: PathBuf },
    Removed { name: String },
}

/// Stream of hotplug notifications from a udev monitor on the `input`
/// subsystem.
pub struct HotplugMonitor {
    socket: AsyncFd<MonitorSocket>,
    pending: VecDeque<HotplugEvent>,
}

impl HotplugMonitor {
    pub fn new() -> Result<Self, CaptureCreationError> {
        let socket = MonitorBuilder::new()?
            .match_subsystem("input")?
            .listen()?;
        Ok(Self {
            socket: AsyncFd::new(socket)?,
            pending: VecDeque::new(),
        })
    }
}

impl Stream for HotplugMonitor {
    type Item = Result<HotplugEvent, CaptureError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(event) = self.pending.pop_front() {
            return Poll::Ready(Some(Ok(event)));
        }

        loop {
            let this = &mut *self;
            let mut guard = ready!(this.socket.poll_read_ready_mut(cx))?;

            for event in guard.get_inner().iter() {
                let name = match event.sysname().to_str() {
                    Some(name) if name.starts_with("event") => name.to_owned(),
                    _ => continue,
                };
                let plug = match event.event_type() {
                    EventType::Add => match event.devnode() {
                        Some(node) => HotplugEvent::Added {
                            name,
                            path: node.to_owned(),
                        },
                        None => continue,
                    },
                    EventType::Remove => HotplugEvent::Removed { name },
                    _ => continue,
                };
                this.pending.push_back(plug);
            }
            guard.clear_ready();
            drop(guard);

            if let Some(event) = this.pending.pop_front() {
                return Poll::Ready(Some(Ok(event)));
            }
        }
    }
}

/// Enumerate the `event*` device nodes currently present.
pub fn enumerate_event_nodes() -> io::Result<Vec<PathBuf>> {
    let mut enumerator = udev::Enumerator::new()?;
    enumerator.match_subsystem("input")?;
    let mut nodes: Vec<PathBuf> = enumerator
        .scan_devices()?
        .filter(|d| {
            d.sysname()
                .to_str()
                .is_some_and(|n| n.starts_with("event"))
        })
        .filter_map(|d| d.devnode().map(|n| n.to_owned()))
        .collect();
    nodes.sort();
    Ok(nodes)
}
