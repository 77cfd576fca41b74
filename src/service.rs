//! The cooperative event loop tying evdev capture, the Wayland session and
//! the hotplug monitor together. Everything runs on one task; the only
//! suspension point is the `select!` at the bottom of each pass.

use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use futures::StreamExt;
use tokio::time;

use evdev_capture::{
    enumerate_event_nodes, DeviceId, EvdevCapture, HotplugEvent, HotplugMonitor,
};
use input_event::Event;
use virtual_input::Session;

use crate::{
    clock::{Clock, Entropy},
    combo::EscapeCombo,
    config::Config,
    cursor::Cursor,
    scheduler::{Packet, Scheduler},
};

pub struct Service {
    clock: Clock,
    entropy: Entropy,
    scheduler: Scheduler,
    cursor: Cursor,
    combo: EscapeCombo,
    capture: EvdevCapture,
    hotplug: HotplugMonitor,
    session: Session,
}

impl Service {
    pub fn new(config: &Config) -> Result<Self> {
        let session = Session::connect(config.color).context("connecting to the compositor")?;

        let mut capture = EvdevCapture::new().context("creating the libinput context")?;
        let nodes = enumerate_event_nodes().context("enumerating input devices")?;
        for node in &nodes {
            capture.attach(node)?;
        }
        log::info!("grabbed {} input devices", capture.device_count());

        let hotplug = HotplugMonitor::new().context("creating the hotplug monitor")?;

        Ok(Self {
            clock: Clock::new(),
            entropy: Entropy::new(),
            scheduler: Scheduler::new(config.max_delay),
            cursor: Cursor::new(),
            combo: EscapeCombo::new(config.combo.clone()),
            capture,
            hotplug,
            session,
        })
    }

    /// Run until the escape combo fires. Every other way out is an error.
    pub async fn run(mut self) -> Result<()> {
        loop {
            self.session.pump()?;
            self.cursor.revalidate(self.session.layout());

            self.release_due()?;
            let cursor = self.draw_cursor();
            self.session.redraw_flagged(cursor);
            self.session.flush()?;

            let now = self.clock.now_ms()?;
            let timeout = self.scheduler.poll_timeout(now);

            let exit = tokio::select! {
                r = self.session.dispatch() => {
                    r?;
                    self.cursor.revalidate(self.session.layout());
                    false
                }
                event = self.capture.next() => {
                    let (device, event) =
                        event.ok_or_else(|| anyhow!("input event stream closed"))??;
                    self.handle_input(device, event)?
                }
                plug = self.hotplug.next() => {
                    let plug = plug.ok_or_else(|| anyhow!("hotplug monitor closed"))??;
                    self.handle_hotplug(plug)?;
                    false
                }
                _ = time::sleep(timeout.unwrap_or(Duration::ZERO)), if timeout.is_some() => {
                    false
                }
            };
            if exit {
                return Ok(());
            }
        }
    }

    /// Feed one decoded event through the combo watcher, the cursor engine
    /// and the scheduler. Returns true when the escape combo fired.
    fn handle_input(&mut self, device: DeviceId, event: Event) -> Result<bool> {
        let now = self.clock.now_ms()?;
        match event {
            Event::Key { key, state } => {
                if self.combo.update(key, state) {
                    log::info!("escape combo pressed, exiting");
                    return Ok(true);
                }
                self.scheduler
                    .enqueue_device(device, event, now, &mut self.entropy);
            }
            Event::Button { .. } | Event::Scroll(_) => {
                self.scheduler
                    .enqueue_device(device, event, now, &mut self.entropy);
            }
            Event::Motion { dx, dy } => {
                if let Some((x, y)) = self
                    .cursor
                    .motion_relative(dx, dy, self.session.layout())?
                {
                    self.mark_cursor_outputs();
                    self.scheduler
                        .enqueue_pointer_move(x, y, now, &mut self.entropy);
                }
            }
            Event::MotionAbsolute { x, y } => {
                if let Some((x, y)) = self
                    .cursor
                    .motion_absolute(x, y, self.session.layout())?
                {
                    self.mark_cursor_outputs();
                    self.scheduler
                        .enqueue_pointer_move(x, y, now, &mut self.entropy);
                }
            }
        }
        Ok(false)
    }

    fn handle_hotplug(&mut self, plug: HotplugEvent) -> Result<()> {
        match plug {
            HotplugEvent::Added { name, path } => {
                log::debug!("hotplug add: {name}");
                let (_, stale) = self.capture.attach(&path)?;
                if let Some(id) = stale {
                    self.scheduler.drain_device(id);
                }
            }
            HotplugEvent::Removed { name } => {
                log::debug!("hotplug remove: {name}");
                if let Some(id) = self.capture.detach(&name) {
                    self.scheduler.drain_device(id);
                }
            }
        }
        Ok(())
    }

    /// Pop and replay everything whose release time has come.
    fn release_due(&mut self) -> Result<()> {
        let now = self.clock.now_ms()?;
        while let Some(packet) = self.scheduler.pop_due(now) {
            let time = u32::try_from(packet.due()).map_err(|_| {
                anyhow!("release timestamp exceeded the 32-bit wire range; restart required")
            })?;
            match packet {
                Packet::Device { event, .. } => match event {
                    Event::Key { key, state } => self.session.replay_key(time, key, state),
                    Event::Button { button, state } => {
                        self.session.replay_button(time, button, state)
                    }
                    Event::Scroll(scroll) => self.session.replay_scroll(time, scroll),
                    // motion is rewritten into pointer-move packets before
                    // it ever reaches the queue
                    Event::Motion { .. } | Event::MotionAbsolute { .. } => {}
                },
                Packet::PointerMove { x, y, .. } => {
                    self.session.replay_motion_absolute(time, x, y)?;
                }
            }
        }
        Ok(())
    }

    /// Flag the outputs the cursor left and entered for a redraw.
    fn mark_cursor_outputs(&mut self) {
        let layout = self.session.layout();
        let (px, py) = self.cursor.previous();
        let (cx, cy) = self.cursor.position();
        let src = layout.abs_to_local(px, py).map(|(i, _, _)| i);
        let dst = layout.abs_to_local(cx, cy).map(|(i, _, _)| i);
        if let Some(i) = src {
            self.session.mark_frame_pending(i);
        }
        if let Some(i) = dst {
            if dst != src {
                self.session.mark_frame_pending(i);
            }
        }
    }

    fn draw_cursor(&self) -> Option<(f64, f64)> {
        (!self.session.layout().is_empty()).then(|| self.cursor.position())
    }
}
