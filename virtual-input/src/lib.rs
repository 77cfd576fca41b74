//! The Wayland side of the daemon: one connection owning the output model,
//! the virtual-pointer / virtual-keyboard sink and the overlay cursor
//! surfaces. All state is mutated synchronously from `Dispatch` handlers or
//! from the event loop; there is no interior threading.

use std::{
    io::ErrorKind,
    os::fd::{AsFd, AsRawFd, RawFd},
};

use tokio::io::unix::AsyncFd;

use wayland_client::{
    backend::{ReadEventsGuard, WaylandError},
    delegate_noop,
    globals::{registry_queue_init, GlobalListContents},
    protocol::{
        wl_buffer::WlBuffer,
        wl_compositor::WlCompositor,
        wl_keyboard,
        wl_output::{self, WlOutput},
        wl_pointer::{Axis, AxisSource, ButtonState as WlButtonState},
        wl_region::WlRegion,
        wl_registry,
        wl_seat::WlSeat,
        wl_shm::WlShm,
        wl_shm_pool::WlShmPool,
        wl_surface::WlSurface,
    },
    Connection, Dispatch, EventQueue, QueueHandle,
};

use wayland_protocols::xdg::xdg_output::zv1::client::{
    zxdg_output_manager_v1::ZxdgOutputManagerV1,
    zxdg_output_v1::{self, ZxdgOutputV1},
};

use wayland_protocols_wlr::{
    layer_shell::v1::client::{
        zwlr_layer_shell_v1::{Layer, ZwlrLayerShellV1},
        zwlr_layer_surface_v1::{self, Anchor, KeyboardInteractivity, ZwlrLayerSurfaceV1},
    },
    virtual_pointer::v1::client::{
        zwlr_virtual_pointer_manager_v1::ZwlrVirtualPointerManagerV1 as VpManager,
        zwlr_virtual_pointer_v1::ZwlrVirtualPointerV1 as Vp,
    },
};

use wayland_protocols_misc::zwp_virtual_keyboard_v1::client::{
    zwp_virtual_keyboard_manager_v1::ZwpVirtualKeyboardManagerV1 as VkManager,
    zwp_virtual_keyboard_v1::ZwpVirtualKeyboardV1 as Vk,
};

use input_event::{ButtonState, KeyState, ScrollEvent, ScrollSource};

use crate::{
    keymap::Keymap,
    layout::{Layout, Rect, MAX_OUTPUTS},
    overlay::Overlay,
};

pub use error::{
    KeymapError, LayoutError, SessionCreationError, SessionError, WaylandBindError,
};

pub mod error;
mod keymap;
pub mod layout;
mod overlay;

struct OutputSlot {
    /// registry global name; doubles as the user-data key of every object
    /// hanging off this output
    name: u32,
    wl_output: WlOutput,
    xdg_output: ZxdgOutputV1,
    pending: Rect,
    confirmed: Option<Rect>,
    overlay: Overlay,
}

pub(crate) struct SessionState {
    qh: QueueHandle<Self>,
    compositor: WlCompositor,
    shm: WlShm,
    layer_shell: ZwlrLayerShellV1,
    xdg_output_manager: ZxdgOutputManagerV1,
    _seat: WlSeat,
    virtual_pointer: Vp,
    virtual_keyboard: Vk,
    keymap: Keymap,
    cursor_color: u32,
    outputs: Vec<OutputSlot>,
    layout: Layout,
    /// registry names of the confirmed outputs, parallel to `layout`
    layout_names: Vec<u32>,
    /// errors raised inside dispatch handlers, surfaced by the next pump
    fatal: Option<SessionError>,
}

struct Inner {
    queue: EventQueue<SessionState>,
    state: SessionState,
    wayland_fd: RawFd,
    read_guard: Option<ReadEventsGuard>,
}

impl AsRawFd for Inner {
    fn as_raw_fd(&self) -> RawFd {
        self.wayland_fd
    }
}

/// The connection to the compositor.
pub struct Session(AsyncFd<Inner>);

impl Session {
    pub fn connect(cursor_color: u32) -> Result<Self, SessionCreationError> {
        let conn = Connection::connect_to_env()?;
        let (globals, mut queue) = registry_queue_init::<SessionState>(&conn)?;
        let qh = queue.handle();

        let compositor: WlCompositor = globals
            .bind(&qh, 4..=5, ())
            .map_err(|e| WaylandBindError::new(e, "wl_compositor 4..=5"))?;
        let shm: WlShm = globals
            .bind(&qh, 1..=1, ())
            .map_err(|e| WaylandBindError::new(e, "wl_shm"))?;
        let layer_shell: ZwlrLayerShellV1 = globals
            .bind(&qh, 3..=4, ())
            .map_err(|e| WaylandBindError::new(e, "wlr-layer-shell 3..=4"))?;
        let xdg_output_manager: ZxdgOutputManagerV1 = globals
            .bind(&qh, 1..=3, ())
            .map_err(|e| WaylandBindError::new(e, "xdg_output_manager 1..=3"))?;
        let seat: WlSeat = globals
            .bind(&qh, 7..=8, ())
            .map_err(|e| WaylandBindError::new(e, "wl_seat 7..=8"))?;
        let vpm: VpManager = globals
            .bind(&qh, 1..=1, ())
            .map_err(|e| WaylandBindError::new(e, "wlr-virtual-pointer-unstable-v1"))?;
        let vkm: VkManager = globals
            .bind(&qh, 1..=1, ())
            .map_err(|e| WaylandBindError::new(e, "virtual-keyboard-unstable-v1"))?;

        let keymap = Keymap::compile()?;
        let virtual_pointer = vpm.create_virtual_pointer(None, &qh, ());
        let virtual_keyboard = vkm.create_virtual_keyboard(&seat, &qh, ());
        virtual_keyboard.keymap(
            u32::from(wl_keyboard::KeymapFormat::XkbV1),
            keymap.fd().as_fd(),
            keymap.size(),
        );

        let mut state = SessionState {
            qh,
            compositor,
            shm,
            layer_shell,
            xdg_output_manager,
            _seat: seat,
            virtual_pointer,
            virtual_keyboard,
            keymap,
            cursor_color,
            outputs: Vec::with_capacity(8),
            layout: Layout::default(),
            layout_names: Vec::new(),
            fatal: None,
        };

        let mut seats = 0;
        for global in globals.contents().clone_list() {
            match global.interface.as_str() {
                "wl_output" => {
                    state.add_output(globals.registry(), global.name, global.version)
                }
                "wl_seat" => {
                    seats += 1;
                    if seats > 1 {
                        log::warn!("ignoring additional seat (global {})", global.name);
                    }
                }
                _ => {}
            }
        }

        // two roundtrips: one to deliver the xdg-output objects, one for
        // their geometry events
        queue.roundtrip(&mut state)?;
        queue.roundtrip(&mut state)?;
        queue.flush()?;

        if let Some(fatal) = state.fatal.take() {
            return Err(fatal.into());
        }

        let wayland_fd = queue.as_fd().as_raw_fd();
        let mut inner = Inner {
            queue,
            state,
            wayland_fd,
            read_guard: None,
        };
        inner.prepare_read()?;

        Ok(Self(AsyncFd::new(inner)?))
    }

    /// Wait for the compositor socket to become readable, then read and
    /// dispatch everything pending.
    pub async fn dispatch(&mut self) -> Result<(), SessionError> {
        let mut guard = self.0.readable_mut().await?;
        {
            let inner = guard.get_inner_mut();
            while inner.read()? {
                inner.prepare_read()?;
            }
            inner.dispatch_events()?;
            inner.flush_events()?;
            inner.prepare_read()?;
        }
        guard.clear_ready();
        drop(guard);
        self.take_fatal()
    }

    /// Dispatch whatever is already queued and flush outgoing requests.
    /// Never blocks.
    pub fn pump(&mut self) -> Result<(), SessionError> {
        let inner = self.0.get_mut();
        inner.dispatch_events()?;
        inner.prepare_read()?;
        inner.flush_events()?;
        self.take_fatal()
    }

    pub fn flush(&mut self) -> Result<(), SessionError> {
        self.0.get_mut().flush_events()
    }

    fn take_fatal(&mut self) -> Result<(), SessionError> {
        match self.0.get_mut().state.fatal.take() {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn layout(&self) -> &Layout {
        &self.0.get_ref().state.layout
    }

    /// Flag the output at `layout_idx` (an index into `layout().outputs()`)
    /// for a redraw on the next loop pass.
    pub fn mark_frame_pending(&mut self, layout_idx: usize) {
        let state = &mut self.0.get_mut().state;
        if let Some(name) = state.layout_names.get(layout_idx).copied() {
            if let Some(slot) = state.outputs.iter_mut().find(|s| s.name == name) {
                slot.overlay.frame_pending = true;
            }
        }
    }

    /// Redraw every flagged output. Skips (no buffer, unconfigured surface)
    /// leave the flag set so the next pass retries.
    pub fn redraw_flagged(&mut self, cursor: Option<(f64, f64)>) {
        let state = &mut self.0.get_mut().state;
        let color = state.cursor_color;
        for slot in &mut state.outputs {
            if !slot.overlay.frame_pending {
                continue;
            }
            let local = match (cursor, slot.confirmed) {
                (Some((x, y)), Some(rect)) if rect.contains(x, y) => {
                    Some(((x - rect.x as f64) as i32, (y - rect.y as f64) as i32))
                }
                _ => None,
            };
            slot.overlay.draw(local, color);
        }
    }

    pub fn replay_key(&mut self, time: u32, key: u32, state: KeyState) {
        let session = &mut self.0.get_mut().state;
        let wire_state = match state {
            KeyState::Pressed => 1,
            KeyState::Released => 0,
        };
        session.virtual_keyboard.key(time, key, wire_state);
        if let Some(mods) = session.keymap.update_key(key, state) {
            session.virtual_keyboard.modifiers(
                mods.depressed,
                mods.latched,
                mods.locked,
                mods.group,
            );
        }
    }

    pub fn replay_button(&mut self, time: u32, button: u32, state: ButtonState) {
        let session = &mut self.0.get_mut().state;
        let state = match state {
            ButtonState::Pressed => WlButtonState::Pressed,
            ButtonState::Released => WlButtonState::Released,
        };
        session.virtual_pointer.button(time, button, state);
        session.virtual_pointer.frame();
    }

    pub fn replay_scroll(&mut self, time: u32, scroll: ScrollEvent) {
        let session = &mut self.0.get_mut().state;
        let vp = &session.virtual_pointer;
        let source = match scroll.source {
            ScrollSource::Wheel => AxisSource::Wheel,
            ScrollSource::Finger => AxisSource::Finger,
            ScrollSource::Continuous => AxisSource::Continuous,
        };
        for (axis, delta) in [
            (Axis::VerticalScroll, scroll.vertical),
            (Axis::HorizontalScroll, scroll.horizontal),
        ] {
            let Some(delta) = delta else { continue };
            // the source is announced even for a zero delta
            vp.axis_source(source);
            if delta.value == 0.0 {
                vp.axis_stop(time, axis);
            } else if delta.v120 != 0 {
                vp.axis_discrete(time, axis, delta.value, delta.v120 / 120);
            } else {
                vp.axis(time, axis, delta.value);
            }
        }
        vp.frame();
    }

    /// Emit an absolute motion over the global space extent, followed by a
    /// frame marker. The target is clamped into the space before the wire
    /// narrowing so a layout change between enqueue and release cannot
    /// produce out-of-range coordinates.
    pub fn replay_motion_absolute(
        &mut self,
        time: u32,
        x: f64,
        y: f64,
    ) -> Result<(), SessionError> {
        let session = &mut self.0.get_mut().state;
        let Some(space) = session.layout.space() else {
            // every output vanished after the move was queued
            return Ok(());
        };
        let (x, y) = session
            .layout
            .clamp(x, y)
            .ok_or(SessionError::OutsideSpace { x, y })?;
        let local_x =
            wire_coord(x - space.x as f64).ok_or(SessionError::OutsideSpace { x, y })?;
        let local_y =
            wire_coord(y - space.y as f64).ok_or(SessionError::OutsideSpace { x, y })?;
        session.virtual_pointer.motion_absolute(
            time,
            local_x,
            local_y,
            space.width as u32,
            space.height as u32,
        );
        session.virtual_pointer.frame();
        Ok(())
    }
}

fn wire_coord(value: f64) -> Option<u32> {
    let rounded = value.round();
    (rounded >= 0.0 && rounded <= u32::MAX as f64).then(|| rounded as u32)
}

impl Inner {
    fn read(&mut self) -> Result<bool, SessionError> {
        let Some(guard) = self.read_guard.take() else {
            return Ok(false);
        };
        match guard.read() {
            Ok(_) => Ok(true),
            Err(WaylandError::Io(e)) if e.kind() == ErrorKind::WouldBlock => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn prepare_read(&mut self) -> Result<(), SessionError> {
        loop {
            match self.queue.prepare_read() {
                None => {
                    self.queue.dispatch_pending(&mut self.state)?;
                }
                Some(guard) => {
                    self.read_guard = Some(guard);
                    return Ok(());
                }
            }
        }
    }

    fn dispatch_events(&mut self) -> Result<(), SessionError> {
        self.queue.dispatch_pending(&mut self.state)?;
        Ok(())
    }

    fn flush_events(&mut self) -> Result<(), SessionError> {
        match self.queue.flush() {
            Ok(()) => Ok(()),
            Err(WaylandError::Io(e)) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl SessionState {
    fn slot_mut(&mut self, name: u32) -> Option<&mut OutputSlot> {
        self.outputs.iter_mut().find(|s| s.name == name)
    }

    fn add_output(&mut self, registry: &wl_registry::WlRegistry, name: u32, version: u32) {
        if self.outputs.len() >= MAX_OUTPUTS {
            self.fatal
                .get_or_insert(SessionError::Layout(LayoutError::TooManyOutputs(
                    MAX_OUTPUTS,
                )));
            return;
        }
        log::debug!("new output (global {name})");
        let wl_output: WlOutput = registry.bind(name, version.min(4), &self.qh, name);
        let xdg_output = self
            .xdg_output_manager
            .get_xdg_output(&wl_output, &self.qh, name);

        let surface = self.compositor.create_surface(&self.qh, ());
        // empty input region so the overlay never swallows pointer focus
        let region: WlRegion = self.compositor.create_region(&self.qh, ());
        surface.set_input_region(Some(&region));
        region.destroy();

        let layer_surface = self.layer_shell.get_layer_surface(
            &surface,
            Some(&wl_output),
            Layer::Overlay,
            "kloak cursor".into(),
            &self.qh,
            name,
        );
        layer_surface.set_anchor(Anchor::Top | Anchor::Bottom | Anchor::Left | Anchor::Right);
        layer_surface.set_size(0, 0);
        layer_surface.set_exclusive_zone(-1);
        layer_surface.set_keyboard_interactivity(KeyboardInteractivity::None);
        surface.commit();

        self.outputs.push(OutputSlot {
            name,
            wl_output,
            xdg_output,
            pending: Rect::default(),
            confirmed: None,
            overlay: Overlay::new(surface, layer_surface),
        });
    }

    fn remove_output(&mut self, name: u32) {
        let Some(idx) = self.outputs.iter().position(|s| s.name == name) else {
            return;
        };
        log::debug!("output removed (global {name})");
        let slot = self.outputs.remove(idx);
        slot.xdg_output.destroy();
        slot.wl_output.release();
        drop(slot.overlay);
        self.rebuild_layout();
    }

    /// Promote staged geometry after a `done` cycle. Zero-sized updates are
    /// discarded.
    fn promote_output(&mut self, name: u32) {
        let Some(slot) = self.slot_mut(name) else {
            return;
        };
        if !slot.pending.has_size() {
            return;
        }
        if slot.confirmed == Some(slot.pending) {
            return;
        }
        slot.confirmed = Some(slot.pending);
        self.rebuild_layout();
    }

    fn rebuild_layout(&mut self) {
        let confirmed: Vec<(u32, Rect)> = self
            .outputs
            .iter()
            .filter_map(|s| s.confirmed.map(|r| (s.name, r)))
            .collect();
        let rects = confirmed.iter().map(|(_, r)| *r).collect();
        match self.layout.rebuild(rects) {
            Ok(()) => {
                self.layout_names = confirmed.into_iter().map(|(n, _)| n).collect();
                for slot in &mut self.outputs {
                    slot.overlay.frame_pending = true;
                }
                log::debug!("pointer space: {:?}", self.layout.space());
            }
            Err(e) => {
                self.fatal.get_or_insert(e.into());
            }
        }
    }
}

impl Dispatch<wl_registry::WlRegistry, GlobalListContents> for SessionState {
    fn event(
        state: &mut Self,
        registry: &wl_registry::WlRegistry,
        event: wl_registry::Event,
        _: &GlobalListContents,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            wl_registry::Event::Global {
                name,
                interface,
                version,
            } => match interface.as_str() {
                "wl_output" => state.add_output(registry, name, version),
                "wl_seat" => log::warn!("ignoring additional seat (global {name})"),
                _ => {}
            },
            wl_registry::Event::GlobalRemove { name } => state.remove_output(name),
            _ => {}
        }
    }
}

impl Dispatch<WlOutput, u32> for SessionState {
    fn event(
        state: &mut Self,
        _: &WlOutput,
        event: wl_output::Event,
        name: &u32,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wl_output::Event::Done = event {
            state.promote_output(*name);
        }
    }
}

impl Dispatch<ZxdgOutputV1, u32> for SessionState {
    fn event(
        state: &mut Self,
        _: &ZxdgOutputV1,
        event: zxdg_output_v1::Event,
        name: &u32,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            zxdg_output_v1::Event::LogicalPosition { x, y } => {
                if let Some(slot) = state.slot_mut(*name) {
                    slot.pending.x = x;
                    slot.pending.y = y;
                }
            }
            zxdg_output_v1::Event::LogicalSize { width, height } => {
                if let Some(slot) = state.slot_mut(*name) {
                    slot.pending.width = width;
                    slot.pending.height = height;
                }
            }
            // xdg_output v3 folds this into wl_output.done, older
            // compositors still send it
            zxdg_output_v1::Event::Done => state.promote_output(*name),
            _ => {}
        }
    }
}

impl Dispatch<ZwlrLayerSurfaceV1, u32> for SessionState {
    fn event(
        state: &mut Self,
        layer_surface: &ZwlrLayerSurfaceV1,
        event: zwlr_layer_surface_v1::Event,
        name: &u32,
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        match event {
            zwlr_layer_surface_v1::Event::Configure {
                serial,
                width,
                height,
            } => {
                let qh = state.qh.clone();
                let shm = state.shm.clone();
                let Some(slot) = state.slot_mut(*name) else {
                    return;
                };
                if !slot.overlay.matches(layer_surface) {
                    return;
                }
                slot.overlay.ack(serial);
                let (Ok(width), Ok(height)) = (i32::try_from(width), i32::try_from(height))
                else {
                    return;
                };
                if width == 0 || height == 0 {
                    return;
                }
                if let Err(e) = slot.overlay.configure(&shm, &qh, *name, width, height) {
                    state.fatal.get_or_insert(SessionError::Io(e));
                }
            }
            zwlr_layer_surface_v1::Event::Closed => {
                if let Some(slot) = state.slot_mut(*name) {
                    slot.overlay.close();
                }
            }
            _ => {}
        }
    }
}

impl Dispatch<WlBuffer, (u32, usize)> for SessionState {
    fn event(
        state: &mut Self,
        _: &WlBuffer,
        event: wayland_client::protocol::wl_buffer::Event,
        (name, frame): &(u32, usize),
        _: &Connection,
        _: &QueueHandle<Self>,
    ) {
        if let wayland_client::protocol::wl_buffer::Event::Release = event {
            if let Some(slot) = state.slot_mut(*name) {
                slot.overlay.buffer_released(*frame);
            }
        }
    }
}

delegate_noop!(SessionState: WlCompositor);
delegate_noop!(SessionState: WlShmPool);
delegate_noop!(SessionState: WlRegion);
delegate_noop!(SessionState: ZwlrLayerShellV1);
delegate_noop!(SessionState: Vp);
delegate_noop!(SessionState: Vk);
delegate_noop!(SessionState: VpManager);
delegate_noop!(SessionState: VkManager);

delegate_noop!(SessionState: ignore WlShm);
delegate_noop!(SessionState: ignore WlSeat);
delegate_noop!(SessionState: ignore WlSurface);
delegate_noop!(SessionState: ignore ZxdgOutputManagerV1);
