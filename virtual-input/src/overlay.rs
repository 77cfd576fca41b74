//! Per-output overlay surface that draws the virtual cursor.
//!
//! Each output carries a layer surface and a small shm pool holding a ring
//! of frames. A frame cycles Free -> InFlight (committed) -> Returned
//! (released by the compositor) -> Free (stale cursor block zeroed).

use std::{fs::File, io, os::fd::AsFd};

use memmap::MmapMut;
use wayland_client::{
    protocol::{wl_shm, wl_shm_pool::WlShmPool, wl_surface::WlSurface},
    protocol::wl_buffer::WlBuffer,
    QueueHandle,
};
use wayland_protocols_wlr::layer_shell::v1::client::zwlr_layer_surface_v1::ZwlrLayerSurfaceV1;

use crate::SessionState;

pub(crate) const FRAME_COUNT: usize = 2;
const CURSOR_SIZE: i32 = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FrameState {
    Free,
    InFlight,
    Returned,
}

struct Frame {
    buffer: WlBuffer,
    offset: usize,
    state: FrameState,
    /// cursor block origin drawn into this frame's pixels
    drawn: Option<(i32, i32)>,
}

struct FramePool {
    pool: WlShmPool,
    frames: Vec<Frame>,
    mmap: MmapMut,
    _file: File,
    width: i32,
    height: i32,
}

impl FramePool {
    fn new(
        shm: &wl_shm::WlShm,
        qh: &QueueHandle<SessionState>,
        output: u32,
        width: i32,
        height: i32,
    ) -> io::Result<Self> {
        let stride = width
            .checked_mul(4)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))?;
        let frame_size = stride
            .checked_mul(height)
            .ok_or_else(|| io::Error::from(io::ErrorKind::InvalidInput))? as usize;
        let total = frame_size * FRAME_COUNT;
        let pool_size =
            i32::try_from(total).map_err(|_| io::Error::from(io::ErrorKind::InvalidInput))?;

        let file = tempfile::tempfile()?;
        file.set_len(total as u64)?;
        let mmap = unsafe { MmapMut::map_mut(&file)? };

        let pool = shm.create_pool(file.as_fd(), pool_size, qh, ());
        let frames = (0..FRAME_COUNT)
            .map(|i| Frame {
                buffer: pool.create_buffer(
                    (i * frame_size) as i32,
                    width,
                    height,
                    stride,
                    wl_shm::Format::Argb8888,
                    qh,
                    (output, i),
                ),
                offset: i * frame_size,
                state: FrameState::Free,
                drawn: None,
            })
            .collect();

        Ok(Self {
            pool,
            frames,
            mmap,
            _file: file,
            width,
            height,
        })
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        for frame in &self.frames {
            frame.buffer.destroy();
        }
        self.pool.destroy();
    }
}

pub(crate) struct Overlay {
    pool: Option<FramePool>,
    surface: WlSurface,
    layer_surface: ZwlrLayerSurfaceV1,
    pub(crate) frame_pending: bool,
    /// cursor block origin currently on screen
    last_cursor: Option<(i32, i32)>,
}

impl Overlay {
    pub(crate) fn new(surface: WlSurface, layer_surface: ZwlrLayerSurfaceV1) -> Self {
        Self {
            pool: None,
            surface,
            layer_surface,
            frame_pending: false,
            last_cursor: None,
        }
    }

    pub(crate) fn matches(&self, layer_surface: &ZwlrLayerSurfaceV1) -> bool {
        &self.layer_surface == layer_surface
    }

    /// (Re)allocate the frame ring for the configured surface size.
    pub(crate) fn configure(
        &mut self,
        shm: &wl_shm::WlShm,
        qh: &QueueHandle<SessionState>,
        output: u32,
        width: i32,
        height: i32,
    ) -> io::Result<()> {
        self.pool = Some(FramePool::new(shm, qh, output, width, height)?);
        self.last_cursor = None;
        self.frame_pending = true;
        Ok(())
    }

    pub(crate) fn ack(&self, serial: u32) {
        self.layer_surface.ack_configure(serial);
    }

    /// The compositor closed the surface (usually mid-unplug); drop the
    /// frames and wait for the output to disappear.
    pub(crate) fn close(&mut self) {
        self.pool = None;
        self.frame_pending = false;
        self.last_cursor = None;
    }

    pub(crate) fn buffer_released(&mut self, frame: usize) {
        if let Some(pool) = self.pool.as_mut() {
            if let Some(frame) = pool.frames.get_mut(frame) {
                frame.state = FrameState::Returned;
            }
        }
    }

    /// Draw the cursor block (or nothing, when the cursor is on another
    /// output) into a free frame and commit it. Skips are recoverable: the
    /// surface has no configured pool yet or every frame is in flight.
    pub(crate) fn draw(&mut self, cursor: Option<(i32, i32)>, color: u32) -> bool {
        let Some(pool) = self.pool.as_mut() else {
            return false;
        };
        let Some(idx) = pool
            .frames
            .iter()
            .position(|f| f.state != FrameState::InFlight)
        else {
            return false;
        };

        let FramePool {
            frames,
            mmap,
            width,
            height,
            ..
        } = pool;
        let (width, height) = (*width, *height);
        let frame = &mut frames[idx];
        let pixels = &mut mmap[frame.offset..frame.offset + (width * height * 4) as usize];

        let mut damage = Vec::with_capacity(3);

        // zero the stale block from this frame's previous use
        if let Some(old) = frame.drawn.take() {
            fill_block(pixels, width, height, old, 0);
            damage.push(old);
        }
        // the block currently displayed by the other frame changes too
        if let Some(shown) = self.last_cursor.take() {
            damage.push(shown);
        }
        if let Some(pos) = cursor {
            fill_block(pixels, width, height, pos, color);
            damage.push(pos);
            frame.drawn = Some(pos);
        }

        self.surface.attach(Some(&frame.buffer), 0, 0);
        for (bx, by) in damage {
            let (x, y, w, h) = clip_block(bx, by, width, height);
            if w > 0 && h > 0 {
                self.surface.damage_buffer(x, y, w, h);
            }
        }
        self.surface.commit();

        frame.state = FrameState::InFlight;
        self.last_cursor = cursor;
        self.frame_pending = false;
        true
    }
}

impl Drop for Overlay {
    fn drop(&mut self) {
        self.pool.take();
        self.layer_surface.destroy();
        self.surface.destroy();
    }
}

fn clip_block(bx: i32, by: i32, width: i32, height: i32) -> (i32, i32, i32, i32) {
    let x0 = bx.max(0);
    let y0 = by.max(0);
    let x1 = bx.saturating_add(CURSOR_SIZE).min(width);
    let y1 = by.saturating_add(CURSOR_SIZE).min(height);
    (x0, y0, x1 - x0, y1 - y0)
}

fn fill_block(pixels: &mut [u8], width: i32, height: i32, origin: (i32, i32), color: u32) {
    let (x0, y0, w, h) = clip_block(origin.0, origin.1, width, height);
    for y in y0..y0 + h {
        for x in x0..x0 + w {
            let i = ((y * width + x) * 4) as usize;
            pixels[i..i + 4].copy_from_slice(&color.to_le_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blocks_are_clipped_to_the_surface() {
        assert_eq!(clip_block(-4, 0, 100, 100), (0, 0, CURSOR_SIZE - 4, CURSOR_SIZE));
        assert_eq!(
            clip_block(95, 95, 100, 100),
            (95, 95, 5, 5)
        );
        let (_, _, w, h) = clip_block(200, 200, 100, 100);
        assert!(w <= 0 || h <= 0);
    }

    #[test]
    fn fill_block_writes_argb_pixels() {
        let mut pixels = vec![0u8; 100 * 100 * 4];
        fill_block(&mut pixels, 100, 100, (0, 0), 0xFFFF0000);
        assert_eq!(&pixels[0..4], &[0x00, 0x00, 0xFF, 0xFF]);
        // outside the block stays untouched
        let off = ((CURSOR_SIZE as usize) * 100 + CURSOR_SIZE as usize) * 4;
        assert_eq!(&pixels[off..off + 4], &[0, 0, 0, 0]);
    }
}
