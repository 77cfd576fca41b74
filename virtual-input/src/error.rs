use std::io;
use thiserror::Error;

use wayland_client::{
    backend::WaylandError,
    globals::{BindError, GlobalError},
    ConnectError, DispatchError,
};

#[derive(Debug, Error)]
#[error("wayland protocol \"{protocol}\" not supported: {inner}")]
pub struct WaylandBindError {
    inner: BindError,
    protocol: &'static str,
}

impl WaylandBindError {
    pub(crate) fn new(inner: BindError, protocol: &'static str) -> Self {
        Self { inner, protocol }
    }
}

#[derive(Debug, Error)]
pub enum KeymapError {
    #[error("xkb keymap compilation failed")]
    Compile,
    #[error("io error: `{0}`")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum LayoutError {
    #[error("screen layout has a gap: only {reachable} of {total} outputs are connected")]
    Disconnected { reachable: usize, total: usize },
    #[error("more than {0} outputs attached")]
    TooManyOutputs(usize),
}

#[derive(Debug, Error)]
pub enum SessionCreationError {
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Global(#[from] GlobalError),
    #[error(transparent)]
    Wayland(#[from] WaylandError),
    #[error(transparent)]
    Bind(#[from] WaylandBindError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Keymap(#[from] KeymapError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("wayland error: `{0}`")]
    Wayland(#[from] WaylandError),
    #[error(transparent)]
    Dispatch(#[from] DispatchError),
    #[error(transparent)]
    Layout(#[from] LayoutError),
    #[error("pointer target ({x}, {y}) outside the global space")]
    OutsideSpace { x: f64, y: f64 },
    #[error("io error: `{0}`")]
    Io(#[from] io::Error),
}
