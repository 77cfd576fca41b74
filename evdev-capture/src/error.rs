use std::{io, path::PathBuf};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CaptureCreationError {
    #[error("libinput context: `{0}`")]
    Context(io::Error),
    #[error("udev: `{0}`")]
    Udev(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum CaptureError {
    #[error("failed to grab evdev device {}", .0.display())]
    Grab(PathBuf),
    #[error("io error: `{0}`")]
    Io(#[from] io::Error),
}
