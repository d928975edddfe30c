//! Layered image on top of the tile store: a node tree whose group
//! projections are recomposited by the update scheduler.

mod config;
mod graph;
mod image;
pub mod logging;
mod stroke;
mod updates;
mod walker;

use std::io;
use std::path::PathBuf;

use model::NodeId;
use scheduler::{SchedulerConfigError, SchedulerError};

pub use config::CoreConfig;
pub use graph::NodeKind;
pub use image::Image;
pub use stroke::FillStroke;
pub use updates::{FilterCookie, ImageUpdater, ProjectionUpdatesFilter};

#[derive(Debug, thiserror::Error)]
pub enum DocumentError {
    #[error("unknown node {0:?}")]
    UnknownNode(NodeId),
    #[error("node {0:?} is not a group")]
    NotAGroup(NodeId),
    #[error("node {0:?} is not a paint layer")]
    NotAPaintLayer(NodeId),
    #[error("the root node cannot be removed")]
    RootRemoval,
    #[error("image size {width}x{height} is not positive")]
    EmptyImage { width: i32, height: i32 },
    #[error("default pixel has {found} bytes, expected {expected}")]
    DefaultPixelSize { expected: usize, found: usize },
    #[error("memory config: {0}")]
    Memory(#[from] tiles::ConfigError),
    #[error("scheduler config: {0}")]
    Scheduler(#[from] SchedulerConfigError),
    #[error("reading config {path}: {source}")]
    ReadConfig { path: PathBuf, source: io::Error },
    #[error("parsing config: {0}")]
    ParseConfig(#[from] toml::de::Error),
    #[error(transparent)]
    Stroke(#[from] SchedulerError),
}

#[cfg(test)]
mod tests;
