#![allow(clippy::uninlined_format_args)]

pub mod app;
pub mod config;
pub mod data;
pub mod dispatch;
pub mod engagement;
pub mod error;
pub mod feed;
pub mod logging;
pub mod model;
pub mod pagination;
pub mod playback;
pub mod size_cache;
pub mod threads;
pub mod ui;
pub mod video;
pub mod virtualizer;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{run, RunOptions};
