// src/position/mod.rs
//! Position acquisition: sample type, stream abstraction and sources

pub mod data;
pub mod gpsd;
pub mod scripted;
pub mod source;

pub use data::Position;
pub use gpsd::GpsdSource;
pub use scripted::ScriptedSource;
pub use source::{PositionEvent, PositionOptions, PositionSource, Watch, WatchHandle, WatchSender};
