//! Simon-task driver for an external cognitive engine.
//!
//! Paces the engine through fixation / cue / stimulus trials, instruments its
//! rule firings and rewards, adapts the response cost, and flattens the
//! results into summary and trace tables. The `sweep` module repeats
//! sessions over parameter grids.

pub mod aggregate;
pub mod config;
pub mod cost;
pub mod engine;
pub mod error;
pub mod export;
pub mod instrument;
pub mod logging;
pub mod params;
pub mod stimulus;
pub mod storage;
pub mod sweep;
pub mod task;
pub mod trial;
