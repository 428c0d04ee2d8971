//! Stepper pulse schedule compression and synchronization.
//!
//! A motion planner hands this crate absolute step event times, one per
//! physical stepper pulse. The crate compresses them into the
//! `queue_step` commands a microcontroller replays with simple interval
//! arithmetic (`t += interval; interval += add`), keeping every
//! reproduced pulse inside a per-step tolerance window, and merges the
//! command streams of all steppers so the mcu's fixed-size move queue
//! never overflows.
//!
//! This crate intentionally avoids any transport- or MCU-specific
//! dependencies.

mod compress;
pub mod message;
pub mod step_compressor;
pub mod stepper_sync;
