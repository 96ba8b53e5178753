//! Core library for the echem_box service.
//!
//! echem_box remotely operates a bank of potentiostat measurement
//! instruments ("slots"): it admits measurement jobs, runs scripted mode
//! sequences per slot concurrently, tracks progress and cancellation,
//! persists output under versioned run directories, and mirrors completed
//! runs to network storage with a time-based retention policy.
//!
//! The orchestration core lives in [`jobs`] and [`sync`]; [`server`] is a
//! thin HTTP veneer and [`driver`] is the interface boundary to the
//! instrument hardware.

pub mod config;
pub mod driver;
pub mod error;
pub mod jobs;
pub mod plot;
pub mod progress;
pub mod server;
pub mod storage;
pub mod sync;
pub mod validation;
