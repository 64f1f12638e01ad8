#![forbid(unsafe_code)]

//! Channel tracking and grab scheduling for ytgrab.
//!
//! The library holds the video lifecycle rules, the record store, the
//! service adapters that talk to `yt-dlp`, and the in-process job runner.
//! The binaries under `src/bin` are thin shells around these modules.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod model;
pub mod reconcile;
pub mod service;
pub mod state;
pub mod store;

#[cfg(test)]
pub(crate) mod testing;
