//! PropScout API Library Crate
//!
//! This library contains the web service around `propscout_core`: the
//! application state, Postgres persistence, REST handlers, the browser
//! WebSocket bridge with its realtime model providers, and routing. The
//! binaries in `bin/` are thin wrappers around this library.

pub mod audio_utils;
pub mod config;
pub mod db;
pub mod handlers;
pub mod models;
pub mod router;
pub mod state;
pub mod ws;
