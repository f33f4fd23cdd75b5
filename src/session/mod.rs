// src/session/mod.rs
//! Session lifecycle and duration updates

pub mod tracker;

pub use tracker::{Session, SessionTracker, SESSION_ID_SEGMENT};
