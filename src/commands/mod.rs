//! IPC commands exposed to the frontend.
//!
//! Each command takes the shared [`AppState`](crate::AppState) and returns
//! `Result<T, String>` so errors cross the IPC boundary as plain messages.

pub mod chat;
pub mod settings;
