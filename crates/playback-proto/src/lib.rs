//! Types shared between the playback daemon and its observers: the wire
//! protocol, the observer-side state view, configuration and platform paths.

pub mod config;
pub mod observer;
pub mod platform;
pub mod protocol;
pub mod state;
