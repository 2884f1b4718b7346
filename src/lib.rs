//! sightline-daemon: narration and walking guidance for visually-impaired users
//!
//! The daemon hosts a single session coordinator that arbitrates free-running
//! scene narration, turn-by-turn navigation and distance calibration. A
//! front-end connects over a Unix socket, supplies camera frames and location
//! fixes, and performs speech and dialogs on the daemon's behalf.

pub mod analysis;
pub mod autocapture;
pub mod backend;
pub mod bridge;
pub mod calibration;
pub mod capture;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod input;
pub mod ipc;
pub mod lifecycle;
pub mod navigation;
pub mod obstacle;
pub mod settings;
pub mod speech;

#[cfg(test)]
mod testing;
