//! Event types broadcast to UI consumers.
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so a front end
//! can forward them as JSON unchanged.

pub mod events;
