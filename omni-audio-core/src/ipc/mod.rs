//! Types published to the rest of the firmware (LED ring, display, network).
//!
//! All types derive `serde::Serialize` + `serde::Deserialize` so status can be
//! forwarded as JSON without a second set of mirror structs.

pub mod events;
