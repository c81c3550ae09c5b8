//! Reading scenario files that describe a system and the constraints placed on it.

pub mod scenario;
