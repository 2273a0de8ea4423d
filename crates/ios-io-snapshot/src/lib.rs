//! Deterministic save-state encoding shared by the IOS kernel, its devices and the USB layer.

pub mod state;
