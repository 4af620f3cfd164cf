//! Data reported by detectors: named channels grouped into per-detector payloads.

pub mod channel;

pub use channel::{Channel, ChannelAxis, ChannelData, DetectorPayload};
