//! # mediawire-transport
//!
//! Transport-agnostic core of the mediawire streaming layer.
//!
//! Turns application frames into framed, sequenced, CRC-checked units that
//! fit any MTU-limited transport, rebuilds them on the far side, and decides
//! which video frames to sacrifice when the transport backs up.
//!
//! ## Crate structure
//!
//! - [`wire`] — Unit header, fragment header, CRC8, byte order
//! - [`framing`] — Packer and chunk-tolerant Unpacker
//! - [`fragment`] — Frame splitting into indexed fragments
//! - [`pool`] — Fixed slot arena with free/ready lists
//! - [`reassembly`] — Reassembly state machine and worker thread
//! - [`congestion`] — Drop-level controller and GOP drop gate
//! - [`media`] — Codec descriptors and H.264 frame classification
//! - [`stats`] — Per-stage counters

pub mod congestion;
pub mod fragment;
pub mod framing;
pub mod media;
pub mod pool;
pub mod reassembly;
pub mod stats;
pub mod wire;

pub use wire::{FRAGMENT_HEADER_SIZE, HEADER_SIZE};
