//! Host-side calibration engine for an addressable loudspeaker array
//! driven by a small rack of signal-processing units: two playback
//! units and one combined playback/record unit, optionally started
//! together over a shared trigger bus.
//!
//! Calibration measures each speaker's frequency response in turn. A
//! probe chirp is routed to exactly one speaker, played, recorded at
//! the array center, and compared against what was played; the inverse
//! of the measured response becomes that speaker's correction filter.
//! Speakers too quiet to measure are bypassed with a flat filter. The
//! resulting per-speaker filter bank is persisted per geometry and
//! applied whenever a signal is later played through the array.
//!
//! Real hardware hides behind the [processor::ProcessorDriver] seam;
//! the [dummy_processor] module provides a simulated rack that the
//! tests and the demo binary run the full protocol against.

#![warn(missing_docs)]
pub mod args;
pub mod dummy_processor;
pub mod engine;
pub mod filter;
pub mod processor;
pub mod rack;
pub mod signal;
pub mod speaker_table;
