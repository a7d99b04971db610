//! Decoders for MLR1 DAQ board test-chip data.
//!
//! This crate turns the raw byte streams recorded with the MLR1 DAQ board into
//! structured data:
//!
//! - APTS: sentinel-framed events of 40-byte frames holding 16 bit-transposed
//!   ADC channels mapped onto a 4x4 pixel matrix
//! - OPAMP: the same ADC stream plus an oscilloscope stream cut by position
//! - DPTS: zero-crossing extraction from differential scope traces, grouping
//!   into 4-edge trains and pixel identification from a calibration table
//!
//! # Example
//!
//! ```no_run
//! use mlr1_core::decoder::AptsDecoder;
//! use mlr1_core::types::ChipVariant;
//!
//! let mut decoder = AptsDecoder::open("apts_run.raw", ChipVariant::Standard).unwrap();
//! while let Some(event) = decoder.next_event().unwrap() {
//!     println!("{} frames, trigger {:?}", event.frames.len(), event.trigger_timestamp);
//! }
//! ```
//!
//! Decoding stops at the first framing error; the stream is never
//! resynchronised.

pub mod decoder;
pub mod dpts;
pub mod opamp;
pub mod output;
pub mod parser;
pub mod progress;
pub mod sidecar;
pub mod types;

// Re-export commonly used types
pub use decoder::{AptsDecoder, DecodeError};
pub use dpts::{DptsError, TrainSet, ZeroSuppress};
pub use opamp::{HeaderTrim, OpampDecoder, ScopeLayout};
pub use output::OutputError;
pub use parser::FrameError;
pub use progress::ProgressSink;
pub use sidecar::{ChipId, ConfigError, ScopeSettings, Sidecar};
pub use types::{AptsEvent, AptsRun, ChipVariant, Frame, SampleWidth, ScopeEvent, ScopeSamples};
