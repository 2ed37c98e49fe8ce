//! Stream Pacer
//!
//! Plays a live compressed camera stream back at the cadence the source
//! captured it, not the cadence the decoder happens to deliver it.
//!
//! # Pipeline
//!
//! ```text
//! FrameSource --RawFrame--> convert --ColorTaggedImage--> PacingEngine --wait--> DisplaySink
//!                                                                         \--> RateCounter
//! ```
//!
//! - `source`: decoders (`StreamSource`: synthetic, FFmpeg, GStreamer)
//! - `convert`: pure color conversions between GRAY, BGR, BGRA (and NV12 input)
//! - `pacing`: clock anchoring and drift computation
//! - `rate`: rolling throughput counter readable from any thread
//! - `sink`: display sinks that never block the worker
//! - `acquisition`: the session state machine tying it together
//!
//! The pacer never drops frames. A frame that arrives late is shown at once;
//! a frame that arrives early is held until the host catches up with the
//! source timeline.

pub mod acquisition;
pub mod cancel;
pub mod config;
pub mod convert;
pub mod error;
pub mod frame;
pub mod pacing;
pub mod rate;
pub mod sink;
pub mod source;

pub use acquisition::{
    AcquisitionLoop, ExitReason, LoopConfig, LoopState, SessionExit, SessionReport, SourceFactory,
};
pub use cancel::StopSignal;
pub use config::ViewerConfig;
pub use convert::{convert, convert_owned};
pub use error::{PipelineError, StartError};
pub use frame::{ColorSpace, ColorTaggedImage, RawFrame};
pub use pacing::{
    Advice, Clock, ClockAnchor, DriftSample, ManualClock, PacingEngine, SystemClock,
};
pub use rate::{RateCounter, RateSnapshot};
pub use sink::{ChannelSink, DisplaySink, LatestSink};
pub use source::{FrameSource, SourceConfig, SourceInfo, StreamSource};
