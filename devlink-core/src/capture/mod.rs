//! Shared capture resource and frame fan-out.
//!
//! | Module | Role |
//! |---|---|
//! | [`types`] | Raw frames, pixel formats, preview / playback sinks |
//! | [`source`] | `CaptureSource` collaborator + synthetic `PatternCapture` |
//! | [`encoder`] | `FrameEncoder` collaborator + `ZstdFrameEncoder` |
//! | [`pipeline`] | Capture-thread frame routing and chunk fan-out |
//! | [`arbiter`] | Demand-set reference counting (Idle / Active) |
//!
//! ```text
//!  CaptureSource ──frames──► FramePipeline ──► preview sink
//!        ▲                        │
//!        │ start/stop             └──encode──► fan_out ──► viewing peers
//!  CaptureArbiter ──watch(FanoutTargets)──┘
//! ```

pub mod arbiter;
pub mod encoder;
pub mod pipeline;
pub mod source;
pub mod types;

pub use arbiter::{CaptureArbiter, Transition};
pub use encoder::{CHUNK_HEADER_SIZE, EncoderFactory, FrameEncoder, ZstdFrameEncoder};
pub use pipeline::{CaptureSignal, FanoutTargets, FramePipeline, fan_out};
pub use source::{CaptureSource, FRAME_QUEUE_DEPTH, FrameReceiver, PatternCapture};
pub use types::{ChunkSink, FrameSink, PixelFormat, RawFrame};
