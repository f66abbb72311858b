//! Telemetry transmission over the modem's open TCP socket

mod pipeline;

pub use pipeline::{PipelineTimings, TransmissionOutcome, TransmissionPipeline};
