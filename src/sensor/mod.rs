//! Sensor input: newline-framed `key=value` telemetry from the sensor link

mod reader;

pub use reader::{LineReader, SensorEvent};
