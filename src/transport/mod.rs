pub mod serial;
pub mod traits;

#[cfg(test)]
pub mod mock;

pub use serial::{SerialPortConfig, SerialPortLink};
pub use traits::SerialLink;
