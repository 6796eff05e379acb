//! ndstream - streaming transport for detector array frames
//!
//! Encodes multi-dimensional arrays with typed attributes into a
//! self-describing binary frame and moves those frames over a
//! publish/subscribe broker, reporting connection health to an observer.

pub mod array;
pub mod codec;
pub mod config;
pub mod pipeline;
pub mod status;
pub mod transport;
pub mod utils;
