pub mod latest;
pub mod sink;

pub use latest::LatestImageCache;
pub use sink::{BmpSink, FrameSink, SinkError};
