pub mod stream_source;
pub mod title;

pub use stream_source::{
    CancelHandle, FanoutRequest, HttpStreamSource, OpenError, OpenedStream, ResponseStream,
    StreamChunk, StreamRequest, StreamSource,
};
