mod error;
mod framed;

pub use error::TransportError;
pub use framed::{FrameMode, FramedReader, FramedWriter, SENTINEL};
