#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("malformed chunk header")]
    FramingInvalid,
    #[error("peer closed connection mid-frame")]
    EofMidFrame,
    #[error("transport io error: {0}")]
    Io(#[from] std::io::Error),
}
