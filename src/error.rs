use thiserror::Error;

/// Errors that can arise in the mesh core and the IP bridge.
///
/// Per-packet conditions (`NotFound`, `ResourceExhausted`, `Corrupted`,
/// `Unsupported`) are local and non-fatal: the packet is dropped, counters
/// are updated and processing continues. Setup failures (`Transport` during
/// initialization) are fatal and surface to the caller unchanged.
#[derive(Debug, Error)]
pub enum MeshError {
    /// Operation attempted before its required prior step, e.g. forwarding
    /// before enable or start before initialize.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),

    /// Malformed input: empty payload, oversized frame, zero destination.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// No route to the requested subnet or node.
    #[error("not found: {0}")]
    NotFound(&'static str),

    /// Queue full or allocation failure.
    #[error("resource exhausted: {0}")]
    ResourceExhausted(&'static str),

    /// Bounded wait exceeded, e.g. task-stop confirmation.
    #[error("timed out: {0}")]
    Timeout(&'static str),

    /// Checksum or length mismatch on a received frame.
    #[error("corrupted frame: {0}")]
    Corrupted(&'static str),

    /// Frame carries a protocol version this implementation does not speak.
    #[error("unsupported frame version {0}")]
    Unsupported(u8),

    /// Failure reported by the underlying mesh transport.
    #[error("transport error: {0}")]
    Transport(String),

    /// Wrapper around IO errors (config files, store directories).
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Wrapper around sled's error type.
    #[error("persistence error: {0}")]
    Persistence(#[from] sled::Error),

    /// Wrapper around bincode serialization and deserialization errors.
    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, MeshError>;
