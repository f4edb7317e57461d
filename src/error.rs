use thiserror::Error;

/// Failure taxonomy for a single export call. Every variant is terminal for
/// that call; the library never retries.
#[derive(Debug, Error)]
pub enum RigPlotError {
    #[error("Nothing to export")]
    EmptyBuffer,

    #[error("invalid output path: {0}")]
    InvalidOutputPath(String),

    #[error("output folder does not exist: {0}")]
    MissingOutputFolder(String),

    #[error("viewport width and height must be positive (got {width} x {height})")]
    InvalidViewport { width: f32, height: f32 },

    #[error("zoom must be a finite positive value (got {0})")]
    InvalidZoom(f32),

    #[error("page dimensions must be positive after margins")]
    InvalidPageSetup,

    #[error("unknown symbol id {0} referenced by the buffer")]
    UnknownSymbol(u32),

    #[error("font error: {0}")]
    Font(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_messages_are_specific() {
        assert_eq!(RigPlotError::EmptyBuffer.to_string(), "Nothing to export");
        let viewport = RigPlotError::InvalidViewport {
            width: 0.0,
            height: 600.0,
        };
        assert!(viewport.to_string().contains("viewport"));
        let zoom = RigPlotError::InvalidZoom(f32::NAN);
        assert!(zoom.to_string().contains("zoom"));
    }
}
