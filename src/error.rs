use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum TunnelError {
    #[error("setup error: {0}")]
    Setup(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("decryption error: {0}")]
    Decrypt(String),

    #[error("multiplex session closed")]
    SessionClosed,
}

pub type Result<T> = std::result::Result<T, TunnelError>;

/// Merge two optional failures into one reported error, keeping both messages.
pub fn combine_errors(first: Option<io::Error>, second: Option<io::Error>) -> Option<io::Error> {
    match (first, second) {
        (None, None) => None,
        (Some(e), None) | (None, Some(e)) => Some(e),
        (Some(a), Some(b)) => Some(io::Error::new(a.kind(), format!("{}; {}", a, b))),
    }
}

/// Build an IO error that carries a [`TunnelError::Decrypt`], so decryption
/// failures stay distinguishable from transport failures in stream code.
pub fn decrypt_error(msg: impl Into<String>) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        TunnelError::Decrypt(msg.into()),
    )
}

/// Whether an IO error originated from a decryption failure.
pub fn is_decrypt_error(err: &io::Error) -> bool {
    err.get_ref()
        .and_then(|e| e.downcast_ref::<TunnelError>())
        .is_some_and(|e| matches!(e, TunnelError::Decrypt(_)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_combine_errors_keeps_both_messages() {
        let first = io::Error::new(io::ErrorKind::BrokenPipe, "upload leg");
        let second = io::Error::new(io::ErrorKind::ConnectionReset, "download leg");

        let combined = combine_errors(Some(first), Some(second)).unwrap();
        let msg = combined.to_string();

        assert!(msg.contains("upload leg"));
        assert!(msg.contains("download leg"));
    }

    #[test]
    fn test_combine_errors_passes_single_through() {
        let only = io::Error::new(io::ErrorKind::BrokenPipe, "upload leg");
        let combined = combine_errors(Some(only), None).unwrap();
        assert_eq!(combined.to_string(), "upload leg");

        assert!(combine_errors(None, None).is_none());
    }

    #[test]
    fn test_decrypt_error_is_distinguishable() {
        let err = decrypt_error("bad record");
        assert!(is_decrypt_error(&err));

        let plain = io::Error::new(io::ErrorKind::InvalidData, "not crypto");
        assert!(!is_decrypt_error(&plain));
    }
}
