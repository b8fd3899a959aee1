use std::fmt::{Display, Formatter};

/// Error type for everything a caller of the link layer can observe.
///
/// Fragment-level anomalies (resyncs, stray messages) are handled inside the link and never
///  surface here; every variant is delivered to exactly the caller whose operation failed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LinkError {
    /// The link is down or was lost. Fatal to every operation pending at the time.
    Connection(String),
    /// An operation did not complete in time. The link itself remains usable.
    Timeout(String),
    /// Malformed or out-of-sequence data. Fatal only to a transfer it corrupts.
    Protocol(String),
    /// The device explicitly reported a failure.
    Device(String),
    /// Rejected because the single request or transfer slot is occupied and the configured
    ///  policy is to reject rather than queue.
    Busy(&'static str),
}

impl LinkError {
    pub fn is_connection(&self) -> bool {
        matches!(self, LinkError::Connection(_))
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, LinkError::Timeout(_))
    }

    pub(crate) fn from_transport(e: anyhow::Error) -> LinkError {
        LinkError::Connection(format!("{:#}", e))
    }
}

impl Display for LinkError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkError::Connection(msg) => write!(f, "connection error: {}", msg),
            LinkError::Timeout(msg) => write!(f, "timeout: {}", msg),
            LinkError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            LinkError::Device(msg) => write!(f, "device error: {}", msg),
            LinkError::Busy(what) => write!(f, "{} is busy", what),
        }
    }
}

impl std::error::Error for LinkError {}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::connection(LinkError::Connection("lost".into()), "connection error: lost")]
    #[case::timeout(LinkError::Timeout("call".into()), "timeout: call")]
    #[case::protocol(LinkError::Protocol("bad header".into()), "protocol error: bad header")]
    #[case::device(LinkError::Device("no such file".into()), "device error: no such file")]
    #[case::busy(LinkError::Busy("transfer slot"), "transfer slot is busy")]
    fn test_display(#[case] error: LinkError, #[case] expected: &str) {
        assert_eq!(error.to_string(), expected);
    }

    #[test]
    fn test_into_anyhow() {
        let e: anyhow::Error = LinkError::Timeout("x".into()).into();
        assert_eq!(e.downcast_ref::<LinkError>(), Some(&LinkError::Timeout("x".into())));
    }

    #[test]
    fn test_from_transport() {
        let e = LinkError::from_transport(anyhow::anyhow!("adapter gone"));
        assert!(e.is_connection());
        assert!(!e.is_timeout());
    }
}
