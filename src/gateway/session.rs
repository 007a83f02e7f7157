//! Session identity and handshake progress tracking.

use std::fmt;

/// Lifecycle stage of the gateway connection.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionStage {
    /// No socket exists.
    Disconnected,
    /// A socket is open, awaiting the server's hello.
    Connecting,
    /// An identify handshake has been sent, awaiting the ready dispatch.
    Identifying,
    /// A resume handshake has been sent, awaiting the resumed dispatch.
    Resuming,
    /// The handshake completed; dispatches are flowing.
    Connected,
    /// An operator shutdown is under way.
    Closing,
}

impl ConnectionStage {
    /// Whether the handshake has fully completed.
    #[must_use]
    pub fn is_connected(self) -> bool {
        matches!(self, ConnectionStage::Connected)
    }
}

impl fmt::Display for ConnectionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionStage::Disconnected => "disconnected",
            ConnectionStage::Connecting => "connecting",
            ConnectionStage::Identifying => "identifying",
            ConnectionStage::Resuming => "resuming",
            ConnectionStage::Connected => "connected",
            ConnectionStage::Closing => "closing",
        };

        f.write_str(name)
    }
}

/// Resumption identity for the current session.
///
/// The sequence only ever moves forward; replayed or reordered dispatches
/// never wind it back.
#[derive(Clone, Debug, Default)]
pub(crate) struct Session {
    id: Option<String>,
    sequence: Option<u64>,
}

impl Session {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Records the identifier of a freshly-opened session.
    pub(crate) fn start(&mut self, id: String) {
        self.id = Some(id);
    }

    /// Forgets the session entirely; the next handshake must identify.
    pub(crate) fn reset(&mut self) {
        self.id = None;
        self.sequence = None;
    }

    /// Folds a dispatch sequence number in, ignoring regressions.
    pub(crate) fn observe(&mut self, sequence: u64) {
        match self.sequence {
            Some(current) if current >= sequence => {},
            _ => self.sequence = Some(sequence),
        }
    }

    pub(crate) fn id(&self) -> Option<&str> {
        self.id.as_deref()
    }

    pub(crate) fn sequence(&self) -> Option<u64> {
        self.sequence
    }

    /// Whether a resume handshake can be attempted.
    pub(crate) fn can_resume(&self) -> bool {
        self.id.is_some() && self.sequence.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_never_regresses() {
        let mut session = Session::new();
        session.observe(5);
        session.observe(3);
        assert_eq!(session.sequence(), Some(5));

        session.observe(6);
        assert_eq!(session.sequence(), Some(6));
    }

    #[test]
    fn resume_needs_both_id_and_sequence() {
        let mut session = Session::new();
        assert!(!session.can_resume());

        session.start("abc".into());
        assert!(!session.can_resume());

        session.observe(1);
        assert!(session.can_resume());
    }

    #[test]
    fn reset_forgets_identity() {
        let mut session = Session::new();
        session.start("abc".into());
        session.observe(12);

        session.reset();
        assert_eq!(session.id(), None);
        assert_eq!(session.sequence(), None);
        assert!(!session.can_resume());
    }

    #[test]
    fn starting_a_session_keeps_the_observed_sequence() {
        let mut session = Session::new();
        session.observe(1);
        session.start("abc".into());
        assert_eq!(session.sequence(), Some(1));
        assert_eq!(session.id(), Some("abc"));
    }
}
