use crate::classify::DisconnectCause;

/// What the login flow does after a connection closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectAction {
    /// Tear down and rebuild with the same credentials, QR disabled.
    RebuildWithoutQr,
    /// Wipe stored credentials, then fail the attempt.
    ClearCredentialsAndFail,
    FailAsIs,
}

pub struct ReconnectPolicy;

impl ReconnectPolicy {
    pub fn decide(cause: &DisconnectCause) -> ReconnectAction {
        match cause {
            DisconnectCause::RestartRequired => ReconnectAction::RebuildWithoutQr,
            DisconnectCause::LoggedOut => ReconnectAction::ClearCredentialsAndFail,
            _ => ReconnectAction::FailAsIs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decisions() {
        assert_eq!(
            ReconnectPolicy::decide(&DisconnectCause::RestartRequired),
            ReconnectAction::RebuildWithoutQr
        );
        assert_eq!(
            ReconnectPolicy::decide(&DisconnectCause::LoggedOut),
            ReconnectAction::ClearCredentialsAndFail
        );
        for cause in [
            DisconnectCause::ConnectionClosed,
            DisconnectCause::TimedOut,
            DisconnectCause::BadSession,
            DisconnectCause::ConnectionLost,
            DisconnectCause::Unknown(440),
        ] {
            assert_eq!(ReconnectPolicy::decide(&cause), ReconnectAction::FailAsIs);
        }
    }
}
