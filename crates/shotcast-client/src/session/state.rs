use std::fmt;

/// Lifecycle of a broadcast session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    Idle,
    DeviceReady,
    Capturing,
    ChannelReady,
    TransportReady,
    Publishing,
    Suspended,
    Stopped,
}

impl SessionState {
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;

        match (self, next) {
            (Stopped, _) => false,
            (_, Stopped) => true,
            (Idle, DeviceReady)
            | (DeviceReady, Capturing)
            | (Capturing, ChannelReady)
            | (ChannelReady, TransportReady)
            | (TransportReady, Publishing)
            | (Publishing, TransportReady)
            | (Suspended, ChannelReady) => true,
            // channel dropped
            (ChannelReady | TransportReady | Publishing, Suspended) => true,
            // readiness withdrawn
            (ChannelReady | TransportReady | Publishing | Suspended, Capturing) => true,
            _ => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionState::Stopped
    }

    /// True once the relay has a send transport for this session
    pub fn has_transport(self) -> bool {
        matches!(self, SessionState::TransportReady | SessionState::Publishing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Idle => "idle",
            SessionState::DeviceReady => "device-ready",
            SessionState::Capturing => "capturing",
            SessionState::ChannelReady => "channel-ready",
            SessionState::TransportReady => "transport-ready",
            SessionState::Publishing => "publishing",
            SessionState::Suspended => "suspended",
            SessionState::Stopped => "stopped",
        };
        f.write_str(name)
    }
}
