use std::time::Duration;

/// Default interval after a post before the peer is suspected unresponsive.
pub const DEFAULT_RESPONSIVENESS_TIMEOUT: Duration = Duration::from_secs(3);

/// Connection behavior configuration.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// How long after a post, with nothing read, before the owner is told the
    /// peer may have become unresponsive. Default: 3 seconds.
    pub responsiveness_timeout: Duration,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            responsiveness_timeout: DEFAULT_RESPONSIVENESS_TIMEOUT,
        }
    }
}

/// Endpoint ids for the two sides of a connection.
///
/// Messages addressed to `local` are dispatched here; acknowledgements and
/// anything else meant for the other side are addressed to `peer`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoints {
    pub local: u32,
    pub peer: u32,
}

impl Endpoints {
    pub fn new(local: u32, peer: u32) -> Self {
        Self { local, peer }
    }

    /// The same pair seen from the other side.
    pub fn reversed(self) -> Self {
        Self {
            local: self.peer,
            peer: self.local,
        }
    }
}
