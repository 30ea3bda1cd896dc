#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Idle,
    Starting,
    Connected,
    Restarting,
    Stopping,
    Failed,
}

impl ConnectionState {
    pub fn label(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Starting => "Starting…",
            Self::Connected => "Connected",
            Self::Restarting => "Restarting…",
            Self::Stopping => "Stopping…",
            Self::Failed => "Failed",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}
