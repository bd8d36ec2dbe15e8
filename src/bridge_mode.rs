//! Bridge mode enumeration.
//!
//! Decides which halves of a [`Bridge`](crate::Bridge) are wired up.

/// Operational mode of a bridge.
///
/// - [`Producer`](BridgeMode::Producer): publishes and sends requests, consumes its reply queue
/// - [`Consumer`](BridgeMode::Consumer): dispatches the work queue to handlers
/// - [`FullDuplex`](BridgeMode::FullDuplex): both
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeMode {
    /// Allows: `publisher()`
    /// Forbids: `dispatcher()`, `start()`
    Producer,

    /// Allows: `dispatcher()`, `start()`
    /// Forbids: `publisher()`
    Consumer,

    /// Allows everything.
    #[default]
    FullDuplex,
}

impl BridgeMode {
    pub fn publishes(self) -> bool {
        matches!(self, Self::Producer | Self::FullDuplex)
    }

    pub fn consumes(self) -> bool {
        matches!(self, Self::Consumer | Self::FullDuplex)
    }
}

impl std::fmt::Display for BridgeMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Producer => "producer",
            Self::Consumer => "consumer",
            Self::FullDuplex => "full-duplex",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mode_capabilities() {
        assert!(BridgeMode::Producer.publishes());
        assert!(!BridgeMode::Producer.consumes());
        assert!(!BridgeMode::Consumer.publishes());
        assert!(BridgeMode::Consumer.consumes());
        assert!(BridgeMode::FullDuplex.publishes() && BridgeMode::FullDuplex.consumes());
        assert_eq!(BridgeMode::default(), BridgeMode::FullDuplex);
    }
}
