use crate::Fault;

/// Lifecycle state of an emulated process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum Termination {
    /// Further instructions may execute.
    #[default]
    Running,
    /// The guest requested process exit with this code.
    Terminated(u32),
    /// Execution stopped on a latched fault.
    Faulted(Fault),
}

impl Termination {
    /// Returns `true` for `Terminated` and `Faulted`.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Running)
    }

    /// Exit code, when the guest terminated normally.
    #[must_use]
    pub const fn exit_code(self) -> Option<u32> {
        match self {
            Self::Terminated(code) => Some(code),
            Self::Running | Self::Faulted(_) => None,
        }
    }

    /// Latched fault, when execution faulted.
    #[must_use]
    pub const fn fault(self) -> Option<Fault> {
        match self {
            Self::Faulted(fault) => Some(fault),
            Self::Running | Self::Terminated(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Termination;
    use crate::{Fault, FaultCode};

    #[test]
    fn default_is_running() {
        assert_eq!(Termination::default(), Termination::Running);
        assert!(!Termination::Running.is_terminal());
    }

    #[test]
    fn accessors_report_only_matching_variant() {
        let fault = Fault::new(FaultCode::Breakpoint, 0x1000);
        assert_eq!(Termination::Terminated(3).exit_code(), Some(3));
        assert_eq!(Termination::Terminated(3).fault(), None);
        assert_eq!(Termination::Faulted(fault).fault(), Some(fault));
        assert_eq!(Termination::Faulted(fault).exit_code(), None);
        assert!(Termination::Faulted(fault).is_terminal());
    }
}
