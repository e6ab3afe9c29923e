// Host focus tracking for the reconnect policy

/// Foreground/background state of the host process
pub trait HostFocus {
    /// True while the host is in the foreground
    fn has_focus(&self) -> bool;
}

/// A host that is always in the foreground (CLIs, servers, tests)
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysFocused;

impl HostFocus for AlwaysFocused {
    fn has_focus(&self) -> bool {
        true
    }
}

impl<F: Fn() -> bool> HostFocus for F {
    fn has_focus(&self) -> bool {
        self()
    }
}

/// When to reconnect after the relay link drops
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReconnectPolicy {
    /// Reconnect as soon as the link is reported lost
    #[default]
    Immediate,
    /// Reconnect only while (or once) the host has focus
    OnFocus,
}

impl ReconnectPolicy {
    /// Whether a reconnect may be attempted right now
    pub fn allows(&self, focus: &dyn HostFocus) -> bool {
        match self {
            ReconnectPolicy::Immediate => true,
            ReconnectPolicy::OnFocus => focus.has_focus(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_policy_allows() {
        let backgrounded = || false;
        assert!(ReconnectPolicy::Immediate.allows(&backgrounded));
        assert!(!ReconnectPolicy::OnFocus.allows(&backgrounded));
        assert!(ReconnectPolicy::OnFocus.allows(&AlwaysFocused));
    }
}
