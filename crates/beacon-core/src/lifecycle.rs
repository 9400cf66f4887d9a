//! Application-lifecycle bridge.
//!
//! Translates platform phase changes into suspend/resume decisions. Repeated
//! phases are deduplicated, and a foreground transition only resumes if an
//! earlier background transition actually suspended.

/// Platform application phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AppPhase {
    /// Visible and interactive.
    #[default]
    Foreground,
    /// Not visible; the OS may freeze the process.
    Background,
    /// Transitional (e.g. app switcher). Ignored.
    Inactive,
}

/// What the driver should do in response to a phase change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleAction {
    /// Close the transport, keep rooms and credential.
    Suspend,
    /// Reconnect if eligible.
    Resume,
}

/// Phase tracker
#[derive(Debug, Clone, Default)]
pub struct LifecycleBridge {
    phase: AppPhase,
    suspended: bool,
}

impl LifecycleBridge {
    /// Bridge starting in the foreground.
    pub fn new() -> Self {
        Self::default()
    }

    /// Last phase seen.
    pub fn phase(&self) -> AppPhase {
        self.phase
    }

    /// Whether the last background transition is still in effect.
    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    /// Record `phase`; returns the action to take, if any.
    pub fn transition(&mut self, phase: AppPhase) -> Option<LifecycleAction> {
        if phase == self.phase {
            return None;
        }
        tracing::debug!(from = ?self.phase, to = ?phase, "app phase changed");
        self.phase = phase;

        match phase {
            AppPhase::Background if !self.suspended => {
                self.suspended = true;
                Some(LifecycleAction::Suspend)
            },
            AppPhase::Foreground if self.suspended => {
                self.suspended = false;
                Some(LifecycleAction::Resume)
            },
            _ => None,
        }
    }
}
