//! Input injection trait boundary (C11).
//!
//! On-screen input injection is an external collaborator (§1), same as
//! capture. [`NoOpInjector`] is the in-process fake.

use controledu_core::protocol::RemoteControlInput;

pub trait InputInjector: Send {
    fn inject(&mut self, input: &RemoteControlInput);
}

/// Records the last command it received instead of touching the OS
/// input stack; used until a platform-specific injector is wired in.
#[derive(Debug, Default)]
pub struct NoOpInjector {
    pub last: Option<RemoteControlInput>,
}

impl InputInjector for NoOpInjector {
    fn inject(&mut self, input: &RemoteControlInput) {
        tracing::debug!(kind = ?input.kind, "remote-control input (no-op injector)");
        self.last = Some(input.clone());
    }
}
