//! Device commands: one exchange with a remote controller (spec.md 3,
//! "Device Command"). State is monotone and reaches a terminal value exactly
//! once; interested parties await that transition via `wait_terminal`
//! instead of registering callbacks, which keeps the "dispatched exactly
//! once" invariant (design note in spec.md 9) trivially true — there is one
//! notification point (`complete`) and any number of waiters.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::core::operator_command::OperatorCommandId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    Ready,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl CommandState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            CommandState::Done | CommandState::Failed | CommandState::Cancelled
        )
    }
}

struct Inner {
    state: CommandState,
    message: Option<String>,
    deadline: Option<Instant>,
}

/// A single device-command exchange. Cheaply cloned (`Arc`-backed via
/// `DeviceCommandHandle`) so the queue, the reply dispatcher, and any
/// operator-command handler awaiting completion can all hold a reference.
pub struct DeviceCommand {
    pub verb: String,
    pub command_text: String,
    pub time_limit: Option<Duration>,
    pub operator_command: Option<OperatorCommandId>,
    inner: Mutex<Inner>,
    notify: Notify,
}

pub type DeviceCommandHandle = std::sync::Arc<DeviceCommand>;

impl DeviceCommand {
    pub fn new(
        verb: impl Into<String>,
        command_text: impl Into<String>,
        time_limit: Option<Duration>,
        operator_command: Option<OperatorCommandId>,
    ) -> DeviceCommandHandle {
        std::sync::Arc::new(Self {
            verb: verb.into(),
            command_text: command_text.into(),
            time_limit,
            operator_command,
            inner: Mutex::new(Inner {
                state: CommandState::Ready,
                message: None,
                deadline: None,
            }),
            notify: Notify::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("device command mutex poisoned")
    }

    pub fn state(&self) -> CommandState {
        self.lock().state
    }

    pub fn message(&self) -> Option<String> {
        self.lock().message.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == CommandState::Running
    }

    /// Ready -> Running. Also stamps the deadline from `time_limit`, if any,
    /// so a watchdog task can decide when to time it out.
    pub fn set_running(&self) {
        {
            let mut inner = self.lock();
            debug_assert_eq!(inner.state, CommandState::Ready, "command started twice");
            inner.state = CommandState::Running;
            inner.deadline = self.time_limit.map(|d| Instant::now() + d);
        }
        self.notify.notify_waiters();
    }

    /// Await the Ready -> Running (or straight to a terminal state, e.g. a
    /// kill rule cancelling a command before it ever started) transition.
    pub async fn wait_started(&self) -> CommandState {
        loop {
            let notified = self.notify.notified();
            let state = self.state();
            if state != CommandState::Ready {
                return state;
            }
            notified.await;
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.lock().deadline
    }

    /// Transition to a terminal state exactly once. Subsequent calls after a
    /// terminal state has already been reached are no-ops (monotonicity).
    pub fn complete(&self, state: CommandState, message: Option<String>) {
        debug_assert!(state.is_terminal(), "complete() requires a terminal state");
        {
            let mut inner = self.lock();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = state;
            inner.message = message;
        }
        self.notify.notify_waiters();
    }

    pub async fn wait_terminal(&self) -> CommandState {
        loop {
            let notified = self.notify.notified();
            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotone_terminal_state() {
        let cmd = DeviceCommand::new("status", "status", None, None);
        cmd.set_running();
        cmd.complete(CommandState::Done, None);
        assert_eq!(cmd.state(), CommandState::Done);
        // A second completion attempt must not overwrite the first.
        cmd.complete(CommandState::Failed, Some("late".into()));
        assert_eq!(cmd.state(), CommandState::Done);
        assert!(cmd.message().is_none());
    }

    #[tokio::test]
    async fn wait_terminal_resolves_after_complete() {
        let cmd = DeviceCommand::new("move", "move 10", None, None);
        cmd.set_running();
        let cmd2 = cmd.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            cmd2.complete(CommandState::Done, None);
        });
        let state = cmd.wait_terminal().await;
        assert_eq!(state, CommandState::Done);
    }
}
