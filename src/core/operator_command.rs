//! Operator commands: a request from a user (spec.md 3, "Operator Command").
//!
//! An operator command owns the link-set of device commands it spawned and
//! derives its own terminal state from theirs (the "Linkage rule"): Done iff
//! every linked device command is Done; Failed if any is Failed (first
//! failure's message wins); Cancelled if any is Cancelled and none Failed.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::core::command::{CommandState, DeviceCommandHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OperatorCommandId(pub u64);

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn next_id() -> OperatorCommandId {
    OperatorCommandId(NEXT_ID.fetch_add(1, Ordering::Relaxed))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    Ready,
    Running,
    Done,
    Failed,
    Cancelled,
}

impl OperatorState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            OperatorState::Done | OperatorState::Failed | OperatorState::Cancelled
        )
    }
}

struct Inner {
    state: OperatorState,
    message: Option<String>,
    links: Vec<DeviceCommandHandle>,
}

/// A user-initiated request. `eldest_ancestor` is `self` for a genuinely
/// user-typed command and the id of the originating command for anything
/// spawned internally (e.g. the `status` device command issued as part of
/// `init()`) — it drives the keyword-verbosity rule in `keywords.rs`.
pub struct OperatorCommand {
    pub id: OperatorCommandId,
    pub verb: String,
    pub raw_text: String,
    pub eldest_ancestor: OperatorCommandId,
    inner: Mutex<Inner>,
    notify: Notify,
}

pub type OperatorCommandHandle = std::sync::Arc<OperatorCommand>;

impl OperatorCommand {
    pub fn new_user_initiated(verb: impl Into<String>, raw_text: impl Into<String>) -> OperatorCommandHandle {
        let id = next_id();
        std::sync::Arc::new(Self {
            id,
            verb: verb.into(),
            raw_text: raw_text.into(),
            eldest_ancestor: id,
            inner: Mutex::new(Inner {
                state: OperatorState::Ready,
                message: None,
                links: Vec::new(),
            }),
            notify: Notify::new(),
        })
    }

    /// A command this crate's own machinery issues on behalf of a user
    /// command (e.g. a periodic `status` poll) rather than one typed by an
    /// operator — `is_user_commanded` returns false for these.
    pub fn new_internal(verb: impl Into<String>, eldest_ancestor: OperatorCommandId) -> OperatorCommandHandle {
        let id = next_id();
        std::sync::Arc::new(Self {
            id,
            verb: verb.into(),
            raw_text: String::new(),
            eldest_ancestor,
            inner: Mutex::new(Inner {
                state: OperatorState::Ready,
                message: None,
                links: Vec::new(),
            }),
            notify: Notify::new(),
        })
    }

    pub fn is_user_commanded(&self) -> bool {
        self.eldest_ancestor == self.id
    }

    pub fn set_running(&self) {
        self.inner.lock().unwrap().state = OperatorState::Running;
    }

    pub fn state(&self) -> OperatorState {
        self.inner.lock().unwrap().state
    }

    pub fn message(&self) -> Option<String> {
        self.inner.lock().unwrap().message.clone()
    }

    pub fn fail(&self, message: impl Into<String>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = OperatorState::Failed;
            inner.message = Some(message.into());
        }
        self.notify.notify_waiters();
    }

    /// Marks Done directly, for handlers whose completion condition is not
    /// simply "every linked device command finished" (e.g. `track`, whose
    /// operator-visible completion waits for both axes to report
    /// "Tracking" after its device command has already gone Done).
    pub fn succeed(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = OperatorState::Done;
        }
        self.notify.notify_waiters();
    }

    pub fn cancel(&self, message: impl Into<String>) {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state.is_terminal() {
                return;
            }
            inner.state = OperatorState::Cancelled;
            inner.message = Some(message.into());
        }
        self.notify.notify_waiters();
    }

    /// Await this operator command's own terminal transition, however it
    /// was reached -- directly (`fail`/`succeed`/`cancel`) or via
    /// `await_links`. Resolves immediately if already terminal.
    pub async fn wait_terminal(&self) -> OperatorState {
        loop {
            let notified = self.notify.notified();
            let state = self.state();
            if state.is_terminal() {
                return state;
            }
            notified.await;
        }
    }

    pub fn link(&self, device_cmd: DeviceCommandHandle) {
        self.inner.lock().unwrap().links.push(device_cmd);
    }

    pub fn links(&self) -> Vec<DeviceCommandHandle> {
        self.inner.lock().unwrap().links.clone()
    }

    /// Await joint completion of every linked device command and set this
    /// operator command's own terminal state per the linkage rule. Safe to
    /// call with zero links (resolves immediately to Done).
    pub async fn await_links(&self) -> OperatorState {
        if self.state().is_terminal() {
            return self.state();
        }
        let links = self.links();
        let mut any_cancelled = false;
        let mut first_failure: Option<String> = None;
        for link in &links {
            match link.wait_terminal().await {
                CommandState::Done => {}
                CommandState::Failed => {
                    if first_failure.is_none() {
                        first_failure = Some(link.message().unwrap_or_else(|| "device command failed".into()));
                    }
                }
                CommandState::Cancelled => any_cancelled = true,
                CommandState::Ready | CommandState::Running => unreachable!("wait_terminal returned non-terminal state"),
            }
        }
        let mut inner = self.inner.lock().unwrap();
        if inner.state.is_terminal() {
            return inner.state;
        }
        inner.state = if let Some(msg) = first_failure {
            inner.message = Some(msg);
            OperatorState::Failed
        } else if any_cancelled {
            OperatorState::Cancelled
        } else {
            OperatorState::Done
        };
        inner.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::DeviceCommand;

    #[tokio::test]
    async fn done_iff_all_links_done() {
        let op = OperatorCommand::new_user_initiated("ping", "ping");
        let d1 = DeviceCommand::new("status", "status", None, Some(op.id));
        let d2 = DeviceCommand::new("status", "status", None, Some(op.id));
        op.link(d1.clone());
        op.link(d2.clone());
        d1.set_running();
        d2.set_running();
        d1.complete(CommandState::Done, None);
        d2.complete(CommandState::Done, None);
        assert_eq!(op.await_links().await, OperatorState::Done);
    }

    #[tokio::test]
    async fn failed_if_any_link_failed() {
        let op = OperatorCommand::new_user_initiated("track", "track 1,2");
        let d1 = DeviceCommand::new("track", "track 1 2", None, Some(op.id));
        let d2 = DeviceCommand::new("status", "status", None, Some(op.id));
        op.link(d1.clone());
        op.link(d2.clone());
        d1.set_running();
        d2.set_running();
        d1.complete(CommandState::Failed, Some("boom".into()));
        d2.complete(CommandState::Done, None);
        assert_eq!(op.await_links().await, OperatorState::Failed);
        assert_eq!(op.message().as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn cancelled_if_any_link_cancelled_and_none_failed() {
        let op = OperatorCommand::new_user_initiated("threadring", "threadring move 25");
        let d1 = DeviceCommand::new("move", "move 25", None, Some(op.id));
        op.link(d1.clone());
        d1.set_running();
        d1.complete(CommandState::Cancelled, Some("Killed by stop".into()));
        assert_eq!(op.await_links().await, OperatorState::Cancelled);
    }
}
