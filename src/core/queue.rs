//! Per-device command queue: priority ordering plus kill-on-conflict rules
//! (spec.md 3 "Command Queue", 4.2). Exactly one command is `Running` per
//! device at a time; pending commands preserve enqueue order within their
//! priority class (FIFO tie-break).

use std::collections::HashMap;

use crate::core::command::{CommandState, DeviceCommandHandle};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillAction {
    KillRunning,
    KillPending,
}

#[derive(Debug, Clone)]
pub struct KillRule {
    pub trigger_verb: String,
    pub victim_verb: String,
    pub action: KillAction,
}

impl KillRule {
    pub fn new(trigger_verb: impl Into<String>, victim_verb: impl Into<String>, action: KillAction) -> Self {
        Self {
            trigger_verb: trigger_verb.into(),
            victim_verb: victim_verb.into(),
            action,
        }
    }
}

/// Slot holding a pending command plus its insertion sequence number, used
/// to break priority ties FIFO.
struct Pending {
    cmd: DeviceCommandHandle,
    priority: i32,
    seq: u64,
}

pub struct CommandQueue {
    priorities: HashMap<String, i32>,
    default_priority: i32,
    rules: Vec<KillRule>,
    running: Option<DeviceCommandHandle>,
    pending: Vec<Pending>,
    next_seq: u64,
}

impl CommandQueue {
    pub fn new(priorities: HashMap<String, i32>, default_priority: i32, rules: Vec<KillRule>) -> Self {
        Self {
            priorities,
            default_priority,
            rules,
            running: None,
            pending: Vec::new(),
            next_seq: 0,
        }
    }

    fn priority_of(&self, verb: &str) -> i32 {
        self.priorities.get(verb).copied().unwrap_or(self.default_priority)
    }

    pub fn running(&self) -> Option<DeviceCommandHandle> {
        self.running.clone()
    }

    pub fn is_busy(&self) -> bool {
        self.running.is_some()
    }

    /// Enqueue `cmd`, applying kill rules against already-queued/running
    /// commands whose verb matches a rule's `victim_verb` when `cmd`'s verb
    /// matches that rule's `trigger_verb`. Victims are transitioned to
    /// `Cancelled` with "Killed by <trigger>" here, synchronously, before
    /// `cmd` itself is admitted to the pending list.
    pub fn add(&mut self, cmd: DeviceCommandHandle) {
        for rule in &self.rules {
            if rule.trigger_verb != cmd.verb {
                continue;
            }
            match rule.action {
                KillAction::KillRunning => {
                    let victim_matches = self.running.as_ref().is_some_and(|r| r.verb == rule.victim_verb);
                    if victim_matches {
                        let running = self.running.take().unwrap();
                        running.complete(
                            CommandState::Cancelled,
                            Some(format!("Killed by {}", rule.trigger_verb)),
                        );
                    }
                }
                KillAction::KillPending => {
                    for p in &self.pending {
                        if p.cmd.verb == rule.victim_verb {
                            p.cmd.complete(
                                CommandState::Cancelled,
                                Some(format!("Killed by {}", rule.trigger_verb)),
                            );
                        }
                    }
                }
            }
        }
        self.pending.retain(|p| p.cmd.state() == CommandState::Ready);

        let priority = self.priority_of(&cmd.verb);
        let seq = self.next_seq;
        self.next_seq += 1;
        self.pending.push(Pending { cmd, priority, seq });
    }

    /// If nothing is running, pop the highest-priority (FIFO tie-break)
    /// Ready command, transition it to Running, and return it so the caller
    /// can perform the actual I/O to start it.
    pub fn try_start_next(&mut self) -> Option<DeviceCommandHandle> {
        if self.running.is_some() {
            return None;
        }
        // Commands cancelled by a kill rule while pending must not be
        // started; skip them here rather than relying on callers to filter.
        while let Some(idx) = self.best_index() {
            let p = self.pending.remove(idx);
            if p.cmd.state() != CommandState::Ready {
                continue;
            }
            p.cmd.set_running();
            self.running = Some(p.cmd.clone());
            return Some(p.cmd);
        }
        None
    }

    fn best_index(&self) -> Option<usize> {
        self.pending
            .iter()
            .enumerate()
            .min_by_key(|(_, p)| (-p.priority, p.seq))
            .map(|(idx, _)| idx)
    }

    /// Called once the currently-running command reaches a terminal state;
    /// clears `running` so the caller can then call `try_start_next` to
    /// advance the queue.
    pub fn on_running_complete(&mut self) {
        self.running = None;
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::command::DeviceCommand;

    fn scale_queue() -> CommandQueue {
        let mut priorities = HashMap::new();
        for verb in ["stop", "status", "move", "speed", "home"] {
            priorities.insert(verb.to_string(), 1);
        }
        CommandQueue::new(
            priorities,
            1,
            vec![KillRule::new("stop", "move", KillAction::KillRunning)],
        )
    }

    #[test]
    fn at_most_one_running() {
        let mut q = scale_queue();
        let a = DeviceCommand::new("status", "status", None, None);
        let b = DeviceCommand::new("status", "status", None, None);
        q.add(a.clone());
        q.add(b.clone());
        let started = q.try_start_next();
        assert!(started.is_some());
        assert!(q.is_busy());
        // Second start attempt yields nothing while one is running.
        assert!(q.try_start_next().is_none());
    }

    #[test]
    fn stop_kills_running_move() {
        let mut q = scale_queue();
        let mv = DeviceCommand::new("move", "move 25", None, None);
        q.add(mv.clone());
        q.try_start_next();
        assert_eq!(mv.state(), crate::core::command::CommandState::Running);

        let stop = DeviceCommand::new("stop", "stop", None, None);
        q.add(stop.clone());
        assert_eq!(mv.state(), crate::core::command::CommandState::Cancelled);
        assert_eq!(mv.message().as_deref(), Some("Killed by stop"));

        q.on_running_complete();
        let next = q.try_start_next();
        assert_eq!(next.unwrap().verb, "stop");
    }

    #[test]
    fn fifo_within_priority_class() {
        let mut q = scale_queue();
        let first = DeviceCommand::new("status", "status", None, None);
        let second = DeviceCommand::new("status", "status", None, None);
        q.add(first.clone());
        q.add(second.clone());
        let started = q.try_start_next().unwrap();
        assert!(std::sync::Arc::ptr_eq(&started, &first));
    }
}
