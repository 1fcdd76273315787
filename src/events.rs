//! The bounded, eventfd-backed outbound event queue.
//!
//! A bounded FIFO wired to a kernel-visible wakeup primitive, so a single
//! `poll` can block on both control-socket readiness and queue activity:
//! `crossbeam_channel` for the FIFO itself, and `nix::sys::eventfd` for the
//! primitive `nix::poll::poll` waits on alongside the control socket's file
//! descriptor.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_channel::{Receiver, Sender, TryRecvError};
use log::warn;
use nix::sys::eventfd::{EfdFlags, eventfd};
use serde::Serialize;

const QUEUE_DROP_THRESHOLD: usize = 10_000;
const QUEUE_RESUME_THRESHOLD: usize = 1_000;

/// Always has `op`; publication events also carry `module`/`path`/
/// optionally `path2`.
#[derive(Debug, Clone, Serialize)]
pub struct EventMessage {
    pub op: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path2: Option<String>,
}

impl EventMessage {
    pub fn publication(op: &str, module: &str, path: &str, path2: Option<&str>) -> Self {
        EventMessage {
            op: op.to_string(),
            module: Some(module.to_string()),
            path: Some(path.to_string()),
            path2: path2.map(str::to_string),
        }
    }

    /// Serialized as one newline-terminated JSON line.
    pub fn to_line(&self) -> String {
        let mut line = serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string());
        line.push('\n');
        line
    }
}

/// A bounded FIFO of pre-serialized JSON lines awaiting transmission.
/// Backpressure: drop silently past 10,000 queued entries (logging one
/// warning), resume accepting once the queue has drained below 1,000.
pub struct EventQueue {
    sender: Sender<String>,
    receiver: Receiver<String>,
    len: AtomicUsize,
    dropping: std::sync::atomic::AtomicBool,
    wakeup: OwnedFd,
}

impl EventQueue {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let wakeup = eventfd(0, EfdFlags::EFD_NONBLOCK | EfdFlags::EFD_CLOEXEC)
            .expect("eventfd creation failed");
        EventQueue {
            sender,
            receiver,
            len: AtomicUsize::new(0),
            dropping: std::sync::atomic::AtomicBool::new(false),
            wakeup,
        }
    }

    /// The fd the communicator worker polls alongside the control socket.
    pub fn wakeup_fd(&self) -> std::os::fd::RawFd {
        self.wakeup.as_raw_fd()
    }

    pub fn push(&self, message: EventMessage) {
        self.push_line(message.to_line());
    }

    /// Queues an already-formatted JSON line, for the handful of wire
    /// messages (e.g. `control`'s `namechange`) that don't fit the
    /// `op`-keyed `EventMessage` shape. Same backpressure as `push`.
    pub fn push_raw(&self, line: String) {
        let line = if line.ends_with('\n') { line } else { format!("{line}\n") };
        self.push_line(line);
    }

    fn push_line(&self, line: String) {
        let len = self.len.load(Ordering::Acquire);
        if self.dropping.load(Ordering::Acquire) {
            if len < QUEUE_RESUME_THRESHOLD {
                self.dropping.store(false, Ordering::Release);
            } else {
                return;
            }
        } else if len >= QUEUE_DROP_THRESHOLD {
            self.dropping.store(true, Ordering::Release);
            warn!("event queue exceeded {QUEUE_DROP_THRESHOLD} entries, dropping new events");
            return;
        }

        if self.sender.send(line).is_ok() {
            self.len.fetch_add(1, Ordering::AcqRel);
            self.ring_wakeup();
        }
    }

    fn ring_wakeup(&self) {
        let one: u64 = 1;
        let _ = nix::unistd::write(&self.wakeup, &one.to_ne_bytes());
    }

    /// Drains the eventfd counter; called by the communicator worker after
    /// `poll` reports the wakeup fd readable.
    pub fn drain_wakeup(&self) {
        let mut buf = [0u8; 8];
        let _ = nix::unistd::read(self.wakeup.as_raw_fd(), &mut buf);
    }

    /// Pops one queued line, if any.
    pub fn pop(&self) -> Option<String> {
        match self.receiver.try_recv() {
            Ok(line) => {
                self.len.fetch_sub(1, Ordering::AcqRel);
                Some(line)
            }
            Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => None,
        }
    }

    pub fn len(&self) -> usize {
        self.len.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(op: &str) -> EventMessage {
        EventMessage::publication(op, "public", "/public/foo", None)
    }

    #[test]
    fn push_then_pop_round_trips() {
        let q = EventQueue::new();
        q.push(msg("MKDIR"));
        assert_eq!(q.len(), 1);
        let line = q.pop().unwrap();
        assert!(line.contains("\"op\":\"MKDIR\""));
        assert!(line.ends_with('\n'));
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn event_with_path2_serializes_both_paths() {
        let e = EventMessage::publication("RENAME", "public", "/public/x", Some("/public/y"));
        let line = e.to_line();
        assert!(line.contains("\"path\":\"/public/x\""));
        assert!(line.contains("\"path2\":\"/public/y\""));
    }

    #[test]
    fn drops_past_threshold_and_resumes_after_drain() {
        let q = EventQueue::new();
        for _ in 0..QUEUE_DROP_THRESHOLD {
            q.push(msg("MKDIR"));
        }
        assert_eq!(q.len(), QUEUE_DROP_THRESHOLD);
        // One more push should be dropped silently.
        q.push(msg("MKDIR"));
        assert_eq!(q.len(), QUEUE_DROP_THRESHOLD);

        // Drain below the resume threshold.
        for _ in 0..(QUEUE_DROP_THRESHOLD - QUEUE_RESUME_THRESHOLD + 1) {
            q.pop();
        }
        assert!(q.len() < QUEUE_RESUME_THRESHOLD);
        q.push(msg("MKDIR"));
        assert_eq!(q.len(), QUEUE_RESUME_THRESHOLD);
    }
}
