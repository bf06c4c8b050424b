// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! Marshalling of GPU completions onto the thread owning the device.

use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};

use crate::backend::Status;
use crate::grid::GridId;

pub(crate) struct Completion {
    pub(crate) node: GridId,
    pub(crate) status: Status,
}

/// Reports the completion of one submission.
///
/// This is the only scheduler type that crosses threads. Dropping a signal without
/// firing it reports a failure, so that nothing waits forever on a lost submission.
#[derive(Debug)]
pub struct CompletionSignal {
    node: GridId,
    sender: Option<Sender<Completion>>,
}

impl CompletionSignal {
    pub fn signal(mut self, status: Status) {
        self.send(status);
    }

    fn send(&mut self, status: Status) {
        if let Some(sender) = self.sender.take() {
            // Ignore the possibility that the device has already been dropped.
            let _ = sender.send(Completion {
                node: self.node,
                status,
            });
        }
    }
}

impl Drop for CompletionSignal {
    fn drop(&mut self) {
        if self.sender.is_some() {
            log::warn!("completion signal dropped without being fired");
            self.send(Status::Failed);
        }
    }
}

static_assertions::assert_impl_all!(CompletionSignal: Send);

impl std::fmt::Debug for Completion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Completion")
            .field("node", &self.node)
            .field("status", &self.status)
            .finish()
    }
}

/// Counts submissions in flight and owns the receiving end of the completion channel.
pub(crate) struct Scheduler {
    sender: Sender<Completion>,
    receiver: Receiver<Completion>,
    in_flight: u32,
    max_in_flight: u32,
}

impl Scheduler {
    pub(crate) fn new(max_in_flight: u32) -> Self {
        let (sender, receiver) = mpsc::channel();
        Self {
            sender,
            receiver,
            in_flight: 0,
            max_in_flight,
        }
    }

    /// Creates the signal for a submission that is about to be handed to the backend.
    pub(crate) fn submit(&mut self, node: GridId) -> CompletionSignal {
        self.in_flight += 1;
        CompletionSignal {
            node,
            sender: Some(self.sender.clone()),
        }
    }

    pub(crate) fn has_capacity(&self) -> bool {
        self.in_flight < self.max_in_flight
    }

    pub(crate) fn in_flight(&self) -> u32 {
        self.in_flight
    }

    pub(crate) fn try_recv(&mut self) -> Option<Completion> {
        match self.receiver.try_recv() {
            Ok(completion) => {
                self.in_flight -= 1;
                Some(completion)
            }
            // The scheduler owns a sender, so the channel never disconnects.
            Err(TryRecvError::Empty | TryRecvError::Disconnected) => None,
        }
    }

    /// Blocks until the next completion arrives.
    pub(crate) fn recv(&mut self) -> Option<Completion> {
        let completion = self.receiver.recv().ok()?;
        self.in_flight -= 1;
        Some(completion)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::Grid;

    #[test]
    fn completions_cross_threads() {
        let mut grid = Grid::default();
        let node = grid.attach((), &[]);
        let mut scheduler = Scheduler::new(2);
        let signal = scheduler.submit(node);
        assert_eq!(scheduler.in_flight(), 1);
        std::thread::spawn(move || signal.signal(Status::Success))
            .join()
            .unwrap();
        let completion = scheduler.recv().unwrap();
        assert_eq!(completion.node, node);
        assert_eq!(completion.status, Status::Success);
        assert_eq!(scheduler.in_flight(), 0);
    }

    #[test]
    fn dropped_signal_reports_failure() {
        let mut grid = Grid::default();
        let node = grid.attach((), &[]);
        let mut scheduler = Scheduler::new(1);
        assert!(scheduler.has_capacity());
        drop(scheduler.submit(node));
        assert_eq!(scheduler.in_flight(), 1);
        assert!(!scheduler.has_capacity());
        let completion = scheduler.try_recv().unwrap();
        assert_eq!(completion.status, Status::Failed);
        assert!(scheduler.has_capacity());
    }
}
