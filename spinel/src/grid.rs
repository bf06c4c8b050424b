// Copyright 2024 the Spinel Authors
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The dependency grid.
//!
//! Each node is one asynchronous unit of GPU work. An edge `a -> b` means `b`
//! happens-after `a`: `b` is not handed to the GPU until `a` has completed there.
//!
//! Nodes move through these states:
//!
//! ```text
//! Created --start--> Waiting --(last predecessor completes)--> Ready
//!    \                                                          ^
//!     `--start (no unresolved predecessors)---------------------'
//! Ready --execute--> Executing --complete--> (disposed)
//! ```
//!
//! While `Created` a node is still being filled in and may gain predecessors.
//! Nothing in here talks to the GPU: the device pops [`Grid::pop_ready`] nodes,
//! submits them, and reports back with [`Grid::complete`].

use std::collections::VecDeque;

use smallvec::SmallVec;

use crate::arena::{Arena, Key};
use crate::backend::Status;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct GridId(Key);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum GridState {
    Created,
    Waiting,
    Ready,
    Executing,
}

struct Node<T> {
    state: GridState,
    task: T,
    /// Predecessors that have not completed yet.
    pending: u32,
    predecessors: SmallVec<[GridId; 4]>,
    successors: SmallVec<[GridId; 4]>,
    /// A predecessor failed; the node must not run its GPU work.
    poisoned: bool,
}

pub(crate) struct Grid<T> {
    nodes: Arena<Node<T>>,
    ready: VecDeque<GridId>,
    started: usize,
}

impl<T> Default for Grid<T> {
    fn default() -> Self {
        Self {
            nodes: Arena::default(),
            ready: VecDeque::new(),
            started: 0,
        }
    }
}

impl<T> Grid<T> {
    /// Creates a node which happens-after every live node in `deps`.
    pub(crate) fn attach(&mut self, task: T, deps: &[GridId]) -> GridId {
        let id = GridId(self.nodes.insert(Node {
            state: GridState::Created,
            task,
            pending: 0,
            predecessors: SmallVec::new(),
            successors: SmallVec::new(),
            poisoned: false,
        }));
        for &dep in deps {
            self.happens_after(id, dep);
        }
        id
    }

    /// Records that `node` may not execute before `other` has completed.
    ///
    /// Edges to nodes which already completed are dropped, as are duplicates.
    pub(crate) fn happens_after(&mut self, node: GridId, other: GridId) {
        if node == other {
            return;
        }
        match self.nodes.get(node.0) {
            Some(n) if n.state == GridState::Created => {}
            Some(_) => {
                debug_assert!(false, "happens_after on a started node");
                return;
            }
            None => return,
        }
        let Some(predecessor) = self.nodes.get_mut(other.0) else {
            return;
        };
        if predecessor.successors.contains(&node) {
            return;
        }
        predecessor.successors.push(node);
        if let Some(node) = self.nodes.get_mut(node.0) {
            node.pending += 1;
            node.predecessors.push(other);
        }
    }

    /// Closes a node: it executes as soon as its predecessors complete.
    pub(crate) fn start(&mut self, id: GridId) {
        let Some(node) = self.nodes.get_mut(id.0) else {
            return;
        };
        if node.state != GridState::Created {
            return;
        }
        self.started += 1;
        if node.pending == 0 {
            node.state = GridState::Ready;
            self.ready.push_back(id);
        } else {
            node.state = GridState::Waiting;
        }
        log::trace!("grid: start {id:?} ({:?})", node.state);
    }

    /// Starts a node along with every predecessor that is still open.
    ///
    /// Without this a forced node could wait forever on a predecessor nobody closes.
    pub(crate) fn force(&mut self, id: GridId) {
        let mut stack = vec![id];
        let mut order = Vec::new();
        while let Some(next) = stack.pop() {
            let Some(node) = self.nodes.get(next.0) else {
                continue;
            };
            if node.state != GridState::Created || order.contains(&next) {
                continue;
            }
            order.push(next);
            stack.extend(node.predecessors.iter().copied());
        }
        // Predecessors first, so that the ready queue keeps dependency order.
        for next in order.into_iter().rev() {
            self.start(next);
        }
    }

    /// Pops the next ready node and marks it executing.
    pub(crate) fn pop_ready(&mut self) -> Option<GridId> {
        while let Some(id) = self.ready.pop_front() {
            if let Some(node) = self.nodes.get_mut(id.0) {
                if node.state == GridState::Ready {
                    node.state = GridState::Executing;
                    return Some(id);
                }
            }
        }
        None
    }

    /// Retires an executing node, returning its task for disposal.
    ///
    /// Successors whose last predecessor this was become ready. A failed node
    /// poisons its successors.
    pub(crate) fn complete(&mut self, id: GridId, status: Status) -> Option<T> {
        match self.nodes.get(id.0) {
            Some(node) if node.state == GridState::Executing => {}
            _ => return None,
        }
        let node = self.nodes.remove(id.0)?;
        self.started -= 1;
        self.release_successors(&node.successors, status.is_failure());
        Some(node.task)
    }

    /// Drops a node that was never started.
    ///
    /// Its successors no longer wait for it.
    pub(crate) fn detach(&mut self, id: GridId) -> Option<T> {
        match self.nodes.get(id.0) {
            Some(node) if node.state == GridState::Created => {}
            _ => return None,
        }
        let node = self.nodes.remove(id.0)?;
        for predecessor in &node.predecessors {
            if let Some(predecessor) = self.nodes.get_mut(predecessor.0) {
                predecessor.successors.retain(|successor| *successor != id);
            }
        }
        self.release_successors(&node.successors, false);
        Some(node.task)
    }

    fn release_successors(&mut self, successors: &[GridId], poison: bool) {
        for &successor_id in successors {
            let Some(successor) = self.nodes.get_mut(successor_id.0) else {
                continue;
            };
            successor.pending -= 1;
            successor.poisoned |= poison;
            if successor.pending == 0 && successor.state == GridState::Waiting {
                successor.state = GridState::Ready;
                self.ready.push_back(successor_id);
            }
        }
    }

    pub(crate) fn task(&self, id: GridId) -> Option<&T> {
        self.nodes.get(id.0).map(|node| &node.task)
    }

    pub(crate) fn task_mut(&mut self, id: GridId) -> Option<&mut T> {
        self.nodes.get_mut(id.0).map(|node| &mut node.task)
    }

    #[cfg(test)]
    pub(crate) fn state(&self, id: GridId) -> Option<GridState> {
        self.nodes.get(id.0).map(|node| node.state)
    }

    pub(crate) fn is_poisoned(&self, id: GridId) -> bool {
        self.nodes.get(id.0).is_some_and(|node| node.poisoned)
    }

    #[cfg(test)]
    pub(crate) fn predecessors(&self, id: GridId) -> &[GridId] {
        self.nodes
            .get(id.0)
            .map_or(&[], |node| node.predecessors.as_slice())
    }

    /// Nodes that were started and have not completed yet.
    pub(crate) fn started(&self) -> usize {
        self.started
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_all(grid: &mut Grid<&'static str>) -> Vec<&'static str> {
        let mut order = Vec::new();
        while let Some(id) = grid.pop_ready() {
            order.push(grid.complete(id, Status::Success).unwrap());
        }
        order
    }

    #[test]
    fn successor_waits_for_predecessor() {
        let mut grid = Grid::default();
        let place = grid.attach("place", &[]);
        let sort = grid.attach("sort", &[place]);
        grid.start(sort);
        assert_eq!(grid.state(sort), Some(GridState::Waiting));
        assert_eq!(grid.pop_ready(), None);
        grid.start(place);
        assert_eq!(grid.pop_ready(), Some(place));
        assert_eq!(grid.pop_ready(), None);
        assert_eq!(grid.complete(place, Status::Success), Some("place"));
        assert_eq!(grid.pop_ready(), Some(sort));
    }

    #[test]
    fn force_starts_open_predecessors_first() {
        let mut grid = Grid::default();
        let raster = grid.attach("raster", &[]);
        let place = grid.attach("place", &[raster]);
        let sort = grid.attach("sort", &[place]);
        grid.force(sort);
        assert_eq!(run_all(&mut grid), ["raster", "place", "sort"]);
        assert_eq!(grid.len(), 0);
        assert_eq!(grid.started(), 0);
    }

    #[test]
    fn edges_to_completed_nodes_are_dropped() {
        let mut grid = Grid::default();
        let raster = grid.attach("raster", &[]);
        grid.start(raster);
        let id = grid.pop_ready().unwrap();
        grid.complete(id, Status::Success);
        let place = grid.attach("place", &[raster]);
        assert!(grid.predecessors(place).is_empty());
        grid.start(place);
        assert_eq!(grid.pop_ready(), Some(place));
    }

    #[test]
    fn failure_poisons_successors() {
        let mut grid = Grid::default();
        let sort = grid.attach("sort", &[]);
        let render = grid.attach("render", &[sort]);
        let other = grid.attach("other", &[]);
        grid.force(render);
        grid.start(other);
        let id = grid.pop_ready().unwrap();
        assert_eq!(id, sort);
        grid.complete(id, Status::Failed);
        assert!(grid.is_poisoned(render));
        assert!(!grid.is_poisoned(other));
    }

    #[test]
    fn detach_releases_successors() {
        let mut grid = Grid::default();
        let raster = grid.attach("raster", &[]);
        let place = grid.attach("place", &[raster]);
        let sort = grid.attach("sort", &[place]);
        grid.start(sort);
        assert_eq!(grid.detach(place), Some("place"));
        assert_eq!(grid.pop_ready(), Some(sort));
        // The raster no longer lists the detached node as a successor.
        grid.start(raster);
        assert_eq!(grid.pop_ready(), Some(raster));
        grid.complete(raster, Status::Success);
        assert_eq!(grid.pop_ready(), None);
    }

    #[test]
    fn duplicate_edges_count_once() {
        let mut grid = Grid::default();
        let raster = grid.attach("raster", &[]);
        let place = grid.attach("place", &[raster, raster]);
        grid.happens_after(place, raster);
        assert_eq!(grid.predecessors(place), [raster]);
        grid.force(place);
        assert_eq!(run_all(&mut grid), ["raster", "place"]);
    }
}
