// Three-lane bounded blocking work queue

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

/// Capacities of the three lanes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LaneCapacities {
    pub edit: usize,
    pub scan: usize,
    pub index: usize,
}

impl Default for LaneCapacities {
    fn default() -> Self {
        Self {
            edit: 64,
            scan: 1024,
            index: 1024,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Edit,
    Scan,
    Index,
}

struct Lanes<T> {
    edit: VecDeque<T>,
    scan: VecDeque<T>,
    index: VecDeque<T>,
}

impl<T> Lanes<T> {
    fn lane(&mut self, lane: Lane) -> &mut VecDeque<T> {
        match lane {
            Lane::Edit => &mut self.edit,
            Lane::Scan => &mut self.scan,
            Lane::Index => &mut self.index,
        }
    }

    /// Edits newest first, then scans and background indexing in arrival order
    fn pop(&mut self) -> Option<(Lane, T)> {
        if let Some(item) = self.edit.pop_back() {
            return Some((Lane::Edit, item));
        }
        if let Some(item) = self.scan.pop_front() {
            return Some((Lane::Scan, item));
        }
        self.index.pop_front().map(|item| (Lane::Index, item))
    }
}

/// Multi-producer, single-consumer queue with one bounded lane per kind of work.
///
/// Producers block while their lane is full. The consumer blocks while every
/// lane is empty and always serves edit, then scan, then index.
pub struct WorkQueue<T> {
    lanes: Mutex<Lanes<T>>,
    capacities: LaneCapacities,
    not_empty: Condvar,
    edit_not_full: Condvar,
    scan_not_full: Condvar,
    index_not_full: Condvar,
}

impl<T> WorkQueue<T> {
    pub fn new(capacities: LaneCapacities) -> Self {
        Self {
            lanes: Mutex::new(Lanes {
                edit: VecDeque::with_capacity(capacities.edit),
                scan: VecDeque::with_capacity(capacities.scan),
                index: VecDeque::with_capacity(capacities.index),
            }),
            capacities,
            not_empty: Condvar::new(),
            edit_not_full: Condvar::new(),
            scan_not_full: Condvar::new(),
            index_not_full: Condvar::new(),
        }
    }

    pub fn submit_edit(&self, item: T) {
        self.submit(Lane::Edit, item);
    }

    pub fn submit_scan(&self, item: T) {
        self.submit(Lane::Scan, item);
    }

    pub fn submit_index(&self, item: T) {
        self.submit(Lane::Index, item);
    }

    pub fn submit(&self, lane: Lane, item: T) {
        let capacity = self.capacity(lane).max(1);
        let mut lanes = self.lanes.lock();
        while lanes.lane(lane).len() >= capacity {
            self.not_full(lane).wait(&mut lanes);
        }
        lanes.lane(lane).push_back(item);
        drop(lanes);
        self.not_empty.notify_one();
    }

    /// Block until some lane has work and return the highest priority item
    pub fn take(&self) -> T {
        let mut lanes = self.lanes.lock();
        loop {
            if let Some((lane, item)) = lanes.pop() {
                drop(lanes);
                self.not_full(lane).notify_one();
                return item;
            }
            self.not_empty.wait(&mut lanes);
        }
    }

    /// Items currently waiting in `lane`
    pub fn len(&self, lane: Lane) -> usize {
        self.lanes.lock().lane(lane).len()
    }

    pub fn is_empty(&self) -> bool {
        let lanes = self.lanes.lock();
        lanes.edit.is_empty() && lanes.scan.is_empty() && lanes.index.is_empty()
    }

    fn capacity(&self, lane: Lane) -> usize {
        match lane {
            Lane::Edit => self.capacities.edit,
            Lane::Scan => self.capacities.scan,
            Lane::Index => self.capacities.index,
        }
    }

    fn not_full(&self, lane: Lane) -> &Condvar {
        match lane {
            Lane::Edit => &self.edit_not_full,
            Lane::Scan => &self.scan_not_full,
            Lane::Index => &self.index_not_full,
        }
    }
}
