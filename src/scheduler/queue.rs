use std::collections::VecDeque;
use uuid::Uuid;

use crate::priority::TaskPriority;

/// FIFO within a priority level; higher levels always ahead of lower ones.
#[derive(Debug, Default)]
pub struct PriorityQueue {
    items: VecDeque<(TaskPriority, Uuid)>,
}

impl PriorityQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts before the first entry of a strictly lower priority.
    pub fn push(&mut self, id: Uuid, priority: TaskPriority) {
        let rank = priority.rank();
        let position = self
            .items
            .iter()
            .position(|(p, _)| p.rank() > rank)
            .unwrap_or(self.items.len());
        self.items.insert(position, (priority, id));
    }

    pub fn pop(&mut self) -> Option<Uuid> {
        self.items.pop_front().map(|(_, id)| id)
    }

    pub fn remove(&mut self, id: Uuid) -> bool {
        match self.items.iter().position(|(_, queued)| *queued == id) {
            Some(index) => self.items.remove(index).is_some(),
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Uuid> + '_ {
        self.items.iter().map(|(_, id)| *id)
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}
