use derive_more::Display;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::PathBuf;

use crate::codec::SensorId;
use crate::sensor::{SweepParams, TofParams};

/// Where a queued message came from. Placement only: periodic messages join
/// the tail, interrupts and recovery jump the head.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Origin {
    #[display("periodic")]
    Periodic,
    #[display("interrupt")]
    Interrupt,
    #[display("recovery")]
    Recovery,
}

/// One schedulable command. The `*_after` flags drive the follow-up pushes
/// the scheduler performs on success.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Probe { calibrate_after: bool },
    Calibrate { measure_after: bool },
    SetDamping { level: u16 },
    MeasureBlock(SweepParams),
    MeasureSine(SweepParams),
    MeasureEnv,
    MeasureTofImpulse(TofParams),
    MeasureTofBlock(TofParams),
    Reset { probe_after: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueueMessage {
    pub target: SensorId,
    pub command: Command,
    pub origin: Origin,
    /// Test measures exercise the sensor after recovery but are never
    /// persisted.
    pub test_measure: bool,
    /// Sub-plans may reroute their audio output.
    pub output_dir: Option<PathBuf>,
}

impl QueueMessage {
    pub fn periodic(target: SensorId, command: Command) -> Self {
        Self::with_origin(target, command, Origin::Periodic)
    }

    pub fn interrupt(target: SensorId, command: Command) -> Self {
        Self::with_origin(target, command, Origin::Interrupt)
    }

    pub fn recovery(target: SensorId, command: Command) -> Self {
        Self::with_origin(target, command, Origin::Recovery)
    }

    fn with_origin(target: SensorId, command: Command, origin: Origin) -> Self {
        Self {
            target,
            command,
            origin,
            test_measure: false,
            output_dir: None,
        }
    }
}

/// The shared command queue. Producers on several tasks, one consumer (the
/// scheduler); a plain guarded deque is all the arbitration the bus needs.
#[derive(Default)]
pub struct CommandQueue {
    inner: Mutex<VecDeque<QueueMessage>>,
}

impl CommandQueue {
    pub fn push_back(&self, message: QueueMessage) {
        self.inner.lock().push_back(message);
    }

    pub fn push_front(&self, message: QueueMessage) {
        self.inner.lock().push_front(message);
    }

    pub fn pop(&self) -> Option<QueueMessage> {
        self.inner.lock().pop_front()
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Snapshot for logging and tests.
    pub fn contents(&self) -> Vec<QueueMessage> {
        self.inner.lock().iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn probe(id: u32) -> QueueMessage {
        QueueMessage::periodic(SensorId(id), Command::Probe {
            calibrate_after: false,
        })
    }

    #[test]
    fn front_pushes_jump_ahead_of_back_pushes() {
        let queue = CommandQueue::default();
        queue.push_back(probe(1)); // A
        queue.push_back(probe(2)); // B
        queue.push_front(probe(3)); // C
        queue.push_back(probe(4)); // D
        queue.push_front(probe(5)); // E

        let order: Vec<u32> = std::iter::from_fn(|| queue.pop())
            .map(|m| m.target.0)
            .collect();
        assert_eq!(order, vec![5, 3, 1, 2, 4]);
    }

    #[test]
    fn same_origin_is_never_reordered() {
        let queue = CommandQueue::default();
        for id in 0..8 {
            queue.push_back(probe(id));
        }
        let order: Vec<u32> = std::iter::from_fn(|| queue.pop())
            .map(|m| m.target.0)
            .collect();
        assert_eq!(order, (0..8).collect::<Vec<_>>());
    }

    #[test]
    fn clear_empties_the_queue() {
        let queue = CommandQueue::default();
        queue.push_back(probe(1));
        queue.push_back(probe(2));
        assert_eq!(queue.len(), 2);
        queue.clear();
        assert!(queue.is_empty());
        assert_eq!(queue.pop(), None);
    }
}
