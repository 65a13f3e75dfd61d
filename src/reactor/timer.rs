use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

/// deadlines beyond this are treated as 'never' rather than overflowing
pub const MAX_TIMER_DELAY: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

/// The things a connection schedules for later
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub enum TimerTask {
    CbsRenewal,
    CloudToDeviceSend,
}

#[derive(Debug, Eq, PartialEq, Ord, PartialOrd)]
struct ScheduledTask {
    deadline: Instant,
    /// keeps tasks with the same deadline in scheduling order
    seq: u64,
    task: TimerTask,
}

/// Deadline-ordered timer tasks, driven by the reactor loop on the reactor's thread
#[derive(Debug, Default)]
pub struct TimerQueue {
    heap: BinaryHeap<Reverse<ScheduledTask>>,
    next_seq: u64,
}

impl TimerQueue {
    pub fn new() -> TimerQueue {
        TimerQueue::default()
    }

    pub fn schedule(&mut self, now: Instant, delay: Duration, task: TimerTask) {
        let deadline = now.checked_add(delay.min(MAX_TIMER_DELAY))
            .or_else(|| now.checked_add(Duration::from_secs(24 * 3600)))
            .unwrap_or(now);
        self.heap.push(Reverse(ScheduledTask {
            deadline,
            seq: self.next_seq,
            task,
        }));
        self.next_seq += 1;
    }

    pub fn cancel(&mut self, task: TimerTask) {
        self.heap.retain(|s| s.0.task != task);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.peek()
            .map(|s| s.0.deadline)
    }

    /// Removes and returns all tasks that are due at `now`, in deadline order
    pub fn pop_due(&mut self, now: Instant) -> Vec<TimerTask> {
        let mut result = Vec::new();
        while let Some(Reverse(next)) = self.heap.peek() {
            if next.deadline > now {
                break;
            }
            if let Some(Reverse(due)) = self.heap.pop() {
                result.push(due.task);
            }
        }
        result
    }

    pub fn is_scheduled(&self, task: TimerTask) -> bool {
        self.heap.iter().any(|s| s.0.task == task)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pop_due_in_deadline_order() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule(now, Duration::from_secs(10), TimerTask::CbsRenewal);
        timers.schedule(now, Duration::from_millis(10), TimerTask::CloudToDeviceSend);

        assert_eq!(timers.next_deadline(), Some(now + Duration::from_millis(10)));
        assert!(timers.pop_due(now).is_empty());
        assert_eq!(timers.pop_due(now + Duration::from_millis(10)), vec![TimerTask::CloudToDeviceSend]);
        assert_eq!(timers.len(), 1);
        assert_eq!(timers.pop_due(now + Duration::from_secs(60)), vec![TimerTask::CbsRenewal]);
        assert!(timers.is_empty());
    }

    #[test]
    fn test_same_deadline_keeps_scheduling_order() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule(now, Duration::ZERO, TimerTask::CloudToDeviceSend);
        timers.schedule(now, Duration::ZERO, TimerTask::CbsRenewal);
        assert_eq!(timers.pop_due(now), vec![TimerTask::CloudToDeviceSend, TimerTask::CbsRenewal]);
    }

    #[test]
    fn test_cancel() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule(now, Duration::from_secs(1), TimerTask::CbsRenewal);
        timers.schedule(now, Duration::from_secs(2), TimerTask::CloudToDeviceSend);

        timers.cancel(TimerTask::CbsRenewal);

        assert!(!timers.is_scheduled(TimerTask::CbsRenewal));
        assert!(timers.is_scheduled(TimerTask::CloudToDeviceSend));
        assert_eq!(timers.next_deadline(), Some(now + Duration::from_secs(2)));
    }

    #[test]
    fn test_huge_delay_is_not_due() {
        let now = Instant::now();
        let mut timers = TimerQueue::new();
        timers.schedule(now, Duration::MAX, TimerTask::CbsRenewal);

        assert!(timers.pop_due(now).is_empty());
        assert!(timers.pop_due(now + Duration::from_secs(24 * 3600)).is_empty());
        assert!(timers.next_deadline().unwrap() > now);
        assert!(timers.is_scheduled(TimerTask::CbsRenewal));
    }
}
