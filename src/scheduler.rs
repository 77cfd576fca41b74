//! The delay scheduler: buffers decoded packets, assigns each an
//! independently sampled release time and hands them back in order.
//!
//! Release times are non-decreasing along the queue. Each packet's delay is
//! uniform on `[max(prev_due - now, 0), max_delay]`, the least-constrained
//! distribution that keeps the order, and delays are strictly additive so a
//! replayed event can never arrive earlier than the unmodified one would
//! have.

use std::collections::VecDeque;
use std::time::Duration;

use rand::RngCore;

use evdev_capture::DeviceId;
use input_event::Event;

use crate::clock::Entropy;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Packet {
    /// a decoded device event, replayed unchanged after the delay
    Device {
        device: DeviceId,
        event: Event,
        due: u64,
    },
    /// an absolute cursor target in the global pointer space
    PointerMove { x: f64, y: f64, due: u64 },
}

impl Packet {
    pub fn due(&self) -> u64 {
        match self {
            Packet::Device { due, .. } => *due,
            Packet::PointerMove { due, .. } => *due,
        }
    }
}

pub struct Scheduler {
    queue: VecDeque<Packet>,
    max_delay: u64,
    prev_due: u64,
}

impl Scheduler {
    pub fn new(max_delay_ms: u32) -> Self {
        Self {
            queue: VecDeque::new(),
            max_delay: u64::from(max_delay_ms),
            prev_due: 0,
        }
    }

    fn sample_due<R: RngCore>(&mut self, now: u64, entropy: &mut Entropy<R>) -> u64 {
        let lower = self.prev_due.saturating_sub(now).min(self.max_delay);
        let delay = entropy.uniform(lower, self.max_delay);
        let due = now + delay;
        self.prev_due = due;
        due
    }

    pub fn enqueue_device<R: RngCore>(
        &mut self,
        device: DeviceId,
        event: Event,
        now: u64,
        entropy: &mut Entropy<R>,
    ) {
        let due = self.sample_due(now, entropy);
        self.queue.push_back(Packet::Device { device, event, due });
    }

    /// Queue a pointer move. When the tail is an unreleased pointer move its
    /// target is overwritten in place instead: the intermediate position
    /// would have been visually overwritten anyway, and the collapse bounds
    /// queue growth and the event rate seen by the compositor.
    pub fn enqueue_pointer_move<R: RngCore>(
        &mut self,
        x: f64,
        y: f64,
        now: u64,
        entropy: &mut Entropy<R>,
    ) {
        if let Some(Packet::PointerMove {
            x: tail_x,
            y: tail_y,
            ..
        }) = self.queue.back_mut()
        {
            *tail_x = x;
            *tail_y = y;
            return;
        }
        let due = self.sample_due(now, entropy);
        self.queue.push_back(Packet::PointerMove { x, y, due });
    }

    /// Pop the head if its release time has been reached.
    pub fn pop_due(&mut self, now: u64) -> Option<Packet> {
        if self.queue.front()?.due() <= now {
            self.queue.pop_front()
        } else {
            None
        }
    }

    /// Drop every queued packet of a detached device so nothing referring
    /// to it can reach release.
    pub fn drain_device(&mut self, device: DeviceId) {
        self.queue
            .retain(|p| !matches!(p, Packet::Device { device: d, .. } if *d == device));
    }

    /// How long the event loop may sleep: until the head is due, or
    /// indefinitely when nothing is queued.
    pub fn poll_timeout(&self, now: u64) -> Option<Duration> {
        self.queue
            .front()
            .map(|p| Duration::from_millis(p.due().saturating_sub(now)))
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use input_event::KeyState;
    use rand::rngs::mock::StepRng;

    const KEY_A: u32 = 30;

    fn key(state: KeyState) -> Event {
        Event::Key { key: KEY_A, state }
    }

    fn entropy() -> Entropy<StepRng> {
        Entropy::with_rng(StepRng::new(0, 0x9e3779b97f4a7c15))
    }

    fn dues(s: &Scheduler) -> Vec<u64> {
        s.queue.iter().map(|p| p.due()).collect()
    }

    #[test]
    fn zero_delay_releases_at_enqueue_time() {
        let mut entropy = entropy();
        let mut s = Scheduler::new(0);
        s.enqueue_device(1, key(KeyState::Pressed), 10, &mut entropy);
        s.enqueue_device(1, key(KeyState::Released), 12, &mut entropy);
        assert_eq!(dues(&s), vec![10, 12]);
        assert_eq!(s.pop_due(9), None);
        assert!(matches!(
            s.pop_due(10),
            Some(Packet::Device { due: 10, .. })
        ));
    }

    #[test]
    fn release_times_are_monotonic_under_bursts() {
        let mut entropy = entropy();
        let mut s = Scheduler::new(100);
        for t in 0..5 {
            s.enqueue_device(1, key(KeyState::Pressed), t, &mut entropy);
        }
        let dues = dues(&s);
        for pair in dues.windows(2) {
            assert!(pair[0] <= pair[1]);
        }
        for (t, due) in dues.iter().enumerate() {
            let delay = due - t as u64;
            assert!(delay <= 100, "delay {delay} out of range");
        }
    }

    #[test]
    fn delay_is_bounded_below_by_the_pending_tail() {
        let mut s = Scheduler::new(100);
        // first packet lands 80ms out
        let mut fixed = Entropy::with_rng(StepRng::new(80, 0));
        s.enqueue_device(1, key(KeyState::Pressed), 0, &mut fixed);
        assert_eq!(dues(&s), vec![80]);
        // an rng that always picks the minimum still cannot release the
        // second packet before the first
        let mut minimal = Entropy::with_rng(StepRng::new(0, 0));
        s.enqueue_device(1, key(KeyState::Released), 1, &mut minimal);
        assert_eq!(dues(&s), vec![80, 80]);
    }

    #[test]
    fn adjacent_pointer_moves_coalesce() {
        let mut entropy = entropy();
        let mut s = Scheduler::new(100);
        s.enqueue_pointer_move(10.0, 10.0, 0, &mut entropy);
        let due = dues(&s)[0];
        s.enqueue_pointer_move(20.0, 20.0, 0, &mut entropy);
        s.enqueue_pointer_move(30.0, 30.0, 1, &mut entropy);
        assert_eq!(s.len(), 1);
        assert_eq!(
            s.queue.front(),
            Some(&Packet::PointerMove {
                x: 30.0,
                y: 30.0,
                due
            })
        );
    }

    #[test]
    fn device_events_never_coalesce() {
        let mut entropy = entropy();
        let mut s = Scheduler::new(100);
        s.enqueue_pointer_move(10.0, 10.0, 0, &mut entropy);
        s.enqueue_device(1, key(KeyState::Pressed), 0, &mut entropy);
        s.enqueue_pointer_move(20.0, 20.0, 0, &mut entropy);
        assert_eq!(s.len(), 3);
    }

    #[test]
    fn detaching_a_device_drains_only_its_packets() {
        let mut entropy = entropy();
        let mut s = Scheduler::new(100);
        s.enqueue_device(1, key(KeyState::Pressed), 0, &mut entropy);
        s.enqueue_device(2, key(KeyState::Pressed), 0, &mut entropy);
        s.enqueue_pointer_move(5.0, 5.0, 0, &mut entropy);
        s.drain_device(1);
        assert_eq!(s.len(), 2);
        assert!(!s
            .queue
            .iter()
            .any(|p| matches!(p, Packet::Device { device: 1, .. })));
    }

    #[test]
    fn poll_timeout_tracks_the_head() {
        let mut entropy = Entropy::with_rng(StepRng::new(0, 0));
        let mut s = Scheduler::new(0);
        assert_eq!(s.poll_timeout(0), None);
        s.enqueue_device(1, key(KeyState::Pressed), 40, &mut entropy);
        assert_eq!(s.poll_timeout(10), Some(Duration::from_millis(30)));
        // overdue head polls back immediately
        assert_eq!(s.poll_timeout(50), Some(Duration::ZERO));
    }

    #[test]
    fn release_preserves_the_event_payload() {
        let mut entropy = entropy();
        let mut s = Scheduler::new(0);
        let event = key(KeyState::Pressed);
        s.enqueue_device(7, event, 3, &mut entropy);
        match s.pop_due(3) {
            Some(Packet::Device {
                device: 7,
                event: released,
                due: 3,
            }) => assert_eq!(released, event),
            other => panic!("unexpected packet: {other:?}"),
        }
    }
}
