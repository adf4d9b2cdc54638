//! # A-GNSS injector
//!
//! The ordered-send substate described in spec.md 4.5: drives a queue of
//! pre-framed GNSS binary frames out over the UART, one at a time, waiting
//! for an ACK before advancing, retrying on NACK or per-message timeout, and
//! bailing out cleanly once an overall deadline elapses. Reentrant: it is
//! parameterized over whatever "prior state" type the host state machine
//! uses, so it can hand that value back unchanged on completion or abort.

use embassy_time::{Duration, Instant};
use heapless::Vec;

/// Runtime-tunable timings (spec.md 6).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AgnssConfig {
    pub message_timeout: Duration,
    pub total_timeout: Duration,
    pub max_retry: u8,
}

impl Default for AgnssConfig {
    fn default() -> Self {
        Self {
            message_timeout: Duration::from_secs(5),
            total_timeout: Duration::from_secs(60),
            max_retry: 3,
        }
    }
}

/// Failure modes surfaced for logging (spec.md 7); both ultimately abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum AgnssError {
    AckMismatch,
    TotalDeadlineElapsed,
}

/// What the caller should do after feeding the injector an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgnssStep {
    /// Send `queue[index]` (fetch via [`AgnssInjector::current_frame`]) and
    /// restart the per-message deadline.
    Send,
    /// Every frame was ACKed; return to the prior state.
    Complete,
    /// The total deadline elapsed or retries were exhausted; return to the
    /// prior state with nothing delivered.
    Aborted,
}

/// `N` bounds one frame's byte length, `M` bounds the queue length. `S` is
/// the host state machine's state type, stored opaquely so this module has
/// no dependency on it.
pub struct AgnssInjector<const N: usize, const M: usize, S: Copy> {
    config: AgnssConfig,
    queue: Vec<Vec<u8, N>, M>,
    index: usize,
    retry: u8,
    active: bool,
    /// Kept after completion/abort until the caller retrieves it with
    /// [`Self::take_prior_state`], since the state machine needs it to know
    /// which state to return to.
    prior_state: Option<S>,
    msg_deadline: Option<Instant>,
    total_deadline: Option<Instant>,
}

impl<const N: usize, const M: usize, S: Copy> AgnssInjector<N, M, S> {
    pub fn new(config: AgnssConfig) -> Self {
        Self {
            config,
            queue: Vec::new(),
            index: 0,
            retry: 0,
            active: false,
            prior_state: None,
            msg_deadline: None,
            total_deadline: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// The prior state to return to, once injection has completed or
    /// aborted. Clears the stored value.
    pub fn take_prior_state(&mut self) -> Option<S> {
        self.prior_state.take()
    }

    /// The frame to (re)send, if injection is active and not yet complete.
    pub fn current_frame(&self) -> Option<&[u8]> {
        self.queue.get(self.index).map(|f| f.as_slice())
    }

    /// Begin injecting `queue`, remembering `prior` to return to. An empty
    /// queue completes immediately.
    pub fn start(&mut self, queue: Vec<Vec<u8, N>, M>, prior: S, now: Instant) -> AgnssStep {
        self.queue = queue;
        self.index = 0;
        self.retry = 0;
        self.active = true;
        self.prior_state = Some(prior);
        if self.queue.is_empty() {
            return self.complete();
        }
        self.total_deadline = Some(now + self.config.total_timeout);
        self.msg_deadline = Some(now + self.config.message_timeout);
        AgnssStep::Send
    }

    fn finish(&mut self) {
        self.queue.clear();
        self.index = 0;
        self.retry = 0;
        self.active = false;
        self.msg_deadline = None;
        self.total_deadline = None;
    }

    fn abort(&mut self) -> AgnssStep {
        self.finish();
        AgnssStep::Aborted
    }

    /// An ACK arrived for the current frame.
    pub fn on_ack(&mut self, now: Instant) -> AgnssStep {
        self.retry = 0;
        self.index += 1;
        if self.index >= self.queue.len() {
            return self.complete();
        }
        self.msg_deadline = Some(now + self.config.message_timeout);
        AgnssStep::Send
    }

    fn complete(&mut self) -> AgnssStep {
        self.finish();
        AgnssStep::Complete
    }

    /// A NACK arrived for the current frame, or its per-message deadline
    /// elapsed: both retry the same way (spec.md 4.5).
    pub fn on_nack_or_message_timeout(&mut self, now: Instant) -> AgnssStep {
        self.retry += 1;
        if self.retry >= self.config.max_retry {
            return self.abort();
        }
        self.msg_deadline = Some(now + self.config.message_timeout);
        AgnssStep::Send
    }

    /// Check whether the per-message or total deadline has elapsed; returns
    /// the appropriate step, or `None` if injection should continue as-is.
    pub fn poll(&mut self, now: Instant) -> Option<AgnssStep> {
        if !self.is_active() {
            return None;
        }
        if let Some(deadline) = self.total_deadline {
            if now >= deadline {
                return Some(self.abort());
            }
        }
        if let Some(deadline) = self.msg_deadline {
            if now >= deadline {
                return Some(self.on_nack_or_message_timeout(now));
            }
        }
        None
    }

    /// Motion never interrupts injection, but may change what state is
    /// returned to once it completes or aborts (spec.md 4.5).
    pub fn update_prior_state_on_motion(&mut self, new_prior: S) {
        if self.is_active() {
            self.prior_state = Some(new_prior);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum FakeState {
        Tracking,
        IdleOff,
    }

    fn frame(byte: u8) -> Vec<u8, 16> {
        let mut v = Vec::new();
        v.push(byte).unwrap();
        v
    }

    /// End-to-end scenario 5 of spec.md 8.
    #[test]
    fn scenario_5_happy_path_two_frames() {
        let t0 = Instant::from_millis(0);
        let mut inj: AgnssInjector<16, 4, FakeState> = AgnssInjector::new(AgnssConfig::default());
        let mut queue = Vec::new();
        queue.push(frame(1)).unwrap();
        queue.push(frame(2)).unwrap();

        assert_eq!(inj.start(queue, FakeState::IdleOff, t0), AgnssStep::Send);
        assert_eq!(inj.current_frame(), Some(&[1u8][..]));

        assert_eq!(inj.on_ack(t0), AgnssStep::Send);
        assert_eq!(inj.current_frame(), Some(&[2u8][..]));

        assert_eq!(inj.on_ack(t0), AgnssStep::Complete);
        assert!(!inj.is_active());
        assert_eq!(inj.take_prior_state(), Some(FakeState::IdleOff));
    }

    #[test]
    fn nack_retries_then_aborts_after_max_retry() {
        let t0 = Instant::from_millis(0);
        let mut inj: AgnssInjector<16, 4, FakeState> = AgnssInjector::new(AgnssConfig {
            max_retry: 2,
            ..AgnssConfig::default()
        });
        let mut queue = Vec::new();
        queue.push(frame(1)).unwrap();
        inj.start(queue, FakeState::Tracking, t0);

        assert_eq!(inj.on_nack_or_message_timeout(t0), AgnssStep::Send);
        assert_eq!(inj.on_nack_or_message_timeout(t0), AgnssStep::Aborted);
    }

    #[test]
    fn total_deadline_aborts_regardless_of_retry_count() {
        let t0 = Instant::from_millis(0);
        let config = AgnssConfig { total_timeout: Duration::from_secs(10), ..AgnssConfig::default() };
        let mut inj: AgnssInjector<16, 4, FakeState> = AgnssInjector::new(config);
        let mut queue = Vec::new();
        queue.push(frame(1)).unwrap();
        inj.start(queue, FakeState::Tracking, t0);

        let later = t0 + Duration::from_secs(11);
        assert_eq!(inj.poll(later), Some(AgnssStep::Aborted));
        assert!(!inj.is_active());
    }

    #[test]
    fn empty_queue_completes_immediately() {
        let t0 = Instant::from_millis(0);
        let mut inj: AgnssInjector<16, 4, FakeState> = AgnssInjector::new(AgnssConfig::default());
        let queue = Vec::new();
        assert_eq!(inj.start(queue, FakeState::Tracking, t0), AgnssStep::Complete);
    }

    #[test]
    fn motion_updates_prior_state_without_interrupting() {
        let t0 = Instant::from_millis(0);
        let mut inj: AgnssInjector<16, 4, FakeState> = AgnssInjector::new(AgnssConfig::default());
        let mut queue = Vec::new();
        queue.push(frame(1)).unwrap();
        inj.start(queue, FakeState::IdleOff, t0);

        inj.update_prior_state_on_motion(FakeState::Tracking);
        assert_eq!(inj.on_ack(t0), AgnssStep::Complete);
        assert!(!inj.is_active());
        assert_eq!(inj.take_prior_state(), Some(FakeState::Tracking));
    }
}
