//! # GNSS power + fix state machine
//!
//! The six-state controller of spec.md 4.6: decides when the GNSS receiver
//! is powered, judges fix quality, writes track points, and hosts the
//! reentrant A-GNSS substate ([`crate::agnss`]).

use embassy_time::{Duration, Instant};
use heapless::Vec;

use crate::agnss::{AgnssConfig, AgnssInjector, AgnssStep};
use crate::fmt::{debug, info, warn};
use crate::track::TrackPoint;

/// The six named states of spec.md 4.6.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum GnssState {
    Init,
    Searching,
    IdleOff,
    Tracking,
    AnalyzingStill,
    AgnssProc,
}

impl GnssState {
    /// P7: GNSS is powered in {S1, S3, S4, S5}, off in {S0, S2}.
    pub fn is_powered(self) -> bool {
        !matches!(self, GnssState::Init | GnssState::IdleOff)
    }
}

/// Runtime-tunable timings and thresholds (spec.md 6, plus the supplemented
/// periodic-wake and date-plausibility knobs of SPEC_FULL.md).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StateMachineConfig {
    pub t_active: Duration,
    pub t_still_confirm: Duration,
    pub t_s4_query: Duration,
    pub t_cold: Duration,
    pub t_reacquire: Duration,
    pub vehicle_speed_thresh_kmh: f32,
    pub min_hdop_for_valid_fix: f32,
    pub max_consecutive_fix_failures: u32,
    /// Number of consecutive invalid fixes observed while Tracking before the
    /// signal is judged "degraded" and the machine falls back to Searching.
    pub degraded_fix_limit: u32,
    /// `None` restores spec.md's literal S2 exit list (motion, host wake,
    /// keep-alive, A-GNSS only). `Some(d)` adds a periodic self-wake every
    /// `d` (default 15 minutes; SPEC_FULL.md supplemented feature 1).
    pub idle_periodic_wake: Option<Duration>,
    /// Minimum plausible year for `dateTimeValid` (SPEC_FULL.md feature 4).
    pub min_plausible_year: u16,
    /// Historical average speed above which the HDOP check is waived in
    /// favor of a satellite-count check (SPEC_FULL.md feature 2).
    pub high_speed_override_thresh_kmh: f32,
}

impl Default for StateMachineConfig {
    fn default() -> Self {
        Self {
            t_active: Duration::from_secs(10),
            t_still_confirm: Duration::from_secs(60),
            t_s4_query: Duration::from_secs(5),
            t_cold: Duration::from_secs(90),
            t_reacquire: Duration::from_secs(30),
            vehicle_speed_thresh_kmh: 5.0,
            min_hdop_for_valid_fix: 2.0,
            max_consecutive_fix_failures: 16,
            degraded_fix_limit: 3,
            idle_periodic_wake: Some(Duration::from_secs(15 * 60)),
            min_plausible_year: 2025,
            high_speed_override_thresh_kmh: 20.0,
        }
    }
}

/// One GNSS fix observation, already parsed from NMEA by the external
/// collaborator named in spec.md 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GnssFix {
    pub location_valid: bool,
    pub date_valid: bool,
    pub time_valid: bool,
    pub year: u16,
    pub hdop: f32,
    pub satellites: u32,
    pub speed_kmh: Option<f32>,
    pub course_deg: Option<f32>,
    pub latitude: f64,
    pub longitude: f64,
    pub altitude_m: f32,
    pub timestamp_unix: u32,
}

/// A running average of reported speed, sampled every 20th update, so a
/// single noisy high-speed sample can't flip the high-speed HDOP override
/// (SPEC_FULL.md feature 3, grounded in the original firmware's `SpeedAverage`).
#[derive(Debug, Clone, Copy)]
struct SpeedAverage {
    samples: [f32; 10],
    len: usize,
    next: usize,
    calls: u32,
}

impl SpeedAverage {
    fn new() -> Self {
        Self { samples: [0.0; 10], len: 0, next: 0, calls: 0 }
    }

    fn observe(&mut self, speed_kmh: f32) {
        self.calls = self.calls.wrapping_add(1);
        if self.calls % 20 != 0 {
            return;
        }
        self.samples[self.next] = speed_kmh;
        self.next = (self.next + 1) % self.samples.len();
        if self.len < self.samples.len() {
            self.len += 1;
        }
    }

    fn average(&self) -> f32 {
        if self.len == 0 {
            return 0.0;
        }
        self.samples[..self.len].iter().sum::<f32>() / self.len as f32
    }
}

/// Shared fix-judging predicate used by Searching, Tracking, and
/// AnalyzingStill alike (SPEC_FULL.md feature 2): a fix is valid if location,
/// date, and time are all valid and HDOP is under threshold, OR — when the
/// tracker's recent average speed is high — satellite count alone clears 4.
struct FixValidityPolicy {
    speed_avg: SpeedAverage,
}

impl FixValidityPolicy {
    fn new() -> Self {
        Self { speed_avg: SpeedAverage::new() }
    }

    fn evaluate(&mut self, fix: &GnssFix, config: &StateMachineConfig) -> bool {
        self.speed_avg.observe(fix.speed_kmh.unwrap_or(0.0));
        let date_time_valid =
            fix.date_valid && fix.time_valid && fix.year >= config.min_plausible_year;
        if !fix.location_valid || !date_time_valid {
            return false;
        }
        if fix.hdop < config.min_hdop_for_valid_fix {
            return true;
        }
        let is_high_speed = self.speed_avg.average() > config.high_speed_override_thresh_kmh;
        is_high_speed && fix.satellites > 4
    }
}

/// What the orchestrator should do after feeding the machine an event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Action {
    None,
    PowerOn,
    PowerOff,
    EmitTrackPoint(TrackPoint),
    /// Send [`GnssStateMachine::agnss_current_frame`] over the GNSS UART.
    SendAgnssFrame,
    /// Consecutive-failure count reached the configured limit while
    /// keep-alive holds the machine in Searching; emit the vendor-specific
    /// restart frame (feature `gnss-restart-on-failure`) and keep searching.
    RequestGnssRestart,
    /// Consecutive-failure count reached the configured limit and the
    /// machine is falling back to IdleOff: emit the restart frame, then cut
    /// GNSS power. Carries both effects so the power-off isn't dropped.
    RequestGnssRestartThenPowerOff,
}

/// `AGNSS_N`/`AGNSS_M` bound the A-GNSS frame size and queue length.
pub struct GnssStateMachine<const AGNSS_N: usize, const AGNSS_M: usize> {
    config: StateMachineConfig,
    state: GnssState,
    policy: FixValidityPolicy,
    injector: AgnssInjector<AGNSS_N, AGNSS_M, GnssState>,
    latest_fix: Option<GnssFix>,
    consecutive_failures: u32,
    degraded_count: u32,
    fix_attempt_deadline: Option<Instant>,
    active_sample_deadline: Option<Instant>,
    still_confirm_deadline: Option<Instant>,
    s4_query_deadline: Option<Instant>,
    idle_wake_deadline: Option<Instant>,
    keep_alive_deadline: Option<Instant>,
}

impl<const AGNSS_N: usize, const AGNSS_M: usize> GnssStateMachine<AGNSS_N, AGNSS_M> {
    pub fn new(config: StateMachineConfig, agnss_config: AgnssConfig) -> Self {
        Self {
            config,
            state: GnssState::Init,
            policy: FixValidityPolicy::new(),
            injector: AgnssInjector::new(agnss_config),
            latest_fix: None,
            consecutive_failures: 0,
            degraded_count: 0,
            fix_attempt_deadline: None,
            active_sample_deadline: None,
            still_confirm_deadline: None,
            s4_query_deadline: None,
            idle_wake_deadline: None,
            keep_alive_deadline: None,
        }
    }

    pub fn state(&self) -> GnssState {
        self.state
    }

    pub fn is_powered(&self) -> bool {
        self.state.is_powered()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    pub fn keep_alive_remaining(&self, now: Instant) -> Duration {
        match self.keep_alive_deadline {
            Some(deadline) if deadline > now => deadline - now,
            _ => Duration::from_secs(0),
        }
    }

    pub fn agnss_current_frame(&self) -> Option<&[u8]> {
        self.injector.current_frame()
    }

    /// Complete peripheral initialization. `fix_immediately` picks S1 vs S2
    /// as spec.md 4.6's S0 exit.
    pub fn finish_init(&mut self, fix_immediately: bool, now: Instant) -> Action {
        let target = if fix_immediately { GnssState::Searching } else { GnssState::IdleOff };
        self.enter(target, GnssState::Init, now)
    }

    fn enter(&mut self, target: GnssState, from: GnssState, now: Instant) -> Action {
        info!("gnss state machine: {:?} -> {:?}", from, target);
        self.state = target;
        match target {
            GnssState::Init => Action::None,
            GnssState::Searching => {
                self.fix_attempt_deadline = Some(
                    now + if from == GnssState::Tracking { self.config.t_reacquire } else { self.config.t_cold },
                );
                if from != GnssState::Tracking {
                    self.consecutive_failures = 0;
                }
                self.still_confirm_deadline = None;
                self.s4_query_deadline = None;
                Action::PowerOn
            }
            GnssState::IdleOff => {
                self.fix_attempt_deadline = None;
                self.active_sample_deadline = None;
                self.still_confirm_deadline = None;
                self.s4_query_deadline = None;
                self.idle_wake_deadline = self.config.idle_periodic_wake.map(|d| now + d);
                Action::PowerOff
            }
            GnssState::Tracking => {
                self.active_sample_deadline = Some(now + self.config.t_active);
                self.still_confirm_deadline = None;
                self.degraded_count = 0;
                self.consecutive_failures = 0;
                Action::PowerOn
            }
            GnssState::AnalyzingStill => {
                self.s4_query_deadline = Some(now + self.config.t_s4_query);
                Action::None
            }
            GnssState::AgnssProc => Action::PowerOn,
        }
    }

    /// A new fix line arrived from the NMEA parser.
    pub fn on_fix(&mut self, fix: GnssFix, now: Instant) -> Action {
        let valid = self.policy.evaluate(&fix, &self.config);
        self.latest_fix = Some(fix);
        match self.state {
            GnssState::Searching => {
                if valid {
                    let from = self.state;
                    let action = self.enter(GnssState::Tracking, from, now);
                    return self.combine_with_point(action, fix);
                }
                Action::None
            }
            GnssState::Tracking => {
                if valid {
                    self.degraded_count = 0;
                } else {
                    self.degraded_count += 1;
                    if self.degraded_count >= self.config.degraded_fix_limit {
                        warn!("gnss state machine: degraded signal, falling back to Searching");
                        return self.enter(GnssState::Searching, GnssState::Tracking, now);
                    }
                }
                Action::None
            }
            GnssState::AnalyzingStill => {
                let high_speed_stop =
                    valid && fix.speed_kmh.unwrap_or(0.0) > self.config.vehicle_speed_thresh_kmh;
                if high_speed_stop {
                    self.enter(GnssState::Tracking, GnssState::AnalyzingStill, now)
                } else {
                    self.enter(GnssState::IdleOff, GnssState::AnalyzingStill, now)
                }
            }
            GnssState::Init | GnssState::IdleOff | GnssState::AgnssProc => Action::None,
        }
    }

    fn combine_with_point(&self, action: Action, fix: GnssFix) -> Action {
        if action == Action::PowerOn {
            Action::EmitTrackPoint(fix_to_point(&fix))
        } else {
            action
        }
    }

    /// Stillness candidate signalled by the motion analyzer.
    pub fn on_still(&mut self, now: Instant) -> Action {
        if self.state == GnssState::Tracking && self.still_confirm_deadline.is_none() {
            self.still_confirm_deadline = Some(now + self.config.t_still_confirm);
        }
        Action::None
    }

    /// A jump (or free-fall dropout) signalled by the motion analyzer.
    pub fn on_motion(&mut self, now: Instant) -> Action {
        match self.state {
            GnssState::Tracking => {
                self.still_confirm_deadline = None;
                Action::None
            }
            GnssState::AnalyzingStill => self.enter(GnssState::Tracking, GnssState::AnalyzingStill, now),
            GnssState::IdleOff => self.enter(GnssState::Searching, GnssState::IdleOff, now),
            GnssState::AgnssProc => {
                self.injector.update_prior_state_on_motion(GnssState::Searching);
                Action::None
            }
            GnssState::Init | GnssState::Searching => Action::None,
        }
    }

    /// `GpsWakeup` host command: request S2 -> S1.
    pub fn on_host_wake(&mut self, now: Instant) -> Action {
        if self.state == GnssState::IdleOff {
            self.enter(GnssState::Searching, GnssState::IdleOff, now)
        } else {
            Action::None
        }
    }

    /// `GpsKeepAlive` host command. `0` cancels; otherwise holds the GNSS
    /// active for `minutes`, waking from IdleOff immediately if needed.
    pub fn on_keep_alive(&mut self, minutes: u16, now: Instant) -> Action {
        if minutes == 0 {
            self.keep_alive_deadline = None;
            return Action::None;
        }
        self.keep_alive_deadline = Some(now + Duration::from_secs(minutes as u64 * 60));
        if self.state == GnssState::IdleOff {
            self.enter(GnssState::Searching, GnssState::IdleOff, now)
        } else {
            Action::None
        }
    }

    /// The host finished writing A-GNSS chunks; hand the queue to the
    /// injector and enter the reentrant A-GNSS substate.
    pub fn on_agnss_end(
        &mut self,
        queue: Vec<Vec<u8, AGNSS_N>, AGNSS_M>,
        now: Instant,
    ) -> Action {
        let prior = if self.state == GnssState::AgnssProc {
            self.injector.take_prior_state().unwrap_or(GnssState::IdleOff)
        } else {
            self.state
        };
        self.state = GnssState::AgnssProc;
        debug!("gnss state machine: entering AgnssProc from {:?}", prior);
        match self.injector.start(queue, prior, now) {
            AgnssStep::Send => Action::PowerOn,
            AgnssStep::Complete | AgnssStep::Aborted => self.return_from_agnss(now),
        }
    }

    /// A binary ACK frame arrived off the GNSS UART. Only meaningful while
    /// `AgnssProc` is hosting an active injection; an ACK observed in any
    /// other state (e.g. in response to a `$PCAS`-style config/restart
    /// command) is not this substate's concern and is ignored.
    pub fn on_agnss_ack(&mut self, now: Instant) -> Action {
        if self.state != GnssState::AgnssProc {
            return Action::None;
        }
        let step = self.injector.on_ack(now);
        self.dispatch_agnss_step(step, now)
    }

    /// A binary NACK frame arrived, or the injector's per-message timer
    /// elapsed. Ignored outside `AgnssProc` for the same reason as
    /// [`Self::on_agnss_ack`].
    pub fn on_agnss_nack_or_timeout(&mut self, now: Instant) -> Action {
        if self.state != GnssState::AgnssProc {
            return Action::None;
        }
        self.dispatch_agnss_step(self.injector.on_nack_or_message_timeout(now), now)
    }

    fn dispatch_agnss_step(&mut self, step: AgnssStep, now: Instant) -> Action {
        match step {
            AgnssStep::Send => Action::SendAgnssFrame,
            AgnssStep::Complete | AgnssStep::Aborted => self.return_from_agnss(now),
        }
    }

    fn return_from_agnss(&mut self, now: Instant) -> Action {
        let prior = self.injector.take_prior_state().unwrap_or(GnssState::IdleOff);
        self.enter(prior, GnssState::AgnssProc, now)
    }

    /// Timer-driven housekeeping; must be called on every scheduling turn
    /// (or at least whenever an armed deadline might have elapsed).
    pub fn on_tick(&mut self, now: Instant) -> Action {
        if self.state == GnssState::AgnssProc {
            if let Some(step) = self.injector.poll(now) {
                return self.dispatch_agnss_step(step, now);
            }
            return Action::None;
        }

        if let Some(deadline) = self.keep_alive_deadline {
            if now >= deadline {
                self.keep_alive_deadline = None;
            }
        }

        match self.state {
            GnssState::Searching => {
                let Some(deadline) = self.fix_attempt_deadline else { return Action::None };
                if now < deadline {
                    return Action::None;
                }
                self.consecutive_failures += 1;
                let restart = self.consecutive_failures >= self.config.max_consecutive_fix_failures;
                if restart {
                    self.consecutive_failures = 0;
                }
                if self.keep_alive_deadline.is_some() {
                    // Keep-alive holds the GNSS searching instead of powering
                    // off; the failure still counts toward a restart.
                    self.fix_attempt_deadline = Some(now + self.config.t_cold);
                    return if restart && cfg!(feature = "gnss-restart-on-failure") {
                        Action::RequestGnssRestart
                    } else {
                        Action::None
                    };
                }
                let action = self.enter(GnssState::IdleOff, GnssState::Searching, now);
                if restart && cfg!(feature = "gnss-restart-on-failure") {
                    Action::RequestGnssRestartThenPowerOff
                } else {
                    action
                }
            }
            GnssState::Tracking => {
                if let Some(deadline) = self.still_confirm_deadline {
                    if now >= deadline {
                        return self.enter(GnssState::AnalyzingStill, GnssState::Tracking, now);
                    }
                }
                let Some(deadline) = self.active_sample_deadline else { return Action::None };
                if now < deadline {
                    return Action::None;
                }
                self.active_sample_deadline = Some(now + self.config.t_active);
                match self.latest_fix {
                    Some(fix) => Action::EmitTrackPoint(fix_to_point(&fix)),
                    None => Action::None,
                }
            }
            GnssState::AnalyzingStill => {
                let Some(deadline) = self.s4_query_deadline else { return Action::None };
                if now >= deadline {
                    self.enter(GnssState::IdleOff, GnssState::AnalyzingStill, now)
                } else {
                    Action::None
                }
            }
            GnssState::IdleOff => {
                let Some(deadline) = self.idle_wake_deadline else { return Action::None };
                if now >= deadline {
                    self.enter(GnssState::Searching, GnssState::IdleOff, now)
                } else {
                    Action::None
                }
            }
            GnssState::Init | GnssState::AgnssProc => Action::None,
        }
    }
}

fn fix_to_point(fix: &GnssFix) -> TrackPoint {
    TrackPoint::new(
        fix.timestamp_unix,
        (fix.latitude * crate::track::V2_UNITS_PER_DEGREE) as i32,
        (fix.longitude * crate::track::V2_UNITS_PER_DEGREE) as i32,
        (fix.altitude_m * 10.0) as i32,
    )
}
