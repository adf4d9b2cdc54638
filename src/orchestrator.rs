//! # Orchestrator
//!
//! Wires the subsystems of spec.md 4.8 together: owns the telemetry
//! snapshot, routes GNSS UART bytes through the framing codec into the
//! state machine, routes accelerometer samples through the motion analyzer,
//! serves host requests against the protocol engine, and relays A-GNSS
//! end-of-write into the state machine. Exposes plain `async fn`s rather
//! than executor-tagged tasks (spec.md 5/9): a concrete board wires each one
//! into whatever scheduler it uses.

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::Mutex;
use embassy_time::Instant;
use heapless::Vec;

use crate::agnss::AgnssConfig;
use crate::fmt::debug;
use crate::framing::{Frame, FeedOutcome, FrameParser, FramingConfig};
use crate::host::fs::FileSystem;
use crate::host::{HostAction, HostEngine, HostEngineConfig, Request, RequestParser};
use crate::logger::{Date, LoggerConfig, LoggerError, TrackLogger};
use crate::motion::{MotionAnalyzer, MotionConfig};
use crate::state_machine::{Action, GnssFix, GnssState, GnssStateMachine, StateMachineConfig};
use crate::telemetry::Telemetry;
use crate::track::TrackVersion;
use crate::uart::{UartRx, UartTx};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum OrchestratorError {
    GnssUart,
    HostUart,
    Logger(LoggerError),
}

/// What the byte just fed to the GNSS UART turned into.
pub enum GnssByteOutcome<const FRAME_N: usize> {
    /// Consumed, no complete unit yet.
    Pending,
    /// Forward to the external NMEA text parser (spec.md 1).
    Nmea(u8),
    /// A complete binary frame; feed it to [`Orchestrator::on_gnss_frame`].
    Frame(Frame<FRAME_N>),
}

/// Ties every subsystem together. Type parameters name the board-specific
/// pieces this crate stays generic over: `GU`/`HU` are the GNSS and host
/// UARTs, `LFS`/`HFS` are the Track Logger's and Host Protocol Engine's SD
/// handles (spec.md 5: the card is shared, but how that sharing is
/// serialized is a board concern outside this crate's scope). `FRAME_N`
/// bounds one GNSS binary frame's payload, `AGNSS_N`/`AGNSS_M` the A-GNSS
/// frame size and queue length, `MOTION_N` the motion analyzer's window.
pub struct Orchestrator<
    GU,
    HU,
    LFS,
    HFS,
    const FRAME_N: usize,
    const AGNSS_N: usize,
    const AGNSS_M: usize,
    const MOTION_N: usize,
> where
    GU: UartTx + UartRx,
    HU: UartTx + UartRx,
    LFS: FileSystem,
    HFS: FileSystem,
{
    telemetry: Mutex<CriticalSectionRawMutex, Telemetry>,
    state_machine: GnssStateMachine<AGNSS_N, AGNSS_M>,
    motion: MotionAnalyzer<MOTION_N>,
    gnss_uart: GU,
    gnss_framing: FrameParser<FRAME_N>,
    host_uart: HU,
    host_parser: RequestParser,
    host_engine: HostEngine<HFS, AGNSS_N, AGNSS_M>,
    logger: TrackLogger<LFS>,
}

impl<GU, HU, LFS, HFS, const FRAME_N: usize, const AGNSS_N: usize, const AGNSS_M: usize, const MOTION_N: usize>
    Orchestrator<GU, HU, LFS, HFS, FRAME_N, AGNSS_N, AGNSS_M, MOTION_N>
where
    GU: UartTx + UartRx,
    HU: UartTx + UartRx,
    LFS: FileSystem,
    HFS: FileSystem,
{
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        gnss_uart: GU,
        host_uart: HU,
        logger_fs: LFS,
        host_fs: HFS,
        sm_config: StateMachineConfig,
        agnss_config: AgnssConfig,
        framing_config: FramingConfig,
        logger_config: LoggerConfig,
        track_version: TrackVersion,
        host_config: HostEngineConfig,
        motion_config: MotionConfig,
        now: Instant,
    ) -> Self {
        Self {
            telemetry: Mutex::new(Telemetry::default()),
            state_machine: GnssStateMachine::new(sm_config, agnss_config),
            motion: MotionAnalyzer::new(motion_config),
            gnss_uart,
            gnss_framing: FrameParser::new(framing_config, now),
            host_uart,
            host_parser: RequestParser::new(),
            host_engine: HostEngine::new(host_fs, host_config),
            logger: TrackLogger::new(logger_fs, logger_config, track_version),
        }
    }

    /// A consistent copy of the current telemetry snapshot (spec.md 3:
    /// single writer, many readers).
    pub async fn telemetry_snapshot(&self) -> Telemetry {
        *self.telemetry.lock().await
    }

    async fn apply_action(&mut self, action: Action, date: Date, now: Instant) -> Result<Action, OrchestratorError> {
        match action {
            Action::EmitTrackPoint(point) => {
                self.logger.record(point, date, now).await.map_err(OrchestratorError::Logger)?;
                Ok(Action::None)
            }
            Action::SendAgnssFrame => {
                if let Some(frame) = self.state_machine.agnss_current_frame() {
                    self.gnss_uart.write(frame).await.map_err(|_| OrchestratorError::GnssUart)?;
                }
                Ok(Action::None)
            }
            // PowerOn/PowerOff/RequestGnssRestart/RequestGnssRestartThenPowerOff/None
            // are board-specific (GPIO toggling, vendor restart command) and
            // are returned for the caller to act on; the "ThenPowerOff"
            // variant tells the caller to do both in sequence.
            other => Ok(other),
        }
    }

    async fn update_telemetry_from_fix(&self, fix: &GnssFix, date: Date) {
        let mut t = self.telemetry.lock().await;
        t.latitude = fix.latitude;
        t.longitude = fix.longitude;
        t.altitude_m = fix.altitude_m;
        t.satellites = fix.satellites;
        t.hdop = fix.hdop;
        t.speed_kmh = fix.speed_kmh;
        t.course_deg = fix.course_deg;
        t.year = date.year;
        t.month = date.month;
        t.day = date.day;
        t.location_valid = fix.location_valid;
        t.date_time_valid = fix.date_valid && fix.time_valid;
    }

    /// Battery and environment fields, updated on their own cadence
    /// (spec.md 4.8) rather than alongside GNSS fixes.
    pub async fn update_environment(
        &self,
        battery_voltage: f32,
        battery_percent: u8,
        temperature_c: f32,
        pressure_pa: f32,
    ) {
        let mut t = self.telemetry.lock().await;
        t.battery_voltage = battery_voltage;
        t.battery_percent = battery_percent;
        t.temperature_c = temperature_c;
        t.pressure_pa = pressure_pa;
    }

    /// A fresh self-consistent GNSS fix line (spec.md 4.8): update the
    /// snapshot, then feed the state machine.
    pub async fn on_gnss_fix(&mut self, fix: GnssFix, date: Date, now: Instant) -> Result<Action, OrchestratorError> {
        self.update_telemetry_from_fix(&fix, date).await;
        let action = self.state_machine.on_fix(fix, now);
        self.apply_action(action, date, now).await
    }

    /// Feed one accelerometer-magnitude sample; routes `isStill`/`hasJump`
    /// into the state machine. Synchronous: neither predicate can emit a
    /// track point (only `on_fix`/`on_tick` can).
    pub fn on_accel_sample(&mut self, magnitude_g: f32, now: Instant) -> Action {
        self.motion.push(magnitude_g);
        if self.motion.has_jump() {
            self.state_machine.on_motion(now)
        } else if self.motion.is_still() {
            self.state_machine.on_still(now)
        } else {
            Action::None
        }
    }

    /// Feed one byte received on the GNSS UART.
    pub fn feed_gnss_byte(&mut self, byte: u8, now: Instant) -> GnssByteOutcome<FRAME_N> {
        match self.gnss_framing.feed(byte, now) {
            FeedOutcome::Pending => GnssByteOutcome::Pending,
            FeedOutcome::Nmea(b) => GnssByteOutcome::Nmea(b),
            FeedOutcome::Frame(f) => GnssByteOutcome::Frame(f),
        }
    }

    /// A complete binary frame parsed off the GNSS UART: only ACK/NACK
    /// frames concern the A-GNSS injector, everything else is logged and
    /// otherwise ignored by this core (spec.md 3's other recognized kinds
    /// are acted on by the vendor driver, not this crate).
    pub async fn on_gnss_frame(
        &mut self,
        frame: &Frame<FRAME_N>,
        date: Date,
        now: Instant,
    ) -> Result<Action, OrchestratorError> {
        let action = if frame.is_ack() {
            self.state_machine.on_agnss_ack(now)
        } else if frame.is_nack() {
            self.state_machine.on_agnss_nack_or_timeout(now)
        } else {
            debug!("orchestrator: ignoring unrecognized GNSS binary frame");
            Action::None
        };
        self.apply_action(action, date, now).await
    }

    /// Feed one byte received on the host transport.
    pub fn feed_host_byte(&mut self, byte: u8) -> Option<Request> {
        self.host_parser.feed(byte)
    }

    /// Dispatch a reassembled host request: write the response to the host
    /// UART, relay any GNSS-bound action into the state machine, and return
    /// whatever board-level action results.
    pub async fn handle_host_request(
        &mut self,
        request: &Request,
        date: Date,
        now: Instant,
    ) -> Result<Action, OrchestratorError> {
        let telemetry = self.telemetry_snapshot().await;
        let (response, action) = self.host_engine.handle(request, &telemetry).await;
        self.host_uart.write(&response).await.map_err(|_| OrchestratorError::HostUart)?;

        let sm_action = match action {
            HostAction::None => Action::None,
            HostAction::GpsWakeup => self.state_machine.on_host_wake(now),
            HostAction::GpsKeepAlive(minutes) => self.state_machine.on_keep_alive(minutes, now),
            HostAction::EndAgnss(queue) => self.forward_agnss_queue(queue, now),
        };
        self.apply_action(sm_action, date, now).await
    }

    fn forward_agnss_queue(&mut self, queue: Vec<Vec<u8, AGNSS_N>, AGNSS_M>, now: Instant) -> Action {
        self.state_machine.on_agnss_end(queue, now)
    }

    /// Timer-driven housekeeping; must run on every scheduling turn (spec.md
    /// 4.6/5). Also refreshes the power-state-derived telemetry fields.
    pub async fn tick(&mut self, date: Date, now: Instant) -> Result<Action, OrchestratorError> {
        let action = self.state_machine.on_tick(now);
        {
            let mut t = self.telemetry.lock().await;
            t.gps_state = self.state_machine.state() as u8;
            t.keep_alive_remaining_s = self.state_machine.keep_alive_remaining(now).as_secs() as u16;
            t.is_stationary = self.state_machine.state() == GnssState::AnalyzingStill;
        }
        self.apply_action(action, date, now).await
    }
}
