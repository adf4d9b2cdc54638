//! Core firmware logic for a battery-powered GNSS tracker.
//!
//! This crate implements the tightly coupled subsystem at the heart of the
//! tracker: the GNSS power-and-fix [`state_machine`], its reentrant
//! [`agnss`] injection substate, the [`host`] request/response protocol
//! engine, and the delta-compressed [`track`] codec, plus the supporting
//! [`motion`] analyzer, [`framing`] codec, [`telemetry`] snapshot, and
//! [`logger`]. Peripheral access (UART, SD/FAT32) is expressed as trait
//! seams ([`uart`], [`host::fs`]) so this crate stays `no_std` and
//! hardware-agnostic; an [`orchestrator`] wires the pieces together for a
//! concrete board.
//!
//! Out of scope, named only as external collaborators: OLED rendering,
//! button debounce, battery sampling, BLE pairing, the SD block driver, the
//! GNSS NMEA text parser, and the RTC.
#![cfg_attr(not(test), no_std)]

mod fmt;

pub mod agnss;
pub mod framing;
pub mod host;
pub mod logger;
pub mod motion;
pub mod orchestrator;
pub mod state_machine;
pub mod telemetry;
pub mod track;
pub mod uart;

pub use agnss::{AgnssConfig, AgnssError, AgnssInjector, AgnssStep};
pub use framing::{Frame, FrameParser, FramingConfig, FramingError};
pub use host::{HostAction, HostEngine, HostEngineConfig, RequestParser};
pub use logger::{LoggerConfig, LoggerError, TrackLogger};
pub use motion::{MotionAnalyzer, MotionConfig};
pub use orchestrator::Orchestrator;
pub use state_machine::{Action, GnssFix, GnssState, GnssStateMachine, StateMachineConfig};
pub use telemetry::Telemetry;
pub use track::{TrackDecoder, TrackEncoder, TrackError, TrackPoint, TrackVersion};
