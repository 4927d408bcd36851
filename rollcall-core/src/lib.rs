//! Rollcall attendance link: admission control, framing and session engine.
//! Host-driven: no I/O; host passes link events and receives actions.

pub mod admission;
pub mod attendee;
pub mod codec;
pub mod config;
pub mod ffi;
pub mod protocol;
pub mod quality;
pub mod retry;
pub mod sequencer;
pub mod session;

pub use admission::{AdmissionQueue, PeerState, QueueStatus, QueuedPeer};
pub use attendee::{AttendeeAction, AttendeeError, AttendeePhase, AttendeeSession};
pub use codec::{decode, decode_frame, encode, encode_frame, FrameDecodeError};
pub use config::EngineConfig;
pub use protocol::{Message, MessageType, QueueNotice, StudentRecord, ValidationError};
pub use session::{AttendanceEngine, DeliveryFailure, LinkPhase, OutboundAction};
