//! Wire protocol for the Repeater agent.
//!
//! Message envelopes ([`Event`], [`Command`]), the JSON codec with its
//! field-naming and enum-tag conventions, the multi-valued [`Headers`] map,
//! and the concrete messages exchanged between a Repeater and the backend.

pub mod codec;
pub mod constants;
pub mod envelope;
pub mod headers;
pub mod messages;
pub mod version;

// Re-export primary types for convenience.
pub use codec::{CodecError, HttpMethod};
pub use envelope::{Command, CommandPayload, Event, MessageMeta, Payload};
pub use headers::Headers;
pub use messages::{
    ErrorCode, Protocol, RegisterRepeaterCommand, RegisterRepeaterPayload, RegisterRepeaterResult,
    RepeaterRegisteringError, RepeaterStatus, RepeaterStatusEvent, RequestExecutingEvent,
    RequestExecutingResult,
};
