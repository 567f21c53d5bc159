//! Frame codec and message model
//!
//! - [`envelope`]: the inbound [`ResponseEnvelope`] and its classification helpers
//! - [`request`]: the outbound [`RequestEnvelope`] builders
//! - [`parser`]: raw text frame decoding

pub mod envelope;
pub mod parser;
pub mod request;

pub use envelope::{ResponseEnvelope, Signal, extract_text};
pub use parser::parse_frame;
pub use request::{FlowRequest, HEARTBEAT_FRAME, RequestEnvelope};
