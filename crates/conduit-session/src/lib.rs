//! Streaming session primitives for conduit.
//!
//! Provides the bounded channel that carries stream messages with
//! backpressure, the stream session that couples two channels into a
//! bidirectional stream and tracks its lifecycle, and the process-wide
//! session registry.
//!
//! # Modules
//!
//! - [`channel`]: `bounded()` fixed-capacity FIFO with blocking send.
//! - [`session`]: `Session`, `SessionHandle` and the typed channel ends.
//! - [`registry`]: `SessionRegistry` (lookup, teardown, accounting).

pub mod channel;
pub mod registry;
pub mod session;

// Re-exports for consumers.
pub use channel::Direction;
pub use registry::{RegistryStats, SessionRegistry};
pub use session::{
    InboundReader, InboundWriter, OutboundReader, OutboundWriter, Session, SessionHandle,
    SessionParts,
};
