//! Inbound WhatsApp webhook: handshake, signature check, envelope parsing,
//! duplicate suppression and handoff to the dispatcher queue.

pub mod dedup;
pub mod envelope;
pub mod routes;
pub mod signature;

pub use dedup::MessageDeduper;
pub use envelope::{Envelope, InboundMessage, sanitize_phone_number};
pub use routes::{router, verify};
pub use signature::{SIGNATURE_HEADER, sign, verify_signature};
