//! Wire protocol spoken between a shotcast broadcaster and the relay hub
//!
//! Frames are JSON objects tagged by `type`. Requests carry a numeric id and
//! are answered by exactly one response with the same id; pushed events may
//! carry an ack id the broadcaster must answer once the command completes.

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
