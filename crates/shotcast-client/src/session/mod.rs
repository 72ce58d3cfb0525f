pub mod coordinator;
pub mod state;

pub use coordinator::BroadcastSession;
pub use state::SessionState;
