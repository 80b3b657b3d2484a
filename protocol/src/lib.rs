//! Shared data model for the skein conversation engine.
//!
//! Everything downstream of the normalizer operates only on the closed,
//! tagged types defined here — raw wire shapes never leave the boundary.

pub mod agent_id;
pub mod message;
pub mod stream;
pub mod turn;

pub use agent_id::AgentId;
pub use message::CanonicalMessage;
pub use message::MessagePayload;
pub use message::UsageStats;
pub use stream::StreamChunk;
pub use stream::StreamPhase;
pub use turn::TurnUpdate;
