//! Client engine for a remote stateful agent service.
//!
//! The engine keeps a local, renderable view of each agent's
//! conversation in sync with the service's canonical history, and turns
//! the service's live token stream into coherent turn updates. The two
//! halves are [`HistoryStore`] (paging, incremental sync, cache
//! persistence) and [`StreamAssembler`] (chunk-to-turn state machine);
//! [`Session`] ties them together behind a [`SessionObserver`].
//!
//! Networking goes through the [`Transport`] trait so hosts and tests
//! can substitute scripted backends for the HTTP implementation.

mod assembler;
mod cache_state;
pub mod config;
mod error;
mod flags;
mod history;
mod normalize;
mod retry;
mod session;
mod transport;
mod util;

pub use assembler::StreamAssembler;
pub use cache_state::CACHE_STATE_FILENAME;
pub use config::Config;
pub use error::Result;
pub use error::SkeinErr;
pub use history::AgentCache;
pub use history::HistoryStore;
pub use normalize::normalize_chunk;
pub use normalize::normalize_message;
pub use retry::open_resilient_stream;
pub use session::Session;
pub use session::SessionObserver;
pub use session::TurnToken;
pub use transport::ChunkStream;
pub use transport::HttpTransport;
pub use transport::PageRequest;
pub use transport::Transport;
