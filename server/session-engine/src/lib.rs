//! Behavioral Session Engine: streaming sessionization and friction incident detection.
//!
//! Folds a stream of user-interaction events into per-session state, closes
//! sessions on inactivity with derived frustration/efficiency scores, and
//! independently detects rage clicks, backtracks and abandoned tasks.
//!
//! State is in-memory only and sharded by (org_id, product_id, session_id).

pub mod bus;
pub mod config;
pub mod detector;
pub mod error;
pub mod normalize;
pub mod runtime;
pub mod score;
pub mod sessionizer;
pub mod shard;
pub mod store;
pub mod types;

pub use bus::{ChannelPublisher, Envelope, Publisher};
pub use config::Config;
pub use detector::IncidentDetector;
pub use error::{BusError, EngineError};
pub use runtime::Runtime;
pub use sessionizer::Sessionizer;
pub use types::{Event, InboundEvent, Incident, SessionKey, SessionMetrics};
