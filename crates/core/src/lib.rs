//! Core types and algorithms for sessionizing events and merging user properties.

pub mod attribution;
pub mod boundary;
pub mod channel;
pub mod codec;
pub mod error;
pub mod events;
pub mod merge;
pub mod properties;
pub mod session;
pub mod store;

pub use attribution::AttributionConfig;
pub use boundary::{BoundaryDetector, CandidateGroup, CloseReason, Detection, ScanEvent};
pub use channel::{ChannelClassifier, ChannelRule, RuleChannelClassifier};
pub use codec::{JsonCodec, PropertyCodec};
pub use error::{Error, Result, RunStatus};
pub use events::*;
pub use merge::{MergeCandidate, MergeConfig, MergeOutcome};
pub use properties::PropertiesMap;
pub use session::{SessionAggregate, SessionConfig};
pub use store::{EventStore, ProjectStore, UserEvents, UserStore};
