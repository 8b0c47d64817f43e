//! Presence DLP - Vision
//!
//! Camera frames, physical spoof heuristics, identity matching and the
//! liveness decision built on top of them.

pub mod frame;
pub mod heuristics;
pub mod identity;
pub mod liveness;

pub use frame::{DirectoryFrameSource, FaceEngine, FrameSource, NullFaceEngine};
pub use heuristics::{assess_crop, LivenessThresholds};
pub use identity::{BoundingBox, FeatureVector, KnownTemplates};
pub use liveness::{LivenessAnalyzer, LivenessSettings, LivenessVerdict, PresenceVerifier};
