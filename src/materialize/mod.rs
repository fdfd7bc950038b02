// ABOUTME: Backend-neutral materialization core - engine, collaborator traits, data model
// ABOUTME: Backends in crate::postgres and crate::sqlite implement the traits defined here

pub mod engine;
pub mod error;
pub mod observer;
pub mod source;
pub mod state;
pub mod target;
pub mod types;

pub use engine::{
    default_version_key, EngineOptions, MissingSlicePolicy, ProbeFailurePolicy, SyncEngine,
    SyncPhase, SyncReport, WatermarkProbe,
};
pub use error::SyncError;
pub use observer::{SliceFetched, SliceObserver, TracingObserver};
pub use source::{ChangeFeedSource, KeyColumnResolver, ViewSliceFetcher};
pub use state::{JsonFileVersionStore, MemoryVersionStore, VersionStore};
pub use target::TargetMerger;
pub use types::{
    ChangeKey, ChangeSet, KeyColumnSet, MergeOutcome, TableName, ViewSlice, Watermark,
};
