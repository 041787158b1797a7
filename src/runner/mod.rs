pub mod controller;
pub mod finder;
pub mod metadata;
pub mod observer;
pub mod orchestrator;

pub use controller::FlowController;
pub use finder::FindResult;
pub use metadata::{CommandMetadata, Insight, InsightLevel, MetadataStore};
pub use observer::{ErrorResolution, FlowObserver, NoopObserver};
pub use orchestrator::{
    Orchestrator, LOOKUP_TIMEOUT_MS, OPTIONAL_LOOKUP_TIMEOUT_MS, SCROLL_TIMEOUT_MS,
};
