//! HTTP clients for the engine's external collaborators.
//!
//! Two boundaries live here: the compute parties (MPC engines and the FHE
//! server) and the bulk time-series dataset service. Both are consumed
//! through traits so the engine can be exercised against scripted fakes.

mod dataset;
mod party;

pub use dataset::{
    DataRange, DatasetService, EventItem, EventsPage, EventsQuery, HttpDatasetService,
    IngestEvent,
};
pub use party::{
    AnalyseRequest, BatchAnalyseRequest, ComputeClient, HttpComputeClient,
};
