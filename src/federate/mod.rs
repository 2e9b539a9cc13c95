//! Federate-side managers and filter wrappers

mod filters;
mod manager;

pub use filters::{delay_operator, drop_operator, DestinationFilter, SourceFilter};
pub use manager::{EndpointCallback, FederateManager};
