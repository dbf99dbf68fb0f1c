//! Provider construction and the metrics-tracking facade.

pub mod facade;
pub mod factory;

pub use facade::{Gateway, ProviderClient, ProviderMetrics, ProviderMetricsSnapshot};
pub use factory::{ProviderConstructor, ProviderFactory};
