pub mod buffer;
pub mod cache;
pub mod config;
pub mod errors;
pub mod http;
pub mod metrics_defs;
pub mod model;
pub mod processor;
pub mod query;
pub mod retry_budget;
pub mod routing;
pub mod service;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutils;

use std::sync::Arc;

use crate::cache::Cache;
use crate::errors::FederatorError;
use crate::processor::RequestProcessor;
use crate::retry_budget::RetryBudget;
use crate::service::FederatorService;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const USER_AGENT: &str = concat!("fedgate/", env!("CARGO_PKG_VERSION"));

/// Build the shared collaborators from the configuration and serve the
/// federation endpoint until the listener fails.
pub async fn run(config: config::Config) -> Result<(), FederatorError> {
    let cache = Arc::new(Cache::from_config(&config.cache));
    let retry_budget = Arc::new(RetryBudget::new(config.retry_budget.clone()));
    let client_max_size = config.federation.client_max_size;
    let listener = config.listener.clone();

    let processor = RequestProcessor::new(config, cache, retry_budget)?;
    let service = FederatorService::new(processor, client_max_size);

    shared::http::run_http_service(&listener.host, listener.port, service).await
}
