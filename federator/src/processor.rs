//! End-to-end request processing.
//!
//! The processor owns one federation request's lifecycle: cache lookup,
//! route resolution, fan-out of route workers under concurrency gates,
//! deadline-bounded collection, ordered buffer finalization, and the
//! cache store. It is the only component allowed to abort a request;
//! everything endpoint-level is absorbed as partial failure.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use hyper::body::Bytes;
use shared::{counter, histogram};
use time::OffsetDateTime;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::sleep;
use uuid::Uuid;

use crate::buffer::{BufferBody, FinalizedBuffer, SpooledBuffer};
use crate::cache::Cache;
use crate::config::Config;
use crate::errors::{FederatorError, Result};
use crate::http::{EndpointClient, build_endpoint_client};
use crate::metrics_defs::{CACHE_HIT, CACHE_MISS, ROUTES_RESOLVED};
use crate::query::Query;
use crate::retry_budget::RetryBudget;
use crate::routing::RoutingClient;
use crate::worker::{RouteResult, WorkerContext, run_route};

/// Per-inbound-request state, owned by the processing call and never
/// shared across requests.
pub struct RequestContext {
    pub id: Uuid,
    /// Arrival time; doubles as the default endtime for open epochs.
    pub submitted: OffsetDateTime,
    pub query: Query,
}

impl RequestContext {
    pub fn new(query: Query) -> Self {
        Self {
            id: Uuid::new_v4(),
            submitted: OffsetDateTime::now_utc(),
            query,
        }
    }
}

/// Outcome of a federation call
#[derive(Debug)]
pub enum FederatedResponse {
    Data {
        content_type: &'static str,
        body: ResponseBody,
    },
    /// Nothing matched anywhere; the service maps this to the client's
    /// `nodata` status.
    NoData,
}

#[derive(Debug)]
pub enum ResponseBody {
    Memory(Bytes),
    Streamed { len: u64, body: BufferBody },
}

pub struct RequestProcessor {
    config: Config,
    cache: Arc<Cache>,
    retry_budget: Arc<RetryBudget>,
    routing: RoutingClient,
    client: EndpointClient,
    global_gate: Arc<Semaphore>,
    host_gates: Mutex<HashMap<String, Arc<Semaphore>>>,
}

impl RequestProcessor {
    pub fn new(
        config: Config,
        cache: Arc<Cache>,
        retry_budget: Arc<RetryBudget>,
    ) -> Result<Self> {
        let routing = RoutingClient::new(&config.routing)?;
        let global_gate = Arc::new(Semaphore::new(config.endpoint.connection_limit));

        Ok(Self {
            routing,
            global_gate,
            client: build_endpoint_client(),
            cache,
            retry_budget,
            host_gates: Mutex::new(HashMap::new()),
            config,
        })
    }

    /// Drive one query to a merged response.
    pub async fn federate(&self, ctx: &RequestContext) -> Result<FederatedResponse> {
        let content_type = ctx.query.params.format.content_type();
        let fingerprint = ctx.query.fingerprint();

        if self.cache.is_enabled() {
            if let Some(cached) = self.cache.get(&fingerprint) {
                counter!(CACHE_HIT).increment(1);
                tracing::debug!(request_id = %ctx.id, "serving cached response");
                return Ok(FederatedResponse::Data {
                    content_type,
                    body: ResponseBody::Memory(cached),
                });
            }
            counter!(CACHE_MISS).increment(1);
        }

        self.validate_durations(ctx)?;

        let routes = self
            .routing
            .resolve(&ctx.query.stream_epochs, ctx.submitted)
            .await?;
        histogram!(ROUTES_RESOLVED).record(routes.len() as f64);
        if routes.is_empty() {
            return Ok(FederatedResponse::NoData);
        }
        tracing::debug!(request_id = %ctx.id, routes = routes.len(), "routes resolved");

        let worker_ctx = Arc::new(WorkerContext {
            client: self.client.clone(),
            retry_budget: self.retry_budget.clone(),
            method: self.config.endpoint.request_method,
            format: ctx.query.params.format,
            default_end: ctx.submitted,
            connect_timeout: Duration::from_secs(self.config.endpoint.timeout_connect_secs),
            read_timeout: Duration::from_secs(self.config.endpoint.timeout_read_secs),
            splitting_factor: self.config.federation.splitting_factor,
            min_epoch_duration: time::Duration::seconds(
                self.config.federation.min_epoch_duration_secs as i64,
            ),
            request_id: ctx.id,
        });

        // One task per route; dropping the set (client disconnect)
        // aborts every outstanding worker.
        let mut join_set = JoinSet::new();
        for (index, route) in routes.into_iter().enumerate() {
            let buffer = SpooledBuffer::new(self.config.federation.buffer_rollover_size);
            let worker_ctx = worker_ctx.clone();
            let global_gate = self.global_gate.clone();
            let host_gate = self.host_gate(&route.url);

            join_set.spawn(async move {
                // Both permits are held for the route's whole lifetime,
                // split descendants included.
                let _global = global_gate.acquire_owned().await.ok();
                let _host = host_gate.acquire_owned().await.ok();
                run_route(worker_ctx, index, route, buffer).await
            });
        }

        let (results, complete) = self.collect_route_results(ctx, &mut join_set).await;

        let mut slots = Vec::with_capacity(results.len());
        let mut failures = 0;
        for result in results {
            failures += result.failures;
            slots.push(result.buffer.into_content().await?);
        }
        let buffer = FinalizedBuffer::new(slots);

        if buffer.is_empty() {
            return Ok(FederatedResponse::NoData);
        }

        // Only a fully successful result may be cached; a degraded or
        // deadline-cut response must not shadow the complete one.
        if self.cache.is_enabled() && complete && failures == 0 {
            let bytes = buffer.into_bytes().await?;
            self.cache.set(
                &fingerprint,
                &bytes,
                Duration::from_secs(self.config.cache.ttl_secs),
            );
            return Ok(FederatedResponse::Data {
                content_type,
                body: ResponseBody::Memory(bytes),
            });
        }

        Ok(FederatedResponse::Data {
            content_type,
            body: ResponseBody::Streamed {
                len: buffer.total_len(),
                body: buffer.into_body(),
            },
        })
    }

    /// Await route workers until they finish or the streaming deadline
    /// expires, in which case the stragglers are aborted. Returns the
    /// results sorted into routing-table order and whether every worker
    /// ran to completion.
    async fn collect_route_results(
        &self,
        ctx: &RequestContext,
        join_set: &mut JoinSet<RouteResult>,
    ) -> (Vec<RouteResult>, bool) {
        let deadline = sleep(Duration::from_secs(
            self.config.federation.streaming_timeout_secs,
        ));
        tokio::pin!(deadline);

        let mut results = Vec::new();
        let mut complete = true;

        loop {
            tokio::select! {
                _ = &mut deadline => {
                    tracing::warn!(
                        request_id = %ctx.id,
                        outstanding = join_set.len(),
                        "streaming deadline expired, aborting remaining workers"
                    );
                    join_set.abort_all();
                    complete = false;
                    break;
                }
                joined = join_set.join_next() => {
                    match joined {
                        None => break,
                        Some(Ok(result)) => results.push(result),
                        Some(Err(err)) => {
                            if !err.is_cancelled() {
                                tracing::error!(request_id = %ctx.id, "route task panicked: {err}");
                            }
                            complete = false;
                        }
                    }
                }
            }
        }

        // Drain whatever the abort left behind.
        while let Some(joined) = join_set.join_next().await {
            if let Ok(result) = joined {
                results.push(result);
            }
        }

        results.sort_by_key(|result| result.index);
        (results, complete)
    }

    fn validate_durations(&self, ctx: &RequestContext) -> Result<()> {
        let per_epoch_limit = self
            .config
            .federation
            .max_stream_epoch_duration_days
            .map(time::Duration::days);
        let total_limit = self
            .config
            .federation
            .max_total_stream_epoch_duration_days
            .map(time::Duration::days);

        let mut total = time::Duration::ZERO;
        for epoch in &ctx.query.stream_epochs {
            let duration = epoch.duration(ctx.submitted);
            if let Some(limit) = per_epoch_limit
                && duration > limit
            {
                return Err(FederatorError::DurationCeiling);
            }
            total = total.saturating_add(duration);
        }

        if let Some(limit) = total_limit
            && total > limit
        {
            return Err(FederatorError::DurationCeiling);
        }

        Ok(())
    }

    fn host_gate(&self, url: &url::Url) -> Arc<Semaphore> {
        let key = url.authority().to_string();
        let mut gates = self
            .host_gates
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        gates
            .entry(key)
            .or_insert_with(|| {
                Arc::new(Semaphore::new(self.config.endpoint.connection_limit_per_host))
            })
            .clone()
    }
}
