//! Per-route worker tasks.
//!
//! One worker drives all sub-requests of one route: admission against
//! the retry budget, one HTTP request per stream epoch, chunkwise
//! streaming into the route's buffer slot, and adaptive re-splitting on
//! payload-too-large rejections. Epochs and split descendants run
//! sequentially within the worker, so a slot's bytes are always in time
//! order; concurrency happens across routes, never inside one.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use http_body_util::BodyExt;
use shared::counter;
use time::OffsetDateTime;
use tokio::time::timeout;
use url::Url;
use uuid::Uuid;

use crate::buffer::SpooledBuffer;
use crate::config::RequestMethod;
use crate::http::{EndpointClient, EndpointStatus, classify_status, fetch};
use crate::metrics_defs::{ENDPOINT_ERRORS, ENDPOINT_SUPPRESSED, EPOCH_SPLITS};
use crate::model::{Route, StreamEpoch};
use crate::query::OutputFormat;
use crate::retry_budget::{Outcome, RetryBudget};

/// Collaborators and per-request settings shared by all route workers
/// of one federation request.
pub struct WorkerContext {
    pub client: EndpointClient,
    pub retry_budget: Arc<RetryBudget>,
    pub method: RequestMethod,
    pub format: OutputFormat,
    /// Concrete endtime substituted for open epochs
    pub default_end: OffsetDateTime,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
    pub splitting_factor: usize,
    pub min_epoch_duration: time::Duration,
    pub request_id: Uuid,
}

/// What one route contributed to the response
pub struct RouteResult {
    /// Buffer slot position, equal to the route's routing-table index
    pub index: usize,
    pub buffer: SpooledBuffer,
    pub bytes: u64,
    /// Sub-epochs that failed permanently
    pub failures: usize,
    /// The endpoint was dropped by the retry budget before any request
    pub suppressed: bool,
}

struct EpochReport {
    bytes: u64,
    failures: usize,
}

/// Process one route to completion, streaming its payload into `buffer`.
pub async fn run_route(
    ctx: Arc<WorkerContext>,
    index: usize,
    route: Route,
    mut buffer: SpooledBuffer,
) -> RouteResult {
    if !ctx.retry_budget.is_admissible(&route.url) {
        tracing::warn!(
            request_id = %ctx.request_id,
            url = %route.url,
            error_ratio = ctx.retry_budget.error_ratio(&route.url),
            "endpoint suppressed by retry budget"
        );
        counter!(ENDPOINT_SUPPRESSED).increment(1);
        return RouteResult {
            index,
            failures: route.stream_epochs.len(),
            suppressed: true,
            bytes: 0,
            buffer,
        };
    }

    let mut bytes = 0;
    let mut failures = 0;
    for epoch in &route.stream_epochs {
        let report = process_epoch(&ctx, &route.url, epoch.clone(), &mut buffer).await;
        bytes += report.bytes;
        failures += report.failures;
    }

    RouteResult {
        index,
        buffer,
        bytes,
        failures,
        suppressed: false,
    }
}

/// Issue the sub-request for one epoch and stream its body into the
/// slot. A 413 splits the epoch and recurses over the sub-epochs in
/// time order; the epoch counts as resolved once every descendant is.
fn process_epoch<'a>(
    ctx: &'a WorkerContext,
    url: &'a Url,
    epoch: StreamEpoch,
    buffer: &'a mut SpooledBuffer,
) -> Pin<Box<dyn Future<Output = EpochReport> + Send + 'a>> {
    Box::pin(async move {
        let response = match fetch(
            &ctx.client,
            url,
            ctx.method,
            &epoch,
            ctx.format,
            ctx.default_end,
            ctx.connect_timeout,
        )
        .await
        {
            Ok(response) => response,
            Err(err) => {
                ctx.retry_budget.record(url, Outcome::Error);
                counter!(ENDPOINT_ERRORS).increment(1);
                tracing::warn!(
                    request_id = %ctx.request_id,
                    url = %url,
                    epoch = %epoch,
                    error = %err,
                    "endpoint request failed"
                );
                return EpochReport {
                    bytes: 0,
                    failures: 1,
                };
            }
        };

        let status = response.status();
        match classify_status(status) {
            EndpointStatus::NoContent => {
                ctx.retry_budget.record(url, Outcome::Success);
                tracing::debug!(
                    request_id = %ctx.request_id,
                    url = %url,
                    epoch = %epoch,
                    status = status.as_u16(),
                    "no data for epoch"
                );
                EpochReport {
                    bytes: 0,
                    failures: 0,
                }
            }
            EndpointStatus::TooLarge => {
                // Not an error outcome for the budget.
                ctx.retry_budget.record(url, Outcome::Success);

                let parts =
                    epoch.split(ctx.splitting_factor, ctx.min_epoch_duration, ctx.default_end);
                if parts.len() < 2 {
                    tracing::warn!(
                        request_id = %ctx.request_id,
                        url = %url,
                        epoch = %epoch,
                        "payload too large at minimum epoch granularity, giving up"
                    );
                    return EpochReport {
                        bytes: 0,
                        failures: 1,
                    };
                }

                counter!(EPOCH_SPLITS).increment(1);
                tracing::debug!(
                    request_id = %ctx.request_id,
                    url = %url,
                    epoch = %epoch,
                    parts = parts.len(),
                    "splitting epoch after payload-too-large rejection"
                );

                let mut report = EpochReport {
                    bytes: 0,
                    failures: 0,
                };
                for part in parts {
                    let child = process_epoch(ctx, url, part, buffer).await;
                    report.bytes += child.bytes;
                    report.failures += child.failures;
                }
                report
            }
            EndpointStatus::Data => {
                let mut body = response.into_body();
                let mut written = 0u64;

                loop {
                    match timeout(ctx.read_timeout, body.frame()).await {
                        Err(_) => {
                            ctx.retry_budget.record(url, Outcome::Error);
                            counter!(ENDPOINT_ERRORS).increment(1);
                            tracing::warn!(
                                request_id = %ctx.request_id,
                                url = %url,
                                epoch = %epoch,
                                "socket read timeout while streaming"
                            );
                            // Bytes already flushed to the slot stay there.
                            return EpochReport {
                                bytes: written,
                                failures: 1,
                            };
                        }
                        Ok(None) => break,
                        Ok(Some(Err(err))) => {
                            ctx.retry_budget.record(url, Outcome::Error);
                            counter!(ENDPOINT_ERRORS).increment(1);
                            tracing::warn!(
                                request_id = %ctx.request_id,
                                url = %url,
                                epoch = %epoch,
                                error = %err,
                                "stream aborted by endpoint"
                            );
                            return EpochReport {
                                bytes: written,
                                failures: 1,
                            };
                        }
                        Ok(Some(Ok(frame))) => {
                            if let Ok(data) = frame.into_data() {
                                if let Err(err) = buffer.write(&data).await {
                                    tracing::error!(
                                        request_id = %ctx.request_id,
                                        url = %url,
                                        error = %err,
                                        "failed to buffer response chunk"
                                    );
                                    return EpochReport {
                                        bytes: written,
                                        failures: 1,
                                    };
                                }
                                written += data.len() as u64;
                            }
                        }
                    }
                }

                ctx.retry_budget.record(url, Outcome::Success);
                EpochReport {
                    bytes: written,
                    failures: 0,
                }
            }
            EndpointStatus::Error(status) => {
                ctx.retry_budget.record(url, Outcome::Error);
                counter!(ENDPOINT_ERRORS).increment(1);
                tracing::warn!(
                    request_id = %ctx.request_id,
                    url = %url,
                    epoch = %epoch,
                    status = status.as_u16(),
                    "endpoint returned an error status"
                );
                EpochReport {
                    bytes: 0,
                    failures: 1,
                }
            }
        }
    })
}
