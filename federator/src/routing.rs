//! Client for the routing-discovery service.
//!
//! The routing service maps stream epoch selectors to the archive
//! endpoints holding the matching data. Its client runs on its own
//! reqwest connection pool with an independent timeout so that slow or
//! overloaded archives never starve route lookups.

use std::time::Duration;

use http::StatusCode;
use time::OffsetDateTime;
use url::Url;

use crate::config::RoutingConfig;
use crate::errors::FederatorError;
use crate::model::{Route, StreamEpoch};

pub struct RoutingClient {
    client: reqwest::Client,
    url: Url,
}

impl RoutingClient {
    pub fn new(config: &RoutingConfig) -> Result<Self, FederatorError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(crate::USER_AGENT)
            .build()
            .map_err(|err| FederatorError::Internal(format!("routing client: {err}")))?;

        Ok(Self {
            client,
            url: config.url.clone(),
        })
    }

    /// Resolve stream epochs into demultiplexed routes (one epoch per
    /// route, response order preserved). "No route found" is an empty
    /// result, not an error.
    pub async fn resolve(
        &self,
        stream_epochs: &[StreamEpoch],
        default_end: OffsetDateTime,
    ) -> Result<Vec<Route>, FederatorError> {
        let request = if let [epoch] = stream_epochs {
            // Single selector: GET with the query-string encoding keeps
            // intermediary HTTP caches effective.
            let mut url = self.url.clone();
            {
                let mut pairs = url.query_pairs_mut();
                pairs
                    .append_pair("network", &epoch.stream.network)
                    .append_pair("station", &epoch.stream.station)
                    .append_pair("location", epoch.stream.location_code())
                    .append_pair("channel", &epoch.stream.channel)
                    .append_pair("starttime", &crate::model::format_timestamp(epoch.start))
                    .append_pair("format", "post");
                if let Some(end) = epoch.end {
                    pairs.append_pair("endtime", &crate::model::format_timestamp(end));
                }
            }
            self.client.get(url)
        } else {
            let mut body = String::from("format=post\n");
            for epoch in stream_epochs {
                body.push_str(&epoch.selector_line(default_end));
                body.push('\n');
            }
            self.client.post(self.url.clone()).body(body)
        };

        let response = request.send().await.map_err(|err| {
            if err.is_timeout() {
                FederatorError::RoutingTimeout
            } else {
                FederatorError::RoutingUnavailable(err.to_string())
            }
        })?;

        match response.status() {
            StatusCode::OK => {
                let text = response
                    .text()
                    .await
                    .map_err(|err| FederatorError::RoutingUnavailable(err.to_string()))?;
                parse_routing_response(&text)
            }
            StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => Ok(Vec::new()),
            status => Err(FederatorError::RoutingUnavailable(format!(
                "routing service returned {status}"
            ))),
        }
    }
}

/// Parse the routing service's line-oriented output: blank-line
/// separated groups of an endpoint URL line followed by one selector
/// line per stream epoch.
fn parse_routing_response(text: &str) -> Result<Vec<Route>, FederatorError> {
    let mut routes = Vec::new();
    let mut current: Option<Url> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            current = None;
            continue;
        }

        match &current {
            None => {
                let url = Url::parse(line).map_err(|err| {
                    FederatorError::RoutingMalformed(format!("bad endpoint URL {line:?}: {err}"))
                })?;
                current = Some(url);
            }
            Some(url) => {
                let epoch = StreamEpoch::from_selector_line(line).map_err(|err| {
                    FederatorError::RoutingMalformed(format!("bad selector line {line:?}: {err}"))
                })?;
                routes.push(Route {
                    url: url.clone(),
                    stream_epochs: vec![epoch],
                });
            }
        }
    }

    Ok(routes)
}
