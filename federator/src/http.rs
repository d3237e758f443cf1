//! Outbound requests to archive endpoints.

use http::StatusCode;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Method, Request, Response};
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::time::timeout;
use url::Url;

use crate::config::RequestMethod;
use crate::model::StreamEpoch;
use crate::query::OutputFormat;

pub type EndpointClient = Client<HttpConnector, Full<Bytes>>;

pub fn build_endpoint_client() -> EndpointClient {
    Client::builder(TokioExecutor::new()).build(HttpConnector::new())
}

#[derive(Error, Debug)]
pub enum EndpointError {
    #[error("timed out connecting to {0}")]
    ConnectTimeout(String),

    #[error("request to {0} failed: {1}")]
    Request(String, String),

    #[error("failed to build request for {0}: {1}")]
    Build(String, String),
}

/// How a worker should react to an endpoint response status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EndpointStatus {
    /// Stream the body into the buffer slot
    Data,
    /// Zero-byte success, not an error for the retry budget
    NoContent,
    /// Split the epoch and retry
    TooLarge,
    /// Permanent failure for this sub-request
    Error(StatusCode),
}

pub fn classify_status(status: StatusCode) -> EndpointStatus {
    match status {
        StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => EndpointStatus::NoContent,
        StatusCode::PAYLOAD_TOO_LARGE => EndpointStatus::TooLarge,
        status if status.is_success() => EndpointStatus::Data,
        status => EndpointStatus::Error(status),
    }
}

/// Issue one sub-request for one stream epoch against one endpoint.
///
/// `connect_timeout` bounds the connection plus response headers; the
/// caller applies the per-read timeout while streaming the body.
pub async fn fetch(
    client: &EndpointClient,
    url: &Url,
    method: RequestMethod,
    epoch: &StreamEpoch,
    format: OutputFormat,
    default_end: OffsetDateTime,
    connect_timeout: Duration,
) -> Result<Response<Incoming>, EndpointError> {
    let endpoint = url.host_str().unwrap_or(url.as_str()).to_string();

    let request = match method {
        RequestMethod::Get => {
            let mut url = url.clone();
            {
                let mut pairs = url.query_pairs_mut();
                pairs
                    .append_pair("network", &epoch.stream.network)
                    .append_pair("station", &epoch.stream.station)
                    .append_pair("location", epoch.stream.location_code())
                    .append_pair("channel", &epoch.stream.channel)
                    .append_pair("starttime", &crate::model::format_timestamp(epoch.start))
                    .append_pair(
                        "endtime",
                        &crate::model::format_timestamp(epoch.end.unwrap_or(default_end)),
                    )
                    .append_pair("format", format.as_str());
            }

            Request::builder()
                .method(Method::GET)
                .uri(url.as_str())
                .header(http::header::USER_AGENT, crate::USER_AGENT)
                .body(Full::new(Bytes::new()))
        }
        RequestMethod::Post => {
            let body = format!(
                "format={}\n{}\n",
                format.as_str(),
                epoch.selector_line(default_end)
            );

            Request::builder()
                .method(Method::POST)
                .uri(url.as_str())
                .header(http::header::USER_AGENT, crate::USER_AGENT)
                .body(Full::new(Bytes::from(body)))
        }
    };

    let request =
        request.map_err(|err| EndpointError::Build(endpoint.clone(), err.to_string()))?;

    timeout(connect_timeout, client.request(request))
        .await
        .map_err(|_| EndpointError::ConnectTimeout(endpoint.clone()))?
        .map_err(|err| EndpointError::Request(endpoint, err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_status() {
        assert_eq!(classify_status(StatusCode::OK), EndpointStatus::Data);
        assert_eq!(
            classify_status(StatusCode::NO_CONTENT),
            EndpointStatus::NoContent
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            EndpointStatus::NoContent
        );
        assert_eq!(
            classify_status(StatusCode::PAYLOAD_TOO_LARGE),
            EndpointStatus::TooLarge
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN),
            EndpointStatus::Error(StatusCode::FORBIDDEN)
        );
        assert_eq!(
            classify_status(StatusCode::INTERNAL_SERVER_ERROR),
            EndpointStatus::Error(StatusCode::INTERNAL_SERVER_ERROR)
        );
    }
}
