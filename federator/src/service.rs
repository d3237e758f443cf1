//! Inbound HTTP surface of the federation gateway.
//!
//! One listener, three concerns: the federation query endpoint (GET
//! with query parameters or POST with selector lines), a health probe,
//! and the templated error bodies every non-2xx response carries.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use http::{Method, StatusCode};
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, Limited};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use shared::{gauge, histogram};
use time::OffsetDateTime;

use crate::errors::FederatorError;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::model::format_timestamp;
use crate::processor::{FederatedResponse, RequestContext, RequestProcessor, ResponseBody};
use crate::query::Query;

pub const QUERY_PATH: &str = "/fedws/dataselect/1/query";
const HEALTH_PATH: &str = "/healthcheck";

pub struct FederatorService {
    inner: Arc<ServiceInner>,
}

impl FederatorService {
    pub fn new(processor: RequestProcessor, client_max_size: usize) -> Self {
        Self {
            inner: Arc::new(ServiceInner {
                processor,
                client_max_size,
            }),
        }
    }
}

impl Service<Request<Incoming>> for FederatorService {
    type Response = Response<BoxBody<Bytes, FederatorError>>;
    type Error = FederatorError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let inner = self.inner.clone();
        Box::pin(async move {
            let started = Instant::now();
            gauge!(REQUESTS_INFLIGHT).increment(1.0);

            let response = inner.route(req).await;

            gauge!(REQUESTS_INFLIGHT).decrement(1.0);
            histogram!(REQUEST_DURATION).record(started.elapsed().as_secs_f64());
            Ok(response)
        })
    }
}

struct ServiceInner {
    processor: RequestProcessor,
    client_max_size: usize,
}

impl ServiceInner {
    async fn route(
        &self,
        req: Request<Incoming>,
    ) -> Response<BoxBody<Bytes, FederatorError>> {
        let submitted = OffsetDateTime::now_utc();
        let request_url = request_url(&req);

        match (req.method(), req.uri().path()) {
            (&Method::GET, HEALTH_PATH) => plain_response(StatusCode::OK, "OK\n"),
            (&Method::GET, QUERY_PATH) => {
                let query = req.uri().query().unwrap_or("");
                match Query::from_get(query) {
                    Ok(query) => self.process(query, &request_url, submitted).await,
                    Err(err) => error_response(&err, &request_url, submitted),
                }
            }
            (&Method::POST, QUERY_PATH) => match self.read_body(req).await {
                Ok(body) => match Query::from_post(&body) {
                    Ok(query) => self.process(query, &request_url, submitted).await,
                    Err(err) => error_response(&err, &request_url, submitted),
                },
                Err(err) => error_response(&err, &request_url, submitted),
            },
            _ => {
                let body = shared::http::format_error_body(
                    StatusCode::NOT_FOUND,
                    "no such resource",
                    &request_url,
                    &format_timestamp(submitted),
                    crate::VERSION,
                );
                shared::http::make_error_response(StatusCode::NOT_FOUND, body)
            }
        }
    }

    /// Read a POST body, bounding it to the configured maximum.
    async fn read_body(&self, req: Request<Incoming>) -> Result<String, FederatorError> {
        let limited = Limited::new(req.into_body(), self.client_max_size);
        let collected = limited.collect().await.map_err(|err| {
            if err.downcast_ref::<http_body_util::LengthLimitError>().is_some() {
                FederatorError::BodyTooLarge {
                    limit: self.client_max_size,
                }
            } else {
                FederatorError::RequestBody(err.to_string())
            }
        })?;

        String::from_utf8(collected.to_bytes().to_vec())
            .map_err(|err| FederatorError::RequestBody(err.to_string()))
    }

    async fn process(
        &self,
        query: Query,
        request_url: &str,
        submitted: OffsetDateTime,
    ) -> Response<BoxBody<Bytes, FederatorError>> {
        let nodata = query.params.nodata;
        let ctx = RequestContext::new(query);

        match self.processor.federate(&ctx).await {
            Ok(FederatedResponse::Data { content_type, body }) => {
                let body = match body {
                    ResponseBody::Memory(bytes) => {
                        Full::new(bytes).map_err(|e| match e {}).boxed()
                    }
                    ResponseBody::Streamed { body, .. } => {
                        body.map_err(FederatorError::Io).boxed()
                    }
                };

                Response::builder()
                    .status(StatusCode::OK)
                    .header(http::header::CONTENT_TYPE, content_type)
                    .body(body)
                    .expect("static response")
            }
            Ok(FederatedResponse::NoData) => {
                let status = nodata.status();
                let body = shared::http::format_error_body(
                    status,
                    "",
                    request_url,
                    &format_timestamp(submitted),
                    crate::VERSION,
                );
                shared::http::make_error_response(status, body)
            }
            Err(err) => {
                tracing::warn!(request_id = %ctx.id, error = %err, "request failed");
                error_response(&err, request_url, submitted)
            }
        }
    }
}

/// Map an error to its templated client response. Internal errors keep
/// their detail out of the body; everything else explains itself.
fn error_response(
    err: &FederatorError,
    request_url: &str,
    submitted: OffsetDateTime,
) -> Response<BoxBody<Bytes, FederatorError>> {
    let status = err.status();
    let description = if status == StatusCode::INTERNAL_SERVER_ERROR {
        String::new()
    } else {
        err.to_string()
    };

    let body = shared::http::format_error_body(
        status,
        &description,
        request_url,
        &format_timestamp(submitted),
        crate::VERSION,
    );
    shared::http::make_error_response(status, body)
}

fn plain_response(
    status: StatusCode,
    body: &'static str,
) -> Response<BoxBody<Bytes, FederatorError>> {
    Response::builder()
        .status(status)
        .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
        .body(Full::new(Bytes::from_static(body.as_bytes())).map_err(|e| match e {}).boxed())
        .expect("static response")
}

/// Reconstruct the submitted URL for error bodies.
fn request_url<B>(req: &Request<B>) -> String {
    let host = req
        .headers()
        .get(http::header::HOST)
        .and_then(|value| value.to_str().ok())
        .unwrap_or("localhost");
    format!("http://{}{}", host, req.uri())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::Cache;
    use crate::config::Config;
    use crate::retry_budget::RetryBudget;
    use crate::testutils::{MockResponse, start_mock_server};

    async fn service_with_routing(routing_base: &str) -> FederatorService {
        let config: Config = serde_yaml::from_str(&format!(
            r#"
listener:
    host: "127.0.0.1"
    port: 8080
routing:
    url: "{routing_base}/routing/1/query"
    timeout_secs: 5
"#
        ))
        .unwrap();

        let cache = Arc::new(Cache::from_config(&config.cache));
        let retry_budget = Arc::new(RetryBudget::new(config.retry_budget.clone()));
        let client_max_size = config.federation.client_max_size;
        let processor = RequestProcessor::new(config, cache, retry_budget).unwrap();
        FederatorService::new(processor, client_max_size)
    }

    async fn serve_once(service: FederatorService) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let service = Arc::new(service);

        tokio::spawn(async move {
            loop {
                let (stream, _) = listener.accept().await.unwrap();
                let io = hyper_util::rt::TokioIo::new(stream);
                let svc = service.clone();
                tokio::spawn(async move {
                    let _ = hyper_util::server::conn::auto::Builder::new(
                        hyper_util::rt::TokioExecutor::new(),
                    )
                    .serve_connection(io, svc)
                    .await;
                });
            }
        });

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        format!("http://127.0.0.1:{port}")
    }

    #[tokio::test]
    async fn test_health_and_validation_errors() {
        let (routing_base, _) =
            start_mock_server(|_| MockResponse::new(StatusCode::NO_CONTENT, Vec::new())).await;
        let base = serve_once(service_with_routing(&routing_base).await).await;
        let client = reqwest::Client::new();

        let health = client.get(format!("{base}/healthcheck")).send().await.unwrap();
        assert_eq!(health.status(), StatusCode::OK);

        // Missing starttime
        let bad = client
            .get(format!("{base}{QUERY_PATH}?net=GR"))
            .send()
            .await
            .unwrap();
        assert_eq!(bad.status(), StatusCode::BAD_REQUEST);
        let body = bad.text().await.unwrap();
        assert!(body.contains("Error 400: Bad request"));
        assert!(body.contains("starttime"));

        // Unknown path
        let missing = client.get(format!("{base}/nope")).send().await.unwrap();
        assert_eq!(missing.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_no_data_honors_nodata_parameter() {
        let (routing_base, _) =
            start_mock_server(|_| MockResponse::new(StatusCode::NO_CONTENT, Vec::new())).await;
        let base = serve_once(service_with_routing(&routing_base).await).await;
        let client = reqwest::Client::new();

        let default = client
            .get(format!("{base}{QUERY_PATH}?start=2020-01-01&end=2020-01-02"))
            .send()
            .await
            .unwrap();
        assert_eq!(default.status(), StatusCode::NO_CONTENT);

        let explicit = client
            .get(format!(
                "{base}{QUERY_PATH}?start=2020-01-01&end=2020-01-02&nodata=404"
            ))
            .send()
            .await
            .unwrap();
        assert_eq!(explicit.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_federated_get_end_to_end() {
        let (endpoint, _) =
            start_mock_server(|_| MockResponse::new(StatusCode::OK, b"WAVEFORMS".to_vec())).await;

        let endpoint_url = format!("{endpoint}/fdsnws/dataselect/1/query");
        let text = format!(
            "{endpoint_url}\nGR BFO -- BHZ 2020-01-01T00:00:00 2020-01-02T00:00:00\n"
        )
        .into_bytes();
        let (routing_base, _) =
            start_mock_server(move |_| MockResponse::new(StatusCode::OK, text.clone())).await;

        let base = serve_once(service_with_routing(&routing_base).await).await;
        let client = reqwest::Client::new();

        let response = client
            .get(format!(
                "{base}{QUERY_PATH}?net=GR&sta=BFO&cha=BHZ&start=2020-01-01&end=2020-01-02"
            ))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(http::header::CONTENT_TYPE).unwrap(),
            "application/vnd.fdsn.mseed"
        );
        assert_eq!(response.bytes().await.unwrap().as_ref(), b"WAVEFORMS");
    }

    #[tokio::test]
    async fn test_post_body_too_large() {
        let (routing_base, _) =
            start_mock_server(|_| MockResponse::new(StatusCode::NO_CONTENT, Vec::new())).await;

        let config: Config = serde_yaml::from_str(&format!(
            r#"
listener:
    host: "127.0.0.1"
    port: 8080
routing:
    url: "{routing_base}/routing/1/query"
federation:
    client_max_size: 64
"#
        ))
        .unwrap();
        let cache = Arc::new(Cache::from_config(&config.cache));
        let retry_budget = Arc::new(RetryBudget::new(config.retry_budget.clone()));
        let client_max_size = config.federation.client_max_size;
        let processor = RequestProcessor::new(config, cache, retry_budget).unwrap();
        let base = serve_once(FederatorService::new(processor, client_max_size)).await;

        let response = reqwest::Client::new()
            .post(format!("{base}{QUERY_PATH}"))
            .body("X".repeat(1024))
            .send()
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
