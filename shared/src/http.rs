use http::StatusCode;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Request, Response};
use hyper_util::rt::TokioExecutor;
use hyper_util::rt::TokioIo;
use hyper_util::server::conn::auto::Builder;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Documentation link embedded in error bodies.
pub const DOCUMENTATION_URI: &str = "https://www.fdsn.org/webservices/";

pub async fn run_http_service<S, E>(host: &str, port: u16, service: S) -> Result<(), E>
where
    S: Service<Request<Incoming>, Response = Response<BoxBody<Bytes, E>>, Error = E>
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
    E: From<std::io::Error> + std::error::Error + Send + Sync + 'static,
{
    let listener = TcpListener::bind(format!("{host}:{port}")).await?;
    tracing::info!(host, port, "listening");
    let service_arc = Arc::new(service);

    loop {
        let (stream, _peer_addr) = listener.accept().await?;
        let _ = stream.set_nodelay(true);
        let io = TokioIo::new(stream);
        let svc = service_arc.clone();

        // Hand the connection to hyper; auto-detect h1/h2 on this socket
        tokio::spawn(async move {
            if let Err(err) = Builder::new(TokioExecutor::new())
                .serve_connection(io, svc)
                .await
            {
                tracing::debug!(error = %err, "connection closed with error");
            }
        });
    }
}

/// Short error descriptions mandated by the FDSN web service specification.
pub fn short_description(status: StatusCode) -> &'static str {
    match status {
        StatusCode::NO_CONTENT | StatusCode::NOT_FOUND => "",
        StatusCode::BAD_REQUEST => "Bad request",
        StatusCode::PAYLOAD_TOO_LARGE => "Request too large",
        StatusCode::URI_TOO_LONG => "Request URI too large",
        StatusCode::BAD_GATEWAY => "Bad gateway",
        StatusCode::GATEWAY_TIMEOUT => "Gateway timeout",
        StatusCode::SERVICE_UNAVAILABLE => "Service temporarily unavailable",
        _ => "Internal server error",
    }
}

/// Render the plain-text error body: status code, short and long
/// description, documentation link, the submitted request URL, the
/// submission timestamp, and the service version string.
pub fn format_error_body(
    status: StatusCode,
    description_long: &str,
    request_url: &str,
    request_submitted: &str,
    service_version: &str,
) -> String {
    let short = short_description(status);
    let long = if description_long.is_empty() {
        short
    } else {
        description_long
    };

    format!(
        "\nError {code}: {short}\n\n\
         {long}\n\n\
         Usage details are available from {doc}\n\n\
         Request:\n{url}\n\n\
         Request Submitted:\n{submitted}\n\n\
         Service version:\n{version}\n",
        code = status.as_u16(),
        short = short,
        long = long,
        doc = DOCUMENTATION_URI,
        url = request_url,
        submitted = request_submitted,
        version = service_version,
    )
}

/// Build a text/plain error response with the templated body.
///
/// A 204 carries no body per RFC 9110; every other status gets the
/// template.
pub fn make_error_response<E>(status: StatusCode, body: String) -> Response<BoxBody<Bytes, E>> {
    let mut builder = Response::builder().status(status);

    if status == StatusCode::NO_CONTENT {
        return builder
            .body(Full::new(Bytes::new()).map_err(|e| match e {}).boxed())
            .expect("static response");
    }

    builder = builder.header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8");
    builder
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("static response")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_body_template() {
        let body = format_error_body(
            StatusCode::BAD_REQUEST,
            "start must be before end",
            "http://localhost:8080/query?start=x",
            "2026-01-01T00:00:00Z",
            "0.1.0",
        );

        assert!(body.starts_with("\nError 400: Bad request"));
        assert!(body.contains("start must be before end"));
        assert!(body.contains(DOCUMENTATION_URI));
        assert!(body.contains("http://localhost:8080/query?start=x"));
        assert!(body.contains("2026-01-01T00:00:00Z"));
        assert!(body.ends_with("0.1.0\n"));
    }

    #[test]
    fn test_long_description_falls_back_to_short() {
        let body = format_error_body(
            StatusCode::INTERNAL_SERVER_ERROR,
            "",
            "http://localhost/query",
            "2026-01-01T00:00:00Z",
            "0.1.0",
        );

        // The long-description slot repeats the short description.
        assert_eq!(body.matches("Internal server error").count(), 2);
    }

    #[test]
    fn test_no_content_has_empty_body() {
        let resp =
            make_error_response::<std::io::Error>(StatusCode::NO_CONTENT, "ignored".to_string());
        assert_eq!(resp.status(), StatusCode::NO_CONTENT);
        assert!(resp.headers().get(http::header::CONTENT_TYPE).is_none());
    }
}
