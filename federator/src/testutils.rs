//! In-process mock servers for exercising the federation engine.

use std::convert::Infallible;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::time::Duration;

use http::StatusCode;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::service::service_fn;
use hyper::{Request, Response};
use hyper_util::rt::TokioExecutor;
use tokio::net::TcpListener;

pub(crate) struct MockResponse {
    pub status: StatusCode,
    pub body: Vec<u8>,
    pub delay: Duration,
}

impl MockResponse {
    pub fn new(status: StatusCode, body: Vec<u8>) -> Self {
        Self {
            status,
            body,
            delay: Duration::ZERO,
        }
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Start a mock HTTP server driven by `responder`; returns the base URL
/// and a counter of requests served.
pub(crate) async fn start_mock_server<F>(responder: F) -> (String, Arc<AtomicUsize>)
where
    F: Fn(&Request<Incoming>) -> MockResponse + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let responder = Arc::new(responder);
    let hits = Arc::new(AtomicUsize::new(0));
    let hits_handle = hits.clone();

    tokio::spawn(async move {
        loop {
            let (stream, _) = listener.accept().await.unwrap();
            let io = hyper_util::rt::TokioIo::new(stream);
            let responder = responder.clone();
            let hits = hits.clone();

            tokio::spawn(async move {
                let service = service_fn(move |req: Request<Incoming>| {
                    let responder = responder.clone();
                    let hits = hits.clone();
                    async move {
                        hits.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                        let mock = responder(&req);
                        if !mock.delay.is_zero() {
                            tokio::time::sleep(mock.delay).await;
                        }
                        Ok::<_, Infallible>(
                            Response::builder()
                                .status(mock.status)
                                .body(Full::new(Bytes::from(mock.body)))
                                .unwrap(),
                        )
                    }
                });

                let _ = hyper_util::server::conn::auto::Builder::new(TokioExecutor::new())
                    .serve_connection(io, service)
                    .await;
            });
        }
    });

    // Give the server a moment to start
    tokio::time::sleep(Duration::from_millis(50)).await;

    (format!("http://127.0.0.1:{port}"), hits_handle)
}
