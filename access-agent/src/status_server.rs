//! HTTP status endpoint.
//!
//! `GET /` answers with the monitor snapshot as JSON and `GET /metrics` with the Prometheus
//! text exposition of the default registry.

use crate::metrics::{EVENTS_DROPPED, LINE_QUEUE_LEN, RECORD_QUEUE_LEN};
use crate::monitor::MonitorHandle;
use anyhow::{Context, Result};
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderValue, ALLOW, CONTENT_TYPE};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use prometheus::Encoder;
use std::convert::Infallible;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub async fn bind(addr: SocketAddr) -> Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind status server to {addr}"))
}

/// Accepts connections until `cancel_token` fires. Each connection is served on its own task.
pub async fn serve(listener: TcpListener, monitor: MonitorHandle, cancel_token: CancellationToken) {
    match listener.local_addr() {
        Ok(addr) => info!("status server listening on http://{addr}/ (metrics at /metrics)"),
        Err(err) => warn!(error = %err, "status server listening on unknown address"),
    }

    loop {
        tokio::select! {
            biased;
            _ = cancel_token.cancelled() => {
                info!("status server shutting down");
                break;
            }
            accept_result = listener.accept() => {
                let (stream, peer) = match accept_result {
                    Ok(conn) => conn,
                    Err(err) => {
                        warn!(error = %err, "failed to accept status connection");
                        continue;
                    }
                };

                let monitor = monitor.clone();
                tokio::spawn(async move {
                    let io = TokioIo::new(stream);
                    let service = service_fn(move |req: Request<Incoming>| {
                        let method = req.method().clone();
                        let path = req.uri().path().to_owned();
                        let monitor = monitor.clone();
                        async move { Ok::<_, Infallible>(route(&method, &path, &monitor).await) }
                    });

                    if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
                        debug!(%peer, error = %err, "error serving status connection");
                    }
                });
            }
        }
    }
}

async fn route(method: &Method, path: &str, monitor: &MonitorHandle) -> Response<Full<Bytes>> {
    if *method != Method::GET {
        let mut response = text(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
        response
            .headers_mut()
            .insert(ALLOW, HeaderValue::from_static("GET"));
        return response;
    }

    match path {
        "/" => snapshot_json(monitor).await,
        "/metrics" => prometheus_text(monitor),
        _ => text(StatusCode::NOT_FOUND, "Not Found"),
    }
}

async fn snapshot_json(monitor: &MonitorHandle) -> Response<Full<Bytes>> {
    let snapshot = match monitor.snapshot().await {
        Ok(snapshot) => snapshot,
        Err(err) => {
            warn!(error = %err, "snapshot unavailable");
            return text(StatusCode::SERVICE_UNAVAILABLE, "Service Unavailable");
        }
    };

    match serde_json::to_vec_pretty(&snapshot) {
        Ok(body) => {
            let mut response = Response::new(Full::new(Bytes::from(body)));
            response
                .headers_mut()
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
            response
        }
        Err(err) => {
            warn!(error = %err, "failed to encode snapshot");
            text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
        }
    }
}

fn prometheus_text(monitor: &MonitorHandle) -> Response<Full<Bytes>> {
    LINE_QUEUE_LEN.set(monitor.line_queue().len() as i64);
    RECORD_QUEUE_LEN.set(monitor.record_queue().len() as i64);
    EVENTS_DROPPED.set(monitor.events_dropped() as i64);

    let encoder = prometheus::TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %err, "failed to encode prometheus metrics");
        return text(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error");
    }

    let mut response = Response::new(Full::new(Bytes::from(buffer)));
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static(prometheus::TEXT_FORMAT));
    response
}

fn text(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(Bytes::from_static(body.as_bytes())));
    *response.status_mut() = status;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::monitor::{event_channel, MonitorService, QueueProbe};
    use crate::record::LifecycleEvent;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::task::JoinHandle;

    struct Harness {
        addr: SocketAddr,
        events: crate::monitor::EventSender,
        cancel: CancellationToken,
        tasks: Vec<JoinHandle<()>>,
    }

    async fn start(run_monitor: bool) -> Harness {
        let (events, events_rx) = event_channel(64);
        let (_line_tx, line_rx) = flume::bounded::<Vec<u8>>(200);
        let (_record_tx, record_rx) = flume::bounded::<u8>(200);
        let (service, handle) = MonitorService::new(
            events_rx,
            events.clone(),
            QueueProbe::new(line_rx),
            QueueProbe::new(record_rx),
            Duration::from_secs(5),
        );
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        if run_monitor {
            tasks.push(tokio::spawn(service.run(cancel.clone())));
        } else {
            drop(service);
        }

        let listener = bind("127.0.0.1:0".parse().unwrap()).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tasks.push(tokio::spawn(serve(listener, handle, cancel.clone())));

        Harness {
            addr,
            events,
            cancel,
            tasks,
        }
    }

    async fn request(addr: SocketAddr, method: &str, path: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        let request =
            format!("{method} {path} HTTP/1.1\r\nhost: localhost\r\nconnection: close\r\n\r\n");
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    async fn stop(harness: Harness) {
        harness.cancel.cancel();
        for task in harness.tasks {
            task.await.unwrap();
        }
    }

    #[tokio::test]
    async fn root_serves_snapshot_json() {
        let harness = start(true).await;
        for _ in 0..3 {
            harness.events.emit(LifecycleEvent::LineHandled);
        }
        harness.events.emit(LifecycleEvent::ParseError);

        let response = request(harness.addr, "GET", "/").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.contains("application/json"));
        assert!(response.contains("\"handleLine\": 3"), "{response}");
        assert!(response.contains("\"errNum\": 1"));
        assert!(response.contains("\"readChanLen\": 0"));
        assert!(response.contains("\"writeChanLen\": 0"));
        assert!(response.contains("\"tps\": 0.0"));
        assert!(response.contains("\"runTime\": \""));

        stop(harness).await;
    }

    #[tokio::test]
    async fn metrics_path_serves_prometheus_text() {
        let harness = start(true).await;
        // Touch a counter so the family is present even when no other test ran first.
        crate::metrics::LINES_HANDLED_TOTAL.inc_by(0);

        let response = request(harness.addr, "GET", "/metrics").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.contains("access_agent_line_queue_len"));
        assert!(response.contains("access_agent_lines_handled_total"));

        stop(harness).await;
    }

    #[tokio::test]
    async fn unknown_path_and_method_are_rejected() {
        let harness = start(true).await;

        let not_found = request(harness.addr, "GET", "/debug").await;
        assert!(not_found.starts_with("HTTP/1.1 404"), "{not_found}");

        let not_allowed = request(harness.addr, "POST", "/").await;
        assert!(not_allowed.starts_with("HTTP/1.1 405"), "{not_allowed}");
        assert!(not_allowed.to_ascii_lowercase().contains("allow: get"));

        stop(harness).await;
    }

    #[tokio::test]
    async fn stopped_monitor_yields_service_unavailable() {
        let harness = start(false).await;

        let response = request(harness.addr, "GET", "/").await;
        assert!(response.starts_with("HTTP/1.1 503"), "{response}");

        stop(harness).await;
    }
}
