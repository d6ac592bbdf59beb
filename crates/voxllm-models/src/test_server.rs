//! Local HTTP file server for exercising downloads in tests.
//!
//! Serves one payload under any path, honours `Range: bytes=N-` and can be
//! told to fail, stall or cut off upcoming responses.

use bytes::Bytes;
use futures_util::stream;
use http_body_util::combinators::BoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder;
use std::collections::VecDeque;
use std::convert::Infallible;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

type Body = BoxBody<Bytes, io::Error>;

/// A request as seen by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub path: String,
    /// Offset from a `Range: bytes=N-` header, if one was sent.
    pub range_start: Option<u64>,
}

#[derive(Debug, Clone, Copy)]
enum Fault {
    /// Respond with this status and an empty body.
    Status(u16),
    /// Announce the full length, then drop the connection after this many
    /// body bytes.
    Interrupt(usize),
    /// Send only this many bytes, without a length header, and end cleanly.
    Unsized(usize),
    /// Answer with the whole payload as if no `Range` had been sent.
    IgnoreRange,
    /// Hold the response back for this long.
    Stall(Duration),
}

#[derive(Debug, Default)]
struct State {
    payload: Bytes,
    faults: VecDeque<Fault>,
    requests: Vec<RecordedRequest>,
}

/// Local server bound to an ephemeral port. Stops accepting when dropped.
pub struct MockFileServer {
    addr: SocketAddr,
    state: Arc<Mutex<State>>,
    task: JoinHandle<()>,
}

impl MockFileServer {
    /// Bind to `127.0.0.1:0` and start serving `payload`.
    pub async fn start(payload: Vec<u8>) -> io::Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let addr = listener.local_addr()?;
        let state = Arc::new(Mutex::new(State {
            payload: Bytes::from(payload),
            ..State::default()
        }));

        let shared = Arc::clone(&state);
        let task = tokio::spawn(async move {
            let builder = Builder::new(TokioExecutor::new());
            while let Ok((io, _)) = listener.accept().await {
                let state = Arc::clone(&shared);
                let svc = service_fn(move |req| {
                    let state = Arc::clone(&state);
                    async move { Ok::<_, Infallible>(respond(req, state).await) }
                });
                let builder = builder.clone();
                tokio::spawn(async move {
                    let _ = builder.serve_connection(TokioIo::new(io), svc).await;
                });
            }
        });

        Ok(Self { addr, state, task })
    }

    /// URL for `filename` on this server.
    pub fn url(&self, filename: &str) -> String {
        format!("http://{}/{}", self.addr, filename)
    }

    /// Cut the next response off after `bytes` body bytes.
    pub fn interrupt_next_after(&self, bytes: usize) {
        self.push(Fault::Interrupt(bytes));
    }

    /// Answer the next request with `status` and no body.
    pub fn fail_next_with(&self, status: u16) {
        self.push(Fault::Status(status));
    }

    /// Send only the first `bytes` of the payload next time, with no
    /// `Content-Length` or `Content-Range`.
    pub fn send_unsized_next(&self, bytes: usize) {
        self.push(Fault::Unsized(bytes));
    }

    /// Ignore the `Range` header of the next request.
    pub fn ignore_range_next(&self) {
        self.push(Fault::IgnoreRange);
    }

    /// Delay the next response by `delay`.
    pub fn stall_next(&self, delay: Duration) {
        self.push(Fault::Stall(delay));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.lock().requests.clone()
    }

    pub fn request_count(&self) -> usize {
        self.lock().requests.len()
    }

    fn push(&self, fault: Fault) {
        self.lock().faults.push_back(fault);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for MockFileServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn respond(req: Request<Incoming>, state: Arc<Mutex<State>>) -> Response<Body> {
    let request = RecordedRequest {
        path: req.uri().path().to_string(),
        range_start: req
            .headers()
            .get(RANGE)
            .and_then(|value| value.to_str().ok())
            .and_then(parse_range_start),
    };

    let (payload, fault) = {
        let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
        state.requests.push(request.clone());
        (state.payload.clone(), state.faults.pop_front())
    };

    let mut range_start = request.range_start;
    let mut limit = None;
    match fault {
        Some(Fault::Status(code)) => {
            let status = StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            return empty(status);
        }
        Some(Fault::Unsized(bytes)) => {
            let head = payload.slice(..bytes.min(payload.len()));
            return Response::new(chunks(vec![Ok(Frame::data(head))]));
        }
        Some(Fault::Stall(delay)) => tokio::time::sleep(delay).await,
        Some(Fault::IgnoreRange) => range_start = None,
        Some(Fault::Interrupt(bytes)) => limit = Some(bytes),
        None => {}
    }

    let total = payload.len() as u64;
    let (status, body) = match range_start {
        Some(start) if start >= total => {
            let mut response = empty(StatusCode::RANGE_NOT_SATISFIABLE);
            set_header(&mut response, CONTENT_RANGE, format!("bytes */{}", total));
            return response;
        }
        Some(start) => (StatusCode::PARTIAL_CONTENT, payload.slice(start as usize..)),
        None => (StatusCode::OK, payload),
    };
    let body_len = body.len();

    let mut response = match limit {
        Some(bytes) if bytes < body_len => Response::new(chunks(vec![
            Ok(Frame::data(body.slice(..bytes))),
            Err(io::Error::new(io::ErrorKind::ConnectionAborted, "interrupted")),
        ])),
        _ => Response::new(full(body)),
    };
    *response.status_mut() = status;
    response
        .headers_mut()
        .insert(CONTENT_LENGTH, HeaderValue::from(body_len as u64));
    if status == StatusCode::PARTIAL_CONTENT {
        let start = total - body_len as u64;
        set_header(
            &mut response,
            CONTENT_RANGE,
            format!("bytes {}-{}/{}", start, total - 1, total),
        );
    }
    response
}

fn empty(status: StatusCode) -> Response<Body> {
    let mut response = Response::new(full(Bytes::new()));
    *response.status_mut() = status;
    response
}

fn full(bytes: Bytes) -> Body {
    Full::new(bytes)
        .map_err(|never| -> io::Error { match never {} })
        .boxed()
}

/// Body streamed frame by frame; an `Err` item aborts the connection.
fn chunks(frames: Vec<Result<Frame<Bytes>, io::Error>>) -> Body {
    BodyExt::boxed(StreamBody::new(stream::iter(frames)))
}

fn set_header(response: &mut Response<Body>, name: HeaderName, value: String) {
    if let Ok(value) = HeaderValue::from_str(&value) {
        response.headers_mut().insert(name, value);
    }
}

/// Offset of an open-ended `bytes=N-` range.
fn parse_range_start(value: &str) -> Option<u64> {
    value
        .trim()
        .strip_prefix("bytes=")
        .and_then(|range| range.split('-').next())
        .and_then(|start| start.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range_start() {
        assert_eq!(parse_range_start("bytes=400-"), Some(400));
        assert_eq!(parse_range_start(" bytes=0-99"), Some(0));
        assert_eq!(parse_range_start("items=4-"), None);
        assert_eq!(parse_range_start("bytes=-500"), None);
    }

    #[tokio::test]
    async fn test_serves_ranges() {
        let server = MockFileServer::start(b"0123456789".to_vec()).await.unwrap();
        let client = reqwest::Client::new();

        let full = client.get(server.url("f")).send().await.unwrap();
        assert_eq!(full.status().as_u16(), 200);
        assert_eq!(full.bytes().await.unwrap().as_ref(), b"0123456789");

        let tail = client
            .get(server.url("f"))
            .header("Range", "bytes=4-")
            .send()
            .await
            .unwrap();
        assert_eq!(tail.status().as_u16(), 206);
        assert_eq!(
            tail.headers()["content-range"].to_str().unwrap(),
            "bytes 4-9/10"
        );
        assert_eq!(tail.bytes().await.unwrap().as_ref(), b"456789");

        let past = client
            .get(server.url("f"))
            .header("Range", "bytes=10-")
            .send()
            .await
            .unwrap();
        assert_eq!(past.status().as_u16(), 416);
        assert_eq!(
            past.headers()["content-range"].to_str().unwrap(),
            "bytes */10"
        );

        assert_eq!(server.request_count(), 3);
        assert_eq!(server.requests()[1].range_start, Some(4));
        assert_eq!(server.requests()[1].path, "/f");
    }

    #[tokio::test]
    async fn test_faults_apply_in_order() {
        let server = MockFileServer::start(b"0123456789".to_vec()).await.unwrap();
        server.ignore_range_next();
        server.send_unsized_next(3);
        server.interrupt_next_after(5);
        let client = reqwest::Client::new();

        let ignored = client
            .get(server.url("f"))
            .header("Range", "bytes=4-")
            .send()
            .await
            .unwrap();
        assert_eq!(ignored.status().as_u16(), 200);
        assert_eq!(ignored.bytes().await.unwrap().as_ref(), b"0123456789");

        let unsized_body = client.get(server.url("f")).send().await.unwrap();
        assert_eq!(unsized_body.content_length(), None);
        assert_eq!(unsized_body.bytes().await.unwrap().as_ref(), b"012");

        let cut = client.get(server.url("f")).send().await.unwrap();
        assert_eq!(cut.content_length(), Some(10));
        assert!(cut.bytes().await.is_err());
    }
}
