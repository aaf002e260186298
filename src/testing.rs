//! In-process mock inference backend for unit tests.
//!
//! Just enough HTTP/1.1 to satisfy our client: read one request, consult a
//! behavior function, optionally stall, answer, close. Each request arrives
//! on its own connection, and the backend tracks how many requests were in
//! flight simultaneously so tests can verify the pool's concurrency bound.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{TcpListener, TcpStream},
};

/// What the mock backend should answer for one request. The behavior
/// function receives the raw request body.
pub type Behavior = Arc<dyn Fn(&str) -> MockReply + Send + Sync + 'static>;

/// One canned reply.
pub struct MockReply {
    pub status: u16,
    pub body: String,
    pub delay: Duration,
}

impl MockReply {
    /// A successful chat completion wrapping the given page text.
    pub fn recognized(text: &str) -> Self {
        let body = serde_json::json!({
            "choices": [{"message": {"role": "assistant", "content": text}}]
        });
        Self::raw(200, body.to_string())
    }

    /// A reply with the given status and a plain-text body.
    pub fn status(status: u16, body: &str) -> Self {
        Self::raw(status, body.to_owned())
    }

    /// A reply with an arbitrary body.
    pub fn raw(status: u16, body: String) -> Self {
        Self {
            status,
            body,
            delay: Duration::ZERO,
        }
    }

    /// Stall for this long before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// A running mock backend.
pub struct MockBackend {
    addr: SocketAddr,
    max_in_flight: Arc<AtomicUsize>,
}

impl MockBackend {
    /// Start a backend answering every request with `behavior`.
    pub async fn spawn(
        behavior: impl Fn(&str) -> MockReply + Send + Sync + 'static,
    ) -> Self {
        let behavior: Behavior = Arc::new(behavior);
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind mock backend");
        let addr = listener.local_addr().expect("mock backend has no address");
        let active = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));

        {
            let active = active.clone();
            let max_in_flight = max_in_flight.clone();
            tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    let behavior = behavior.clone();
                    let active = active.clone();
                    let max_in_flight = max_in_flight.clone();
                    tokio::spawn(async move {
                        handle_connection(stream, behavior, active, max_in_flight).await;
                    });
                }
            });
        }

        Self {
            addr,
            max_in_flight,
        }
    }

    /// The API base URL to hand to a client.
    pub fn api_base(&self) -> String {
        format!("http://{}/v1", self.addr)
    }

    /// The largest number of requests that were ever in flight at once.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    behavior: Behavior,
    active: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
) {
    let Some(body) = read_request_body(&mut stream).await else {
        return;
    };

    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
    max_in_flight.fetch_max(now, Ordering::SeqCst);
    let reply = behavior(&body);
    tokio::time::sleep(reply.delay).await;
    active.fetch_sub(1, Ordering::SeqCst);

    let reason = match reply.status {
        200 => "OK",
        500 => "Internal Server Error",
        _ => "Mock",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        reply.status,
        reason,
        reply.body.len(),
        reply.body
    );
    let _ = stream.write_all(response.as_bytes()).await;
}

/// Read one HTTP request off the wire and return its body.
async fn read_request_body(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    // Read until the end of the headers.
    let header_end = loop {
        if let Some(pos) = find_subslice(&buf, b"\r\n\r\n") {
            break pos;
        }
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    // Find the declared body length.
    let headers = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = headers
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    // Read the rest of the body.
    let body_start = header_end + 4;
    while buf.len() < body_start + content_length {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    Some(String::from_utf8_lossy(&buf[body_start..]).to_string())
}

fn find_subslice(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}
