//! Request execution for template blocks

use super::JobTarget;
use crate::error::{is_resource_exhaustion, EngineError};
use crate::network::socket::{classify_io_error, TcpConnectScanner};
use crate::templates::{HttpRequest, Response, TcpPayload, TcpRequest};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A response together with the address or URL that produced it
#[derive(Debug, Clone)]
pub struct Exchange {
    pub matched_at: String,
    pub response: Response,
}

/// Writes a block's inputs to a TCP connection and collects what comes back
#[derive(Debug, Clone)]
pub struct TcpExecutor {
    scanner: TcpConnectScanner,
}

impl TcpExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            scanner: TcpConnectScanner::new(timeout),
        }
    }

    /// Run one block against one target.
    ///
    /// The whole exchange, connect included, shares a single deadline. A
    /// connection that yields no bytes before the deadline is a timeout.
    /// Cancellation abandons the exchange with [`EngineError::Stopped`].
    pub async fn execute(
        &self,
        request: &TcpRequest,
        target: JobTarget,
        cancel: &CancellationToken,
    ) -> crate::Result<Exchange> {
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Stopped),
            exchange = self.exchange(request, target) => exchange,
        }
    }

    async fn exchange(&self, request: &TcpRequest, target: JobTarget) -> crate::Result<Exchange> {
        let addr = target.socket_addr();
        let deadline = Instant::now() + self.scanner.timeout();
        let mut stream = self.scanner.connect(addr).await?;
        let mut body = Vec::new();

        for input in &request.inputs {
            let data = match &input.payload {
                TcpPayload::Bytes(bytes) => bytes.clone(),
                TcpPayload::Text(text) => target.substitute(text).into_bytes(),
            };

            match tokio::time::timeout_at(deadline, stream.write_all(&data)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(classify_io_error(e, addr)),
                Err(_) => return Err(EngineError::Timeout),
            }

            if let Some(read) = input.read {
                body.extend(read_chunk(&mut stream, addr, read, deadline).await?);
            }
        }

        if request.read_size > 0 {
            match read_chunk(&mut stream, addr, request.read_size, deadline).await {
                Ok(chunk) => body.extend(chunk),
                // bytes from an input-level read already count as a reply
                Err(EngineError::Timeout) if !body.is_empty() => {}
                Err(e) => return Err(e),
            }
        }

        Ok(Exchange {
            matched_at: target.host_port(),
            response: Response::from_bytes(body),
        })
    }
}

async fn read_chunk(stream: &mut TcpStream, addr: SocketAddr, limit: usize, deadline: Instant) -> crate::Result<Vec<u8>> {
    let mut buffer = vec![0u8; limit];
    match tokio::time::timeout_at(deadline, stream.read(&mut buffer)).await {
        Ok(Ok(n)) => {
            buffer.truncate(n);
            Ok(buffer)
        }
        Ok(Err(e)) => Err(classify_io_error(e, addr)),
        Err(_) => Err(EngineError::Timeout),
    }
}

/// HTTP requests through reqwest.
///
/// Clients are shared per redirect policy; certificates are not verified
/// since targets are addressed by IP.
#[derive(Debug)]
pub struct HttpExecutor {
    timeout: Duration,
    clients: Mutex<HashMap<Option<usize>, reqwest::Client>>,
}

impl HttpExecutor {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client(&self, redirects: Option<usize>) -> crate::Result<reqwest::Client> {
        let mut clients = self.clients.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(client) = clients.get(&redirects) {
            return Ok(client.clone());
        }

        let policy = match redirects {
            Some(max) => reqwest::redirect::Policy::limited(max),
            None => reqwest::redirect::Policy::none(),
        };
        let client = reqwest::Client::builder()
            .timeout(self.timeout)
            .connect_timeout(self.timeout)
            .danger_accept_invalid_certs(true)
            .redirect(policy)
            .user_agent(concat!("eagleeye/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(classify_reqwest_error)?;
        clients.insert(redirects, client.clone());
        Ok(client)
    }

    /// Send every path of the block, in order.
    ///
    /// Each path gets the full timeout; cancellation abandons the request in
    /// flight and skips the remaining paths.
    pub async fn execute(
        &self,
        request: &HttpRequest,
        target: JobTarget,
        cancel: &CancellationToken,
    ) -> crate::Result<Vec<Exchange>> {
        let client = self.client(request.redirects.then_some(request.max_redirects))?;
        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|e| EngineError::Network(format!("method {}: {}", request.method, e)))?;

        let mut exchanges = Vec::with_capacity(request.paths.len());
        for path in &request.paths {
            let exchange = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Stopped),
                exchange = fetch(&client, &method, request, target, path) => exchange?,
            };
            exchanges.push(exchange);
        }

        Ok(exchanges)
    }
}

async fn fetch(
    client: &reqwest::Client,
    method: &reqwest::Method,
    request: &HttpRequest,
    target: JobTarget,
    path: &str,
) -> crate::Result<Exchange> {
    let url = request_url(path, target);
    let mut builder = client.request(method.clone(), &url);
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), target.substitute(value));
    }
    if let Some(body) = &request.body {
        builder = builder.body(target.substitute(body));
    }

    let mut response = builder.send().await.map_err(classify_reqwest_error)?;

    let status = response.status();
    let status_line = format!("{:?} {}", response.version(), status);
    let headers = response
        .headers()
        .iter()
        .map(|(name, value)| {
            format!(
                "{}: {}\r\n",
                canonical_header_name(name.as_str()),
                String::from_utf8_lossy(value.as_bytes())
            )
        })
        .collect::<String>();

    let mut body = Vec::new();
    while body.len() < request.max_size {
        match response.chunk().await.map_err(classify_reqwest_error)? {
            Some(chunk) => {
                let take = chunk.len().min(request.max_size - body.len());
                body.extend_from_slice(&chunk[..take]);
            }
            None => break,
        }
    }

    Ok(Exchange {
        matched_at: url,
        response: Response {
            status: Some(status.as_u16()),
            status_line,
            headers,
            body,
        },
    })
}

/// MIME canonical form of a header name: `content-type` becomes `Content-Type`.
///
/// The HTTP stack lowercases names on receipt; templates match against the
/// conventional casing.
fn canonical_header_name(name: &str) -> String {
    let mut upper = true;
    name.chars()
        .map(|c| {
            let mapped = if upper { c.to_ascii_uppercase() } else { c.to_ascii_lowercase() };
            upper = c == '-';
            mapped
        })
        .collect()
}

/// Paths normally start with `{{BaseURL}}`; bare paths are joined to it
fn request_url(path: &str, target: JobTarget) -> String {
    let expanded = target.substitute(path);
    if expanded.contains("://") {
        expanded
    } else if expanded.starts_with('/') {
        format!("{}{}", target.base_url(), expanded)
    } else {
        format!("{}/{}", target.base_url(), expanded)
    }
}

fn classify_reqwest_error(error: reqwest::Error) -> EngineError {
    if error.is_timeout() {
        return EngineError::Timeout;
    }

    let mut source = std::error::Error::source(&error);
    while let Some(cause) = source {
        if let Some(io) = cause.downcast_ref::<std::io::Error>() {
            if is_resource_exhaustion(io) {
                return EngineError::ResourceExhausted(error.to_string());
            }
        }
        source = cause.source();
    }

    EngineError::Network(error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::templates::{parse_template, Condition, MatcherSet, RawTemplate, TcpInput};
    use std::collections::BTreeMap;
    use tokio::net::TcpListener;

    async fn serve_once(reply: &'static [u8]) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buffer = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                match socket.read(&mut buffer).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => request.extend_from_slice(&buffer[..n]),
                }
            }
            let _ = socket.write_all(reply).await;
            let _ = socket.shutdown().await;
        });
        port
    }

    #[tokio::test]
    async fn test_tcp_exchange() {
        let port = serve_once(b"+PONG\r\n").await;
        let request = TcpRequest {
            inputs: vec![TcpInput {
                payload: TcpPayload::Text("PING {{Hostname}}\r\n\r\n".to_string()),
                read: None,
            }],
            ports: vec![port],
            plain_hosts: 1,
            tls_hosts: 0,
            read_size: 64,
            matchers: MatcherSet {
                condition: Condition::Or,
                matchers: Vec::new(),
            },
        };

        let target = JobTarget::new("127.0.0.1".parse().unwrap(), port);
        let exchange = TcpExecutor::new(Duration::from_secs(2)).execute(&request, target, &CancellationToken::new()).await.unwrap();
        assert_eq!(exchange.response.body, b"+PONG\r\n");
        assert_eq!(exchange.matched_at, format!("127.0.0.1:{}", port));
    }

    #[tokio::test]
    async fn test_http_exchange() {
        let port = serve_once(b"HTTP/1.1 200 OK\r\nServer: unit\r\nContent-Length: 5\r\nConnection: close\r\n\r\nhello").await;
        let request = HttpRequest {
            method: "GET".to_string(),
            paths: vec!["{{BaseURL}}/status".to_string()],
            headers: BTreeMap::new(),
            body: None,
            redirects: false,
            max_redirects: 0,
            max_size: 3,
            port: None,
            matchers: MatcherSet::default(),
        };

        let target = JobTarget::new("127.0.0.1".parse().unwrap(), port);
        let exchanges = HttpExecutor::new(Duration::from_secs(2))
            .execute(&request, target, &CancellationToken::new())
            .await
            .unwrap();

        let response = &exchanges[0].response;
        assert_eq!(response.status, Some(200));
        assert!(response.headers.contains("Server: unit\r\n"));
        assert!(response.headers.contains("Content-Length: 5\r\n"));
        assert_eq!(response.body, b"hel");
        assert_eq!(exchanges[0].matched_at, format!("http://127.0.0.1:{}/status", port));
    }

    #[test]
    fn test_request_url_joins_bare_paths() {
        let target = JobTarget::new("10.0.0.1".parse().unwrap(), 443);
        assert_eq!(request_url("admin", target), "https://10.0.0.1:443/admin");
        assert_eq!(request_url("{{RootURL}}/x", target), "https://10.0.0.1:443/x");
    }

    #[test]
    fn test_canonical_header_name() {
        assert_eq!(canonical_header_name("server"), "Server");
        assert_eq!(canonical_header_name("x-powered-by"), "X-Powered-By");
        assert_eq!(canonical_header_name("WWW-authenticate"), "Www-Authenticate");
    }

    #[tokio::test]
    async fn test_header_words_match_conventional_casing() {
        let port = serve_once(b"HTTP/1.1 200 OK\r\nServer: nginx/1.18\r\nContent-Length: 0\r\nConnection: close\r\n\r\n").await;
        let template = parse_template(&RawTemplate::new(
            "nginx",
            "id: nginx\nhttp:\n  - path: ['{{BaseURL}}/']\n    matchers:\n      - type: word\n        part: header\n        words: ['Server: nginx']\n",
        ))
        .unwrap();

        let target = JobTarget::new("127.0.0.1".parse().unwrap(), port);
        let exchanges = HttpExecutor::new(Duration::from_secs(2))
            .execute(&template.http[0], target, &CancellationToken::new())
            .await
            .unwrap();

        let outcome = template.http[0].matchers.evaluate(&exchanges[0].response);
        assert!(outcome.matched, "headers: {:?}", exchanges[0].response.headers);
    }

    #[tokio::test]
    async fn test_cancel_abandons_remaining_paths() {
        // accepts and never answers
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let request = HttpRequest {
            method: "GET".to_string(),
            paths: (0..5).map(|i| format!("{{{{BaseURL}}}}/{}", i)).collect(),
            headers: BTreeMap::new(),
            body: None,
            redirects: false,
            max_redirects: 0,
            max_size: 1024,
            port: None,
            matchers: MatcherSet::default(),
        };
        let cancel = CancellationToken::new();
        {
            let cancel = cancel.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50)).await;
                cancel.cancel();
            });
        }

        let target = JobTarget::new("127.0.0.1".parse().unwrap(), port);
        let start = std::time::Instant::now();
        let outcome = HttpExecutor::new(Duration::from_secs(2)).execute(&request, target, &cancel).await;

        assert!(matches!(outcome, Err(EngineError::Stopped)));
        assert!(start.elapsed() < Duration::from_secs(1), "took {:?}", start.elapsed());
    }
}
