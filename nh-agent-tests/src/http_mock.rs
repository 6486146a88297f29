//! A minimal single-purpose HTTP/1.1 server for exercising the downloader
//! against real sockets instead of mocking `reqwest` itself. It understands
//! just enough of the protocol to serve fixed bodies, redirects, and
//! Range-resumed partial content — the shapes spec 8's download scenarios
//! need.

use std::convert::Infallible;
use std::net::SocketAddr;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

/// Reads and discards a request's headers, returning the value of the
/// `Range` header if one was sent.
async fn read_request(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 512];
    loop {
        let n = stream.read(&mut chunk).await.ok()?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&buf);
    text.lines()
        .find(|line| line.to_ascii_lowercase().starts_with("range:"))
        .and_then(|line| line.split(':').nth(1))
        .map(|v| v.trim().to_string())
}

async fn write_response(stream: &mut TcpStream, status_line: &str, headers: &[(&str, String)], body: &[u8]) {
    let mut response = format!("HTTP/1.1 {status_line}\r\n");
    for (name, value) in headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("connection: close\r\n\r\n");
    let _ = stream.write_all(response.as_bytes()).await;
    let _ = stream.write_all(body).await;
    let _ = stream.shutdown().await;
}

/// Serves `body` in full on every connection. Returns the `http://` URL to
/// fetch it from and the listener's background task.
pub async fn serve_once(body: Vec<u8>) -> (String, JoinHandle<Infallible>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    let url = format!("http://{addr}/file.bin");

    let handle = tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let body = body.clone();
            tokio::spawn(async move {
                read_request(&mut stream).await;
                write_response(
                    &mut stream,
                    "200 OK",
                    &[("content-length", body.len().to_string())],
                    &body,
                )
                .await;
            });
        }
    });

    (url, handle)
}

/// Serves `redirect_body` via a single `302 Found` to a second internal
/// listener that then serves `final_body` in full, per spec 8 scenario 4.
pub async fn serve_redirect(final_body: Vec<u8>) -> (String, JoinHandle<Infallible>, JoinHandle<Infallible>) {
    let (final_url, final_handle) = serve_once(final_body).await;

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind redirect server");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    let url = format!("http://{addr}/redirect.bin");
    let location = final_url.clone();

    let redirect_handle = tokio::spawn(async move {
        loop {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let location = location.clone();
            tokio::spawn(async move {
                read_request(&mut stream).await;
                write_response(&mut stream, "302 Found", &[("location", location)], b"").await;
            });
        }
    });

    (url, redirect_handle, final_handle)
}

/// Serves `body` across two connections: the first closes after `drop_after`
/// bytes with no `Content-Length` (simulating a mid-download reset); the
/// second honors the `Range` header the downloader retries with and serves
/// the remainder as `206 Partial Content`. Per spec 8 scenario 2.
pub async fn serve_resumed(body: Vec<u8>, drop_after: usize) -> (String, JoinHandle<Infallible>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind mock server");
    let addr: SocketAddr = listener.local_addr().expect("local addr");
    let url = format!("http://{addr}/file.bin");
    let total = body.len();

    let handle = tokio::spawn(async move {
        let mut connection = 0u32;
        loop {
            let (mut stream, _) = listener.accept().await.expect("accept");
            let body = body.clone();
            connection += 1;
            let first_connection = connection == 1;
            tokio::spawn(async move {
                let range = read_request(&mut stream).await;
                if first_connection {
                    let prefix = &body[..drop_after.min(body.len())];
                    let _ = stream
                        .write_all(format!("HTTP/1.1 200 OK\r\ncontent-length: {total}\r\n\r\n").as_bytes())
                        .await;
                    let _ = stream.write_all(prefix).await;
                    let _ = stream.shutdown().await;
                    return;
                }

                let start = range
                    .as_deref()
                    .and_then(|r| r.strip_prefix("bytes="))
                    .and_then(|r| r.split('-').next())
                    .and_then(|n| n.parse::<usize>().ok())
                    .unwrap_or(0);
                let remainder = &body[start.min(body.len())..];
                write_response(
                    &mut stream,
                    "206 Partial Content",
                    &[
                        ("content-length", remainder.len().to_string()),
                        ("content-range", format!("bytes {start}-{total}/{total}")),
                    ],
                    remainder,
                )
                .await;
            });
        }
    });

    (url, handle)
}
