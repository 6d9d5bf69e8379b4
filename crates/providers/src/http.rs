// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Minimal HTTP/1.1 client for the remote sandbox RPC.
//!
//! Sends bearer-authenticated requests over TCP and reads responses using
//! Content-Length framing (does not depend on connection close for EOF).

use crate::ProviderError;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;

/// Covers connect + write + read for one request.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Parsed response: status code and body.
pub(crate) struct HttpResponse {
    pub status: u16,
    pub body: String,
}

pub(crate) async fn get(addr: &str, token: &str, path: &str) -> Result<HttpResponse, ProviderError> {
    let request = format!(
        "GET {} HTTP/1.1\r\nHost: {}\r\nAuthorization: Bearer {}\r\n\r\n",
        path, addr, token
    );
    timed_request(addr, &request).await
}

pub(crate) async fn post(
    addr: &str,
    token: &str,
    path: &str,
    body: &str,
) -> Result<HttpResponse, ProviderError> {
    let request = format!(
        "POST {} HTTP/1.1\r\nHost: {}\r\nAuthorization: Bearer {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\n\r\n{}",
        path,
        addr,
        token,
        body.len(),
        body
    );
    timed_request(addr, &request).await
}

pub(crate) async fn delete(
    addr: &str,
    token: &str,
    path: &str,
) -> Result<HttpResponse, ProviderError> {
    let request = format!(
        "DELETE {} HTTP/1.1\r\nHost: {}\r\nAuthorization: Bearer {}\r\n\r\n",
        path, addr, token
    );
    timed_request(addr, &request).await
}

/// Connect, send, and read with a timeout covering the entire operation.
/// Prevents hangs when the service accepts the connection but never responds.
async fn timed_request(addr: &str, request: &str) -> Result<HttpResponse, ProviderError> {
    tokio::time::timeout(REQUEST_TIMEOUT, send_request(addr, request))
        .await
        .map_err(|_| ProviderError::Connection("HTTP request timed out".into()))?
}

async fn send_request(addr: &str, request: &str) -> Result<HttpResponse, ProviderError> {
    let mut stream = TcpStream::connect(addr)
        .await
        .map_err(|e| ProviderError::Connection(format!("connect failed: {}", e)))?;
    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| ProviderError::Connection(format!("write failed: {}", e)))?;

    let mut reader = BufReader::new(&mut stream);
    read_response(&mut reader).await
}

/// Read and parse an HTTP/1.1 response from a buffered stream.
async fn read_response<R: tokio::io::AsyncRead + Unpin>(
    reader: &mut BufReader<R>,
) -> Result<HttpResponse, ProviderError> {
    let mut status_line = String::new();
    reader
        .read_line(&mut status_line)
        .await
        .map_err(|e| ProviderError::Connection(format!("read failed: {}", e)))?;

    let status: u16 = status_line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .ok_or_else(|| ProviderError::Connection(format!("bad status line: {:?}", status_line)))?;

    // Headers; we only care about Content-Length.
    let mut content_length = 0usize;
    loop {
        let mut line = String::new();
        let n = reader
            .read_line(&mut line)
            .await
            .map_err(|e| ProviderError::Connection(format!("read failed: {}", e)))?;
        if n == 0 || line.trim().is_empty() {
            break;
        }
        if let Some(value) = line.to_ascii_lowercase().strip_prefix("content-length:") {
            content_length = value.trim().parse().unwrap_or(0);
        }
    }

    let mut body = vec![0u8; content_length];
    if content_length > 0 {
        reader
            .read_exact(&mut body)
            .await
            .map_err(|e| ProviderError::Connection(format!("read failed: {}", e)))?;
    }

    Ok(HttpResponse { status, body: String::from_utf8_lossy(&body).into_owned() })
}

#[cfg(test)]
#[path = "http_tests.rs"]
mod tests;
