//! Real outbound HTTP execution for dispatched requests.

use std::collections::BTreeMap;

use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use sealink_shared::protocol::{ProxyRequest, ProxyResponse};
use sealink_shared::{Error, Result};
use tracing::debug;

/// Thin wrapper over a shared reqwest client
#[derive(Clone)]
pub struct Fetcher {
    client: reqwest::Client,
}

impl Fetcher {
    pub fn new() -> Result<Self> {
        // The ship expects the target's response verbatim, so redirects
        // are passed through, not followed.
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|err| Error::Fetch(err.to_string()))?;
        Ok(Self { client })
    }

    /// Issue the request against its real target and capture the full
    /// response: status, headers, body.
    pub async fn execute(&self, request: &ProxyRequest) -> Result<ProxyResponse> {
        let method = Method::from_bytes(request.method.as_bytes())
            .map_err(|_| Error::Fetch(format!("invalid method {:?}", request.method)))?;
        let url = request.target_url();

        let mut headers = HeaderMap::new();
        for (name, value) in &request.headers {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => debug!("Skipping unforwardable header {:?}", name),
            }
        }

        let mut builder = self.client.request(method, url.as_str()).headers(headers);
        if !request.body.is_empty() {
            builder = builder.body(request.body.clone());
        }
        let response = builder
            .send()
            .await
            .map_err(|err| Error::Fetch(err.to_string()))?;

        let status_code = response.status().as_u16();
        let mut response_headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(text) = value.to_str() {
                // First value wins on repeats.
                response_headers
                    .entry(name.as_str().to_string())
                    .or_insert_with(|| text.to_string());
            }
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| Error::Fetch(err.to_string()))?
            .to_vec();

        Ok(ProxyResponse {
            status_code,
            headers: response_headers,
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    use super::*;

    /// Minimal canned HTTP origin for one connection
    async fn canned_origin(response: &'static [u8]) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            // Read the request head; canned origins don't parse bodies.
            let _ = stream.read(&mut buf).await.unwrap();
            stream.write_all(response).await.unwrap();
        });
        addr.to_string()
    }

    #[tokio::test]
    async fn captures_status_headers_and_body() {
        let addr = canned_origin(
            b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Origin: yes\r\n\r\nhello",
        )
        .await;
        let (host, port) = addr.rsplit_once(':').unwrap();

        let request = ProxyRequest {
            method: "GET".to_string(),
            protocol: "http".to_string(),
            hostname: host.to_string(),
            port: port.parse().unwrap(),
            path: "/".to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        };
        let response = Fetcher::new().unwrap().execute(&request).await.unwrap();
        assert_eq!(response.status_code, 200);
        assert_eq!(response.headers.get("x-origin").map(String::as_str), Some("yes"));
        assert_eq!(response.body, b"hello");
    }

    #[tokio::test]
    async fn redirects_are_captured_not_followed() {
        let addr = canned_origin(
            b"HTTP/1.1 302 Found\r\nLocation: http://example.com/\r\nContent-Length: 0\r\n\r\n",
        )
        .await;
        let (host, port) = addr.rsplit_once(':').unwrap();

        let request = ProxyRequest {
            method: "GET".to_string(),
            protocol: "http".to_string(),
            hostname: host.to_string(),
            port: port.parse().unwrap(),
            path: "/old".to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        };
        let response = Fetcher::new().unwrap().execute(&request).await.unwrap();
        assert_eq!(response.status_code, 302);
        assert_eq!(
            response.headers.get("location").map(String::as_str),
            Some("http://example.com/")
        );
    }

    #[tokio::test]
    async fn unreachable_target_is_a_fetch_error() {
        let request = ProxyRequest {
            method: "GET".to_string(),
            protocol: "http".to_string(),
            hostname: "127.0.0.1".to_string(),
            port: 1,
            path: "/".to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        };
        let result = Fetcher::new().unwrap().execute(&request).await;
        assert!(matches!(result, Err(Error::Fetch(_))));
    }
}
