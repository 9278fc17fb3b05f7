//! The single-call HTTP contract the minting protocols run over
//!
//! The gateway is injectable per server so hosts can route token traffic
//! through their own client, proxy or test double. Implementations perform
//! exactly one round-trip: retry policy belongs to the token server, and an
//! HTTP status of 400 or above is data for the caller, not an error.

use std::fmt;

use async_trait::async_trait;
use serde::de::DeserializeOwned;

use crate::error::Error;

/// The request methods the minting protocols use
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    /// An HTTP GET
    Get,
    /// An HTTP POST
    Post,
}

/// A single outbound HTTP request
#[derive(Clone, Debug)]
pub struct Request {
    /// The request method
    pub method: Method,
    /// The absolute request URL
    pub url: String,
    /// Header name/value pairs, sent verbatim
    pub headers: Vec<(String, String)>,
    /// The raw request body; empty for GET
    pub body: Vec<u8>,
}

impl Request {
    /// Constructs a GET request
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: Method::Get,
            url: url.into(),
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    /// Constructs a POST request with a body
    pub fn post(url: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            method: Method::Post,
            url: url.into(),
            headers: Vec::new(),
            body: body.into(),
        }
    }

    /// Appends a header
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// The response to a [`Request`]
#[derive(Clone, Debug)]
pub struct Response {
    /// The HTTP status code
    pub status: u16,
    /// Response headers as received
    pub headers: Vec<(String, String)>,
    /// The raw response body
    pub body: Vec<u8>,
}

impl Response {
    /// The body as text, lossily decoded
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub(crate) fn json<T: DeserializeOwned>(&self) -> Result<T, Error> {
        serde_json::from_slice(&self.body).map_err(Error::decode)
    }
}

/// An abstract single-call HTTP transport
///
/// Implementations MUST NOT retry and MUST surface any status as a
/// [`Response`]; only a failure to complete the round-trip at all is an
/// error.
#[async_trait]
pub trait HttpGateway: Send + Sync + fmt::Debug {
    /// Performs one HTTP round-trip
    async fn call(&self, request: Request) -> Result<Response, Error>;
}

/// The default gateway, backed by a shared [`reqwest::Client`]
///
/// The client's connection pool is reused across every call made through
/// this gateway.
#[derive(Clone, Debug, Default)]
pub struct ReqwestGateway {
    client: reqwest::Client,
}

impl ReqwestGateway {
    /// Constructs a gateway over an existing client
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpGateway for ReqwestGateway {
    async fn call(&self, request: Request) -> Result<Response, Error> {
        let method = match request.method {
            Method::Get => reqwest::Method::GET,
            Method::Post => reqwest::Method::POST,
        };

        let mut builder = self.client.request(method, request.url.as_str());
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if !request.body.is_empty() {
            builder = builder.body(request.body);
        }

        let response = builder.send().await.map_err(Error::transport)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response.bytes().await.map_err(Error::transport)?.to_vec();

        Ok(Response {
            status,
            headers,
            body,
        })
    }
}
