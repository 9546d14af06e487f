//! Request/response seam between the job client and the simulation service.
//!
//! [`SirepoClient`](crate::client::SirepoClient) only ever talks to a `dyn Transport`: the
//! blocking HTTP implementation below for a real server, or the in-process
//! [`SimServer`](crate::sim::SimServer) in tests and offline runs.

use std::time::Duration;

use reqwest::blocking::Client;
use serde_json::Value as Json;

use crate::config::SirepoConfig;
use crate::error::*;

pub trait Transport: Send + Sync {
    /// POSTs `payload` as JSON to `endpoint` (relative to the server root) and decodes the body.
    fn post_json(&self, endpoint: &str, payload: &Json) -> SirepoResult<Json>;

    /// GETs the raw body of `endpoint`.
    fn get_bytes(&self, endpoint: &str) -> SirepoResult<Vec<u8>>;

    /// Human-readable location of the service, used in log lines.
    fn describe(&self) -> String;
}

/// Blocking HTTP transport holding the session cookie issued at login.
///
/// The cookie store lives inside the `reqwest` client, so every clone of a
/// [`SirepoClient`](crate::client::SirepoClient) that shares this transport reuses the session.
pub struct HttpTransport {
    server: String,
    client: Client,
}

impl HttpTransport {
    pub fn new(server: &str) -> SirepoResult<Self> {
        Self::with_timeout(server, None)
    }

    pub fn from_config(config: &SirepoConfig) -> SirepoResult<Self> {
        Self::with_timeout(
            &config.server,
            config.request_timeout_secs.map(Duration::from_secs_f64),
        )
    }

    fn with_timeout(server: &str, timeout: Option<Duration>) -> SirepoResult<Self> {
        let mut builder = Client::builder().cookie_store(true);
        if let Some(timeout) = timeout {
            builder = builder.timeout(timeout);
        }
        Ok(Self {
            server: server.trim_end_matches('/').to_string(),
            client: builder.build()?,
        })
    }

    fn url(&self, endpoint: &str) -> String {
        format!("{}/{}", self.server, endpoint.trim_start_matches('/'))
    }
}

impl Transport for HttpTransport {
    fn post_json(&self, endpoint: &str, payload: &Json) -> SirepoResult<Json> {
        let url = self.url(endpoint);
        let res = self.client.post(&url).json(payload).send()?;
        if !res.status().is_success() {
            return Err(SirepoError::Http {
                url,
                status: res.status().as_u16(),
            });
        }
        Ok(res.json()?)
    }

    fn get_bytes(&self, endpoint: &str) -> SirepoResult<Vec<u8>> {
        let url = self.url(endpoint);
        let res = self.client.get(&url).send()?;
        if !res.status().is_success() {
            return Err(SirepoError::Http {
                url,
                status: res.status().as_u16(),
            });
        }
        Ok(res.bytes()?.to_vec())
    }

    fn describe(&self) -> String {
        self.server.clone()
    }
}

#[cfg(test)]
mod test {
    mod http {
        use crate::transport::*;

        #[test]
        fn urls_are_joined_once() {
            let transport = HttpTransport::new("http://localhost:8000/").unwrap();
            assert_eq!(
                transport.url("/auth-bluesky-login"),
                "http://localhost:8000/auth-bluesky-login"
            );
            assert_eq!(transport.describe(), "http://localhost:8000");
        }
    }
}
