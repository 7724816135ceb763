// src/imagery/provider.rs
use bytes::Bytes;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::utils::env::require_var;

pub const MAPBOX_TOKEN_VAR: &str = "MAPBOX_TOKEN";

/// Request parameters shared by every tile of one acquisition pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TileSpec {
    pub style: String,
    pub zoom: u8,
    pub width: u32,
    pub height: u32,
}

impl Default for TileSpec {
    fn default() -> Self {
        Self {
            style: "satellite-v9".to_string(),
            zoom: 18,
            width: 256,
            height: 256,
        }
    }
}

impl TileSpec {
    /// Parses `"256x256"` (or a single `"256"` for square tiles).
    pub fn parse_size(s: &str) -> Option<(u32, u32)> {
        let s = s.trim().to_ascii_lowercase();
        let (w, h) = match s.split_once('x') {
            Some((w, h)) => (w.trim().parse().ok()?, h.trim().parse().ok()?),
            None => {
                let side = s.parse().ok()?;
                (side, side)
            }
        };
        // Static Images API limit
        if w == 0 || h == 0 || w > 1280 || h > 1280 {
            return None;
        }
        Some((w, h))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TileRequest {
    pub lat: f64,
    pub lon: f64,
    pub spec: TileSpec,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("rate limited by imagery API")]
    RateLimited,

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("no imagery at this location")]
    NotFound,

    #[error("request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },
}

impl FetchError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchError::RateLimited | FetchError::Transient(_))
    }

    pub fn from_status(status: StatusCode, body: String) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            FetchError::RateLimited
        } else if status.is_server_error() {
            FetchError::Transient(format!("server error {}", status))
        } else if status == StatusCode::NOT_FOUND {
            FetchError::NotFound
        } else {
            FetchError::Rejected {
                status: status.as_u16(),
                body,
            }
        }
    }
}

/// A source of raster tiles. Implemented by the Mapbox client and by scripted
/// providers in tests.
#[allow(async_fn_in_trait)]
pub trait TileProvider {
    async fn fetch(&self, request: &TileRequest) -> Result<Bytes, FetchError>;
}

/// Mapbox Static Images API client.
pub struct MapboxClient {
    client: Client,
    base_url: Url,
    token: String,
}

impl MapboxClient {
    pub fn new(base_url: &str, token: String, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| anyhow::anyhow!("Invalid imagery base URL '{}': {}", base_url, e))?;
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("satellite-valuation/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// Reads the token from `MAPBOX_TOKEN`; fails before any request is made.
    pub fn from_env(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let token = require_var(MAPBOX_TOKEN_VAR)?;
        Self::new(base_url, token, timeout)
    }

    pub fn tile_url(&self, request: &TileRequest) -> Result<Url, FetchError> {
        let path = format!(
            "styles/v1/mapbox/{}/static/{},{},{}/{}x{}",
            request.spec.style,
            request.lon,
            request.lat,
            request.spec.zoom,
            request.spec.width,
            request.spec.height
        );
        let mut url = self.base_url.join(&path).map_err(|e| FetchError::Rejected {
            status: 0,
            body: format!("cannot build tile URL: {}", e),
        })?;
        url.query_pairs_mut().append_pair("access_token", &self.token);
        Ok(url)
    }
}

fn classify_transport_error(err: &reqwest::Error) -> FetchError {
    // reqwest embeds the full URL in its messages; strip it so the token never reaches logs.
    let kind = if err.is_timeout() {
        "timeout"
    } else if err.is_connect() {
        "connection failed"
    } else if err.is_body() || err.is_decode() {
        "body read failed"
    } else {
        "request failed"
    };
    FetchError::Transient(kind.to_string())
}

impl TileProvider for MapboxClient {
    async fn fetch(&self, request: &TileRequest) -> Result<Bytes, FetchError> {
        let url = self.tile_url(request)?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            return Err(FetchError::from_status(status, body));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| classify_transport_error(&e))?;
        if bytes.is_empty() {
            return Err(FetchError::Transient("empty response body".to_string()));
        }
        Ok(bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tile_url_layout() {
        let client = MapboxClient::new(
            "https://api.mapbox.com",
            "pk.test".to_string(),
            Duration::from_secs(10),
        )
        .unwrap();
        let request = TileRequest {
            lat: 47.5112,
            lon: -122.257,
            spec: TileSpec::default(),
        };
        assert_eq!(
            client.tile_url(&request).unwrap().as_str(),
            "https://api.mapbox.com/styles/v1/mapbox/satellite-v9/static/-122.257,47.5112,18/256x256?access_token=pk.test"
        );
    }

    #[test]
    fn test_status_classification() {
        assert!(matches!(
            FetchError::from_status(StatusCode::TOO_MANY_REQUESTS, String::new()),
            FetchError::RateLimited
        ));
        assert!(FetchError::from_status(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(matches!(
            FetchError::from_status(StatusCode::NOT_FOUND, String::new()),
            FetchError::NotFound
        ));
        let rejected = FetchError::from_status(StatusCode::UNAUTHORIZED, "bad token".into());
        assert!(!rejected.is_retryable());
        assert!(matches!(rejected, FetchError::Rejected { status: 401, .. }));
    }

    #[test]
    fn test_parse_size() {
        assert_eq!(TileSpec::parse_size("256x256"), Some((256, 256)));
        assert_eq!(TileSpec::parse_size("512"), Some((512, 512)));
        assert_eq!(TileSpec::parse_size("0x10"), None);
        assert_eq!(TileSpec::parse_size("wide"), None);
    }
}
