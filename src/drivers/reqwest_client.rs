//! [`HttpClient`] backed by reqwest with rustls.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;

use crate::http::{HttpClient, HttpError, HttpResponse};

#[derive(Debug, Clone)]
pub struct ReqwestClient {
    client: reqwest::Client,
}

impl ReqwestClient {
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self { client })
    }

    async fn execute(
        &self,
        request: reqwest::RequestBuilder,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        let request = headers
            .iter()
            .fold(request.timeout(timeout), |req, (name, value)| {
                req.header(name.as_str(), value.as_str())
            });

        let response = request.send().await.map_err(map_error)?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();
        let body = response.text().await.map_err(map_error)?;

        Ok(HttpResponse {
            status,
            headers,
            body,
        })
    }
}

fn map_error(error: reqwest::Error) -> HttpError {
    if error.is_timeout() {
        HttpError::Timeout
    } else if error.is_connect() {
        HttpError::Connect(error.to_string())
    } else {
        HttpError::Request(error.to_string())
    }
}

#[async_trait]
impl HttpClient for ReqwestClient {
    async fn get(
        &self,
        url: &str,
        headers: &[(String, String)],
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        self.execute(self.client.get(url), headers, timeout).await
    }

    async fn post(
        &self,
        url: &str,
        headers: &[(String, String)],
        body: &str,
        timeout: Duration,
    ) -> Result<HttpResponse, HttpError> {
        self.execute(self.client.post(url).body(body.to_string()), headers, timeout)
            .await
    }
}
