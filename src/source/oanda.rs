//! OANDA v20 REST client for instruments and mid-price candles.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, SecondsFormat};
use reqwest::Client;
use serde::Deserialize;

use crate::error::{SyncError, SyncResult};
use crate::model::{Granularity, RawCandle};

use super::CandleSource;

#[derive(Clone)]
pub struct OandaClient {
    client: Client,
    base_url: String,
    account_id: String,
}

#[derive(Debug, Deserialize)]
struct CandlesResponse {
    #[serde(default)]
    candles: Vec<RawCandle>,
}

#[derive(Debug, Deserialize)]
struct InstrumentsResponse {
    #[serde(default)]
    instruments: Vec<InstrumentInfo>,
}

#[derive(Debug, Deserialize)]
struct InstrumentInfo {
    name: String,
}

impl OandaClient {
    pub fn new(base_url: String, account_id: String, api_token: &str) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(30))
            .pool_max_idle_per_host(10)
            .pool_idle_timeout(Duration::from_secs(90))
            .default_headers({
                let mut headers = reqwest::header::HeaderMap::new();
                headers.insert(
                    reqwest::header::AUTHORIZATION,
                    format!("Bearer {}", api_token)
                        .parse()
                        .context("Invalid API token")?,
                );
                headers
            })
            .build()
            .context("Failed to build OandaClient")?;

        Ok(Self {
            client,
            base_url,
            account_id,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_candles(
        &self,
        instrument: &str,
        query: &[(&str, String)],
    ) -> SyncResult<Vec<RawCandle>> {
        let url = self.url(&format!("/v3/instruments/{instrument}/candles"));
        let resp = self
            .client
            .get(&url)
            .query(query)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("GET {url} failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(SyncError::Transport(format!("GET {url} {status}: {text}")));
        }

        let body = resp
            .json::<CandlesResponse>()
            .await
            .map_err(|e| SyncError::Transport(format!("parsing candles response: {e}")))?;
        Ok(body.candles)
    }
}

fn fmt_time(t: DateTime<FixedOffset>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[async_trait]
impl CandleSource for OandaClient {
    async fn list_instruments(&self) -> SyncResult<Vec<String>> {
        let url = self.url(&format!("/v3/accounts/{}/instruments", self.account_id));
        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("GET {url} failed: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(SyncError::Transport(format!("GET {url} {status}: {text}")));
        }

        let body = resp
            .json::<InstrumentsResponse>()
            .await
            .map_err(|e| SyncError::Transport(format!("parsing instruments response: {e}")))?;
        Ok(body.instruments.into_iter().map(|i| i.name).collect())
    }

    async fn fetch_by_range(
        &self,
        instrument: &str,
        granularity: Granularity,
        from: DateTime<FixedOffset>,
        to: DateTime<FixedOffset>,
    ) -> SyncResult<Vec<RawCandle>> {
        let query = [
            ("granularity", granularity.as_str().to_string()),
            ("price", "M".to_string()),
            ("from", fmt_time(from)),
            ("to", fmt_time(to)),
        ];
        self.get_candles(instrument, &query).await
    }

    async fn fetch_by_count(
        &self,
        instrument: &str,
        granularity: Granularity,
        count: u32,
    ) -> SyncResult<Vec<RawCandle>> {
        let query = [
            ("granularity", granularity.as_str().to_string()),
            ("price", "M".to_string()),
            ("count", count.to_string()),
        ];
        self.get_candles(instrument, &query).await
    }
}
