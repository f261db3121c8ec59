use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use url::Url;

use crate::cache::Record;
use crate::config::RemoteConfig;

use super::{RemoteError, RemoteSource};

/// Wire shape of a record on the records endpoint.
#[derive(Debug, Serialize, Deserialize)]
struct RecordBody {
  key: String,
  payload: Value,
  version: u64,
}

impl From<RecordBody> for Record {
  fn from(body: RecordBody) -> Self {
    Record::new(body.key, body.payload, body.version)
  }
}

/// JSON-over-HTTP remote source.
///
/// `GET {base}/records/{key}` fetches, `PUT {base}/records/{key}` pushes.
#[derive(Clone)]
pub struct HttpRemote {
  client: reqwest::Client,
  base_url: Url,
  token: Option<String>,
}

impl HttpRemote {
  pub fn new(config: &RemoteConfig, token: Option<String>) -> Result<Self> {
    let base_url = Url::parse(&config.url)
      .map_err(|e| eyre!("Invalid remote url '{}': {}", config.url, e))?;
    if base_url.cannot_be_a_base() {
      return Err(eyre!("Remote url '{}' cannot be used as a base", config.url));
    }

    let client = reqwest::Client::builder()
      .timeout(Duration::from_secs(config.timeout_secs))
      .user_agent(concat!("nimbus-sync/", env!("CARGO_PKG_VERSION")))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url,
      token,
    })
  }

  fn record_url(&self, key: &str) -> Url {
    let mut url = self.base_url.clone();
    // cannot_be_a_base was rejected in new()
    if let Ok(mut segments) = url.path_segments_mut() {
      segments.pop_if_empty().push("records").push(key);
    }
    url
  }

  fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
    match &self.token {
      Some(token) => request.bearer_auth(token),
      None => request,
    }
  }

  async fn send(&self, request: reqwest::RequestBuilder) -> Result<Record, RemoteError> {
    let response = self.authorize(request).send().await?;
    let status = response.status();

    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      return Err(RemoteError::from_status(status, &body));
    }

    let body: RecordBody = response.json().await?;
    Ok(body.into())
  }
}

#[async_trait]
impl RemoteSource for HttpRemote {
  async fn fetch(&self, key: &str) -> Result<Record, RemoteError> {
    let url = self.record_url(key);
    debug!(%url, "fetching record");
    self.send(self.client.get(url)).await
  }

  async fn push(&self, record: &Record) -> Result<Record, RemoteError> {
    let url = self.record_url(&record.key);
    debug!(%url, version = record.version, "pushing record");

    let body = RecordBody {
      key: record.key.clone(),
      payload: record.payload.clone(),
      version: record.version,
    };
    self.send(self.client.put(url).json(&body)).await
  }
}
