//! HTTP source adapter
//!
//! One reqwest client shared by every provider, built on first use and dropped
//! by [`HttpSourceAdapter::shutdown`]. Requests are plain GETs against the
//! provider's URL template; there are no retries.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::Mutex;
use url::form_urlencoded;

use super::{FetchFailure, RawPayload, SourceAdapter};
use crate::config::BrokerConfig;
use crate::lookup::{LookupKind, ResponseMode};

/// A resolved provider endpoint.
#[derive(Debug, Clone)]
pub struct Endpoint {
    template: String,
    key: Option<String>,
    mode: ResponseMode,
    timeout: Duration,
}

impl Endpoint {
    pub fn new(template: impl Into<String>, mode: ResponseMode, timeout: Duration) -> Self {
        Self {
            template: template.into(),
            key: None,
            mode,
            timeout,
        }
    }

    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn mode(&self) -> ResponseMode {
        self.mode
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Substitute `{query}` and `{key}`, both URL-encoded.
    pub fn url_for(&self, query: &str) -> String {
        let mut url = self.template.replace("{query}", &encode(query));
        if let Some(key) = &self.key {
            url = url.replace("{key}", &encode(key));
        }
        url
    }
}

fn encode(value: &str) -> String {
    form_urlencoded::byte_serialize(value.as_bytes()).collect()
}

pub struct HttpSourceAdapter {
    endpoints: BTreeMap<LookupKind, Endpoint>,
    client: Mutex<Option<Client>>,
}

impl HttpSourceAdapter {
    pub fn new(endpoints: impl IntoIterator<Item = (LookupKind, Endpoint)>) -> Self {
        Self {
            endpoints: endpoints.into_iter().collect(),
            client: Mutex::new(None),
        }
    }

    /// Build endpoints from configuration. A provider whose key variable is
    /// unset is left out and its kind fails as unconfigured.
    pub fn from_config(config: &BrokerConfig) -> Self {
        let endpoints = config.providers.iter().filter_map(|(kind, provider)| {
            let endpoint = Endpoint::new(
                provider.endpoint.clone(),
                provider.response_mode(*kind),
                provider.timeout(*kind),
            );
            match provider.resolve_key() {
                Ok(None) => Some((*kind, endpoint)),
                Ok(Some(key)) => Some((*kind, endpoint.with_key(key))),
                Err(var) => {
                    tracing::warn!(%kind, %var, "provider key variable unset; kind disabled");
                    None
                }
            }
        });
        Self::new(endpoints)
    }

    pub fn is_configured(&self, kind: LookupKind) -> bool {
        self.endpoints.contains_key(&kind)
    }

    /// The shared client, building it if needed. The lock is released before
    /// any request is sent.
    async fn client(&self) -> Result<Client, FetchFailure> {
        let mut guard = self.client.lock().await;
        if let Some(client) = guard.as_ref() {
            return Ok(client.clone());
        }
        let client = Client::builder()
            .build()
            .map_err(|e| FetchFailure::Transport(format!("failed to create HTTP client: {e}")))?;
        tracing::debug!("http client opened");
        *guard = Some(client.clone());
        Ok(client)
    }

    pub async fn is_open(&self) -> bool {
        self.client.lock().await.is_some()
    }
}

#[async_trait]
impl SourceAdapter for HttpSourceAdapter {
    async fn fetch(&self, kind: LookupKind, query: &str) -> Result<RawPayload, FetchFailure> {
        let endpoint = self
            .endpoints
            .get(&kind)
            .ok_or(FetchFailure::Unconfigured(kind))?;
        let client = self.client().await?;

        let response = client
            .get(endpoint.url_for(query))
            .timeout(endpoint.timeout)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    FetchFailure::Timeout
                } else {
                    FetchFailure::Transport(e.to_string())
                }
            })?;

        let status = response.status();
        if status != StatusCode::OK {
            return Err(FetchFailure::Status(status.as_u16()));
        }

        let body_error = |e: reqwest::Error| {
            if e.is_timeout() {
                FetchFailure::Timeout
            } else {
                FetchFailure::Decode(e.to_string())
            }
        };
        let payload = match endpoint.mode {
            ResponseMode::Json => RawPayload::Json(response.bytes().await.map_err(body_error)?.to_vec()),
            ResponseMode::Text => RawPayload::Text(response.text().await.map_err(body_error)?),
        };
        tracing::debug!(%kind, bytes = payload.len(), "provider responded");
        Ok(payload)
    }

    async fn shutdown(&self) {
        if self.client.lock().await.take().is_some() {
            tracing::debug!("http client closed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_template_encodes_query_and_key() {
        let endpoint = Endpoint::new(
            "https://upi.example.invalid/?upi_id={query}&key={key}",
            ResponseMode::Json,
            Duration::from_secs(15),
        )
        .with_key("a&b");
        assert_eq!(
            endpoint.url_for("someone@bank"),
            "https://upi.example.invalid/?upi_id=someone%40bank&key=a%26b"
        );
    }

    #[test]
    fn template_without_placeholders_is_unchanged() {
        let endpoint = Endpoint::new("https://x.example.invalid/", ResponseMode::Text, Duration::from_secs(1));
        assert_eq!(endpoint.url_for("1.2.3.4"), "https://x.example.invalid/");
    }

    #[tokio::test]
    async fn unconfigured_kind_fails_without_opening_a_client() {
        let adapter = HttpSourceAdapter::new(Vec::<(LookupKind, Endpoint)>::new());
        let err = adapter.fetch(LookupKind::Upi, "someone@bank").await.unwrap_err();
        assert_eq!(err, FetchFailure::Unconfigured(LookupKind::Upi));
        assert!(!adapter.is_open().await);
    }

    #[test]
    fn from_config_skips_providers_with_unset_keys() {
        let yaml = r#"
providers:
  number:
    endpoint: "https://n.example.invalid/?term={query}&key={key}"
    key_env: LOOKUP_BROKER_TEST_KEY_THAT_IS_NEVER_SET
  ip:
    endpoint: "https://ip.example.invalid/?ip={query}"
"#;
        let config = BrokerConfig::from_yaml_str(yaml).unwrap();
        let adapter = HttpSourceAdapter::from_config(&config);
        assert!(!adapter.is_configured(LookupKind::Number));
        assert!(adapter.is_configured(LookupKind::Ip));
        assert_eq!(adapter.endpoints[&LookupKind::Ip].mode(), ResponseMode::Text);
    }

    #[test]
    fn blank_key_disables_the_provider() {
        std::env::set_var("LOOKUP_BROKER_TEST_BLANK_KEY", "  ");
        std::env::set_var("LOOKUP_BROKER_TEST_REAL_KEY", "k1");
        let yaml = r#"
providers:
  number:
    endpoint: "https://n.example.invalid/?term={query}&key={key}"
    key_env: LOOKUP_BROKER_TEST_BLANK_KEY
  upi:
    endpoint: "https://u.example.invalid/?vpa={query}&key={key}"
    key_env: LOOKUP_BROKER_TEST_REAL_KEY
"#;
        let config = BrokerConfig::from_yaml_str(yaml).unwrap();
        assert_eq!(
            config.providers[&LookupKind::Number].resolve_key(),
            Err("LOOKUP_BROKER_TEST_BLANK_KEY".to_string())
        );

        let adapter = HttpSourceAdapter::from_config(&config);
        assert!(!adapter.is_configured(LookupKind::Number));
        assert_eq!(
            adapter.endpoints[&LookupKind::Upi].url_for("a@b"),
            "https://u.example.invalid/?vpa=a%40b&key=k1"
        );
    }
}
