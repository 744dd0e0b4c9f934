//! 🔌 connection.rs: the one place in the crate allowed to touch a socket.
//!
//! A [`Connection`] is a pooled `reqwest::Client` plus the list of cluster addresses,
//! the auth flavour of the day, and the TLS knobs. Every component that needs to talk
//! to the cluster opens one at the start of its life and closes it at the end. In between,
//! it's "send this method to this path with this body, give me the text back."
//!
//! 🔄 Host selection is round-robin across `addresses`. A transport failure on one node
//! falls over to the next; an HTTP error status does not (the node answered, it just
//! didn't like us). Non-2xx replies surface as [`ConnectorError::Connection`].
//!
//! 🦆 The duck is not authenticated. The duck does not need to be.

use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, Url};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, trace, warn};

use crate::backends::BulkTransport;
use crate::error::{ConnectorError, Result};

const APPLICATION_JSON: &str = "application/json";
// ⚠️ not application/json. the bulk API is picky and it is right to be.
const APPLICATION_NDJSON: &str = "application/x-ndjson";

/// 📡 Where the cluster lives and how to knock on its door.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct ConnectionConfig {
    /// 📡 Node URLs, scheme and port included. At least one. Yes, `localhost` needs `http://`.
    pub addresses: Vec<String>,
    /// 📦 The index every request is aimed at.
    pub index: String,
    /// 🏷️ Mapping type. Only the legacy dialects put it on the wire.
    #[serde(default = "default_doc_type", alias = "type")]
    pub doc_type: String,
    /// 🔒 Basic auth username.
    #[serde(default)]
    pub username: Option<String>,
    /// 🔒 Basic auth password.
    #[serde(default)]
    pub password: Option<String>,
    /// 🔒 API key. Beats basic auth when both are set.
    #[serde(default)]
    pub api_key: Option<String>,
    /// 🔐 PEM file holding the client certificate chain and its private key.
    #[serde(default)]
    pub client_cert_path: Option<PathBuf>,
    /// ⚠️ Accept self-signed server certificates. Dev clusters only, please.
    #[serde(default)]
    pub trust_self_signed_certs: bool,
    /// ⏱️ Per-request read timeout.
    #[serde(default)]
    pub socket_timeout_ms: Option<u64>,
    /// ⏱️ TCP/TLS connect timeout.
    #[serde(default)]
    pub connect_timeout_ms: Option<u64>,
}

fn default_doc_type() -> String {
    "_doc".to_string()
}

impl ConnectionConfig {
    /// 🏗️ Minimal config: addresses, index, type. Everything else off.
    pub fn new(
        addresses: Vec<String>,
        index: impl Into<String>,
        doc_type: impl Into<String>,
    ) -> Result<Self> {
        let config = Self {
            addresses,
            index: index.into(),
            doc_type: doc_type.into(),
            username: None,
            password: None,
            api_key: None,
            client_cert_path: None,
            trust_self_signed_certs: false,
            socket_timeout_ms: None,
            connect_timeout_ms: None,
        };
        config.validate()?;
        Ok(config)
    }

    /// 🔍 addresses non-empty, index and type named.
    pub fn validate(&self) -> Result<()> {
        if self.addresses.is_empty() {
            return Err(ConnectorError::Configuration(
                "addresses can not be empty".to_string(),
            ));
        }
        if self.index.is_empty() {
            return Err(ConnectorError::Configuration(
                "index can not be empty".to_string(),
            ));
        }
        if self.doc_type.is_empty() {
            return Err(ConnectorError::Configuration(
                "type can not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// 🔒 The three moods of authentication.
#[derive(Clone)]
enum Auth {
    Anonymous,
    Basic {
        username: String,
        password: Option<String>,
    },
    ApiKey(String),
}

// 🎭 hand-rolled so secrets stay out of debug logs
impl std::fmt::Debug for Auth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Auth::Anonymous => f.write_str("Anonymous"),
            Auth::Basic { username, .. } => write!(f, "Basic({username}, ***)"),
            Auth::ApiKey(_) => f.write_str("ApiKey(***)"),
        }
    }
}

impl Auth {
    fn from_config(config: &ConnectionConfig) -> Self {
        // 🔒 api_key is the premium tier. basic auth is economy. nothing is standby.
        if let Some(ref api_key) = config.api_key {
            Auth::ApiKey(api_key.clone())
        } else if let Some(ref username) = config.username {
            Auth::Basic {
                username: username.clone(),
                password: config.password.clone(),
            }
        } else {
            Auth::Anonymous
        }
    }

    fn apply(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match self {
            Auth::Anonymous => request,
            Auth::Basic { username, password } => request.basic_auth(username, password.as_ref()),
            Auth::ApiKey(key) => request.header("Authorization", format!("ApiKey {key}")),
        }
    }
}

/// 🔌 A request-capable handle to the cluster.
#[derive(Debug)]
pub struct Connection {
    client: reqwest::Client,
    addresses: Vec<String>,
    next_address: AtomicUsize,
    auth: Auth,
    bulk_path: String,
}

impl Connection {
    /// 🚀 Build the HTTP client from the config. No request is sent yet.
    pub async fn open(config: &ConnectionConfig) -> Result<Self> {
        config.validate()?;

        let mut builder = reqwest::Client::builder();
        if let Some(ms) = config.connect_timeout_ms {
            builder = builder.connect_timeout(Duration::from_millis(ms));
        }
        if let Some(ms) = config.socket_timeout_ms {
            builder = builder.read_timeout(Duration::from_millis(ms));
        }
        if let Some(ref cert_path) = config.client_cert_path {
            let pem = tokio::fs::read(cert_path).await.map_err(|e| {
                ConnectorError::Configuration(format!(
                    "can't load the client certificate from '{}': {e}",
                    cert_path.display()
                ))
            })?;
            let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
                ConnectorError::Configuration(format!(
                    "client certificate '{}' is not a usable PEM identity: {e}",
                    cert_path.display()
                ))
            })?;
            builder = builder.identity(identity);
        }
        if config.trust_self_signed_certs {
            warn!("⚠️ trusting self-signed certificates: fine for a dev cluster, a confession anywhere else");
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder.build().map_err(|e| {
            ConnectorError::Configuration(format!(
                "the HTTP client refused to be born (TLS setup?): {e}"
            ))
        })?;

        debug!(
            "🔌 connection opened to {} address(es) for index '{}'",
            config.addresses.len(),
            config.index
        );
        Ok(Self {
            client,
            addresses: config.addresses.clone(),
            next_address: AtomicUsize::new(0),
            auth: Auth::from_config(config),
            bulk_path: "/_bulk".to_string(),
        })
    }

    /// 🎯 Post bulk requests here instead of `/_bulk`. Lines with an empty `{}` header
    /// then land in the index (and type) the path names.
    pub fn with_bulk_path(mut self, path: impl Into<String>) -> Self {
        self.bulk_path = path.into();
        self
    }

    /// 🗑️ Release the handle. The pool drains when the client drops.
    pub fn close(self) {
        debug!("🗑️ connection closed");
    }

    /// 📡 Send one request, JSON body in, response text out.
    pub async fn perform(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<&str>,
    ) -> Result<String> {
        self.perform_with_content_type(method, path, params, body, APPLICATION_JSON)
            .await
    }

    /// 📡 Same as [`Connection::perform`], parsed as JSON.
    pub async fn perform_json(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<&str>,
    ) -> Result<Value> {
        let text = self.perform(method, path, params, body).await?;
        serde_json::from_str(&text).map_err(|e| {
            ConnectorError::MalformedResponse(format!("{path} did not answer with JSON: {e}"))
        })
    }

    async fn perform_with_content_type(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
        body: Option<&str>,
        content_type: &str,
    ) -> Result<String> {
        let address_count = self.addresses.len();
        let first = self.next_address.fetch_add(1, Ordering::Relaxed) % address_count;
        let mut last_failure = String::new();

        for offset in 0..address_count {
            let address = &self.addresses[(first + offset) % address_count];
            let url = build_url(address, path, params)?;
            trace!("📡 {} {}", method, url);

            let mut request = self.client.request(method.clone(), url);
            if let Some(body) = body {
                request = request
                    .header("Content-Type", content_type)
                    .body(body.to_string());
            }
            request = self.auth.apply(request);

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    let text = response.text().await.map_err(|e| {
                        ConnectorError::Connection(format!(
                            "{method} {path}: reading the response body failed: {e}"
                        ))
                    })?;
                    if !status.is_success() {
                        return Err(ConnectorError::Connection(format!(
                            "{method} {path} answered {status}: {text}"
                        )));
                    }
                    return Ok(text);
                }
                Err(e) => {
                    // 🔄 node is ghosting us. try the next one on the list.
                    warn!("⚠️ {method} {path} against {address} failed: {e}");
                    last_failure = e.to_string();
                }
            }
        }

        Err(ConnectorError::Connection(format!(
            "{method} {path} failed on every address ({address_count} tried), last failure: {last_failure}"
        )))
    }
}

#[async_trait]
impl BulkTransport for Connection {
    async fn send_bulk(&self, payload: &str) -> Result<String> {
        debug!("📡 sending {} bytes to {}", payload.len(), self.bulk_path);
        self.perform_with_content_type(
            Method::POST,
            &self.bulk_path,
            &[],
            Some(payload),
            APPLICATION_NDJSON,
        )
        .await
    }
}

/// 🔧 `address` + `path` + `params`, with the "/" hygiene nobody remembers until `//_bulk`.
fn build_url(address: &str, path: &str, params: &[(&str, String)]) -> Result<Url> {
    let joined = format!("{}{}", address.trim_end_matches('/'), path);
    let mut url = Url::parse(&joined).map_err(|e| {
        ConnectorError::Configuration(format!("'{joined}' is not a valid URL: {e}"))
    })?;
    if !params.is_empty() {
        let mut pairs = url.query_pairs_mut();
        for (key, value) in params {
            pairs.append_pair(key, value);
        }
    }
    Ok(url)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn the_one_where_empty_addresses_are_turned_away_at_the_door() {
        let result = ConnectionConfig::new(vec![], "idx", "_doc");
        assert!(matches!(result, Err(ConnectorError::Configuration(_))));
    }

    #[test]
    fn the_one_where_slashes_do_not_multiply() -> anyhow::Result<()> {
        let url = build_url(
            "http://localhost:9200/",
            "/idx/_search",
            &[("scroll", "5m".to_string()), ("preference", "_shards:0".to_string())],
        )?;
        assert_eq!(url.path(), "/idx/_search");
        let pairs: Vec<(String, String)> = url
            .query_pairs()
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        assert_eq!(
            pairs,
            vec![
                ("scroll".to_string(), "5m".to_string()),
                ("preference".to_string(), "_shards:0".to_string())
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_dead_node_hands_off_to_a_live_one() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        // 💀 port 1 on localhost: nobody home, connection refused, instantly
        let config = ConnectionConfig::new(
            vec!["http://127.0.0.1:1".to_string(), server.uri()],
            "idx",
            "_doc",
        )?;
        let connection = Connection::open(&config).await?;
        let body = connection.perform(Method::GET, "/", &[], None).await?;
        assert_eq!(body, "{}");
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_api_key_outranks_basic_auth() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/"))
            .and(header("Authorization", "ApiKey sekrit"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = ConnectionConfig::new(vec![server.uri()], "idx", "_doc")?;
        config.username = Some("elastic".to_string());
        config.password = Some("changeme".to_string());
        config.api_key = Some("sekrit".to_string());
        let connection = Connection::open(&config).await?;
        connection.perform(Method::GET, "/", &[], None).await?;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_500_is_a_connection_error_not_a_success() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/_bulk"))
            .and(header("Content-Type", "application/x-ndjson"))
            .respond_with(ResponseTemplate::new(500).set_body_string("on fire"))
            .mount(&server)
            .await;

        let config = ConnectionConfig::new(vec![server.uri()], "idx", "_doc")?;
        let connection = Connection::open(&config).await?;
        let err = connection
            .send_bulk("{\"index\":{}}\n{}\n")
            .await
            .expect_err("💀 a 500 should not be mistaken for a win");
        assert!(err.is_transport());
        assert!(err.to_string().contains("on fire"));
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_bulk_goes_to_the_index_it_was_told_about() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/idx/_bulk"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"errors":false,"items":[]}"#))
            .expect(1)
            .mount(&server)
            .await;

        let config = ConnectionConfig::new(vec![server.uri()], "idx", "_doc")?;
        let connection = Connection::open(&config).await?.with_bulk_path("/idx/_bulk");
        let reply = connection.send_bulk("{\"index\":{}}\n{}\n").await?;
        assert!(reply.contains("\"errors\":false"));
        Ok(())
    }
}
