//! 📜 scroll.rs: one cursor, one read unit, one page at a time.
//!
//! 🎬 *[a scroll id is issued. it will rotate. it will expire. it will be released.]*
//!
//! The [`ScrollReader`] walks `Unopened → Active → Exhausted/Closed`. It opens its own
//! [`Connection`], sends the initial search (with a slice clause bolted onto the query
//! when its unit is a slice), then keeps asking `/_search/scroll` for more until a page
//! comes back empty.
//!
//! Two ways to consume it:
//! - document-wise: [`ScrollReader::start`] / [`ScrollReader::advance`] / [`ScrollReader::current`]
//! - page-wise: [`Source::next_batch`], one page per bundle, empty bundle at the end
//!
//! 🗑️ [`ScrollReader::close`] must run on every exit path. It releases the cursor on the
//! server (best effort, a failure is only a warning) and drops the connection regardless.

use anyhow::Context;
use async_trait::async_trait;
use reqwest::Method;
use serde_json::{Value, json};
use tracing::{debug, trace, warn};

use crate::backends::Source;
use crate::common::DocBatch;
use crate::connection::Connection;
use crate::dialect::{Dialect, SplitStrategy};
use crate::error::{ConnectorError, Result};
use crate::read::{ReadConfig, ReadUnit};

const EMPTY_DOCUMENT: &str = "{}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReaderState {
    Unopened,
    Active,
    Exhausted,
    Closed,
}

/// 📜 Sequential reader over one [`ReadUnit`].
#[derive(Debug)]
pub struct ScrollReader {
    config: ReadConfig,
    dialect: Dialect,
    unit: ReadUnit,
    state: ReaderState,
    connection: Option<Connection>,
    /// 🎟️ the server's cursor token, rotated on every page
    scroll_id: Option<String>,
    page: std::vec::IntoIter<String>,
    current: Option<String>,
}

impl ScrollReader {
    pub fn new(config: ReadConfig, dialect: Dialect, unit: ReadUnit) -> Self {
        Self {
            config,
            dialect,
            unit,
            state: ReaderState::Unopened,
            connection: None,
            scroll_id: None,
            page: Vec::new().into_iter(),
            current: None,
        }
    }

    pub fn unit(&self) -> &ReadUnit {
        &self.unit
    }

    /// 🎟️ Current cursor token, `None` until a non-empty first page arrived.
    pub fn scroll_id(&self) -> Option<&str> {
        self.scroll_id.as_deref()
    }

    /// 📄 The document produced by the last successful `start`/`advance`.
    pub fn current(&self) -> Option<&str> {
        self.current.as_deref()
    }

    /// 🚀 Open the cursor and position on the first document. `false` means the unit is empty.
    pub async fn start(&mut self) -> Result<bool> {
        let first_page = self.open_and_fetch_first_page().await?;
        Ok(self.load_page(first_page))
    }

    /// ⏭️ Move to the next document, fetching pages as needed. `false` means end of stream.
    pub async fn advance(&mut self) -> Result<bool> {
        if let Some(doc) = self.page.next() {
            self.current = Some(doc);
            return Ok(true);
        }
        if self.state != ReaderState::Active {
            self.current = None;
            return Ok(false);
        }
        // 🔄 load_page positions on the new page's first document, or reports the end
        let page = self.fetch_next_page().await?;
        Ok(self.load_page(page))
    }

    /// 🗑️ Release the cursor (best effort) and the connection (always). Idempotent.
    pub async fn close(&mut self) {
        if self.state == ReaderState::Closed {
            return;
        }
        if let (Some(connection), Some(scroll_id)) = (self.connection.as_ref(), self.scroll_id.as_ref()) {
            let body = json!({ "scroll_id": [scroll_id] }).to_string();
            match connection
                .perform(Method::DELETE, "/_search/scroll", &[], Some(&body))
                .await
            {
                Ok(_) => trace!("🗑️ scroll cursor released"),
                Err(e) => warn!("⚠️ could not release the scroll cursor, it will expire on its own: {e}"),
            }
        }
        if let Some(connection) = self.connection.take() {
            connection.close();
        }
        self.scroll_id = None;
        self.current = None;
        self.page = Vec::new().into_iter();
        self.state = ReaderState::Closed;
    }

    /// 📦 Put a fetched page in place. Empty page: end of stream.
    fn load_page(&mut self, page: Vec<String>) -> bool {
        if page.is_empty() {
            self.state = ReaderState::Exhausted;
            self.current = None;
            self.page = Vec::new().into_iter();
            return false;
        }
        self.page = page.into_iter();
        self.current = self.page.next();
        true
    }

    async fn open_and_fetch_first_page(&mut self) -> Result<Vec<String>> {
        if self.state != ReaderState::Unopened {
            return Err(ConnectorError::Configuration(
                "a scroll reader can only be started once".to_string(),
            ));
        }
        let connection = Connection::open(&self.config.connection).await?;
        let connection = self.connection.insert(connection);
        self.state = ReaderState::Active;

        let path = self.dialect.index_path(
            &self.config.connection.index,
            &self.config.connection.doc_type,
            "_search",
        );
        let params = search_params(&self.config, self.dialect, &self.unit);
        let body = match self.unit.slice_clause() {
            Some((id, max)) if self.dialect.split_strategy == SplitStrategy::PerSlice => {
                inject_slice(self.config.effective_query(), id, max)
            }
            _ => self.config.effective_query().to_string(),
        };
        debug!("📜 opening scroll on {path} for {:?}", self.unit.kind);

        let response = connection
            .perform_json(Method::GET, &path, &params, Some(&body))
            .await?;
        let page = extract_page(&response, self.config.with_metadata)?;
        if !page.is_empty() {
            self.scroll_id = scroll_id_of(&response);
        }
        Ok(page)
    }

    async fn fetch_next_page(&mut self) -> Result<Vec<String>> {
        let (Some(connection), Some(scroll_id)) = (self.connection.as_ref(), self.scroll_id.as_ref())
        else {
            return Ok(Vec::new());
        };
        let body = json!({
            "scroll": self.config.scroll_keepalive,
            "scroll_id": scroll_id,
        })
        .to_string();
        let response = connection
            .perform_json(Method::GET, "/_search/scroll", &[], Some(&body))
            .await?;
        // 🔄 tokens rotate, and the latest one is the one to release, even on the last page
        if let Some(rotated) = scroll_id_of(&response) {
            self.scroll_id = Some(rotated);
        }
        extract_page(&response, self.config.with_metadata)
    }
}

#[async_trait]
impl Source for ScrollReader {
    async fn next_batch(&mut self) -> anyhow::Result<DocBatch> {
        // 📦 whatever start/advance left buffered goes out first
        let mut docs: Vec<String> = Vec::new();
        if let Some(current) = self.current.take() {
            docs.push(current);
        }
        docs.extend(self.page.by_ref());
        if !docs.is_empty() {
            return Ok(DocBatch::new(docs));
        }

        let page = match self.state {
            ReaderState::Unopened => self
                .open_and_fetch_first_page()
                .await
                .context("💀 the first scroll page never arrived")?,
            ReaderState::Active => self
                .fetch_next_page()
                .await
                .context("💀 the scroll continuation failed mid-read")?,
            ReaderState::Exhausted | ReaderState::Closed => Vec::new(),
        };
        if page.is_empty() {
            self.state = match self.state {
                ReaderState::Closed => ReaderState::Closed,
                _ => ReaderState::Exhausted,
            };
        }
        Ok(DocBatch::new(page))
    }

    async fn close(&mut self) {
        ScrollReader::close(self).await
    }
}

/// 🔧 `scroll`, plus `size` and `preference` on the legacy dialect.
fn search_params(config: &ReadConfig, dialect: Dialect, unit: &ReadUnit) -> Vec<(&'static str, String)> {
    let mut params = vec![("scroll", config.scroll_keepalive.clone())];
    if dialect.split_strategy == SplitStrategy::PerShard {
        params.push(("size", config.batch_size.to_string()));
        if let Some(preference) = unit.shard_preference() {
            params.push(("preference", format!("_shards:{preference}")));
        }
    }
    params
}

/// 🍕 Bolt `"slice": {...}` onto the front of the query's top-level object.
///
/// Textual: the query is opaque and otherwise goes out byte for byte.
pub fn inject_slice(query: &str, id: u32, max: u32) -> String {
    let clause = format!(r#""slice": {{"id": {id},"max": {max}}}"#);
    let Some(brace) = query.find('{') else {
        return query.to_string();
    };
    let (head, rest) = query.split_at(brace + 1);
    if rest.trim_start().starts_with('}') {
        format!("{head}{clause}{rest}")
    } else {
        format!("{head}{clause},{rest}")
    }
}

fn scroll_id_of(response: &Value) -> Option<String> {
    response
        .get("_scroll_id")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// 📄 A page's documents: whole hits with `with_metadata`, otherwise just `_source`.
/// A hit without `_source` (`_source: false` mappings, stored-fields-only queries)
/// comes out as the empty document `{}`.
fn extract_page(response: &Value, with_metadata: bool) -> Result<Vec<String>> {
    let hits = response
        .pointer("/hits/hits")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            ConnectorError::MalformedResponse("search response has no hits.hits array".to_string())
        })?;
    Ok(hits
        .iter()
        .map(|hit| {
            if with_metadata {
                return hit.to_string();
            }
            match hit.get("_source") {
                Some(source) => source.to_string(),
                None => {
                    trace!("🫥 hit {} has no _source, reading it as {{}}", hit["_id"]);
                    EMPTY_DOCUMENT.to_string()
                }
            }
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::ConnectionConfig;
    use wiremock::matchers::{body_json, body_string, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn page(scroll_id: &str, sources: &[Value]) -> Value {
        let hits: Vec<Value> = sources
            .iter()
            .enumerate()
            .map(|(i, s)| json!({"_id": i.to_string(), "_index": "logs", "_source": s}))
            .collect();
        json!({"_scroll_id": scroll_id, "hits": {"hits": hits}})
    }

    async fn config_for(server: &MockServer) -> anyhow::Result<ReadConfig> {
        Ok(ReadConfig::new(ConnectionConfig::new(
            vec![server.uri()],
            "logs",
            "_doc",
        )?))
    }

    #[test]
    fn the_one_where_the_slice_goes_first_in_line() {
        assert_eq!(
            inject_slice(r#"{"query":{"match_all":{}}}"#, 2, 8),
            r#"{"slice": {"id": 2,"max": 8},"query":{"match_all":{}}}"#
        );
        assert_eq!(inject_slice("{}", 0, 2), r#"{"slice": {"id": 0,"max": 2}}"#);
    }

    #[test]
    fn the_one_where_a_lonely_slice_is_no_slice_at_all() {
        assert_eq!(ReadUnit::slice(0, 1, 10).slice_clause(), None);
        assert_eq!(ReadUnit::slice(0, 2, 10).slice_clause(), Some((0, 2)));
    }

    #[test]
    fn the_one_where_only_legacy_sends_size_and_preference() -> anyhow::Result<()> {
        let config = ReadConfig::new(ConnectionConfig::new(
            vec!["http://localhost:9200".to_string()],
            "logs",
            "_doc",
        )?);
        let legacy = search_params(&config, Dialect::for_major(2)?, &ReadUnit::shard("3"));
        assert_eq!(
            legacy,
            vec![
                ("scroll", "5m".to_string()),
                ("size", "100".to_string()),
                ("preference", "_shards:3".to_string())
            ]
        );
        let modern = search_params(&config, Dialect::for_major(7)?, &ReadUnit::slice(0, 2, 1));
        assert_eq!(modern, vec![("scroll", "5m".to_string())]);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_an_empty_index_leaves_no_cursor_behind() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logs/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page("abc", &[])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let mut reader = ScrollReader::new(
            config_for(&server).await?,
            Dialect::for_major(7)?,
            ReadUnit::whole(),
        );
        assert!(!reader.start().await?);
        assert_eq!(reader.scroll_id(), None);
        assert_eq!(reader.current(), None);
        reader.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_three_pages_become_five_docs_and_one_goodbye() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logs/_doc/_search"))
            .and(query_param("scroll", "5m"))
            .and(body_string(
                r#"{"slice": {"id": 1,"max": 2},"query":{"match_all":{}}}"#,
            ))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(page("s1", &[json!({"n": 1}), json!({"n": 2})])),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_search/scroll"))
            .and(body_json(json!({"scroll": "5m", "scroll_id": "s1"})))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(page("s2", &[json!({"n": 3}), json!({"n": 4}), json!({"n": 5})])),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_search/scroll"))
            .and(body_json(json!({"scroll": "5m", "scroll_id": "s2"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(page("s3", &[])))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/_search/scroll"))
            .and(body_json(json!({"scroll_id": ["s3"]})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"succeeded": true})))
            .expect(1)
            .mount(&server)
            .await;

        let mut reader = ScrollReader::new(
            config_for(&server).await?,
            Dialect::for_major(6)?,
            ReadUnit::slice(1, 2, 100),
        );
        let mut seen = Vec::new();
        let mut more = reader.start().await?;
        while more {
            seen.push(reader.current().unwrap_or_default().to_string());
            more = reader.advance().await?;
        }
        assert_eq!(
            seen,
            vec![r#"{"n":1}"#, r#"{"n":2}"#, r#"{"n":3}"#, r#"{"n":4}"#, r#"{"n":5}"#]
        );
        assert_eq!(reader.current(), None);
        reader.close().await;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_metadata_tags_along_page_by_page() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logs/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page("s1", &[json!({"n": 1})])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page("s2", &[])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut config = config_for(&server).await?;
        config.with_metadata = true;
        let mut reader = ScrollReader::new(config, Dialect::for_major(7)?, ReadUnit::whole());

        let first = reader.next_batch().await?;
        assert_eq!(first.len(), 1);
        let hit: Value = serde_json::from_str(&first.docs[0])?;
        assert_eq!(hit["_index"], "logs");
        assert_eq!(hit["_source"]["n"], 1);

        assert!(reader.next_batch().await?.is_empty());
        assert!(reader.next_batch().await?.is_empty());
        Source::close(&mut reader).await;
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_failed_release_is_just_a_shrug() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logs/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page("s1", &[json!({"n": 1})])))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(500).set_body_string("nope"))
            .expect(1)
            .mount(&server)
            .await;

        let mut reader = ScrollReader::new(
            config_for(&server).await?,
            Dialect::for_major(7)?,
            ReadUnit::whole(),
        );
        assert!(reader.start().await?);
        // 🗑️ close mid-stream: release fails, nothing is raised, reader is done
        reader.close().await;
        assert_eq!(reader.scroll_id(), None);
        assert!(!reader.advance().await?);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_broken_continuation_still_gives_the_cursor_back() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logs/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(page("s1", &[json!({"n": 1})])))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(500).set_body_string("shard failure"))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/_search/scroll"))
            .and(body_json(json!({"scroll_id": ["s1"]})))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut reader = ScrollReader::new(
            config_for(&server).await?,
            Dialect::for_major(7)?,
            ReadUnit::whole(),
        );
        assert_eq!(reader.next_batch().await?.len(), 1);
        let err = reader
            .next_batch()
            .await
            .expect_err("💀 a 500 mid-scroll is not the end of the stream");
        assert!(format!("{err:#}").contains("shard failure"));
        // 🗑️ the read blew up, the cursor still goes home
        Source::close(&mut reader).await;
        assert_eq!(reader.scroll_id(), None);
        Ok(())
    }

    #[tokio::test]
    async fn the_one_where_a_hit_without_source_reads_as_an_empty_document() -> anyhow::Result<()> {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/logs/_search"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "_scroll_id": "s1",
                "hits": {"hits": [{"_index": "logs", "_id": "1"}, {"_id": "2", "_source": {"n": 2}}]}
            })))
            .mount(&server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/_search/scroll"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut reader = ScrollReader::new(
            config_for(&server).await?,
            Dialect::for_major(7)?,
            ReadUnit::whole(),
        );
        let batch = reader.next_batch().await?;
        assert_eq!(batch.docs, vec!["{}".to_string(), r#"{"n":2}"#.to_string()]);
        reader.close().await;
        Ok(())
    }
}
