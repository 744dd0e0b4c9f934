//! 🔧 App Configuration: TOML and env vars in, one typed [`AppConfig`] out.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." (every developer at 3am) 🦆
//!
//! 🏗️ Powered by Figment. `ESIO_*` environment variables form the base layer (nested keys
//! joined by `__`, so `ESIO_RUNTIME__QUEUE_CAPACITY=32`), the TOML file goes on top and
//! wins every argument.

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use std::path::Path;
use tracing::info;

use crate::backends::FileSourceConfig;
use crate::read::ReadConfig;
use crate::write::WriteConfig;

/// 📦 One struct to rule them all, and in the Figment bind them.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct AppConfig {
    /// 📖 Where documents come from.
    pub source_config: SourceConfig,
    /// ✍️ Where documents go, and how they are bulked on the way.
    pub sink_config: WriteConfig,
    #[serde(default, alias = "supervisor_config")]
    pub runtime: RuntimeConfig,
}

/// 🚰 The source flavours, tagged by TOML table name: `[source_config.Elasticsearch]`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub enum SourceConfig {
    Elasticsearch(ReadConfig),
    File(FileSourceConfig),
}

/// 🧵 Pipeline knobs: channel depth and worker counts.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct RuntimeConfig {
    /// ✉️ Bundles buffered between the source and sink stages.
    #[serde(default = "default_queue_capacity", alias = "channel_size")]
    pub queue_capacity: usize,
    /// 📖 Read units scrolled at the same time.
    #[serde(default = "default_source_parallelism")]
    pub source_parallelism: usize,
    /// ✍️ Unbuffered sink workers. Buffered mode uses `max_parallel_requests` instead.
    #[serde(default = "default_sink_parallelism", alias = "num_sink_workers")]
    pub sink_parallelism: usize,
    /// 📊 Draw the progress bar.
    #[serde(default = "default_show_progress")]
    pub show_progress: bool,
}

fn default_queue_capacity() -> usize {
    10
}

fn default_source_parallelism() -> usize {
    4
}

fn default_sink_parallelism() -> usize {
    1
}

fn default_show_progress() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            source_parallelism: default_source_parallelism(),
            sink_parallelism: default_sink_parallelism(),
            show_progress: default_show_progress(),
        }
    }
}

impl AppConfig {
    /// 🔍 Everything that can be judged without a network. Runs before any worker starts.
    pub fn validate(&self) -> anyhow::Result<()> {
        match self.source_config {
            SourceConfig::Elasticsearch(ref read) => read
                .validate()
                .context("💀 the [source_config.Elasticsearch] table has a problem")?,
            SourceConfig::File(ref file) => {
                if file.docs_per_batch == 0 {
                    anyhow::bail!("💀 source_config.File.docs_per_batch must be > 0");
                }
            }
        }
        self.sink_config
            .validate()
            .context("💀 the [sink_config] table has a problem")?;
        let runtime = &self.runtime;
        if runtime.queue_capacity == 0 || runtime.source_parallelism == 0 || runtime.sink_parallelism == 0 {
            anyhow::bail!(
                "💀 runtime knobs must all be > 0, got queue_capacity={}, source_parallelism={}, sink_parallelism={}",
                runtime.queue_capacity,
                runtime.source_parallelism,
                runtime.sink_parallelism
            );
        }
        Ok(())
    }
}

/// 🚀 Load the config from env vars, plus a TOML file if one was given.
///
/// - `None` → env vars only. No file, no assumptions.
/// - `Some(path)` → env vars + TOML, merged, TOML wins on conflicts.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {}",
        config_file_name.map_or_else(|| "<env only>".to_string(), |p| p.display().to_string())
    );

    let config = Figment::new().merge(Env::prefixed("ESIO_").split("__"));
    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables (ESIO_*). \
             The file exists in our hearts, but apparently not in the shape we need.",
            path.display()
        ),
        None => "💀 Failed to parse configuration from environment variables (ESIO_*). \
                 No file was provided, so this one's all on the environment."
            .to_string(),
    };

    let app_config: AppConfig = config.extract().context(context_msg)?;
    app_config.validate()?;
    Ok(app_config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::write::ShardAssignment;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_test_config(contents: &str) -> anyhow::Result<NamedTempFile> {
        // 🧪 Figment wants TOML from disk, like it's method acting
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile()?;
        file.write_all(contents.as_bytes())?;
        file.flush()?;
        Ok(file)
    }

    #[test]
    fn the_one_where_a_full_reindex_config_parses_end_to_end() -> anyhow::Result<()> {
        let file = write_test_config(
            r#"
            [runtime]
            queue_capacity = 8
            sink_parallelism = 3

            [source_config.Elasticsearch]
            query = '{"query":{"term":{"level":"error"}}}'
            with_metadata = true
            batch_size = 500

            [source_config.Elasticsearch.connection]
            addresses = ["http://old-cluster:9200"]
            index = "logs"
            type = "event"

            [sink_config.connection]
            addresses = ["http://new-cluster:9200", "http://new-cluster-2:9200"]
            index = "logs-v2"
            api_key = "sekrit"

            [sink_config.documents]
            id_field = "/meta/id"
            use_partial_update = true

            [sink_config.bulk]
            max_batch_size = 250
            ignore_version_conflicts = true
            max_buffering_duration_ms = 1500
            max_parallel_requests = 4
            shard_assignment = "hash"

            [sink_config.bulk.retry]
            max_attempts = 6
            max_duration_secs = 120
            "#,
        )?;

        let app_config = load_config(Some(file.path()))?;
        assert_eq!(app_config.runtime.queue_capacity, 8);
        assert_eq!(app_config.runtime.sink_parallelism, 3);
        assert_eq!(app_config.runtime.source_parallelism, 4);

        let SourceConfig::Elasticsearch(ref read) = app_config.source_config else {
            panic!("💀 expected an Elasticsearch source, serde took us somewhere else");
        };
        assert_eq!(read.connection.doc_type, "event");
        assert_eq!(read.batch_size, 500);
        assert_eq!(read.scroll_keepalive, "5m");
        assert!(read.with_metadata);

        let sink = &app_config.sink_config;
        assert_eq!(sink.connection.addresses.len(), 2);
        assert_eq!(sink.connection.doc_type, "_doc");
        assert_eq!(sink.documents.id_field.as_deref(), Some("/meta/id"));
        assert_eq!(sink.bulk.max_batch_size, 250);
        assert_eq!(sink.bulk.max_batch_size_bytes, 5 * 1024 * 1024);
        assert_eq!(sink.bulk.shard_assignment, ShardAssignment::Hash);
        assert!(sink.bulk.is_stateful());
        let retry = sink.bulk.retry.as_ref().expect("💀 retry table should parse");
        assert_eq!(retry.initial_backoff_ms, 5_000);
        Ok(())
    }

    #[test]
    fn the_one_where_runtime_defaults_show_up_uninvited_but_helpful() -> anyhow::Result<()> {
        let file = write_test_config(
            r#"
            [source_config.File]
            file_name = "input.ndjson"

            [sink_config.connection]
            addresses = ["http://localhost:9200"]
            index = "out"
            "#,
        )?;

        let app_config: AppConfig = Figment::new().merge(Toml::file(file.path())).extract()?;
        assert_eq!(app_config.runtime, RuntimeConfig::default());
        assert_eq!(app_config.runtime.queue_capacity, 10);
        match app_config.source_config {
            SourceConfig::File(ref f) => assert_eq!(f.docs_per_batch, 1000),
            honestly_who_knows => panic!("💀 expected a File source, got {honestly_who_knows:?}"),
        }
        Ok(())
    }

    #[test]
    fn the_one_where_runtime_accepts_its_former_stage_names() -> anyhow::Result<()> {
        let file = write_test_config(
            r#"
            [runtime]
            channel_size = 12
            num_sink_workers = 4

            [source_config.File]
            file_name = "input.ndjson"

            [sink_config.connection]
            addresses = ["http://localhost:9200"]
            index = "out"
            "#,
        )?;

        let app_config = load_config(Some(file.path()))?;
        assert_eq!(app_config.runtime.queue_capacity, 12);
        assert_eq!(app_config.runtime.sink_parallelism, 4);
        Ok(())
    }

    #[test]
    fn the_one_where_a_bad_version_type_fails_at_load_time() -> anyhow::Result<()> {
        let file = write_test_config(
            r#"
            [source_config.File]
            file_name = "input.ndjson"

            [sink_config.connection]
            addresses = ["http://localhost:9200"]
            index = "out"

            [sink_config.documents]
            id_field = "id"
            version_type = "sometimes"
            "#,
        )?;

        let err = load_config(Some(file.path())).expect_err("💀 'sometimes' is not a version type");
        assert!(format!("{err:#}").contains("version type"));
        Ok(())
    }

    #[test]
    fn the_one_where_the_toml_crate_agrees_with_figment() -> anyhow::Result<()> {
        let raw = r#"
            [source_config.File]
            file_name = "input.ndjson"
            docs_per_batch = 3

            [sink_config.connection]
            addresses = ["http://localhost:9200"]
            index = "out"
        "#;
        let direct: AppConfig = toml::from_str(raw)?;
        let file = write_test_config(raw)?;
        let via_figment: AppConfig = Figment::new().merge(Toml::file(file.path())).extract()?;
        assert_eq!(direct, via_figment);
        Ok(())
    }
}
