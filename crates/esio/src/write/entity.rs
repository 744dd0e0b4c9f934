//! 🏗️ entity.rs: one document in, one bulk line out.
//!
//! A bulk line is an action header (`{"index": {...address...}}`) plus, unless it's a
//! delete, a body line. Which action, which address and which body is decided here, once
//! per document, by [`BulkEntityBuilder::build`]. Pure function, no I/O, no surprises.
//! Well. Few surprises.
//!
//! ```text
//!   delete flag set?          ─▶ delete   {address}
//!   partial update?           ─▶ update   {address} + {"doc":…,"doc_as_upsert":true}
//!   upsert script?            ─▶ update   {address} + {"script":{"source":…,"params":…},"upsert":…}
//!   otherwise                 ─▶ index    {address} + document
//! ```

use std::borrow::Cow;

use serde::Serialize;
use serde_json::value::RawValue;
use serde_json::{Map, Value};
use tracing::warn;

use crate::dialect::Dialect;
use crate::error::{ConnectorError, Result};
use crate::write::DocToBulkConfig;
use crate::write::extract::{FieldPath, FlagExtractor, ValueExtractor};

/// 🔄 How many times the server retries an update that lost a version race.
pub const DEFAULT_RETRY_ON_CONFLICT: u32 = 5;

/// 🔢 The version types the server understands.
pub const VERSION_TYPES: [&str; 4] = ["internal", "external", "external_gt", "external_gte"];

pub(crate) fn validate_version_type(version_type: Option<&str>) -> Result<()> {
    match version_type {
        Some(vt) if !VERSION_TYPES.contains(&vt) => Err(ConnectorError::Configuration(format!(
            "version type must be one of {VERSION_TYPES:?}, got '{vt}'"
        ))),
        _ => Ok(()),
    }
}

/// 📍 Where a document goes, and under which conditions.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DocumentAddress {
    pub index: Option<String>,
    pub doc_type: Option<String>,
    pub id: Option<String>,
    pub routing: Option<String>,
    pub version: Option<i64>,
    pub version_type: Option<String>,
    pub retry_on_conflict: Option<u32>,
}

impl DocumentAddress {
    /// 📜 Header object for this dialect. Absent fields are left out, not nulled.
    pub fn to_header(&self, dialect: &Dialect) -> Value {
        let mut header = Map::new();
        let strings = [
            ("_index", &self.index),
            ("_type", &self.doc_type),
            ("_id", &self.id),
            ("routing", &self.routing),
            ("version_type", &self.version_type),
        ];
        for (name, value) in strings {
            if let Some(value) = value {
                header.insert(name.to_string(), Value::String(value.clone()));
            }
        }
        if let Some(version) = self.version {
            header.insert("version".to_string(), Value::from(version));
        }
        if let Some(retries) = self.retry_on_conflict {
            header.insert(
                dialect.retry_on_conflict_field.to_string(),
                Value::from(retries),
            );
        }
        Value::Object(header)
    }

    /// 🔙 The inverse of [`DocumentAddress::to_header`].
    pub fn from_header(header: &Value, dialect: &Dialect) -> Result<Self> {
        let object = header.as_object().ok_or_else(|| {
            ConnectorError::MalformedResponse(format!("action header is not an object: {header}"))
        })?;
        let string = |name: &str| object.get(name).and_then(Value::as_str).map(str::to_string);
        Ok(Self {
            index: string("_index"),
            doc_type: string("_type"),
            id: string("_id"),
            routing: string("routing"),
            version: object.get("version").and_then(Value::as_i64),
            version_type: string("version_type"),
            retry_on_conflict: object
                .get(dialect.retry_on_conflict_field)
                .and_then(Value::as_u64)
                .and_then(|n| u32::try_from(n).ok()),
        })
    }
}

/// 🏷️ The three actions we ever send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BulkOp {
    Index,
    Update,
    Delete,
}

impl BulkOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            BulkOp::Index => "index",
            BulkOp::Update => "update",
            BulkOp::Delete => "delete",
        }
    }
}

/// 📄 One finished bulk fragment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BulkLine {
    pub op: BulkOp,
    /// 📍 the serialized address object, `{}` for a server-assigned id
    pub header: String,
    pub body: Option<String>,
}

impl BulkLine {
    /// 📜 `{"op":header}\n` then `body\n` when there is one.
    pub fn write_ndjson(&self, out: &mut String) {
        out.push_str("{\"");
        out.push_str(self.op.as_str());
        out.push_str("\":");
        out.push_str(&self.header);
        out.push_str("}\n");
        if let Some(ref body) = self.body {
            out.push_str(body);
            out.push('\n');
        }
    }

    pub fn to_ndjson(&self) -> String {
        let mut out = String::with_capacity(self.byte_len() as usize);
        self.write_ndjson(&mut out);
        out
    }

    /// 📏 Exact size of [`BulkLine::to_ndjson`], without building it.
    pub fn byte_len(&self) -> u64 {
        // {"  op  ":  header  }\n
        let action = 2 + self.op.as_str().len() + 2 + self.header.len() + 2;
        let body = self.body.as_ref().map_or(0, |b| b.len() + 1);
        (action + body) as u64
    }

    /// 📍 Parse the header back into an address.
    pub fn address(&self, dialect: &Dialect) -> Result<DocumentAddress> {
        let header: Value = serde_json::from_str(&self.header)?;
        DocumentAddress::from_header(&header, dialect)
    }
}

/// 🔍 The per-document extraction functions, all optional.
#[derive(Debug, Default)]
pub struct Extractors {
    pub id: Option<Box<dyn ValueExtractor>>,
    pub index: Option<Box<dyn ValueExtractor>>,
    pub doc_type: Option<Box<dyn ValueExtractor>>,
    pub routing: Option<Box<dyn ValueExtractor>>,
    pub version: Option<Box<dyn ValueExtractor>>,
    pub delete_flag: Option<Box<dyn FlagExtractor>>,
}

impl Extractors {
    /// 🔧 Field paths from the config file, turned into extractors.
    pub fn from_config(config: &DocToBulkConfig) -> Result<Self> {
        fn value(path: &Option<String>) -> Result<Option<Box<dyn ValueExtractor>>> {
            path.as_deref()
                .map(|p| FieldPath::parse(p).map(|fp| Box::new(fp) as Box<dyn ValueExtractor>))
                .transpose()
        }
        Ok(Self {
            id: value(&config.id_field)?,
            index: value(&config.index_field)?,
            doc_type: value(&config.type_field)?,
            routing: value(&config.routing_field)?,
            version: value(&config.version_field)?,
            delete_flag: config
                .delete_flag_field
                .as_deref()
                .map(|p| FieldPath::parse(p).map(|fp| Box::new(fp) as Box<dyn FlagExtractor>))
                .transpose()?,
        })
    }

    /// 📍 Does anything here decide where a document goes?
    fn addresses_anything(&self) -> bool {
        self.id.is_some() || self.index.is_some() || self.doc_type.is_some() || self.routing.is_some()
    }
}

/// 🏗️ Turns documents into bulk lines. Build once, share across workers.
#[derive(Debug)]
pub struct BulkEntityBuilder {
    extractors: Extractors,
    use_partial_update: bool,
    upsert_script: Option<String>,
    version_type: Option<String>,
    dialect: Dialect,
}

#[derive(Serialize)]
struct PartialUpdateBody<'a> {
    doc: &'a RawValue,
    doc_as_upsert: bool,
}

#[derive(Serialize)]
struct Script<'a> {
    source: &'a str,
    params: &'a RawValue,
}

#[derive(Serialize)]
struct ScriptedUpsertBody<'a> {
    script: Script<'a>,
    upsert: &'a RawValue,
}

impl BulkEntityBuilder {
    /// 🏗️ Validates the combination before any document shows up.
    pub fn new(extractors: Extractors, config: &DocToBulkConfig, dialect: Dialect) -> Result<Self> {
        if extractors.delete_flag.is_some() && extractors.id.is_none() {
            return Err(ConnectorError::Configuration(
                "a delete flag requires an id extractor, deletes need to know what to delete"
                    .to_string(),
            ));
        }
        validate_version_type(config.version_type.as_deref())?;
        let upsert_script = config.upsert_script.clone().filter(|s| !s.is_empty());
        if !extractors.addresses_anything() && (config.use_partial_update || upsert_script.is_some()) {
            warn!("⚠️ update mode is configured without any address field, documents will be plain inserts");
        }
        Ok(Self {
            extractors,
            use_partial_update: config.use_partial_update,
            upsert_script,
            version_type: config.version_type.clone(),
            dialect,
        })
    }

    pub fn from_config(config: &DocToBulkConfig, dialect: Dialect) -> Result<Self> {
        Self::new(Extractors::from_config(config)?, config, dialect)
    }

    pub fn dialect(&self) -> &Dialect {
        &self.dialect
    }

    fn is_update_shaped(&self) -> bool {
        self.use_partial_update || self.upsert_script.is_some()
    }

    /// 📍 Apply every configured extractor. Index and type come out lower-cased.
    pub fn address_of(&self, document: &Value) -> Result<DocumentAddress> {
        let run = |extractor: &Option<Box<dyn ValueExtractor>>| -> Result<Option<String>> {
            match extractor {
                Some(e) => e.extract(document),
                None => Ok(None),
            }
        };
        let version = run(&self.extractors.version)?
            .map(|v| {
                v.parse::<i64>().map_err(|_| {
                    ConnectorError::Extraction(format!("version '{v}' is not an integer"))
                })
            })
            .transpose()?;
        Ok(DocumentAddress {
            index: run(&self.extractors.index)?.map(|s| s.to_lowercase()),
            doc_type: run(&self.extractors.doc_type)?.map(|s| s.to_lowercase()),
            id: run(&self.extractors.id)?,
            routing: run(&self.extractors.routing)?,
            version,
            version_type: self.version_type.clone(),
            retry_on_conflict: self.is_update_shaped().then_some(DEFAULT_RETRY_ON_CONFLICT),
        })
    }

    /// 🏗️ One document, one line.
    pub fn build(&self, document: &str) -> Result<BulkLine> {
        let document = single_line(document);

        if !self.extractors.addresses_anything() {
            return Ok(BulkLine {
                op: BulkOp::Index,
                header: "{}".to_string(),
                body: Some(document.into_owned()),
            });
        }

        let parsed: Value = serde_json::from_str(&document).map_err(|e| {
            ConnectorError::Extraction(format!("document is not valid JSON: {e}"))
        })?;
        let mut address = self.address_of(&parsed)?;
        let is_delete = match self.extractors.delete_flag {
            Some(ref flag) => flag.is_set(&parsed)?,
            None => false,
        };

        let raw: &RawValue = serde_json::from_str(&document)?;
        let (op, body) = if is_delete {
            (BulkOp::Delete, None)
        } else if self.use_partial_update {
            let body = PartialUpdateBody {
                doc: raw,
                doc_as_upsert: true,
            };
            (BulkOp::Update, Some(serde_json::to_string(&body)?))
        } else if let Some(ref source) = self.upsert_script {
            let body = ScriptedUpsertBody {
                script: Script { source, params: raw },
                upsert: raw,
            };
            (BulkOp::Update, Some(serde_json::to_string(&body)?))
        } else {
            (BulkOp::Index, Some(document.to_string()))
        };

        if op != BulkOp::Update {
            address.retry_on_conflict = None;
        }
        Ok(BulkLine {
            op,
            header: address.to_header(&self.dialect).to_string(),
            body,
        })
    }
}

/// ✂️ NDJSON is one value per line. Raw newlines in valid JSON are only ever whitespace.
fn single_line(document: &str) -> Cow<'_, str> {
    let trimmed = document.trim();
    if trimmed.contains(['\n', '\r']) {
        Cow::Owned(trimmed.replace(['\n', '\r'], ""))
    } else {
        Cow::Borrowed(trimmed)
    }
}
