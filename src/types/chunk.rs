//! Chunk types and decoding of raw store records.
//!
//! A vector store keeps each fragment as a record: a text document plus a flat JSON
//! metadata map. [`decode_records`] turns the records of one collection into typed
//! [`Chunk`]s, resolving the two layouts seen in practice:
//!
//! - **Indexed**: every record carries `chunk_index` and `total_chunks`.
//! - **Positional**: no record carries `chunk_index`; order is recovered from
//!   `start_index` (ties broken by record id) and the total is the record count.
//!
//! Decoding is per file: a record without a filename, or a file whose records mix the
//! two layouts, is rejected on its own and the rest of the collection still decodes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::collection::CollectionId;

/// Metadata key holding the original filename.
pub const FILENAME_KEY: &str = "name";
/// Alternate filename key written by some ingestion pipelines.
pub const FILENAME_ALT_KEY: &str = "filename";
/// Metadata key holding the chunk position.
pub const CHUNK_INDEX_KEY: &str = "chunk_index";
/// Metadata key holding the fragment count of the file.
pub const TOTAL_CHUNKS_KEY: &str = "total_chunks";
/// Metadata key holding the content hash of the whole file.
pub const HASH_KEY: &str = "hash";
/// Metadata key holding the source file id.
pub const FILE_ID_KEY: &str = "file_id";
/// Metadata key holding the source path.
pub const SOURCE_KEY: &str = "source";
/// Character offset of the chunk in the source document (positional layout).
pub const START_INDEX_KEY: &str = "start_index";
/// Embedding engine and model used at ingestion, as a JSON object or JSON text.
pub const EMBEDDING_CONFIG_KEY: &str = "embedding_config";

/// Errors raised while decoding raw store records.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MetadataError {
    /// The record has no filename metadata.
    #[error("Record {record_id} in collection {collection_id} has no filename metadata")]
    MissingFilename {
        /// Collection holding the record.
        collection_id: CollectionId,
        /// Record id.
        record_id: String,
    },
    /// A required field is absent.
    #[error("Record {record_id} is missing metadata field `{field}`")]
    MissingField {
        /// Record id.
        record_id: String,
        /// Field name.
        field: &'static str,
    },
    /// A field is present but not a non-negative integer in range.
    #[error("Record {record_id} has invalid `{field}`: {value}")]
    InvalidField {
        /// Record id.
        record_id: String,
        /// Field name.
        field: &'static str,
        /// Offending value as JSON text.
        value: String,
    },
    /// Some records of a file carry `chunk_index` and others do not.
    #[error("File {filename} mixes indexed and positional chunks ({indexed} of {records} indexed)")]
    MixedIndexing {
        /// Filename.
        filename: String,
        /// Records carrying `chunk_index`.
        indexed: usize,
        /// Total records of the file.
        records: usize,
    },
}

/// Embedding settings recorded next to a chunk.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    /// Embedding engine (provider).
    #[serde(default)]
    pub engine: Option<String>,
    /// Embedding model.
    #[serde(default)]
    pub model: Option<String>,
}

impl EmbeddingConfig {
    /// Read the config from a metadata value; ingestion writes it as JSON text.
    pub fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::String(text) => serde_json::from_str(text).ok(),
            Value::Object(_) => serde_json::from_value(value.clone()).ok(),
            _ => None,
        }
    }
}

/// One fragment of an original file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    /// Collection the chunk was fetched from.
    pub collection_id: CollectionId,
    /// Original filename.
    pub filename: String,
    /// Position of the chunk within the file.
    pub chunk_index: u32,
    /// Number of chunks the file was split into.
    pub total_chunks: u32,
    /// Chunk payload. Empty when fetched with a metadata-only filter.
    pub content: Vec<u8>,
    /// Hash of the whole original file, when recorded.
    pub content_hash: Option<String>,
    /// Source file id, when recorded.
    pub file_id: Option<String>,
    /// Source path, when recorded.
    pub source: Option<String>,
    /// Embedding settings, when recorded.
    #[serde(default)]
    pub embedding_config: Option<EmbeddingConfig>,
}

impl Chunk {
    /// Create a chunk without optional metadata.
    pub fn new(
        collection_id: impl Into<CollectionId>,
        filename: impl Into<String>,
        chunk_index: u32,
        total_chunks: u32,
        content: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            collection_id: collection_id.into(),
            filename: filename.into(),
            chunk_index,
            total_chunks,
            content: content.into(),
            content_hash: None,
            file_id: None,
            source: None,
            embedding_config: None,
        }
    }

    /// Attach the whole-file content hash.
    pub fn with_content_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = Some(hash.into());
        self
    }

    /// Attach the source file id.
    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    /// Attach the source path.
    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Attach the embedding settings.
    pub fn with_embedding_config(mut self, config: EmbeddingConfig) -> Self {
        self.embedding_config = Some(config);
        self
    }

    /// Encode the chunk as an indexed raw record.
    pub fn to_record(&self) -> RawRecord {
        let mut metadata = Map::new();
        metadata.insert(FILENAME_KEY.to_string(), Value::from(self.filename.clone()));
        metadata.insert(CHUNK_INDEX_KEY.to_string(), Value::from(self.chunk_index));
        metadata.insert(TOTAL_CHUNKS_KEY.to_string(), Value::from(self.total_chunks));
        if let Some(hash) = &self.content_hash {
            metadata.insert(HASH_KEY.to_string(), Value::from(hash.clone()));
        }
        if let Some(file_id) = &self.file_id {
            metadata.insert(FILE_ID_KEY.to_string(), Value::from(file_id.clone()));
        }
        if let Some(source) = &self.source {
            metadata.insert(SOURCE_KEY.to_string(), Value::from(source.clone()));
        }
        if let Some(config) = &self.embedding_config {
            if let Ok(text) = serde_json::to_string(config) {
                metadata.insert(EMBEDDING_CONFIG_KEY.to_string(), Value::from(text));
            }
        }

        let (document, binary) = match std::str::from_utf8(&self.content) {
            Ok(text) => (text.to_string(), None),
            Err(_) => (String::new(), Some(self.content.clone())),
        };
        RawRecord {
            id: format!("{}:{}:{}", self.collection_id, self.filename, self.chunk_index),
            document,
            binary,
            embedding: None,
            metadata,
        }
    }
}

/// Record shape as returned by a vector store: document text plus flat metadata.
///
/// Payloads that are not valid UTF-8 (binary files, or a chunk boundary that splits a
/// multi-byte character) are carried in `binary` and take precedence over `document`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Record id within its collection.
    pub id: String,
    /// Document text.
    #[serde(default)]
    pub document: String,
    /// Raw payload bytes when the content is not text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub binary: Option<Vec<u8>>,
    /// Stored embedding vector, if the store returns it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Flat metadata map.
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl RawRecord {
    /// Filename recorded in the metadata, if any.
    pub fn filename(&self) -> Option<&str> {
        self.metadata
            .get(FILENAME_KEY)
            .or_else(|| self.metadata.get(FILENAME_ALT_KEY))
            .and_then(Value::as_str)
            .filter(|name| !name.is_empty())
    }

    /// Create a text record.
    pub fn text(id: impl Into<String>, document: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            id: id.into(),
            document: document.into(),
            binary: None,
            embedding: None,
            metadata,
        }
    }

    /// Payload bytes, exactly as stored.
    pub fn payload(&self) -> Vec<u8> {
        match &self.binary {
            Some(bytes) => bytes.clone(),
            None => self.document.clone().into_bytes(),
        }
    }

    fn string_field(&self, key: &str) -> Option<String> {
        self.metadata.get(key).and_then(Value::as_str).map(str::to_string)
    }

    fn u64_field(&self, field: &'static str) -> Result<Option<u64>, MetadataError> {
        let Some(value) = self.metadata.get(field) else {
            return Ok(None);
        };
        let parsed = match value {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        };
        parsed.map(Some).ok_or_else(|| MetadataError::InvalidField {
            record_id: self.id.clone(),
            field,
            value: value.to_string(),
        })
    }

    fn u32_field(&self, field: &'static str) -> Result<Option<u32>, MetadataError> {
        match self.u64_field(field)? {
            None => Ok(None),
            Some(v) => u32::try_from(v).map(Some).map_err(|_| MetadataError::InvalidField {
                record_id: self.id.clone(),
                field,
                value: v.to_string(),
            }),
        }
    }

    fn to_chunk(&self, collection_id: &CollectionId, filename: &str, index: u32, total: u32) -> Chunk {
        Chunk {
            collection_id: collection_id.clone(),
            filename: filename.to_string(),
            chunk_index: index,
            total_chunks: total,
            content: self.payload(),
            content_hash: self.string_field(HASH_KEY),
            file_id: self.string_field(FILE_ID_KEY),
            source: self.string_field(SOURCE_KEY),
            embedding_config: self.metadata.get(EMBEDDING_CONFIG_KEY).and_then(EmbeddingConfig::from_value),
        }
    }
}

/// Result of decoding one collection's records.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedRecords {
    /// Chunks of every file that decoded.
    pub chunks: Vec<Chunk>,
    /// Records or files left out, with the reason.
    pub rejected: Vec<MetadataError>,
}

/// Decode the records of one collection into chunks.
///
/// Chunks are returned grouped by filename (sorted), in record order within an
/// indexed file and in recovered order within a positional file. Values are not
/// validated against each other here; duplicate indices and inconsistent totals are
/// preserved for the reconstructor to diagnose.
///
/// Bad metadata only drops what it touches: a record without a filename or with an
/// unreadable index is skipped, a file mixing layouts is skipped as a whole.
pub fn decode_records(collection_id: &CollectionId, records: &[RawRecord]) -> DecodedRecords {
    let mut decoded = DecodedRecords {
        chunks: Vec::with_capacity(records.len()),
        rejected: Vec::new(),
    };

    let mut by_file: BTreeMap<&str, Vec<&RawRecord>> = BTreeMap::new();
    for record in records {
        match record.filename() {
            Some(filename) => by_file.entry(filename).or_default().push(record),
            None => decoded.rejected.push(MetadataError::MissingFilename {
                collection_id: collection_id.clone(),
                record_id: record.id.clone(),
            }),
        }
    }

    for (filename, file_records) in by_file {
        let indexed = file_records
            .iter()
            .filter(|r| r.metadata.contains_key(CHUNK_INDEX_KEY))
            .count();

        if indexed == file_records.len() {
            for record in file_records {
                match decode_indexed(record) {
                    Ok((index, total)) => {
                        decoded.chunks.push(record.to_chunk(collection_id, filename, index, total))
                    }
                    Err(error) => decoded.rejected.push(error),
                }
            }
        } else if indexed == 0 {
            match decode_positional(&file_records) {
                Ok(ordered) => {
                    let total = ordered.len() as u32;
                    for (position, record) in ordered.into_iter().enumerate() {
                        decoded
                            .chunks
                            .push(record.to_chunk(collection_id, filename, position as u32, total));
                    }
                }
                Err(error) => decoded.rejected.push(error),
            }
        } else {
            decoded.rejected.push(MetadataError::MixedIndexing {
                filename: filename.to_string(),
                indexed,
                records: file_records.len(),
            });
        }
    }

    decoded
}

fn decode_indexed(record: &RawRecord) -> Result<(u32, u32), MetadataError> {
    let index = record
        .u32_field(CHUNK_INDEX_KEY)?
        .ok_or_else(|| MetadataError::MissingField {
            record_id: record.id.clone(),
            field: CHUNK_INDEX_KEY,
        })?;
    let total = record
        .u32_field(TOTAL_CHUNKS_KEY)?
        .ok_or_else(|| MetadataError::MissingField {
            record_id: record.id.clone(),
            field: TOTAL_CHUNKS_KEY,
        })?;
    Ok((index, total))
}

/// Order a positional file by `start_index`, ties broken by record id.
fn decode_positional<'a>(records: &[&'a RawRecord]) -> Result<Vec<&'a RawRecord>, MetadataError> {
    let mut ordered = Vec::with_capacity(records.len());
    for record in records {
        let start = record.u64_field(START_INDEX_KEY)?.unwrap_or(0);
        ordered.push((start, *record));
    }
    ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.id.cmp(&b.1.id)));

    if u32::try_from(ordered.len()).is_err() {
        return Err(MetadataError::InvalidField {
            record_id: ordered[0].1.id.clone(),
            field: TOTAL_CHUNKS_KEY,
            value: ordered.len().to_string(),
        });
    }
    Ok(ordered.into_iter().map(|(_, record)| record).collect())
}

/// Filter applied to `query_chunks`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkFilter {
    /// Only return chunks of this file.
    pub filename: Option<String>,
    /// Return chunk payloads; when false `content` is left empty.
    pub include_content: bool,
}

impl ChunkFilter {
    /// All chunks, metadata only.
    pub fn metadata_only() -> Self {
        Self {
            filename: None,
            include_content: false,
        }
    }

    /// All chunks with content.
    pub fn everything() -> Self {
        Self {
            filename: None,
            include_content: true,
        }
    }

    /// Chunks of one file, with content.
    pub fn for_file(filename: impl Into<String>) -> Self {
        Self {
            filename: Some(filename.into()),
            include_content: true,
        }
    }

    /// Whether a raw record passes the filename restriction.
    pub fn matches(&self, record: &RawRecord) -> bool {
        match &self.filename {
            Some(wanted) => record.filename() == Some(wanted.as_str()),
            None => true,
        }
    }
}
