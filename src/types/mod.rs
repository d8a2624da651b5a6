//! Core data types shared by the enumerator, batch processor, index, and reconstructor.

pub mod collection;
pub mod chunk;
pub mod outcome;
pub mod reconstruction;

pub use collection::{CollectionId, CollectionDescriptor, CollectionHandle, CollectionPage};
pub use chunk::{
    decode_records, Chunk, ChunkFilter, DecodedRecords, EmbeddingConfig, MetadataError, RawRecord,
};
pub use outcome::{ErrorKind, OutcomeStatus, SkipReason, CollectionOutcome, BatchReport};
pub use reconstruction::{
    ReconstructedFile, Ambiguity, CandidateContent, GroupDiagnostic, GroupRejection,
};
