//! Job enumeration and output naming.

mod naming;
mod source;

pub use naming::{base_stem, find_existing, generation_key, is_generated, OutputNamer, GENERATED_MARKER};
pub use source::{index_jobs, JobDescriptor, JobId, JobSource, SourceFile};
