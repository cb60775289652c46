//! periphgen core library
//!
//! Domain model and front half of the generation pipeline:
//! - [`descriptor`]: vendor XML register maps parsed into an immutable [`Device`]
//! - [`schema`]: versioned metadata schemas with aggregated violations
//! - [`metadata`]: typed views over validated platform/peripheral/board documents
//! - [`context`]: the read-only [`TemplateContext`] built per request
//! - [`template`]: rendering a template into a provenance-stamped [`Artifact`]

pub mod artifact;
pub mod context;
pub mod descriptor;
pub mod digest;
pub mod error;
pub mod metadata;
pub mod obs;
pub mod schema;
pub mod telemetry;
pub mod template;

pub use artifact::{Artifact, Provenance, SourceIdentity, PROVENANCE_BEGIN, PROVENANCE_END};
pub use context::TemplateContext;
pub use descriptor::cache::DescriptorCache;
pub use descriptor::{
    AccessMode, BitFieldDescriptor, Device, Dialect, PeripheralDescriptor, PeripheralInstance,
    RegisterDescriptor,
};
pub use error::{
    ContextError, DescriptorParseError, GenerationError, SchemaError, SchemaErrors,
    TemplateRenderError,
};
pub use metadata::{
    BoardMetadata, DocumentKind, Idioms, MetadataDocument, PeripheralClass, PeripheralMetadata,
    PlatformMetadata, SourceLanguage, Toolchain, ValidatedMetadata,
};
pub use obs::{request_span, RequestSpan};
pub use schema::{validate, SchemaRegistry};
pub use telemetry::init_tracing;
pub use template::{EngineConfig, TemplateEngine, TemplateSource};

/// periphgen version, embedded in every provenance header.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
