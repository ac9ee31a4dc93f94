//! Pseudonymised, normalised engagement data from transcription exports.
//!
//! Volunteers transcribe archival material on a crowdsourcing platform that
//! exports one CSV per workflow. This crate turns those exports into:
//!
//! - a unified analysis table in which every volunteer appears under a
//!   stable pseudonym, with selected JSON subject and metadata fields
//!   flattened into columns,
//! - pseudonymised copies of the raw per-workflow exports,
//! - per-project sharing tables that locate each subject on the web.
//!
//! Pseudonyms persist across runs in an identity dictionary, so the same
//! volunteer keeps the same pseudonym as new exports arrive.
//!
//! # Overview
//!
//! - [`Catalogue`] describes the workflows, their kept versions and fields,
//!   and the projects to share.
//! - [`IdentityRegistry`] loads, extends and persists the dictionary.
//! - [`WorkflowReader`] reads and prepares one export.
//! - [`RecordAssembler`] pseudonymises and unifies the exports.
//! - [`ShareableExporter`] builds the per-project tables.
//! - [`run`] drives all of the above from [`Settings`].
//!
//! # Example
//!
//! ```
//! use engagement_data::{IdentityRegistry, PseudonymGenerator, RawIdentity};
//!
//! let generator = PseudonymGenerator::new(8, Some(7)).expect("valid digits");
//! let mut registry = IdentityRegistry::new(generator);
//!
//! let named = registry.resolve(&RawIdentity::LoggedIn(42)).expect("resolves");
//! let again = registry.resolve(&RawIdentity::LoggedIn(42)).expect("resolves");
//! assert_eq!(named, again);
//! assert!(named.as_str().starts_with("name:"));
//! ```

mod assembler;
mod atomic_io;
mod catalogue;
mod error;
mod identity;
mod json_fields;
mod pipeline;
mod settings;
mod sharing;
mod table;
mod workflow_reader;

pub use assembler::{
    Assembly, METADATA_PREFIX, PSEUDONYM_COLUMN, PseudonymisedExport, RecordAssembler,
    apply_temporal_cutoffs, pseudonymise_export, split_pseudo_workflow,
};
pub use catalogue::{
    Catalogue, LocationTemplate, Project, PseudoWorkflowSplit, TemplatePart, WorkflowConfig,
    WorkflowId, parse_workflow_list,
};
pub use error::{ConfigError, IdentityError, PipelineError, SchemaError, WriteError};
pub use identity::{
    DEFAULT_PSEUDONYM_DIGITS, IdentityRegistry, MAX_PSEUDONYM_ATTEMPTS, MAX_PSEUDONYM_DIGITS,
    Pseudonym, PseudonymGenerator, RawIdentity,
};
pub use json_fields::{
    FieldLookup, FoldedJson, JsonShape, KeyTree, expand, normalise_keys, render, survey_keys,
};
pub use pipeline::{ANALYSIS_FILE, RunSummary, run};
pub use settings::Settings;
pub use sharing::{
    MISSING_LOCATION, PLAIN_LOCATION_COLUMN, PROJECT_LOCATION_COLUMN, ProjectExport, Resolution,
    ShareableExporter, SubjectIndex,
};
pub use table::{CLASSIFICATION_ID, Row, Table};
pub use workflow_reader::{
    START_STAMP_COLUMN, SUBJECT_PREFIX, WorkflowExport, WorkflowReader, export_file_name,
};
