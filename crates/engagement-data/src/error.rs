//! Error types for the engagement-data crate.
//!
//! Each concern has its own semantic error enum, following the workspace
//! convention of `thiserror` enums with string payloads so errors stay
//! `Clone` and comparable in tests. [`PipelineError`] aggregates them and is
//! the error returned by a whole run. Every variant is fatal; recoverable
//! data anomalies are logged instead of being represented here.

use std::path::PathBuf;

use camino::Utf8PathBuf;
use thiserror::Error;

use crate::catalogue::WorkflowId;

/// An output file could not be written atomically.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("failed to write '{path}': {message}")]
pub struct WriteError {
    /// Path of the file being written.
    pub path: Utf8PathBuf,
    /// Description of the I/O failure.
    pub message: String,
}

/// Configuration problems detected before any export is processed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The catalogue file could not be read.
    #[error("failed to read catalogue at '{path}': {message}")]
    Read {
        /// Path to the catalogue file.
        path: PathBuf,
        /// Description of the I/O error.
        message: String,
    },

    /// The catalogue JSON is malformed or missing required fields.
    #[error("invalid catalogue JSON: {message}")]
    Parse {
        /// Description of the parse error.
        message: String,
    },

    /// The catalogue version is not supported.
    #[error("unsupported catalogue version: expected {expected}, found {actual}")]
    UnsupportedVersion {
        /// Expected version number.
        expected: u32,
        /// Actual version found in the catalogue.
        actual: u32,
    },

    /// A workflow table does not describe the same workflows as the others.
    #[error(
        "workflow table '{table}' disagrees with the workflow names: missing {missing:?}, unexpected {unexpected:?}"
    )]
    TableKeysDiffer {
        /// Name of the offending table.
        table: &'static str,
        /// Workflows present in the reference set but absent from the table.
        missing: Vec<WorkflowId>,
        /// Workflows present in the table but absent from the reference set.
        unexpected: Vec<WorkflowId>,
    },

    /// A project lists a workflow the catalogue does not describe.
    #[error("project '{project}' lists unknown workflow {workflow_id}")]
    UnknownProjectWorkflow {
        /// Project name.
        project: String,
        /// Workflow that is not described.
        workflow_id: WorkflowId,
    },

    /// A run requested a workflow the catalogue does not describe.
    #[error("workflow {workflow_id} is unknown to the catalogue")]
    UnknownWorkflow {
        /// Requested workflow.
        workflow_id: WorkflowId,
    },

    /// The workflow selection could not be parsed.
    #[error("invalid workflow selection '{value}': {message}")]
    InvalidSelection {
        /// Raw selection value.
        value: String,
        /// Parser error message.
        message: String,
    },

    /// The pseudo-workflow split definition is unusable.
    #[error("invalid pseudo-workflow split: {message}")]
    InvalidSplit {
        /// Description of the problem.
        message: String,
    },

    /// Pseudonyms must contain at least one digit.
    #[error("pseudonym digit count must be between 1 and {max}, found {digits}")]
    InvalidPseudonymDigits {
        /// Configured digit count.
        digits: usize,
        /// Largest supported digit count.
        max: usize,
    },

    /// A directory the run must write into is not writable.
    #[error("directory '{path}' is not writable: {message}")]
    Unwritable {
        /// Directory that failed the probe.
        path: PathBuf,
        /// Description of the failure.
        message: String,
    },
}

/// Export data does not have the shape the pipeline requires.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    /// An input file could not be read.
    #[error("failed to read '{path}': {message}")]
    Read {
        /// Path of the input file.
        path: PathBuf,
        /// Description of the I/O error.
        message: String,
    },

    /// CSV text could not be parsed.
    #[error("malformed CSV in {context}: {message}")]
    Csv {
        /// Where the CSV came from.
        context: String,
        /// Parser error message.
        message: String,
    },

    /// A required column is absent.
    #[error("column '{column}' is missing")]
    MissingColumn {
        /// Name of the missing column.
        column: String,
    },

    /// A new column would overwrite an existing column.
    #[error("column '{column}' already exists")]
    ColumnCollision {
        /// Name of the colliding column.
        column: String,
    },

    /// A data row has a different number of cells than the header.
    #[error("row {row} has {actual} cells but the header has {expected}")]
    RaggedRow {
        /// One-based data row number.
        row: usize,
        /// Cells in the header.
        expected: usize,
        /// Cells in the row.
        actual: usize,
    },

    /// A classification id is not an unsigned integer.
    #[error("invalid classification id '{value}'")]
    InvalidClassificationId {
        /// Raw cell value.
        value: String,
    },

    /// A classification id occurs more than once.
    #[error("classification {classification_id} occurs more than once")]
    DuplicateClassification {
        /// The repeated classification id.
        classification_id: u64,
    },

    /// An export file does not contain exactly the requested workflow.
    #[error("'{path}' should contain only workflow {expected}, found {found:?}")]
    WorkflowMismatch {
        /// Export file path.
        path: PathBuf,
        /// Requested workflow.
        expected: WorkflowId,
        /// Distinct workflow ids found in the file.
        found: Vec<String>,
    },

    /// A JSON cell could not be parsed.
    #[error("classification {classification_id}: invalid JSON in '{column}': {message}")]
    InvalidJson {
        /// Row key.
        classification_id: u64,
        /// JSON column.
        column: String,
        /// Parser error message.
        message: String,
    },

    /// A subject envelope did not hold exactly one subject.
    #[error(
        "classification {classification_id}: expected data for exactly one subject in '{column}', found {subjects}"
    )]
    SubjectEnvelope {
        /// Row key.
        classification_id: u64,
        /// JSON column.
        column: String,
        /// Number of subject entries found.
        subjects: usize,
    },

    /// A requested field is absent under every accepted spelling.
    #[error("classification {classification_id}: field '{path}' is missing from '{column}'")]
    MissingField {
        /// Row key.
        classification_id: u64,
        /// JSON column.
        column: String,
        /// Requested dot path.
        path: String,
    },

    /// Several spellings of one field are populated in the same object.
    #[error(
        "classification {classification_id}: field '{path}' in '{column}' is populated under several spellings"
    )]
    ConflictingCase {
        /// Row key.
        classification_id: u64,
        /// JSON column.
        column: String,
        /// Requested dot path.
        path: String,
    },

    /// A flattened value diverged from its source JSON.
    #[error(
        "classification {classification_id}: '{path}' is '{source_value}' in '{column}' but '{flattened}' after flattening"
    )]
    CrossCheck {
        /// Row key.
        classification_id: u64,
        /// JSON column.
        column: String,
        /// Requested dot path.
        path: String,
        /// Value obtained by walking the source JSON.
        source_value: String,
        /// Value found in the flattened column.
        flattened: String,
    },

    /// A cell could not be interpreted.
    #[error("classification {classification_id}: invalid value '{value}' in '{column}': {message}")]
    InvalidValue {
        /// Row key.
        classification_id: u64,
        /// Column holding the value.
        column: String,
        /// Raw cell value.
        value: String,
        /// Description of the problem.
        message: String,
    },
}

/// The identity dictionary is corrupt or cannot grow.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IdentityError {
    /// The dictionary file exists but could not be read.
    #[error("failed to read identity dictionary at '{path}': {message}")]
    Read {
        /// Dictionary path.
        path: Utf8PathBuf,
        /// Description of the I/O error.
        message: String,
    },

    /// The dictionary is not a JSON object of strings.
    #[error("invalid identity dictionary JSON: {message}")]
    Parse {
        /// Description of the parse error.
        message: String,
    },

    /// A raw identity occurs more than once.
    #[error("identity dictionary lists raw identity '{key}' more than once")]
    DuplicateRawKey {
        /// The repeated raw key.
        key: String,
    },

    /// A pseudonym is assigned to more than one raw identity.
    #[error("identity dictionary assigns pseudonym '{pseudonym}' more than once")]
    DuplicatePseudonym {
        /// The repeated pseudonym.
        pseudonym: String,
    },

    /// A stored pseudonym does not carry a known prefix.
    #[error("identity dictionary maps '{key}' to malformed pseudonym '{pseudonym}'")]
    MalformedPseudonym {
        /// Raw key.
        key: String,
        /// Stored pseudonym.
        pseudonym: String,
    },

    /// Every random candidate collided with an existing pseudonym.
    #[error(
        "no unused pseudonym found after {attempts} attempts; {digits} digits are too few for this population"
    )]
    PseudonymExhaustion {
        /// Number of candidates tried.
        attempts: usize,
        /// Configured digit count.
        digits: usize,
    },

    /// The dictionary could not be serialised.
    #[error("failed to serialise identity dictionary: {message}")]
    Serialise {
        /// Description of the failure.
        message: String,
    },

    /// The dictionary could not be written.
    #[error(transparent)]
    Write(#[from] WriteError),
}

/// Any fatal failure of a pipeline run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// Configuration tables or settings are inconsistent.
    #[error("configuration inconsistency: {0}")]
    ConfigInconsistency(#[from] ConfigError),

    /// Export data does not match the expected schema.
    #[error("schema mismatch: {0}")]
    SchemaMismatch(#[from] SchemaError),

    /// The identity dictionary is corrupt or exhausted.
    #[error("identity failure: {0}")]
    Identity(#[from] IdentityError),

    /// An output could not be written.
    #[error("output failure: {0}")]
    Write(#[from] WriteError),

    /// Run settings could not be loaded.
    #[error("failed to load settings: {message}")]
    Settings {
        /// Description of the failure.
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_formats_correctly() {
        let err = WriteError {
            path: Utf8PathBuf::from("secrets/identities.json"),
            message: "permission denied".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "failed to write 'secrets/identities.json': permission denied"
        );
    }

    #[test]
    fn table_keys_error_lists_both_sides() {
        let err = ConfigError::TableKeysDiffer {
            table: "startStamps",
            missing: vec![WorkflowId::new(18504)],
            unexpected: vec![WorkflowId::new(9)],
        };
        assert_eq!(
            err.to_string(),
            "workflow table 'startStamps' disagrees with the workflow names: missing [18504], unexpected [9]"
        );
    }

    #[test]
    fn missing_field_names_the_classification() {
        let err = SchemaError::MissingField {
            classification_id: 392_796_932,
            column: "subject_data".to_owned(),
            path: "retired.retired_at".to_owned(),
        };
        assert_eq!(
            err.to_string(),
            "classification 392796932: field 'retired.retired_at' is missing from 'subject_data'"
        );
    }

    #[test]
    fn exhaustion_mentions_digit_count() {
        let err = IdentityError::PseudonymExhaustion {
            attempts: 10,
            digits: 1,
        };
        assert_eq!(
            err.to_string(),
            "no unused pseudonym found after 10 attempts; 1 digits are too few for this population"
        );
    }

    #[test]
    fn pipeline_error_wraps_schema_errors() {
        let err = PipelineError::from(SchemaError::ColumnCollision {
            column: "md.started_at".to_owned(),
        });
        assert_eq!(
            err.to_string(),
            "schema mismatch: column 'md.started_at' already exists"
        );
    }
}
