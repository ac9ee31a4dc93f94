//! Loading and preparing one workflow export.

use std::path::PathBuf;

use cap_std::fs::Dir;
use tracing::{debug, info};

use crate::catalogue::{Catalogue, WorkflowConfig, WorkflowId};
use crate::error::{PipelineError, SchemaError};
use crate::json_fields::{JsonShape, expand, survey_keys};
use crate::table::Table;

/// Column tagging each row with its workflow's start timestamp.
///
/// It only lives between reading and the temporal filter.
pub const START_STAMP_COLUMN: &str = "workflow_start";

/// Prefix of flattened subject fields.
pub const SUBJECT_PREFIX: &str = "subj";

/// One workflow export after reading.
#[derive(Debug, Clone)]
pub struct WorkflowExport {
    workflow: WorkflowId,
    name: String,
    raw: Table,
    prepared: Table,
}

impl WorkflowExport {
    /// Returns the workflow id.
    #[must_use]
    pub const fn workflow(&self) -> WorkflowId {
        self.workflow
    }

    /// Returns the workflow's export name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the export exactly as read.
    #[must_use]
    pub const fn raw(&self) -> &Table {
        &self.raw
    }

    /// Returns the version-filtered, tagged and subject-expanded rows.
    #[must_use]
    pub const fn prepared(&self) -> &Table {
        &self.prepared
    }

    /// Splits the export into its raw and prepared tables.
    #[must_use]
    pub fn into_parts(self) -> (Table, Table) {
        (self.raw, self.prepared)
    }
}

/// Returns the export file name for a workflow.
#[must_use]
pub fn export_file_name(workflow: &WorkflowConfig) -> String {
    format!("{}-classifications.csv", workflow.name())
}

/// Reads workflow exports from a directory.
#[derive(Debug)]
pub struct WorkflowReader<'a> {
    exports: &'a Dir,
    catalogue: &'a Catalogue,
}

impl<'a> WorkflowReader<'a> {
    /// Creates a reader over the `exports` directory.
    #[must_use]
    pub const fn new(exports: &'a Dir, catalogue: &'a Catalogue) -> Self {
        Self { exports, catalogue }
    }

    /// Reads and prepares the export of `id`.
    ///
    /// # Errors
    ///
    /// Returns a configuration error for an unknown workflow, and a schema
    /// error when the file cannot be read, holds another workflow, or its
    /// subject data does not expand.
    pub fn read(&self, id: WorkflowId) -> Result<WorkflowExport, PipelineError> {
        let workflow = self.catalogue.workflow(id)?;
        let file_name = export_file_name(workflow);

        let file = self
            .exports
            .open(&file_name)
            .map_err(|err| SchemaError::Read {
                path: PathBuf::from(&file_name),
                message: err.to_string(),
            })?;
        let raw = Table::from_csv_reader(file, &file_name)?;
        check_single_workflow(&raw, id, &file_name)?;

        let prepared = self.prepare(&raw, workflow)?;
        info!(
            workflow = %id,
            name = workflow.name(),
            rows = raw.len(),
            kept = prepared.len(),
            "read workflow export"
        );

        Ok(WorkflowExport {
            workflow: id,
            name: workflow.name().to_owned(),
            raw,
            prepared,
        })
    }

    fn prepare(&self, raw: &Table, workflow: &WorkflowConfig) -> Result<Table, SchemaError> {
        let version = raw.require_column("workflow_version")?;
        let mut prepared = raw.filtered(|row| Ok(workflow.keeps_version(row.cell(version).trim())))?;

        prepared.push_constant_column(START_STAMP_COLUMN, &workflow.start_stamp().to_rfc3339())?;

        let survey = survey_keys(&prepared, "subject_data", JsonShape::SubjectEnvelope)?;
        for variants in survey.case_variants() {
            debug!(workflow = %workflow.id(), ?variants, "subject fields spelled inconsistently");
        }

        let fields: Vec<String> = self
            .catalogue
            .all_subject_keepers()
            .iter()
            .chain(workflow.subject_fields())
            .cloned()
            .collect();
        expand(
            &mut prepared,
            "subject_data",
            &fields,
            SUBJECT_PREFIX,
            JsonShape::SubjectEnvelope,
        )?;
        Ok(prepared)
    }
}

fn check_single_workflow(raw: &Table, id: WorkflowId, file_name: &str) -> Result<(), SchemaError> {
    let found = raw.distinct_values("workflow_id")?;
    match found.as_slice() {
        [only] if only.parse::<WorkflowId>() == Ok(id) => Ok(()),
        _ => Err(SchemaError::WorkflowMismatch {
            path: PathBuf::from(file_name),
            expected: id,
            found,
        }),
    }
}

#[cfg(test)]
mod tests {
    use cap_std::ambient_authority;
    use rstest::{fixture, rstest};
    use tempfile::TempDir;

    use super::*;

    const CATALOGUE: &str = r##"{
        "version": 1,
        "names": {"18504": "meetings"},
        "keepers": {"18504": ["38.91", "38.92"]},
        "subjectKeepers": {"18504": ["Date", "Page"]},
        "startStamps": {"18504": "2021-11-17T00:00:00Z"},
        "labels": {"18504": "Meetings"},
        "workflowTypes": {"18504": "tabular"},
        "allSubjectKeepers": ["#priority", "retired.retired_at"],
        "metadataKeepers": ["started_at", "finished_at", "utc_offset"],
        "stopStamp": "2023-01-01T00:00:00Z"
    }"##;

    const HEADER: &str = "classification_id,workflow_id,workflow_version,subject_data\n";

    fn row(id: u64, workflow: u64, version: &str, subject: &str) -> String {
        format!("{id},{workflow},{version},\"{}\"\n", subject.replace('"', "\"\""))
    }

    #[fixture]
    fn catalogue() -> Catalogue {
        Catalogue::from_json(CATALOGUE).expect("valid catalogue")
    }

    fn exports(contents: &str) -> (TempDir, Dir) {
        let tmp = TempDir::new().expect("create temp dir");
        std::fs::write(tmp.path().join("meetings-classifications.csv"), contents)
            .expect("write export");
        let dir = Dir::open_ambient_dir(tmp.path(), ambient_authority()).expect("open dir");
        (tmp, dir)
    }

    #[rstest]
    fn filters_versions_tags_start_and_expands_subjects(catalogue: Catalogue) {
        let contents = [
            HEADER.to_owned(),
            row(1, 18504, "38.91", r##"{"9": {"#priority": 1, "retired": {"retired_at": "2022-01-05T10:00:00Z"}, "Date": "1 May", "Page": "1"}}"##),
            row(2, 18504, "37.1", r##"{"9": {"#priority": 1, "retired": null, "Date": "1 May", "Page": "1"}}"##),
            row(3, 18504, "38.92", r##"{"10": {"priority": 2, "Retired": null, "date": "1 May", "page": "2"}}"##),
        ]
        .concat();
        let (_tmp, dir) = exports(&contents);

        let export = WorkflowReader::new(&dir, &catalogue)
            .read(WorkflowId::new(18504))
            .expect("read export");

        assert_eq!(export.raw().len(), 3);
        let prepared = export.prepared();
        assert_eq!(
            prepared.columns(),
            [
                "classification_id",
                "workflow_id",
                "workflow_version",
                START_STAMP_COLUMN,
                "subj.#priority",
                "subj.retired.retired_at",
                "subj.date",
                "subj.page",
            ]
        );
        assert_eq!(prepared.len(), 2);
        assert_eq!(prepared.value(3, "subj.#priority"), Some("2"));
        assert_eq!(prepared.value(3, "subj.page"), Some("2"));
        assert_eq!(
            prepared.value(1, "subj.retired.retired_at"),
            Some("2022-01-05T10:00:00Z")
        );
        assert_eq!(prepared.value(3, "subj.retired.retired_at"), Some(""));
        assert_eq!(
            prepared.value(1, START_STAMP_COLUMN),
            Some("2021-11-17T00:00:00+00:00")
        );
    }

    #[rstest]
    #[case::other_workflow(vec![19279])]
    #[case::mixed_workflows(vec![18504, 19279])]
    fn rejects_exports_of_other_workflows(catalogue: Catalogue, #[case] workflows: Vec<u64>) {
        let contents: String = std::iter::once(HEADER.to_owned())
            .chain((1_u64..).zip(&workflows).map(|(id, workflow)| {
                row(id, *workflow, "38.91", r##"{"9": {"#priority": 1, "retired": null, "Date": "d", "Page": "1"}}"##)
            }))
            .collect();
        let (_tmp, dir) = exports(&contents);

        let err = WorkflowReader::new(&dir, &catalogue)
            .read(WorkflowId::new(18504))
            .expect_err("wrong workflow");
        assert!(matches!(
            err,
            PipelineError::SchemaMismatch(SchemaError::WorkflowMismatch { .. })
        ));
    }

    #[rstest]
    fn missing_export_is_a_read_error(catalogue: Catalogue) {
        let tmp = TempDir::new().expect("create temp dir");
        let dir = Dir::open_ambient_dir(tmp.path(), ambient_authority()).expect("open dir");
        let err = WorkflowReader::new(&dir, &catalogue)
            .read(WorkflowId::new(18504))
            .expect_err("no export");
        assert!(matches!(
            err,
            PipelineError::SchemaMismatch(SchemaError::Read { .. })
        ));
    }

    #[rstest]
    fn unknown_workflow_is_a_configuration_error(catalogue: Catalogue) {
        let (_tmp, dir) = exports(HEADER);
        let err = WorkflowReader::new(&dir, &catalogue)
            .read(WorkflowId::new(7))
            .expect_err("unknown");
        assert!(matches!(err, PipelineError::ConfigInconsistency(_)));
    }
}
