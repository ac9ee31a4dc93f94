//! Per-project redistributable exports.
//!
//! Each project gets the rows of its workflows plus columns locating every
//! subject on the web: the subject's page in the project
//! (`location.zooniverse.project`), the uploaded image
//! (`location.zooniverse.plain`), and any project-specific locations built
//! from templates. Locations come from the project's subject index, which is
//! maintained independently of the classification exports and can be
//! incomplete or contradictory; neither aborts the export.

use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::path::PathBuf;

use cap_std::fs::Dir;
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::catalogue::{Catalogue, LocationTemplate, Project, TemplatePart, WorkflowId};
use crate::error::{PipelineError, SchemaError};
use crate::table::{Row, Table};

/// Column holding the subject's page within the project.
pub const PROJECT_LOCATION_COLUMN: &str = "location.zooniverse.project";

/// Column holding the subject's image URL.
pub const PLAIN_LOCATION_COLUMN: &str = "location.zooniverse.plain";

/// Placeholder written when a subject is absent from the index.
pub const MISSING_LOCATION: &str = "MISSING";

/// Key of the image URL inside a subject's `locations` JSON.
const PLAIN_LOCATION_KEY: &str = "0";

/// Outcome of resolving one subject location.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution<'a> {
    /// Exactly one candidate location exists.
    Found(&'a str),
    /// Several distinct candidates exist; the lexicographically greatest is
    /// chosen.
    Ambiguous {
        /// The chosen candidate.
        chosen: &'a str,
        /// Number of distinct candidates.
        candidates: usize,
    },
    /// The subject is not in the index.
    Missing,
}

impl<'a> Resolution<'a> {
    fn from_candidates(candidates: Option<&'a BTreeSet<String>>) -> Self {
        let Some(set) = candidates else {
            return Self::Missing;
        };
        match (set.last(), set.len()) {
            (None, _) => Self::Missing,
            (Some(only), 1) => Self::Found(only),
            (Some(chosen), count) => Self::Ambiguous {
                chosen,
                candidates: count,
            },
        }
    }

    /// Returns the resolved location, if any.
    #[must_use]
    pub const fn location(&self) -> Option<&'a str> {
        match self {
            Self::Found(location) | Self::Ambiguous { chosen: location, .. } => Some(*location),
            Self::Missing => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SubjectRecord {
    subject_id: u64,
    #[serde(default)]
    workflow_id: Option<u64>,
    subject_set_id: u64,
    locations: String,
}

/// Candidate locations of a project's subjects.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubjectIndex {
    project: HashMap<(u64, WorkflowId), BTreeSet<String>>,
    plain: HashMap<u64, BTreeSet<String>>,
}

impl SubjectIndex {
    /// Reads a subject index CSV with `subject_id`, `workflow_id`,
    /// `subject_set_id` and `locations` columns; other columns are ignored.
    ///
    /// Project URLs are built as
    /// `{project_url}classify/workflow/{workflow}/subject-set/{set}/subject/{subject}`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::Csv`] if a record lacks a required column or a
    /// numeric field does not parse.
    pub fn from_csv_reader<R: Read>(
        reader: R,
        project_url: &str,
        context: &str,
    ) -> Result<Self, SchemaError> {
        let mut index = Self::default();
        let mut csv_reader = csv::Reader::from_reader(reader);
        for result in csv_reader.deserialize::<SubjectRecord>() {
            let record = result.map_err(|err| SchemaError::Csv {
                context: context.to_owned(),
                message: err.to_string(),
            })?;
            if let Some(workflow) = record.workflow_id {
                index
                    .project
                    .entry((record.subject_id, WorkflowId::new(workflow)))
                    .or_default()
                    .insert(format!(
                        "{project_url}classify/workflow/{workflow}/subject-set/{}/subject/{}",
                        record.subject_set_id, record.subject_id
                    ));
            }
            match image_location(&record.locations) {
                Some(url) => {
                    index.plain.entry(record.subject_id).or_default().insert(url);
                }
                None => warn!(
                    subject = record.subject_id,
                    context, "subject has no usable image location"
                ),
            }
        }
        Ok(index)
    }

    /// Resolves the project page of `subject` as shown in `workflow`.
    #[must_use]
    pub fn project_location(&self, subject: u64, workflow: WorkflowId) -> Resolution<'_> {
        Resolution::from_candidates(self.project.get(&(subject, workflow)))
    }

    /// Resolves the image URL of `subject`.
    #[must_use]
    pub fn plain_location(&self, subject: u64) -> Resolution<'_> {
        Resolution::from_candidates(self.plain.get(&subject))
    }
}

fn image_location(locations: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(locations).ok()?;
    parsed
        .get(PLAIN_LOCATION_KEY)
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// One project's sharing export.
#[derive(Debug, Clone)]
pub struct ProjectExport {
    /// Output file name, `{slug}.csv`.
    pub file_name: String,
    /// Rows of the project's workflows with location columns.
    pub table: Table,
}

/// Builds per-project sharing exports.
#[derive(Debug)]
pub struct ShareableExporter<'a> {
    subjects: &'a Dir,
    catalogue: &'a Catalogue,
}

impl<'a> ShareableExporter<'a> {
    /// Creates an exporter reading subject indexes from `subjects`.
    #[must_use]
    pub const fn new(subjects: &'a Dir, catalogue: &'a Catalogue) -> Self {
        Self {
            subjects,
            catalogue,
        }
    }

    /// Exports every catalogue project that has at least one of the
    /// `processed` workflows.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if a subject index cannot be read or a
    /// column needed for locations is missing.
    pub fn export_all(
        &self,
        sharing: &Table,
        processed: &BTreeSet<WorkflowId>,
    ) -> Result<Vec<ProjectExport>, PipelineError> {
        let mut exports = Vec::new();
        for project in self.catalogue.projects() {
            if project.workflows().iter().any(|id| processed.contains(id)) {
                exports.push(self.export(sharing, project)?);
            } else {
                debug!(project = project.name(), "no processed workflows; skipping");
            }
        }
        Ok(exports)
    }

    /// Exports one project.
    ///
    /// # Errors
    ///
    /// Returns [`PipelineError`] if the subject index cannot be read or a
    /// column needed for locations is missing.
    pub fn export(&self, sharing: &Table, project: &Project) -> Result<ProjectExport, PipelineError> {
        let workflow = sharing.require_column("workflow_id")?;
        let mut table = sharing.filtered(|row| {
            Ok(parse_workflow(row, workflow).is_some_and(|id| project.workflows().contains(&id)))
        })?;

        let index = self.load_index(project)?;
        let (project_column, plain_column) = self.resolve_locations(&table, project, &index)?;
        table.push_column(PROJECT_LOCATION_COLUMN, project_column)?;
        table.push_column(PLAIN_LOCATION_COLUMN, plain_column)?;

        for (column, template) in project.location_templates() {
            let values = render_template(&table, template)?;
            table.push_column(column, values)?;
        }

        info!(project = project.name(), rows = table.len(), "built sharing export");
        Ok(ProjectExport {
            file_name: format!("{}.csv", project.slug()),
            table,
        })
    }

    fn load_index(&self, project: &Project) -> Result<SubjectIndex, SchemaError> {
        let file = self
            .subjects
            .open(project.subjects_file())
            .map_err(|err| SchemaError::Read {
                path: PathBuf::from(project.subjects_file()),
                message: err.to_string(),
            })?;
        SubjectIndex::from_csv_reader(file, project.url(), project.subjects_file())
    }

    /// Maps a derived workflow back to the exported workflow the index knows.
    fn indexed_workflow(&self, workflow: WorkflowId) -> WorkflowId {
        self.catalogue
            .split()
            .filter(|split| split.child_id() == workflow)
            .map_or(workflow, |split| split.parent())
    }

    fn resolve_locations(
        &self,
        table: &Table,
        project: &Project,
        index: &SubjectIndex,
    ) -> Result<(HashMap<u64, String>, HashMap<u64, String>), SchemaError> {
        let subject_column = table.require_column("subject_ids")?;
        let workflow_column = table.require_column("workflow_id")?;
        let mut project_values = HashMap::with_capacity(table.len());
        let mut plain_values = HashMap::with_capacity(table.len());
        let mut missing = BTreeSet::new();
        let mut ambiguous = BTreeSet::new();

        for row in table.rows() {
            let subject = row.cell(subject_column).trim().parse::<u64>().ok();
            let workflow = parse_workflow(row, workflow_column).map(|id| self.indexed_workflow(id));

            let page = match (subject, workflow) {
                (Some(subject_id), Some(workflow_id)) => index.project_location(subject_id, workflow_id),
                _ => Resolution::Missing,
            };
            let image = subject.map_or(Resolution::Missing, |subject_id| index.plain_location(subject_id));

            for resolution in [&page, &image] {
                match resolution {
                    Resolution::Missing => {
                        missing.insert(row.cell(subject_column).to_owned());
                    }
                    Resolution::Ambiguous { chosen, candidates } => {
                        if ambiguous.insert((row.cell(subject_column).to_owned(), *chosen)) {
                            warn!(
                                project = project.name(),
                                subject = row.cell(subject_column),
                                candidates = *candidates,
                                chosen = *chosen,
                                "subject has disagreeing locations"
                            );
                        }
                    }
                    Resolution::Found(_) => {}
                }
            }

            project_values.insert(
                row.classification_id(),
                page.location().unwrap_or(MISSING_LOCATION).to_owned(),
            );
            let plain = image.location().map_or_else(
                || MISSING_LOCATION.to_owned(),
                |url| format!("{}{url}", project.plain_location_prefix().unwrap_or_default()),
            );
            plain_values.insert(row.classification_id(), plain);
        }

        if !missing.is_empty() {
            warn!(
                project = project.name(),
                subjects = missing.len(),
                "subjects missing from the index"
            );
        }
        Ok((project_values, plain_values))
    }
}

fn parse_workflow(row: &Row, index: usize) -> Option<WorkflowId> {
    row.cell(index).parse().ok()
}

/// A template part bound to a column position.
enum Piece<'a> {
    Text(&'a str),
    Cell(usize),
}

fn render_template(
    table: &Table,
    template: &LocationTemplate,
) -> Result<HashMap<u64, String>, SchemaError> {
    let pieces = template
        .parts()
        .iter()
        .map(|part| match part {
            TemplatePart::Literal(text) => Ok(Piece::Text(text)),
            TemplatePart::Column(column) => table.require_column(column).map(Piece::Cell),
        })
        .collect::<Result<Vec<_>, _>>()?;
    Ok(table
        .rows()
        .iter()
        .map(|row| {
            let rendered: String = pieces
                .iter()
                .map(|piece| match piece {
                    Piece::Text(text) => *text,
                    Piece::Cell(index) => row.cell(*index),
                })
                .collect();
            (row.classification_id(), rendered)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use rstest::{fixture, rstest};

    use super::*;

    const URL: &str = "https://example.org/projects/minutes/";

    const INDEX: &str = "\
subject_id,project_id,workflow_id,subject_set_id,locations
9,1,18504,100,\"{\"\"0\"\":\"\"https://img/9a.jpeg\"\"}\"
9,1,18504,101,\"{\"\"0\"\":\"\"https://img/9a.jpeg\"\"}\"
10,1,18504,100,\"{\"\"0\"\":\"\"https://img/10.jpeg\"\"}\"
10,1,,100,\"{\"\"0\"\":\"\"https://img/10b.jpeg\"\"}\"
11,1,18504,100,not json
";

    #[fixture]
    fn index() -> SubjectIndex {
        SubjectIndex::from_csv_reader(INDEX.as_bytes(), URL, "fixture").expect("valid index")
    }

    #[rstest]
    fn single_candidate_is_found(index: SubjectIndex) {
        assert_eq!(
            index.project_location(11, WorkflowId::new(18504)),
            Resolution::Found(
                "https://example.org/projects/minutes/classify/workflow/18504/subject-set/100/subject/11"
            )
        );
        assert_eq!(index.plain_location(11), Resolution::Missing);
    }

    #[rstest]
    fn disagreeing_candidates_pick_the_greatest(index: SubjectIndex) {
        assert_eq!(
            index.project_location(9, WorkflowId::new(18504)),
            Resolution::Ambiguous {
                chosen: "https://example.org/projects/minutes/classify/workflow/18504/subject-set/101/subject/9",
                candidates: 2,
            }
        );
        assert_eq!(
            index.plain_location(10),
            Resolution::Ambiguous {
                chosen: "https://img/10b.jpeg",
                candidates: 2,
            }
        );
    }

    #[rstest]
    fn duplicate_candidates_collapse(index: SubjectIndex) {
        assert_eq!(index.plain_location(9), Resolution::Found("https://img/9a.jpeg"));
    }

    #[rstest]
    #[case(12, 18504)]
    #[case(9, 19279)]
    fn unknown_subjects_are_missing(index: SubjectIndex, #[case] subject: u64, #[case] workflow: u64) {
        assert_eq!(
            index.project_location(subject, WorkflowId::new(workflow)),
            Resolution::Missing
        );
    }

    #[test]
    fn rejects_index_without_required_columns() {
        let result = SubjectIndex::from_csv_reader("subject_id\n1\n".as_bytes(), URL, "fixture");
        assert!(matches!(result, Err(SchemaError::Csv { .. })));
    }

    #[test]
    fn templates_render_per_row() {
        let table = Table::from_csv_str(
            "classification_id,subj.barcode\n1,E00123\n2,E00456\n",
            "fixture",
        )
        .expect("valid table");
        let template =
            LocationTemplate::parse("https://data.rbge.org.uk/herb/{subj.barcode}").expect("template");
        let values = render_template(&table, &template).expect("render");
        assert_eq!(
            values.get(&2).map(String::as_str),
            Some("https://data.rbge.org.uk/herb/E00456")
        );

        let missing = LocationTemplate::parse("{subj.image}").expect("template");
        assert_eq!(
            render_template(&table, &missing),
            Err(SchemaError::MissingColumn {
                column: "subj.image".to_owned()
            })
        );
    }
}
