//! One end-to-end pseudonymisation run.
//!
//! A run validates its configuration, reads and assembles every selected
//! workflow, and renders all outputs in memory. Only then does it write
//! anything: the identity dictionary first, followed by the output files.
//! A failure at any earlier point leaves every file on disk untouched.
//!
//! A failed output write leaves the new dictionary in place beside the
//! previous outputs. Every output on disk then still resolves through the
//! dictionary, and rerunning the same exports reproduces the missing files
//! with the pseudonyms already persisted.

use std::collections::BTreeSet;
use std::ffi::OsStr;
use std::fs;
use std::path::{Path, PathBuf};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::ambient_authority;
use cap_std::fs::Dir;
use tracing::info;

use crate::assembler::RecordAssembler;
use crate::atomic_io::{probe_writable, write_atomic};
use crate::catalogue::{Catalogue, WorkflowId};
use crate::error::{ConfigError, PipelineError, SchemaError};
use crate::identity::{IdentityRegistry, PseudonymGenerator};
use crate::settings::Settings;
use crate::sharing::ShareableExporter;
use crate::workflow_reader::WorkflowReader;

/// File name of the unified analysis table.
pub const ANALYSIS_FILE: &str = "all_classifications.csv";

/// Counts describing a completed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Workflow exports read.
    pub workflows: usize,
    /// Rows in the analysis table.
    pub rows: usize,
    /// Identities in the dictionary after the run.
    pub identities: usize,
    /// Identities first seen in this run.
    pub new_identities: usize,
    /// Sharing exports written.
    pub projects: usize,
}

struct Output<'a> {
    dir: &'a Dir,
    name: Utf8PathBuf,
    contents: Vec<u8>,
}

/// Runs the pipeline described by `settings`.
///
/// # Errors
///
/// Returns [`PipelineError`] for any inconsistency in configuration, export
/// data or the identity dictionary, and for failed writes. Nothing is written
/// unless every export was read and assembled successfully. A
/// [`PipelineError::Write`] raised after the dictionary was persisted leaves
/// that dictionary on disk; outputs not yet replaced keep their previous
/// contents.
pub fn run(settings: &Settings) -> Result<RunSummary, PipelineError> {
    let catalogue = Catalogue::from_file(&settings.catalogue_path())?;
    let selection = settings.selection()?;
    let selected: Vec<WorkflowId> = catalogue
        .select(selection.as_deref())?
        .iter()
        .map(|workflow| workflow.id())
        .collect();
    let generator = PseudonymGenerator::new(settings.pseudonym_digits, settings.pseudonym_seed)?;

    let (dictionary_dir, dictionary_file) = dictionary_location(&settings.dictionary_path())?;
    let output_dir = open_writable(&settings.output_dir())?;
    let secrets_dir = open_writable(&settings.secrets_dir())?;
    let sharing_dir = if settings.skip_sharing {
        None
    } else {
        Some(open_writable(&settings.sharing_dir())?)
    };
    let exports_dir = open_exports(&settings.exports_dir())?;

    let mut registry = IdentityRegistry::load(&dictionary_dir, &dictionary_file, generator)?;
    info!(
        workflows = selected.len(),
        identities = registry.len(),
        "starting run"
    );

    let reader = WorkflowReader::new(&exports_dir, &catalogue);
    let exports = selected
        .iter()
        .map(|id| reader.read(*id))
        .collect::<Result<Vec<_>, _>>()?;
    let assembly = RecordAssembler::new(&catalogue).assemble(exports, &mut registry)?;

    let mut outputs = vec![Output {
        dir: &output_dir,
        name: Utf8PathBuf::from(ANALYSIS_FILE),
        contents: assembly.analysis.to_csv()?,
    }];
    for export in &assembly.exports {
        outputs.push(Output {
            dir: &secrets_dir,
            name: Utf8PathBuf::from(format!("{}-classifications.csv", export.name)),
            contents: export.table.to_csv()?,
        });
    }

    let mut projects = 0;
    if let Some(dir) = sharing_dir.as_ref() {
        let processed = processed_workflows(&catalogue, &selected);
        let exporter = ShareableExporter::new(&exports_dir, &catalogue);
        for project in exporter.export_all(&assembly.sharing, &processed)? {
            outputs.push(Output {
                dir,
                name: Utf8PathBuf::from(project.file_name),
                contents: project.table.to_csv()?,
            });
            projects += 1;
        }
    }

    let summary = RunSummary {
        workflows: selected.len(),
        rows: assembly.analysis.len(),
        identities: registry.len(),
        new_identities: registry.added(),
        projects,
    };

    registry.persist(&dictionary_dir, &dictionary_file)?;
    for output in &outputs {
        write_atomic(output.dir, &output.name, &output.contents)?;
    }

    info!(
        rows = summary.rows,
        identities = summary.identities,
        new_identities = summary.new_identities,
        files = outputs.len(),
        "run complete"
    );
    Ok(summary)
}

/// Workflows present in the assembled table: the selection plus the derived
/// workflow when its parent was selected.
fn processed_workflows(catalogue: &Catalogue, selected: &[WorkflowId]) -> BTreeSet<WorkflowId> {
    let mut processed: BTreeSet<WorkflowId> = selected.iter().copied().collect();
    let derived = catalogue
        .split()
        .filter(|split| processed.contains(&split.parent()))
        .map(|split| split.child_id());
    processed.extend(derived);
    processed
}

fn dictionary_location(path: &Path) -> Result<(Dir, Utf8PathBuf), ConfigError> {
    let file = dictionary_file_name(path)
        .map(Utf8Path::to_path_buf)
        .ok_or_else(|| ConfigError::Unwritable {
            path: path.to_path_buf(),
            message: "identity dictionary path must end in a UTF-8 file name".to_owned(),
        })?;
    let parent = path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    Ok((open_writable(parent)?, file))
}

/// Creates `path` if needed and confirms files can be created in it.
fn open_writable(path: &Path) -> Result<Dir, ConfigError> {
    let unwritable = |err: std::io::Error| ConfigError::Unwritable {
        path: path.to_path_buf(),
        message: err.to_string(),
    };
    fs::create_dir_all(path).map_err(unwritable)?;
    let dir = Dir::open_ambient_dir(path, ambient_authority()).map_err(unwritable)?;
    probe_writable(&dir).map_err(unwritable)?;
    Ok(dir)
}

fn open_exports(path: &Path) -> Result<Dir, SchemaError> {
    Dir::open_ambient_dir(path, ambient_authority()).map_err(|err| SchemaError::Read {
        path: PathBuf::from(path),
        message: err.to_string(),
    })
}

fn dictionary_file_name(path: &Path) -> Option<&Utf8Path> {
    path.file_name()
        .and_then(OsStr::to_str)
        .map(Utf8Path::new)
}
