//! Unit registry: the set of compilation units and their per-unit state.
//!
//! A unit is either a file discovered through the search rules or a code
//! buffer injected directly. Units are identified by [`UnitId`] in
//! registration order and each carries a unique origin name used in
//! diagnostics.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::debug;

use crate::ast::{self, Item, Module};
use crate::diagnostic::{Diagnostic, DiagnosticRecord};
use crate::error::KilnError;
use crate::name_resolve::DeclSite;
use crate::span::{LineIndex, Location, UnitId};

/// Extension appended to unit names that have none.
pub const SOURCE_EXTENSION: &str = "kiln";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnitSource {
    File {
        /// The name the unit was requested under.
        logical_name: String,
        path: PathBuf,
    },
    Injected,
}

/// How far a unit has progressed through the per-unit stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitStage {
    Registered,
    Loaded,
    Parsed,
    Declared,
    /// Loading failed; the unit takes no further part in compilation.
    Failed,
}

#[derive(Debug)]
pub struct Unit {
    pub id: UnitId,
    pub origin: String,
    pub source: UnitSource,
    pub text: String,
    pub line_index: LineIndex,
    pub module: Option<Module>,
    pub stage: UnitStage,
}

impl Unit {
    /// Directory that relative paths written in this unit start from.
    pub fn base_dir(&self, working_dir: &Path) -> PathBuf {
        match &self.source {
            UnitSource::File { path, .. } => path
                .parent()
                .map_or_else(|| working_dir.to_path_buf(), Path::to_path_buf),
            UnitSource::Injected => working_dir.to_path_buf(),
        }
    }

    /// Store the unit's text once it has been read.
    pub fn set_text(&mut self, text: String) {
        self.line_index = LineIndex::new(&text);
        self.text = text;
        self.stage = UnitStage::Loaded;
    }
}

#[derive(Debug, Default)]
pub struct UnitRegistry {
    units: Vec<Unit>,
    canonical_paths: HashSet<PathBuf>,
    injected: u32,
}

impl UnitRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }

    pub fn get(&self, id: UnitId) -> &Unit {
        &self.units[id.index()]
    }

    pub fn get_mut(&mut self, id: UnitId) -> &mut Unit {
        &mut self.units[id.index()]
    }

    /// Units in `stage`, in registration order.
    pub fn in_stage(&self, stage: UnitStage) -> impl Iterator<Item = UnitId> + '_ {
        self.units
            .iter()
            .filter(move |unit| unit.stage == stage)
            .map(|unit| unit.id)
    }

    pub fn first_in_stage(&self, stage: UnitStage) -> Option<UnitId> {
        self.in_stage(stage).next()
    }

    /// Whether the file at `path` is already registered.
    pub fn contains_path(&self, path: &Path) -> bool {
        fs::canonicalize(path).is_ok_and(|canonical| self.canonical_paths.contains(&canonical))
    }

    /// Register a file unit whose text is read later, during loading.
    pub fn register_file(&mut self, logical_name: &str, path: PathBuf) -> Result<UnitId, KilnError> {
        let not_found = || KilnError::UnitNotFound {
            name: logical_name.to_string(),
            path: path.clone(),
        };
        if !path.is_file() {
            return Err(not_found());
        }
        let canonical = fs::canonicalize(&path).map_err(|_| not_found())?;
        if self.canonical_paths.contains(&canonical) {
            return Err(KilnError::DuplicateUnit(path));
        }
        self.canonical_paths.insert(canonical);

        let origin = path.display().to_string();
        let id = self.push(
            origin,
            UnitSource::File {
                logical_name: logical_name.to_string(),
                path,
            },
            None,
        );
        Ok(id)
    }

    /// Register a code buffer under a synthetic `<injected #N>` name.
    pub fn register_injected(&mut self, text: String) -> UnitId {
        self.injected += 1;
        let origin = format!("<injected #{}>", self.injected);
        self.push(origin, UnitSource::Injected, Some(text))
    }

    /// Register a code buffer under a fixed name, e.g. the core library.
    pub fn register_named(&mut self, origin: &str, text: String) -> UnitId {
        self.push(origin.to_string(), UnitSource::Injected, Some(text))
    }

    fn push(&mut self, origin: String, source: UnitSource, text: Option<String>) -> UnitId {
        let id = UnitId(self.units.len() as u32);
        debug!("registered unit {} as {origin}", id.0);
        let mut unit = Unit {
            id,
            origin,
            source,
            text: String::new(),
            line_index: LineIndex::new(""),
            module: None,
            stage: UnitStage::Registered,
        };
        if let Some(text) = text {
            unit.set_text(text);
        }
        self.units.push(unit);
        id
    }

    pub fn function_decl(&self, site: DeclSite) -> Option<&ast::FunctionDecl> {
        match self.item(site)? {
            Item::Function(func) => Some(func),
            _ => None,
        }
    }

    pub fn global_decl(&self, site: DeclSite) -> Option<&ast::GlobalDecl> {
        match self.item(site)? {
            Item::Global(global) => Some(global),
            _ => None,
        }
    }

    fn item(&self, site: DeclSite) -> Option<&Item> {
        self.units
            .get(site.unit.index())?
            .module
            .as_ref()?
            .items
            .get(site.item)
    }

    /// Turn a stage diagnostic into a record carrying origin and position.
    ///
    /// Diagnostics without a span get an empty origin and position 0:0.
    pub fn record(&self, diagnostic: Diagnostic) -> DiagnosticRecord {
        let Some(span) = diagnostic.span else {
            let location = Location {
                line: 0,
                column: 0,
                length: 0,
            };
            return DiagnosticRecord::new(diagnostic, "", location);
        };
        let unit = self.get(span.unit);
        let location = unit.line_index.locate(&unit.text, span.start, span.end);
        let origin = unit.origin.clone();
        DiagnosticRecord::new(diagnostic, origin, location)
    }
}

/// Resolve a unit name to a path.
///
/// `folder:rest` resolves under a mapped folder; other relative names
/// resolve under `base`. With `append_extension`, a name without an
/// extension gets `.kiln`.
pub fn resolve_unit_path(
    name: &str,
    folders: &HashMap<String, PathBuf>,
    base: &Path,
    append_extension: bool,
) -> PathBuf {
    let mut path = match name.split_once(':') {
        Some((folder, rest)) if folders.contains_key(folder) => folders[folder].join(rest),
        _ => {
            let path = Path::new(name);
            if path.is_absolute() {
                path.to_path_buf()
            } else {
                base.join(path)
            }
        }
    };
    if append_extension && path.extension().is_none() {
        path.set_extension(SOURCE_EXTENSION);
    }
    path
}

/// Whether `name` goes through a folder mapping (and so ignores any base directory).
pub fn is_mapped(name: &str, folders: &HashMap<String, PathBuf>) -> bool {
    name.split_once(':')
        .is_some_and(|(folder, _)| folders.contains_key(folder))
}
