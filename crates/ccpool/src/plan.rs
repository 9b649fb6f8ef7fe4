//! Maps source files to object files and decides which ones need compiling.

use std::collections::HashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

/// File in the output directory recording the settings of the last build.
pub const SETTINGS_FILE: &str = "build_settings.json";

/// Only this many leading lines of a file are searched for `#include`s.
const INCLUDE_SCAN_LINES: usize = 75;

/// Errors while building a [`BuildPlan`].
#[derive(Debug, thiserror::Error)]
pub enum PlanError {
    #[error("No sources to build")]
    NoSources,

    #[error("Source has no file name: {}", .path.display())]
    InvalidSource { path: PathBuf },

    #[error(
        "Got duplicate object file {} (from {} and {})",
        .object.display(),
        .first.display(),
        .second.display()
    )]
    DuplicateObject {
        object: PathBuf,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Failed to write build settings {}: {source}", .path.display())]
    SettingsWrite {
        path: PathBuf,
        source: std::io::Error,
    },
}

/// Which sources a plan leaves out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Freshness {
    /// Compile every source.
    RebuildAll,
    /// Skip a source when its object file is at least as new as the source
    /// and every header it includes. `<...>` includes are looked up in
    /// `include_dirs`, `"..."` includes next to the including file first.
    SkipUpToDate { include_dirs: Vec<PathBuf> },
}

/// Compiler and flags of a build, stored in the output directory so the next
/// incremental build can tell whether its objects are still usable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildSettings {
    pub compiler: PathBuf,
    pub flags: Vec<String>,
}

impl BuildSettings {
    pub fn new(compiler: impl Into<PathBuf>, flags: &[String]) -> Self {
        Self {
            compiler: compiler.into(),
            flags: flags.to_vec(),
        }
    }

    /// Settings of the previous build in `out_dir`, if any were stored and
    /// are readable.
    pub fn load(out_dir: &Path) -> Option<Self> {
        let path = out_dir.join(SETTINGS_FILE);
        let content = std::fs::read(&path).ok()?;
        match serde_json::from_slice(&content) {
            Ok(settings) => Some(settings),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "Ignoring unreadable build settings");
                None
            }
        }
    }

    pub fn store(&self, out_dir: &Path) -> Result<(), PlanError> {
        let path = out_dir.join(SETTINGS_FILE);
        serde_json::to_vec_pretty(self)
            .map_err(std::io::Error::from)
            .and_then(|json| std::fs::write(&path, json))
            .map_err(|source| PlanError::SettingsWrite { path, source })
    }

    /// Skipping is only allowed when `incremental` is set and the previous
    /// build in `out_dir` used exactly these settings.
    pub fn freshness(&self, out_dir: &Path, incremental: bool) -> Freshness {
        if !incremental {
            return Freshness::RebuildAll;
        }
        if Self::load(out_dir).as_ref() != Some(self) {
            info!("Build settings changed since the last build, rebuilding every source");
            return Freshness::RebuildAll;
        }
        Freshness::SkipUpToDate {
            include_dirs: include_dirs(&self.flags),
        }
    }
}

/// Directories named by `-I<dir>` or `-I <dir>` in compiler flags.
pub fn include_dirs(flags: &[String]) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut flags = flags.iter();
    while let Some(flag) = flags.next() {
        match flag.strip_prefix("-I") {
            Some("") => dirs.extend(flags.next().map(PathBuf::from)),
            Some(dir) => dirs.push(PathBuf::from(dir)),
            None => {}
        }
    }
    dirs
}

/// One source and the object file it compiles to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompileUnit {
    pub source: PathBuf,
    pub object: PathBuf,
}

/// The set of compile units for one build.
#[derive(Debug, Clone)]
pub struct BuildPlan {
    units: Vec<CompileUnit>,
    skipped: Vec<PathBuf>,
}

impl BuildPlan {
    /// Plan a build of `sources` into `out_dir`.
    pub fn new<I>(out_dir: &Path, sources: I, freshness: &Freshness) -> Result<Self, PlanError>
    where
        I: IntoIterator<Item = PathBuf>,
    {
        let mut units = Vec::new();
        let mut skipped = Vec::new();
        let mut seen: Vec<CompileUnit> = Vec::new();
        let mut scanner = match freshness {
            Freshness::RebuildAll => None,
            Freshness::SkipUpToDate { include_dirs } => Some(IncludeScanner::new(include_dirs)),
        };

        for source in sources {
            let object = object_path(out_dir, &source)
                .ok_or_else(|| PlanError::InvalidSource { path: source.clone() })?;

            if let Some(previous) = seen.iter().find(|unit| unit.object == object) {
                return Err(PlanError::DuplicateObject {
                    object,
                    first: previous.source.clone(),
                    second: source,
                });
            }

            let unit = CompileUnit { source, object };
            seen.push(unit.clone());

            if let Some(scanner) = scanner.as_mut()
                && scanner.is_up_to_date(&unit.source, &unit.object)
            {
                skipped.push(unit.source);
            } else {
                units.push(unit);
            }
        }

        if seen.is_empty() {
            return Err(PlanError::NoSources);
        }

        Ok(Self { units, skipped })
    }

    /// Units that need compiling, in the order the sources were given.
    pub fn units(&self) -> &[CompileUnit] {
        &self.units
    }

    /// Sources left out because their object file is up to date.
    pub fn skipped(&self) -> &[PathBuf] {
        &self.skipped
    }
}

/// `<out_dir>/<stem>.o`
pub fn object_path(out_dir: &Path, source: &Path) -> Option<PathBuf> {
    let mut name = OsString::from(source.file_stem()?);
    name.push(".o");
    Some(out_dir.join(name))
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

enum Include<'a> {
    /// `#include <name>`
    System(&'a str),
    /// `#include "name"`
    Quoted(&'a str),
}

fn includes(text: &str) -> impl Iterator<Item = Include<'_>> {
    text.lines().take(INCLUDE_SCAN_LINES).filter_map(|line| {
        let mut words = line.split_whitespace();
        if words.next()? != "#include" {
            return None;
        }
        let target = words.next()?;
        if let Some(name) = target.strip_prefix('<').and_then(|t| t.strip_suffix('>')) {
            Some(Include::System(name))
        } else {
            target
                .strip_prefix('"')
                .and_then(|t| t.strip_suffix('"'))
                .map(Include::Quoted)
        }
    })
}

/// Finds the newest modification time among a file and everything it
/// includes, caching per file across the whole plan.
struct IncludeScanner<'a> {
    include_dirs: &'a [PathBuf],
    newest: HashMap<PathBuf, Option<SystemTime>>,
}

impl<'a> IncludeScanner<'a> {
    fn new(include_dirs: &'a [PathBuf]) -> Self {
        Self {
            include_dirs,
            newest: HashMap::new(),
        }
    }

    /// Whether `object` exists and is not older than `source` or any header
    /// it pulls in. Any metadata error means the source gets rebuilt.
    fn is_up_to_date(&mut self, source: &Path, object: &Path) -> bool {
        match (self.newest_input(source), modified(object)) {
            (Some(input_time), Some(object_time)) => input_time <= object_time,
            _ => false,
        }
    }

    /// `None` for files that do not exist and for extensionless headers
    /// (`<vector>`), which belong to the toolchain.
    fn newest_input(&mut self, file: &Path) -> Option<SystemTime> {
        file.extension()?;
        if let Some(&cached) = self.newest.get(file) {
            return cached;
        }

        let own = modified(file);
        // Recorded before recursing so include cycles terminate.
        self.newest.insert(file.to_path_buf(), own);
        let mut newest = own?;

        let Ok(bytes) = std::fs::read(file) else {
            return Some(newest);
        };
        let text = String::from_utf8_lossy(&bytes);
        for candidate in self.candidates(file, &text) {
            if let Some(time) = self.newest_input(&candidate) {
                newest = newest.max(time);
            }
        }

        self.newest.insert(file.to_path_buf(), Some(newest));
        Some(newest)
    }

    fn candidates(&self, file: &Path, text: &str) -> Vec<PathBuf> {
        let mut candidates = Vec::new();
        for include in includes(text) {
            let name = match include {
                Include::System(name) => name,
                Include::Quoted(name) => {
                    if let Some(parent) = file.parent() {
                        candidates.push(parent.join(name));
                    }
                    name
                }
            };
            candidates.extend(self.include_dirs.iter().map(|dir| dir.join(name)));
        }
        candidates
    }
}
