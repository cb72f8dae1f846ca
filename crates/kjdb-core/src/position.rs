//! Translation between remote code locations and author-source positions.
//!
//! Uses the owning class's SMAP when one is present, falling back to the
//! location's own line number and generated source name.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::smap::{SmapCache, SourceMap};
use crate::vm::{ClassId, CodeLocation, TargetVm};

// ── SourcePosition ───────────────────────────────────────────────────────────

/// A position in an author source file.
///
/// `file` is the leaf name the compiler embedded, never an absolute path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    pub file: String,
    pub line: u32,
    pub column: Option<u32>,
}

impl SourcePosition {
    pub fn new(file: impl Into<String>, line: u32) -> Self {
        Self {
            file: file.into(),
            line,
            column: None,
        }
    }
}

impl std::fmt::Display for SourcePosition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.column {
            Some(col) => write!(f, "{}:{}:{}", self.file, self.line, col),
            None => write!(f, "{}:{}", self.file, self.line),
        }
    }
}

// ── PositionManager ──────────────────────────────────────────────────────────

/// Maps remote locations to source positions and back.
///
/// Owns the per-session SMAP cache; all queries are cheap after the first
/// touch of a class.
pub struct PositionManager {
    vm: Arc<dyn TargetVm>,
    smaps: SmapCache,
}

impl PositionManager {
    pub fn new(vm: Arc<dyn TargetVm>) -> Self {
        Self {
            vm,
            smaps: SmapCache::new(),
        }
    }

    /// The parsed SMAP for a class, fetched and cached on first use.
    pub fn smap_for(&self, class_id: ClassId, class_name: &str) -> Arc<Option<SourceMap>> {
        let vm = Arc::clone(&self.vm);
        self.smaps.get_or_insert_with(class_name, || {
            vm.source_debug_extension(class_id).ok().flatten()
        })
    }

    /// Author-source position of a remote location.
    ///
    /// SMAP-mapped when the class has one and the line is mapped; otherwise
    /// the location's own source name and line. `None` for synthetic code
    /// with no usable line number.
    pub fn location_to_position(&self, location: &CodeLocation) -> Option<SourcePosition> {
        if location.line > 0 {
            let smap = self.smap_for(location.class_id, &location.class_name);
            if let Some(map) = smap.as_ref() {
                if let Some(pos) = map.find_source_position(location.line as u32) {
                    return Some(SourcePosition::new(pos.file_name, pos.line));
                }
            }
            return Some(SourcePosition::new(
                location.source_name.clone(),
                location.line as u32,
            ));
        }
        None
    }

    /// Every author position whose inline expansion covers `location`,
    /// deduplicated by `(file, line)`.
    pub fn inlined_positions_at(&self, location: &CodeLocation) -> Vec<SourcePosition> {
        if location.line <= 0 {
            return Vec::new();
        }
        let smap = self.smap_for(location.class_id, &location.class_name);
        let Some(map) = smap.as_ref() else {
            return Vec::new();
        };
        let mut positions = Vec::new();
        for (file, range) in map.ranges_containing_dest(location.line as u32) {
            let pos = SourcePosition::new(
                file.name.clone(),
                range.map_dest_to_source(location.line as u32),
            );
            if !positions.contains(&pos) {
                positions.push(pos);
            }
        }
        positions
    }

    /// Whether `location` sits inside inline-expanded code.
    pub fn is_in_inline_function(&self, location: &CodeLocation) -> bool {
        if location.line <= 0 {
            return false;
        }
        let smap = self.smap_for(location.class_id, &location.class_name);
        smap.as_ref()
            .as_ref()
            .map(|map| map.contains_dest(location.line as u32))
            .unwrap_or(false)
    }

    /// Every remote location that corresponds to `file:line`.
    ///
    /// Considers both classes whose declared source matches the file and
    /// classes whose SMAP maps the author line into generated code. Results
    /// are deduplicated by `(class, generated line)`.
    pub fn find_locations(&self, file: &str, line: u32) -> Result<Vec<CodeLocation>> {
        let mut found: Vec<CodeLocation> = Vec::new();
        for class in self.vm.all_classes()? {
            let mut candidate_lines: Vec<i32> = Vec::new();

            if class.source_name.as_deref() == Some(file) {
                candidate_lines.push(line as i32);
            }

            let smap = self.smap_for(class.id, &class.name);
            if let Some(map) = smap.as_ref() {
                for dest in map.find_dest_lines(file, line) {
                    candidate_lines.push(dest as i32);
                }
            }

            candidate_lines.sort_unstable();
            candidate_lines.dedup();
            for generated in candidate_lines {
                for location in self.vm.locations_of_line(class.id, generated)? {
                    let duplicate = found.iter().any(|existing| {
                        existing.class_id == location.class_id && existing.line == location.line
                    });
                    if !duplicate {
                        found.push(location);
                    }
                }
            }
        }
        Ok(found)
    }
}
