//! SMAP (JSR-45 source map) parsing and queries.
//!
//! Kotlin embeds an SMAP in each class's debug-extension attribute to map
//! generated line numbers back to the author sources of inlined code. This
//! module parses the `Kotlin`/`KotlinDebug` strata and answers bidirectional
//! line queries; dest-line lookup is O(log n) over the mapped ranges.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;

// ── Errors ───────────────────────────────────────────────────────────────────

/// SMAP parse failure. Callers treat a broken SMAP as "class has no SMAP".
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SmapError {
    /// Input does not start with the `SMAP` header line.
    #[error("missing SMAP header")]
    MissingHeader,
    /// The header is truncated (no output file or default stratum).
    #[error("truncated SMAP header")]
    TruncatedHeader,
    /// Neither a `Kotlin` nor a `KotlinDebug` stratum is present.
    #[error("no Kotlin stratum")]
    NoKotlinStratum,
    /// A file entry could not be parsed.
    #[error("malformed file entry: {0:?}")]
    BadFileEntry(String),
    /// A line mapping could not be parsed.
    #[error("malformed line mapping: {0:?}")]
    BadLineMapping(String),
}

// ── Data model ───────────────────────────────────────────────────────────────

/// One contiguous line-range mapping inside a stratum.
///
/// Maps source lines `[source_start, source_start + range)` of the file
/// identified by `parent_file` onto generated lines
/// `[dest_start, dest_start + range)`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RangeMapping {
    pub source_start: u32,
    pub dest_start: u32,
    pub range: u32,
    /// File id this range maps into (SMAP-local).
    pub parent_file: u32,
}

impl RangeMapping {
    /// Whether `dest` falls inside this range's generated lines.
    pub fn contains_dest(&self, dest: u32) -> bool {
        dest >= self.dest_start && dest < self.dest_start + self.range
    }

    /// Whether `source` falls inside this range's author lines.
    pub fn contains_source(&self, source: u32) -> bool {
        source >= self.source_start && source < self.source_start + self.range
    }

    /// Map a generated line inside this range to its author line.
    pub fn map_dest_to_source(&self, dest: u32) -> u32 {
        debug_assert!(self.contains_dest(dest));
        self.source_start + (dest - self.dest_start)
    }

    /// Map an author line inside this range to its generated line.
    pub fn map_source_to_dest(&self, source: u32) -> u32 {
        debug_assert!(self.contains_source(source));
        self.dest_start + (source - self.source_start)
    }
}

/// A file declared in the stratum's `*F` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub id: u32,
    /// Leaf file name (e.g. `Main.kt`).
    pub name: String,
    /// Full path when the entry carried one, else equal to `name`.
    pub path: String,
    /// Ranges mapping into this file, in declaration order.
    pub ranges: Vec<RangeMapping>,
}

/// An author-source position resolved from an SMAP.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SmapPosition {
    pub file_name: String,
    pub file_path: String,
    pub line: u32,
}

// ── SourceMap ────────────────────────────────────────────────────────────────

/// A parsed SMAP, immutable once built.
#[derive(Debug, Clone)]
pub struct SourceMap {
    pub output_file: String,
    pub default_stratum: String,
    pub files: Vec<FileInfo>,
    /// `(dest_start, dest_end, file_idx, range_idx, ordinal)` sorted by
    /// `dest_start`, with a running prefix maximum of `dest_end` so the
    /// backward containment scan can stop early.
    dest_index: Vec<DestEntry>,
    prefix_max_end: Vec<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DestEntry {
    dest_start: u32,
    dest_end: u32,
    file_idx: usize,
    range_idx: usize,
    ordinal: usize,
}

impl PartialEq for SourceMap {
    fn eq(&self, other: &Self) -> bool {
        self.files == other.files
    }
}
impl Eq for SourceMap {}

impl SourceMap {
    fn build(output_file: String, default_stratum: String, files: Vec<FileInfo>) -> Self {
        let mut dest_index = Vec::new();
        let mut ordinal = 0usize;
        for (file_idx, file) in files.iter().enumerate() {
            for (range_idx, range) in file.ranges.iter().enumerate() {
                dest_index.push(DestEntry {
                    dest_start: range.dest_start,
                    dest_end: range.dest_start + range.range,
                    file_idx,
                    range_idx,
                    ordinal,
                });
                ordinal += 1;
            }
        }
        dest_index.sort_by_key(|e| (e.dest_start, e.ordinal));

        let mut prefix_max_end = Vec::with_capacity(dest_index.len());
        let mut max_end = 0u32;
        for entry in &dest_index {
            max_end = max_end.max(entry.dest_end);
            prefix_max_end.push(max_end);
        }

        Self {
            output_file,
            default_stratum,
            files,
            dest_index,
            prefix_max_end,
        }
    }

    /// All `(file, range)` pairs whose generated lines contain `dest`,
    /// in SMAP declaration order.
    pub fn ranges_containing_dest(&self, dest: u32) -> Vec<(&FileInfo, &RangeMapping)> {
        // Candidates start at or before `dest`; walk backward from the
        // partition point until the prefix max end can no longer reach it.
        let upper = self
            .dest_index
            .partition_point(|e| e.dest_start <= dest);
        let mut hits: Vec<&DestEntry> = Vec::new();
        for i in (0..upper).rev() {
            if self.prefix_max_end[i] <= dest {
                break;
            }
            let entry = &self.dest_index[i];
            if entry.dest_end > dest {
                hits.push(entry);
            }
        }
        hits.sort_by_key(|e| e.ordinal);
        hits.into_iter()
            .map(|e| (&self.files[e.file_idx], &self.files[e.file_idx].ranges[e.range_idx]))
            .collect()
    }

    /// Resolve a generated line to its author-source position.
    ///
    /// When several ranges contain the line, the first in SMAP order wins.
    pub fn find_source_position(&self, dest: u32) -> Option<SmapPosition> {
        let (file, range) = self.ranges_containing_dest(dest).into_iter().next()?;
        Some(SmapPosition {
            file_name: file.name.clone(),
            file_path: file.path.clone(),
            line: range.map_dest_to_source(dest),
        })
    }

    /// Every generated line any range maps `source_file:source_line` to.
    ///
    /// `source_file` matches either the declared name or the declared path.
    pub fn find_dest_lines(&self, source_file: &str, source_line: u32) -> Vec<u32> {
        let mut dests = Vec::new();
        for file in &self.files {
            if file.name != source_file && file.path != source_file {
                continue;
            }
            for range in &file.ranges {
                if range.contains_source(source_line) {
                    dests.push(range.map_source_to_dest(source_line));
                }
            }
        }
        dests.sort_unstable();
        dests.dedup();
        dests
    }

    /// Whether any range maps the generated line `dest`.
    pub fn contains_dest(&self, dest: u32) -> bool {
        !self.ranges_containing_dest(dest).is_empty()
    }

    /// Look up a declared file by its SMAP-local id.
    pub fn file_by_id(&self, id: u32) -> Option<&FileInfo> {
        self.files.iter().find(|f| f.id == id)
    }

    /// Total number of ranges across all files.
    pub fn range_count(&self) -> usize {
        self.dest_index.len()
    }

    /// Render the canonical `Kotlin` stratum form of this map.
    ///
    /// `parse(serialize(m))` reproduces `m`'s file tree.
    pub fn serialize(&self) -> String {
        let mut out = String::new();
        out.push_str("SMAP\n");
        out.push_str(&self.output_file);
        out.push('\n');
        out.push_str("Kotlin\n");
        out.push_str("*S Kotlin\n");
        out.push_str("*F\n");
        for file in &self.files {
            out.push_str(&format!("+ {} {}\n{}\n", file.id, file.name, file.path));
        }
        out.push_str("*L\n");
        for file in &self.files {
            for range in &file.ranges {
                out.push_str(&format!(
                    "{}#{},{}:{}\n",
                    range.source_start, range.parent_file, range.range, range.dest_start
                ));
            }
        }
        out.push_str("*E\n");
        out
    }
}

// ── Parser ───────────────────────────────────────────────────────────────────

/// Parse an SMAP from a class's debug-extension text.
///
/// Scans for the `Kotlin` and `KotlinDebug` strata and keeps the debug
/// stratum when both appear; all other strata are ignored.
pub fn parse(input: &str) -> Result<SourceMap, SmapError> {
    let mut lines = input.lines();
    match lines.next() {
        Some(header) if header.trim() == "SMAP" => {}
        _ => return Err(SmapError::MissingHeader),
    }
    let output_file = lines.next().ok_or(SmapError::TruncatedHeader)?.to_string();
    let default_stratum = lines.next().ok_or(SmapError::TruncatedHeader)?.to_string();

    let rest: Vec<&str> = lines.collect();
    let kotlin = extract_stratum(&rest, "Kotlin");
    let debug = extract_stratum(&rest, "KotlinDebug");
    let (files, mappings) = debug.or(kotlin)?;

    let mut file_infos = parse_files(&files)?;
    parse_mappings(&mappings, &mut file_infos)?;

    Ok(SourceMap::build(output_file, default_stratum, file_infos))
}

/// Raw `*F` and `*L` section lines of one stratum.
type StratumLines<'a> = (Vec<&'a str>, Vec<&'a str>);

fn extract_stratum<'a>(lines: &[&'a str], name: &str) -> Result<StratumLines<'a>, SmapError> {
    let header = format!("*S {name}");
    let start = lines
        .iter()
        .position(|l| l.trim() == header)
        .ok_or(SmapError::NoKotlinStratum)?;

    let mut files = Vec::new();
    let mut mappings = Vec::new();
    let mut section = ' ';
    for line in &lines[start + 1..] {
        let trimmed = line.trim_end();
        if trimmed == "*E" || trimmed.starts_with("*S ") {
            break;
        }
        match trimmed {
            "*F" => section = 'F',
            "*L" => section = 'L',
            _ if trimmed.starts_with('*') => section = ' ',
            _ => match section {
                'F' => files.push(*line),
                'L' => {
                    if !trimmed.is_empty() {
                        mappings.push(*line);
                    }
                }
                _ => {}
            },
        }
    }
    Ok((files, mappings))
}

fn parse_files(lines: &[&str]) -> Result<Vec<FileInfo>, SmapError> {
    let mut files = Vec::new();
    let mut iter = lines.iter().peekable();
    while let Some(line) = iter.next() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (has_path, entry) = match trimmed.strip_prefix('+') {
            Some(rest) => (true, rest.trim_start()),
            None => (false, trimmed),
        };
        let (id_text, name) = entry
            .split_once(' ')
            .ok_or_else(|| SmapError::BadFileEntry(trimmed.to_string()))?;
        let id: u32 = id_text
            .parse()
            .map_err(|_| SmapError::BadFileEntry(trimmed.to_string()))?;
        let name = name.trim().to_string();
        let path = if has_path {
            iter.next()
                .map(|l| l.trim().to_string())
                .ok_or_else(|| SmapError::BadFileEntry(trimmed.to_string()))?
        } else {
            name.clone()
        };
        files.push(FileInfo {
            id,
            name,
            path,
            ranges: Vec::new(),
        });
    }
    Ok(files)
}

fn parse_mappings(lines: &[&str], files: &mut [FileInfo]) -> Result<(), SmapError> {
    for line in lines {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        let (lhs, rhs) = trimmed
            .split_once(':')
            .ok_or_else(|| SmapError::BadLineMapping(trimmed.to_string()))?;

        // lhs := <src-line> ('#' <file-id> (',' <repeat>)?)?
        let (src_text, file_id, repeat) = match lhs.split_once('#') {
            Some((src, file_part)) => match file_part.split_once(',') {
                Some((fid, rep)) => (src, parse_num(fid, trimmed)?, parse_num(rep, trimmed)?),
                None => (src, parse_num(file_part, trimmed)?, 1),
            },
            None => (lhs, 1, 1),
        };
        let source_start = parse_num(src_text, trimmed)?;

        // rhs := <dest-line> (',' <increment>)? — the increment is accepted
        // but does not alter the mapping.
        let dest_start = match rhs.split_once(',') {
            Some((dest, _increment)) => parse_num(dest, trimmed)?,
            None => parse_num(rhs, trimmed)?,
        };

        let range = RangeMapping {
            source_start,
            dest_start,
            range: repeat,
            parent_file: file_id,
        };
        let file = files
            .iter_mut()
            .find(|f| f.id == file_id)
            .ok_or_else(|| SmapError::BadLineMapping(trimmed.to_string()))?;
        file.ranges.push(range);
    }
    Ok(())
}

fn parse_num(text: &str, context: &str) -> Result<u32, SmapError> {
    text.trim()
        .parse()
        .map_err(|_| SmapError::BadLineMapping(context.to_string()))
}

// ── SmapCache ────────────────────────────────────────────────────────────────

/// Per-session cache of parsed SMAPs, keyed by declaring class name.
///
/// Classes without an SMAP (or with an unparseable one) cache `None` so the
/// debug-extension fetch is not repeated on later queries.
#[derive(Default)]
pub struct SmapCache {
    maps: RwLock<HashMap<String, Arc<Option<SourceMap>>>>,
}

impl SmapCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the cached SMAP for `class_name`, computing it with `fetch` on
    /// the first request.
    pub fn get_or_insert_with<F>(&self, class_name: &str, fetch: F) -> Arc<Option<SourceMap>>
    where
        F: FnOnce() -> Option<String>,
    {
        if let Some(found) = self.maps.read().expect("smap cache poisoned").get(class_name) {
            return Arc::clone(found);
        }
        let parsed = fetch().and_then(|text| match parse(&text) {
            Ok(map) => Some(map),
            Err(err) => {
                log::warn!("ignoring unparseable SMAP for {class_name}: {err}");
                None
            }
        });
        let entry = Arc::new(parsed);
        let mut maps = self.maps.write().expect("smap cache poisoned");
        Arc::clone(maps.entry(class_name.to_string()).or_insert(entry))
    }

    /// Number of cached entries (including cached absences).
    pub fn len(&self) -> usize {
        self.maps.read().expect("smap cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
