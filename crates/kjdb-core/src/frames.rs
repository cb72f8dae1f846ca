//! Logical call stacks, including virtual frames for inlined functions.
//!
//! Raw VM frames are augmented with SMAP data: when a frame's generated
//! line falls inside a cross-file inline range, one virtual frame per
//! nested range is prepended ahead of the real frame. Virtual frames carry
//! author positions but are never addressable in the VM; variable lookups
//! resolve to the enclosing real frame.

use std::sync::Arc;

use crate::error::Result;
use crate::position::{PositionManager, SourcePosition};
use crate::smap::{FileInfo, RangeMapping};
use crate::vm::{TargetVm, ThreadId};

// ── StackFrame ───────────────────────────────────────────────────────────────

/// One entry of the user-visible call stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackFrame {
    /// Contiguous index over the combined stack; 0 is innermost.
    pub index: usize,
    pub class_name: String,
    pub method_name: String,
    /// Source file shown when no line is known.
    pub source_name: String,
    pub position: Option<SourcePosition>,
    /// Synthesized from SMAP data rather than present in the VM.
    pub is_inline: bool,
    pub is_native: bool,
    /// Nesting order for inline frames, innermost first from 1; 0 for real
    /// frames.
    pub inline_depth: u32,
    /// Index into the VM's own frame list for variable lookups.
    pub real_index: usize,
}

impl std::fmt::Display for StackFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{} {}.{}", self.index, self.class_name, self.method_name)?;
        match &self.position {
            Some(pos) => write!(f, " ({pos})")?,
            None => write!(f, " ({}:?)", self.source_name)?,
        }
        if self.is_inline {
            write!(f, " [inline]")?;
        }
        if self.is_native {
            write!(f, " [native]")?;
        }
        Ok(())
    }
}

// ── FrameBuilder ─────────────────────────────────────────────────────────────

/// Builds logical stacks for suspended threads.
pub struct FrameBuilder {
    vm: Arc<dyn TargetVm>,
    positions: Arc<PositionManager>,
}

impl FrameBuilder {
    pub fn new(vm: Arc<dyn TargetVm>, positions: Arc<PositionManager>) -> Self {
        Self { vm, positions }
    }

    /// The logical stack of `thread`, innermost first. The thread must be
    /// suspended.
    pub fn build(&self, thread: ThreadId) -> Result<Vec<StackFrame>> {
        let raw_frames = self.vm.frames(thread)?;
        let mut stack: Vec<StackFrame> = Vec::with_capacity(raw_frames.len());

        for (real_index, raw) in raw_frames.iter().enumerate() {
            let location = &raw.location;

            let inline_ranges = self.cross_file_inline_ranges(raw);
            for (depth, (file_name, mapped_line, method_hint)) in
                inline_ranges.iter().enumerate()
            {
                stack.push(StackFrame {
                    index: 0,
                    class_name: location.class_name.clone(),
                    method_name: method_hint.clone(),
                    source_name: file_name.clone(),
                    position: Some(SourcePosition::new(file_name.clone(), *mapped_line)),
                    is_inline: true,
                    is_native: false,
                    inline_depth: depth as u32 + 1,
                    real_index,
                });
            }

            let position = if raw.is_native {
                None
            } else if inline_ranges.is_empty() {
                self.positions.location_to_position(location)
            } else {
                // The generated line belongs to inlined code; the real
                // frame's own author line is unknown.
                None
            };

            stack.push(StackFrame {
                index: 0,
                class_name: location.class_name.clone(),
                method_name: location.method_name.clone(),
                source_name: location.source_name.clone(),
                position,
                is_inline: false,
                is_native: raw.is_native,
                inline_depth: 0,
                real_index,
            });
        }

        for (index, frame) in stack.iter_mut().enumerate() {
            frame.index = index;
        }
        Ok(stack)
    }

    /// `(file, mapped_line, method_hint)` per cross-file inline range
    /// containing the frame's generated line, innermost first.
    fn cross_file_inline_ranges(&self, raw: &crate::vm::RawFrame) -> Vec<(String, u32, String)> {
        let location = &raw.location;
        if location.line <= 0 {
            return Vec::new();
        }
        let smap = self
            .positions
            .smap_for(location.class_id, &location.class_name);
        let Some(map) = smap.as_ref() else {
            return Vec::new();
        };
        let dest = location.line as u32;

        let mut hits: Vec<(usize, &FileInfo, &RangeMapping)> = map
            .ranges_containing_dest(dest)
            .into_iter()
            .enumerate()
            .filter(|(_, (file, _))| file.name != location.source_name)
            .map(|(ordinal, (file, range))| (ordinal, file, range))
            .collect();

        // Narrower ranges are nested more deeply; ties break toward the
        // later declaration.
        hits.sort_by(|a, b| {
            a.2.range
                .cmp(&b.2.range)
                .then(b.0.cmp(&a.0))
        });

        hits.into_iter()
            .map(|(_, file, range)| {
                (
                    file.name.clone(),
                    range.map_dest_to_source(dest),
                    method_hint_from_file(&file.name),
                )
            })
            .collect()
    }
}

/// Recover a readable method hint from a range's owning file name:
/// `Inline.kt` becomes `Inline (inlined)`.
fn method_hint_from_file(file_name: &str) -> String {
    let stem = file_name
        .rsplit_once('.')
        .map(|(stem, _)| stem)
        .unwrap_or(file_name);
    format!("{stem} (inlined)")
}
