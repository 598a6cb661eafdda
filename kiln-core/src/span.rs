//! Source positions.
//!
//! Every stage works with byte spans into a unit's text. Only when a
//! diagnostic is handed to the sink are spans turned into the 1-based
//! line/column/length triple exposed at the API boundary.

/// Index of a compilation unit inside its `UnitRegistry`.
///
/// Ids are assigned in registration order and never reused within a
/// `Context`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UnitId(pub u32);

impl UnitId {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Half-open byte range `[start, end)` inside one unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Span {
    pub unit: UnitId,
    pub start: u32,
    pub end: u32,
}

impl Span {
    pub fn new(unit: UnitId, start: u32, end: u32) -> Self {
        Span { unit, start, end }
    }

    /// Span covering both `self` and `other`. Both must belong to the same unit.
    pub fn to(self, other: Span) -> Span {
        debug_assert_eq!(self.unit, other.unit);
        Span {
            unit: self.unit,
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn len(&self) -> u32 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Resolved human-readable position of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    /// 1-based line.
    pub line: u32,
    /// 1-based column, counted in characters.
    pub column: u32,
    /// Span size in characters.
    pub length: u32,
}

/// Cached line starts for one source text.
#[derive(Debug, Clone)]
pub struct LineIndex {
    line_starts: Vec<usize>,
}

impl LineIndex {
    pub fn new(source: &str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        LineIndex { line_starts }
    }

    /// Convert a byte span of `source` into line, column and length.
    ///
    /// Offsets past the end of the text are clamped, so a span produced
    /// for an empty or truncated unit still yields a valid location.
    pub fn locate(&self, source: &str, start: u32, end: u32) -> Location {
        let start = clamp_to_boundary(source, start as usize);
        let end = clamp_to_boundary(source, (end as usize).max(start));

        let line_idx = match self.line_starts.binary_search(&start) {
            Ok(idx) => idx,
            Err(idx) => idx - 1,
        };
        let line_start = self.line_starts[line_idx];
        let column = source[line_start..start].chars().count() + 1;
        let length = source[start..end].chars().count();

        Location {
            line: line_idx as u32 + 1,
            column: column as u32,
            length: length as u32,
        }
    }
}

fn clamp_to_boundary(source: &str, offset: usize) -> usize {
    let mut offset = offset.min(source.len());
    while !source.is_char_boundary(offset) {
        offset -= 1;
    }
    offset
}
