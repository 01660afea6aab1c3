//! Offset-keyed text edits over an immutable original source.
//!
//! Insertions attach to a byte offset of the *original* text, so edits made
//! in any order compose without shifting each other. `*_left` text belongs
//! to whatever ends at the offset, `*_right` text to whatever starts there.
//! At a shared offset the output is: left, right, overwrite content.

use std::{
    collections::{BTreeMap, BTreeSet},
    fmt,
};

use sourcemap::SourceMap;

use crate::{
    language::span::Span,
    transform::source_map::{MappingCursor, SourceMapOptions},
};

#[derive(Clone, Debug)]
pub struct EditBuffer {
    original: String,
    left: BTreeMap<usize, String>,
    right: BTreeMap<usize, String>,
    replaced: BTreeMap<usize, String>,
    removed: Vec<Span>,
}

/// One contiguous run of output text.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Piece<'a> {
    Inserted(&'a str),
    Original { start: usize, text: &'a str },
}

impl EditBuffer {
    pub fn new(original: impl Into<String>) -> Self {
        Self {
            original: original.into(),
            left: BTreeMap::new(),
            right: BTreeMap::new(),
            replaced: BTreeMap::new(),
            removed: Vec::new(),
        }
    }

    pub fn original(&self) -> &str {
        &self.original
    }

    pub fn append_left(&mut self, offset: usize, text: &str) -> &mut Self {
        self.check_offset(offset);
        self.left.entry(offset).or_default().push_str(text);
        self
    }

    pub fn prepend_left(&mut self, offset: usize, text: &str) -> &mut Self {
        self.check_offset(offset);
        self.left.entry(offset).or_default().insert_str(0, text);
        self
    }

    pub fn append_right(&mut self, offset: usize, text: &str) -> &mut Self {
        self.check_offset(offset);
        self.right.entry(offset).or_default().push_str(text);
        self
    }

    pub fn prepend_right(&mut self, offset: usize, text: &str) -> &mut Self {
        self.check_offset(offset);
        self.right.entry(offset).or_default().insert_str(0, text);
        self
    }

    /// Drops `start..end` from the output together with any text that was
    /// attached strictly inside the range.
    pub fn remove(&mut self, start: usize, end: usize) -> &mut Self {
        self.check_offset(start);
        self.check_offset(end);
        if start >= end {
            return self;
        }
        self.left.retain(|&offset, _| offset <= start || offset > end);
        self.right.retain(|&offset, _| offset < start || offset >= end);
        self.replaced.retain(|&offset, _| offset < start || offset >= end);
        self.removed.push(Span::new(start, end));
        self
    }

    pub fn overwrite(&mut self, start: usize, end: usize, text: &str) -> &mut Self {
        self.remove(start, end);
        self.replaced.insert(start, text.to_string());
        self
    }

    pub fn has_changed(&self) -> bool {
        !(self.left.is_empty()
            && self.right.is_empty()
            && self.replaced.is_empty()
            && self.removed.is_empty())
    }

    pub fn generate_map(&self, options: &SourceMapOptions) -> SourceMap {
        let mut cursor = MappingCursor::new(&self.original, options);
        for piece in self.pieces() {
            match piece {
                Piece::Inserted(text) => cursor.advance(text),
                Piece::Original { start, text } => cursor.copy(start, text),
            }
        }
        cursor.finish()
    }

    pub(crate) fn pieces(&self) -> Vec<Piece<'_>> {
        let len = self.original.len();
        let mut points = BTreeSet::from([0, len]);
        points.extend(self.left.keys().copied());
        points.extend(self.right.keys().copied());
        points.extend(self.replaced.keys().copied());
        for span in &self.removed {
            points.insert(span.start);
            points.insert(span.end);
        }

        let points: Vec<usize> = points.into_iter().collect();
        let mut pieces = Vec::new();
        for (index, &point) in points.iter().enumerate() {
            for attached in [&self.left, &self.right, &self.replaced] {
                if let Some(text) = attached.get(&point) {
                    if !text.is_empty() {
                        pieces.push(Piece::Inserted(text));
                    }
                }
            }
            if let Some(&next) = points.get(index + 1) {
                if !self.is_removed(point) {
                    pieces.push(Piece::Original {
                        start: point,
                        text: &self.original[point..next],
                    });
                }
            }
        }
        pieces
    }

    fn is_removed(&self, offset: usize) -> bool {
        self.removed
            .iter()
            .any(|span| span.start <= offset && offset < span.end)
    }

    fn check_offset(&self, offset: usize) {
        debug_assert!(
            self.original.is_char_boundary(offset),
            "edit offset {offset} is not a char boundary of the original source"
        );
    }
}

impl fmt::Display for EditBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for piece in self.pieces() {
            match piece {
                Piece::Inserted(text) | Piece::Original { text, .. } => f.write_str(text)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn untouched_buffer_renders_original() {
        let edits = EditBuffer::new("let a = 1;");
        assert!(!edits.has_changed());
        assert_eq!(edits.to_string(), "let a = 1;");
    }

    #[test]
    fn left_and_right_insertions_order_around_offset() {
        let mut edits = EditBuffer::new("ab");
        edits
            .append_right(1, "R")
            .append_left(1, "L")
            .prepend_left(1, "l")
            .prepend_right(1, "r");
        assert_eq!(edits.to_string(), "alLrRb");
    }

    #[test]
    fn remove_drops_text_attached_inside_the_range() {
        let mut edits = EditBuffer::new("await foo()");
        edits.append_left(3, "x").append_right(3, "y");
        edits.append_left(0, "<");
        edits.remove(0, 6);
        assert_eq!(edits.to_string(), "<foo()");

        // Text attached after the removal survives at its borders.
        edits.append_left(6, "(").append_right(11, ")");
        assert_eq!(edits.to_string(), "<(foo())");
    }

    #[test]
    fn overwrite_replaces_range() {
        let mut edits = EditBuffer::new("const x = 1");
        edits.overwrite(6, 7, "renamed");
        assert_eq!(edits.to_string(), "const renamed = 1");
        assert!(edits.has_changed());
    }

    #[test]
    fn insertions_at_end_of_source() {
        let mut edits = EditBuffer::new("f(a)");
        edits.append_right(3, ",1").append_left(4, ";");
        assert_eq!(edits.to_string(), "f(a,1);");
    }
}
