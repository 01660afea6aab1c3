//! Source maps for rewritten output, built with the `sourcemap` crate.
//!
//! A token is added at the start of every copied run of original text and
//! after each newline inside it. Columns count UTF-16 code units.

use std::string::FromUtf8Error;

use sourcemap::{SourceMap, SourceMapBuilder};
use thiserror::Error;

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SourceMapOptions {
    /// Name of the generated file.
    pub file: Option<String>,
    /// Name recorded in `sources`. Defaults to an empty string.
    pub source: Option<String>,
    /// Embed the original text as `sourcesContent`.
    pub include_content: bool,
}

#[derive(Debug, Error)]
pub enum SourceMapError {
    #[error("failed to serialize source map")]
    Encode(#[from] sourcemap::Error),
    #[error("serialized source map is not UTF-8")]
    Utf8(#[from] FromUtf8Error),
}

/// Serializes `map` as revision 3 JSON.
pub fn to_json(map: &SourceMap) -> Result<String, SourceMapError> {
    let mut out = Vec::new();
    map.to_writer(&mut out)?;
    Ok(String::from_utf8(out)?)
}

/// Walks the generated output in order, recording where each copied run of
/// text came from.
pub struct MappingCursor<'a> {
    original: &'a str,
    line_starts: Vec<usize>,
    source: String,
    builder: SourceMapBuilder,
    line: u32,
    column: u32,
}

impl<'a> MappingCursor<'a> {
    pub fn new(original: &'a str, options: &SourceMapOptions) -> Self {
        let line_starts = std::iter::once(0)
            .chain(original.match_indices('\n').map(|(index, _)| index + 1))
            .collect();
        let source = options.source.clone().unwrap_or_default();
        let mut builder = SourceMapBuilder::new(options.file.as_deref());
        let source_id = builder.add_source(&source);
        if options.include_content {
            builder.set_source_contents(source_id, Some(original));
        }
        Self {
            original,
            line_starts,
            source,
            builder,
            line: 0,
            column: 0,
        }
    }

    /// Moves the generated position past `text`, which has no origin.
    pub fn advance(&mut self, text: &str) {
        for ch in text.chars() {
            self.step(ch);
        }
    }

    /// Emits `text`, which was copied from the original starting at byte
    /// offset `start`.
    pub fn copy(&mut self, start: usize, text: &str) {
        let (mut line, column) = self.locate(start);
        self.add_token(line, column);

        let mut chars = text.chars().peekable();
        while let Some(ch) = chars.next() {
            self.step(ch);
            if ch == '\n' {
                line += 1;
                if chars.peek().is_some() {
                    self.add_token(line, 0);
                }
            }
        }
    }

    pub fn finish(self) -> SourceMap {
        self.builder.into_sourcemap()
    }

    fn step(&mut self, ch: char) {
        if ch == '\n' {
            self.line += 1;
            self.column = 0;
        } else {
            self.column += ch.len_utf16() as u32;
        }
    }

    fn locate(&self, offset: usize) -> (u32, u32) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(line) => line,
            Err(next) => next - 1,
        };
        let line_start = self.line_starts[line];
        let column = self.original[line_start..offset]
            .chars()
            .map(char::len_utf16)
            .sum::<usize>();
        (line as u32, column as u32)
    }

    fn add_token(&mut self, src_line: u32, src_col: u32) {
        self.builder.add(
            self.line,
            self.column,
            src_line,
            src_col,
            Some(self.source.as_str()),
            None,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn positions(map: &SourceMap) -> Vec<(u32, u32, u32, u32)> {
        map.tokens()
            .map(|token| {
                (
                    token.get_dst_line(),
                    token.get_dst_col(),
                    token.get_src_line(),
                    token.get_src_col(),
                )
            })
            .collect()
    }

    #[test]
    fn inserted_prefix_shifts_the_first_token() {
        let mut cursor = MappingCursor::new("abc", &SourceMapOptions::default());
        cursor.advance("X");
        cursor.copy(0, "abc");
        let map = cursor.finish();
        assert_eq!(positions(&map), [(0, 1, 0, 0)]);
        assert_eq!(map.get_source(0), Some(""));
    }

    #[test]
    fn copied_newlines_start_new_tokens() {
        let mut cursor = MappingCursor::new("a\nb", &SourceMapOptions::default());
        cursor.advance("X\n");
        cursor.copy(0, "a\nb");
        let map = cursor.finish();
        assert_eq!(positions(&map), [(1, 0, 0, 0), (2, 0, 1, 0)]);
    }

    #[test]
    fn columns_count_utf16_units() {
        let source = "é😀x";
        let mut cursor = MappingCursor::new(source, &SourceMapOptions::default());
        let x = source.find('x').expect("x");
        cursor.copy(x, "x");
        // 'é' is one unit and '😀' two, so `x` sits at column 3.
        assert_eq!(positions(&cursor.finish()), [(0, 0, 0, 3)]);
    }

    #[test]
    fn json_shape() {
        let mut cursor = MappingCursor::new(
            "a",
            &SourceMapOptions {
                file: Some("out.js".to_string()),
                source: Some("in.js".to_string()),
                include_content: true,
            },
        );
        cursor.copy(0, "a");
        let json: serde_json::Value =
            serde_json::from_str(&to_json(&cursor.finish()).expect("serialize")).expect("parse");
        assert_eq!(json["version"], 3);
        assert_eq!(json["file"], "out.js");
        assert_eq!(json["sources"][0], "in.js");
        assert_eq!(json["sourcesContent"][0], "a");
        assert_eq!(json["mappings"], "AAAA");
    }
}
