//! Dataset store: delimited-text tables of string rows.
//!
//! A dataset is an ordered list of rows whose first row is the header. Parsing
//! follows RFC 4180 quoting (`"` wraps fields, `""` escapes a quote) and does
//! not enforce a fixed field count; schema arity is applied separately by
//! [`align`].

use crate::error::DatasetError;
use crate::hasher::{RowFingerprint, fingerprint_row};
use crate::persistence;
use std::collections::HashSet;
use std::path::Path;
use tracing::{debug, info, warn};

/// Canonical content of a freshly provisioned baseline dataset.
pub const DEFAULT_BASELINE_CSV: &str = r#"Category,Fact
Behavior,Cats can rotate their ears 180 degrees.
Communication,Cats have over 100 vocal sounds.
Hunting,Cats are capable of making over 100 different postures while hunting.
Physiology,Cats sleep for about 13 to 16 hours a day on average.
Anatomy,A cat's whiskers are generally as wide as its body.
Diet,Cats cannot taste sweetness.
History,"Cats were domesticated about 4000 years ago."
Breeding,A group of cats is called a clowder.
Trivia,Cats can run up to 30 miles per hour over short distances.
Trivia,The world's oldest cat lived to be 38 years old.
"#;

const DELIMITER: char = ',';
const QUOTE: char = '"';

/// One immutable dataset row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Row {
    fields: Vec<String>,
}

impl Row {
    pub fn new<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    pub fn fields(&self) -> &[String] {
        &self.fields
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn fingerprint(&self) -> RowFingerprint {
        fingerprint_row(&self.fields)
    }

    /// Join fields with `separator` for prompts and display.
    pub fn render(&self, separator: &str) -> String {
        self.fields.join(separator)
    }

    /// Return a copy with exactly `arity` fields: short rows are padded with
    /// empty fields, long rows are truncated.
    pub fn aligned_to(&self, arity: usize) -> Row {
        let mut fields: Vec<String> = self.fields.iter().take(arity).cloned().collect();
        fields.resize(arity, String::new());
        Row { fields }
    }
}

/// An ordered table of rows. The first row is the header.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    rows: Vec<Row>,
}

impl Dataset {
    pub fn new(rows: Vec<Row>) -> Self {
        Self { rows }
    }

    /// The canonical default baseline.
    pub fn default_baseline() -> Self {
        // The embedded constant is well-formed; an empty dataset is the only
        // conceivable fallback and is caught by the tests below.
        Self::parse(DEFAULT_BASELINE_CSV).unwrap_or_default()
    }

    /// Parse delimited text into a dataset.
    ///
    /// Blank lines are skipped. A leading UTF-8 byte order mark is ignored.
    pub fn parse(text: &str) -> Result<Self, DatasetError> {
        let text = text.strip_prefix('\u{feff}').unwrap_or(text);
        let mut rows = Vec::new();
        let mut chars = text.chars().peekable();
        let mut line = 1usize;

        while chars.peek().is_some() {
            let record_line = line;
            let mut fields = Vec::new();
            let mut field = String::new();
            let mut in_quotes = false;
            let mut was_quoted = false;
            let mut after_quote = false;

            loop {
                let Some(c) = chars.next() else {
                    if in_quotes {
                        return Err(DatasetError::Parse {
                            line: record_line,
                            message: "unterminated quoted field".to_string(),
                        });
                    }
                    break;
                };

                if in_quotes {
                    if c == QUOTE {
                        if chars.peek() == Some(&QUOTE) {
                            chars.next();
                            field.push(QUOTE);
                        } else {
                            in_quotes = false;
                            after_quote = true;
                        }
                    } else {
                        if c == '\n' {
                            line += 1;
                        }
                        field.push(c);
                    }
                    continue;
                }

                match c {
                    DELIMITER => {
                        fields.push(std::mem::take(&mut field));
                        was_quoted = false;
                        after_quote = false;
                    }
                    '\r' if chars.peek() == Some(&'\n') => {}
                    '\n' => {
                        line += 1;
                        break;
                    }
                    QUOTE if field.is_empty() && !was_quoted => {
                        in_quotes = true;
                        was_quoted = true;
                    }
                    QUOTE => {
                        return Err(DatasetError::Parse {
                            line,
                            message: "bare \" in non-quoted field".to_string(),
                        });
                    }
                    _ if after_quote => {
                        return Err(DatasetError::Parse {
                            line,
                            message: format!("extraneous {c:?} after closing quote"),
                        });
                    }
                    _ => field.push(c),
                }
            }

            // A record consisting of nothing but a line break is skipped.
            if fields.is_empty() && field.is_empty() && !was_quoted {
                continue;
            }
            fields.push(field);
            rows.push(Row { fields });
        }

        Ok(Self { rows })
    }

    /// Parse raw uploaded bytes. Content must be UTF-8.
    pub fn from_bytes(data: &[u8]) -> Result<Self, DatasetError> {
        let text = std::str::from_utf8(data).map_err(|e| DatasetError::Parse {
            line: 1 + data[..e.valid_up_to()].iter().filter(|b| **b == b'\n').count(),
            message: format!("invalid UTF-8: {e}"),
        })?;
        Self::parse(text)
    }

    /// Load a dataset from disk.
    pub fn load(path: &Path) -> Result<Self, DatasetError> {
        let data = std::fs::read(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DatasetError::NotFound {
                    path: path.to_path_buf(),
                }
            } else {
                DatasetError::Read {
                    path: path.to_path_buf(),
                    source: e,
                }
            }
        })?;
        let dataset = Self::from_bytes(&data)?;
        debug!(path = %path.display(), rows = dataset.len(), "Loaded dataset");
        Ok(dataset)
    }

    /// Fully overwrite the file at `path` with this dataset.
    pub fn save(&self, path: &Path) -> Result<(), DatasetError> {
        persistence::atomic_write(path, self.to_delimited().as_bytes()).map_err(|e| {
            DatasetError::Write {
                path: path.to_path_buf(),
                source: e,
            }
        })?;
        debug!(path = %path.display(), rows = self.len(), "Saved dataset");
        Ok(())
    }

    /// Serialize to delimited text, one record per line.
    pub fn to_delimited(&self) -> String {
        let mut out = String::new();
        for row in &self.rows {
            // A lone empty field would otherwise be a blank line, which
            // parsing skips.
            if let [only] = row.fields.as_slice()
                && only.is_empty()
            {
                out.push_str("\"\"\n");
                continue;
            }
            for (i, field) in row.fields.iter().enumerate() {
                if i > 0 {
                    out.push(DELIMITER);
                }
                write_field(&mut out, field);
            }
            out.push('\n');
        }
        out
    }

    /// Render every row joined by `separator`, one row per line.
    pub fn render(&self, separator: &str) -> String {
        let mut out = String::new();
        for row in &self.rows {
            out.push_str(&row.render(separator));
            out.push('\n');
        }
        out
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn header(&self) -> Option<&Row> {
        self.rows.first()
    }

    /// Field count defined by the header row.
    pub fn arity(&self) -> Option<usize> {
        self.header().map(Row::len)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, row: Row) {
        self.rows.push(row);
    }

    pub fn fingerprints(&self) -> HashSet<RowFingerprint> {
        self.rows.iter().map(Row::fingerprint).collect()
    }

    pub fn contains(&self, fingerprint: &RowFingerprint) -> bool {
        self.rows.iter().any(|r| &r.fingerprint() == fingerprint)
    }

    /// Append every row of `incoming` that is not already present, including
    /// rows repeated earlier in `incoming`. Returns how many rows were added.
    pub fn merge_new_rows(&mut self, incoming: &Dataset) -> usize {
        let mut seen = self.fingerprints();
        let before = self.rows.len();
        for row in &incoming.rows {
            if seen.insert(row.fingerprint()) {
                self.rows.push(row.clone());
            }
        }
        self.rows.len() - before
    }
}

/// Structural check of uploaded bytes. Schema arity is not enforced.
pub fn validate(data: &[u8]) -> Result<(), DatasetError> {
    if data.iter().all(u8::is_ascii_whitespace) {
        return Err(DatasetError::Empty);
    }
    let parsed = Dataset::from_bytes(data)?;
    if parsed.is_empty() {
        return Err(DatasetError::Empty);
    }
    Ok(())
}

/// Normalize `uploaded` to the baseline's field arity.
///
/// Lossy by choice: extra fields are dropped and missing fields become empty
/// strings. With an empty baseline there is no schema and rows pass through.
pub fn align(uploaded: &Dataset, baseline: &Dataset) -> Dataset {
    let Some(arity) = baseline.arity() else {
        warn!("Baseline dataset is empty; uploaded rows are not aligned");
        return uploaded.clone();
    };

    let mut padded = 0usize;
    let mut truncated = 0usize;
    let rows = uploaded
        .rows
        .iter()
        .map(|row| {
            if row.len() < arity {
                padded += 1;
            } else if row.len() > arity {
                truncated += 1;
            }
            row.aligned_to(arity)
        })
        .collect::<Vec<_>>();

    info!(
        rows = rows.len(),
        arity, padded, truncated, "Aligned uploaded rows to baseline schema"
    );
    Dataset { rows }
}

fn write_field(out: &mut String, field: &str) {
    let needs_quotes = field.starts_with(' ')
        || field.starts_with('\t')
        || field.contains([DELIMITER, QUOTE, '\r', '\n']);
    if !needs_quotes {
        out.push_str(field);
        return;
    }
    out.push(QUOTE);
    for c in field.chars() {
        if c == QUOTE {
            out.push(QUOTE);
        }
        out.push(c);
    }
    out.push(QUOTE);
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    #[test]
    fn test_default_baseline_shape() {
        let ds = Dataset::default_baseline();
        assert_eq!(ds.len(), 11);
        assert_eq!(ds.arity(), Some(2));
        assert_eq!(ds.header().unwrap().fields(), &["Category", "Fact"]);
        assert_eq!(
            ds.rows()[7].fields(),
            &["History", "Cats were domesticated about 4000 years ago."]
        );
    }

    #[test]
    fn test_parse_quoted_fields() {
        let ds = Dataset::parse("a,\"b, with comma\",\"say \"\"hi\"\"\"\n").unwrap();
        assert_eq!(ds.rows()[0].fields(), &["a", "b, with comma", "say \"hi\""]);
    }

    #[test]
    fn test_parse_multiline_quoted_field() {
        let ds = Dataset::parse("h1,h2\nx,\"line one\nline two\"\ny,z\n").unwrap();
        assert_eq!(ds.len(), 3);
        assert_eq!(ds.rows()[1].fields(), &["x", "line one\nline two"]);
    }

    #[test]
    fn test_parse_crlf_and_blank_lines() {
        let ds = Dataset::parse("a,b\r\n\r\nc,d\r\n").unwrap();
        assert_eq!(ds.len(), 2);
        assert_eq!(ds.rows()[1].fields(), &["c", "d"]);
    }

    #[test]
    fn test_parse_without_trailing_newline() {
        let ds = Dataset::parse("a,b\nc,d").unwrap();
        assert_eq!(ds.rows()[1].fields(), &["c", "d"]);
    }

    #[test]
    fn test_parse_trailing_empty_field() {
        let ds = Dataset::parse("a,\n").unwrap();
        assert_eq!(ds.rows()[0].fields(), &["a", ""]);
    }

    #[test]
    fn test_parse_rejects_unterminated_quote() {
        let err = Dataset::parse("a,b\nc,\"open").unwrap_err();
        assert!(matches!(err, DatasetError::Parse { line: 2, .. }));
    }

    #[test]
    fn test_parse_rejects_bare_quote() {
        let err = Dataset::parse("a,b\"c\n").unwrap_err();
        assert!(matches!(err, DatasetError::Parse { line: 1, .. }));
    }

    #[test]
    fn test_parse_rejects_text_after_closing_quote() {
        let err = Dataset::parse("\"a\"b,c\n").unwrap_err();
        assert!(matches!(err, DatasetError::Parse { .. }));
    }

    #[test]
    fn test_validate_accepts_ragged_rows() {
        assert!(validate(b"a,b,c\nd\ne,f,g,h\n").is_ok());
    }

    #[test]
    fn test_validate_rejects_empty() {
        assert!(matches!(validate(b""), Err(DatasetError::Empty)));
        assert!(matches!(validate(b"\n\n  \n"), Err(DatasetError::Empty)));
    }

    #[test]
    fn test_validate_rejects_non_utf8() {
        assert!(matches!(
            validate(&[0x61, 0x2c, 0xff, 0xfe]),
            Err(DatasetError::Parse { .. })
        ));
    }

    #[test]
    fn test_align_pads_short_rows() {
        let baseline = Dataset::new(vec![Row::new(["a", "b", "c", "d", "e"])]);
        let uploaded = Dataset::new(vec![Row::new(["1", "2", "3"])]);
        let aligned = align(&uploaded, &baseline);
        assert_eq!(aligned.rows()[0].fields(), &["1", "2", "3", "", ""]);
    }

    #[test]
    fn test_align_truncates_long_rows_and_keeps_matching() {
        let baseline = Dataset::new(vec![Row::new(["Category", "Fact"])]);
        let uploaded = Dataset::new(vec![
            Row::new(["Diet", "Cats love fish", "extra"]),
            Row::new(["Diet", "Cats eat mice"]),
        ]);
        let aligned = align(&uploaded, &baseline);
        assert_eq!(aligned.rows()[0].fields(), &["Diet", "Cats love fish"]);
        assert_eq!(aligned.rows()[1], uploaded.rows()[1]);
    }

    #[test]
    fn test_align_with_empty_baseline_passes_through() {
        let uploaded = Dataset::new(vec![Row::new(["x"])]);
        assert_eq!(align(&uploaded, &Dataset::default()), uploaded);
    }

    #[test]
    fn test_save_and_load_preserves_quoted_content() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("baseline.csv");
        let ds = Dataset::new(vec![
            Row::new(["Category", "Fact"]),
            Row::new(["Trivia", "Cats, famously, say \"meow\""]),
            Row::new(["Note", " leading space"]),
        ]);
        ds.save(&path).unwrap();
        assert_eq!(Dataset::load(&path).unwrap(), ds);
    }

    #[test]
    fn test_load_missing_file() {
        let err = Dataset::load(Path::new("/nonexistent/poisonlab/baseline.csv")).unwrap_err();
        assert!(matches!(err, DatasetError::NotFound { .. }));
    }

    #[test]
    fn test_merge_new_rows_skips_known_and_repeated() {
        let mut base = Dataset::new(vec![Row::new(["h", "v"]), Row::new(["a", "1"])]);
        let incoming = Dataset::new(vec![
            Row::new(["h", "v"]),
            Row::new(["b", "2"]),
            Row::new(["b", "2"]),
            Row::new(["a", "1"]),
        ]);
        assert_eq!(base.merge_new_rows(&incoming), 1);
        assert_eq!(base.len(), 3);
        assert_eq!(base.rows()[2].fields(), &["b", "2"]);
    }

    #[test]
    fn test_single_empty_field_survives_reload() {
        let ds = Dataset::new(vec![Row::new(["Fact"]), Row::new([""]), Row::new(["x"])]);
        assert_eq!(ds.to_delimited(), "Fact\n\"\"\nx\n");
        assert_eq!(Dataset::parse(&ds.to_delimited()).unwrap(), ds);
    }

    #[test]
    fn test_render_uses_separator() {
        let ds = Dataset::new(vec![Row::new(["a", "b"]), Row::new(["c", "d"])]);
        assert_eq!(ds.render(" | "), "a | b\nc | d\n");
    }
}
