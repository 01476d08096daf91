use std::fmt;

/// A position inside one source file. Lines and columns are 1-based,
/// `offset` counts characters from the start of the file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct FilePos {
    pub line: usize,
    pub column: usize,
    pub offset: usize,
}

impl FilePos {
    pub fn new(line: usize, column: usize, offset: usize) -> FilePos {
        FilePos {
            line,
            column,
            offset,
        }
    }
}

impl fmt::Display for FilePos {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.line, self.column)
    }
}

/// A half-open source range within a named file.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SourceLocation {
    pub filename: String,
    pub begin: FilePos,
    pub end: FilePos,
}

impl SourceLocation {
    pub fn new(filename: impl Into<String>, begin: FilePos, end: FilePos) -> SourceLocation {
        SourceLocation {
            filename: filename.into(),
            begin,
            end,
        }
    }

    /// Extends this range up to `end`, returning the widened location.
    pub fn update(&mut self, end: FilePos) -> SourceLocation {
        self.end = end;
        self.clone()
    }
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.filename.is_empty() {
            write!(f, "{}", self.begin)
        } else {
            write!(f, "{}:{}", self.filename, self.begin)
        }
    }
}
