use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;

use crate::location::SourceLocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    TokenError,
    SyntaxError,
    TypeError,
    Warning,
    LinkError,
}

impl MessageType {
    fn is_failure(self) -> bool {
        !matches!(self, MessageType::Warning)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MessageType::TokenError => "TokenError",
            MessageType::SyntaxError => "SyntaxError",
            MessageType::TypeError => "TypeError",
            MessageType::Warning => "Warning",
            MessageType::LinkError => "LinkError",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone)]
pub struct Message {
    pub ty: MessageType,
    pub location: SourceLocation,
    pub text: String,
}

impl Message {
    pub fn new(ty: MessageType, location: SourceLocation, text: String) -> Message {
        Message { ty, location, text }
    }
}

/// Messages compare by type, begin position and text. Filename and end
/// position are ignored so expectations stay relocatable.
impl PartialEq for Message {
    fn eq(&self, other: &Self) -> bool {
        self.ty == other.ty
            && self.location.begin == other.location.begin
            && self.text == other.text
    }
}

impl Eq for Message {}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.location, self.ty, self.text)
    }
}

#[derive(Debug)]
enum Sink {
    /// Collects messages for later inspection or diffing.
    Buffered(Vec<Message>),
    /// Prints immediately, only counting failures.
    Console { error_count: usize },
}

/// Receives diagnostics from every compiler stage.
#[derive(Debug)]
pub struct Report {
    sink: Sink,
}

impl Report {
    pub fn buffered() -> Report {
        Report {
            sink: Sink::Buffered(Vec::new()),
        }
    }

    pub fn console() -> Report {
        Report {
            sink: Sink::Console { error_count: 0 },
        }
    }

    pub fn push(&mut self, msg: Message) {
        match &mut self.sink {
            Sink::Buffered(messages) => messages.push(msg),
            Sink::Console { error_count } => {
                if msg.ty.is_failure() {
                    *error_count += 1;
                }
                eprintln!("{}", msg);
            }
        }
    }

    pub fn token_error(&mut self, location: SourceLocation, text: impl Into<String>) {
        self.push(Message::new(MessageType::TokenError, location, text.into()));
    }

    pub fn syntax_error(&mut self, location: SourceLocation, text: impl Into<String>) {
        self.push(Message::new(MessageType::SyntaxError, location, text.into()));
    }

    pub fn type_error(&mut self, location: SourceLocation, text: impl Into<String>) {
        self.push(Message::new(MessageType::TypeError, location, text.into()));
    }

    pub fn warning(&mut self, location: SourceLocation, text: impl Into<String>) {
        self.push(Message::new(MessageType::Warning, location, text.into()));
    }

    /// Link errors carry no source location.
    pub fn link_error(&mut self, text: impl Into<String>) {
        self.push(Message::new(
            MessageType::LinkError,
            SourceLocation::default(),
            text.into(),
        ));
    }

    pub fn contains_failures(&self) -> bool {
        match &self.sink {
            Sink::Buffered(messages) => messages.iter().any(|m| m.ty.is_failure()),
            Sink::Console { error_count } => *error_count > 0,
        }
    }

    /// Buffered messages; empty for console reports.
    pub fn messages(&self) -> &[Message] {
        match &self.sink {
            Sink::Buffered(messages) => messages,
            Sink::Console { .. } => &[],
        }
    }

    pub fn clear(&mut self) {
        match &mut self.sink {
            Sink::Buffered(messages) => messages.clear(),
            Sink::Console { error_count } => *error_count = 0,
        }
    }

    pub fn log(&self) {
        for msg in self.messages() {
            eprintln!("{}", msg);
        }
    }
}

/// All stages of one compile share the report.
pub type SharedReport = Rc<RefCell<Report>>;

pub fn shared(report: Report) -> SharedReport {
    Rc::new(RefCell::new(report))
}

/// Messages present in `first` but not `second`, and vice versa.
pub fn difference(first: &Report, second: &Report) -> (Vec<Message>, Vec<Message>) {
    let missing = first
        .messages()
        .iter()
        .filter(|m| !second.messages().contains(m))
        .cloned()
        .collect();
    let superfluous = second
        .messages()
        .iter()
        .filter(|m| !first.messages().contains(m))
        .cloned()
        .collect();
    (missing, superfluous)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::location::FilePos;

    fn loc(file: &str, line: usize, col: usize) -> SourceLocation {
        SourceLocation::new(file, FilePos::new(line, col, 0), FilePos::new(line, col, 0))
    }

    #[test]
    fn equality_ignores_filename_and_end() {
        let mut a = Message::new(MessageType::TypeError, loc("a.flow", 3, 1), "boom".into());
        let b = Message::new(MessageType::TypeError, loc("b.flow", 3, 1), "boom".into());
        a.location.end = FilePos::new(3, 9, 42);
        assert_eq!(a, b);
    }

    #[test]
    fn warnings_are_not_failures() {
        let mut report = Report::buffered();
        report.warning(loc("x", 1, 1), "meh");
        assert!(!report.contains_failures());
        report.syntax_error(loc("x", 1, 2), "bad");
        assert!(report.contains_failures());
    }

    #[test]
    fn difference_reports_both_directions() {
        let mut expected = Report::buffered();
        expected.type_error(loc("x", 1, 1), "one");
        expected.type_error(loc("x", 2, 1), "two");

        let mut actual = Report::buffered();
        actual.type_error(loc("x", 2, 1), "two");
        actual.type_error(loc("x", 3, 1), "three");

        let (missing, superfluous) = difference(&expected, &actual);
        assert_eq!(missing.len(), 1);
        assert_eq!(missing[0].text, "one");
        assert_eq!(superfluous.len(), 1);
        assert_eq!(superfluous[0].text, "three");
    }
}
