//! Fatal generation and host-I/O diagnostics.
//!
//! The backend consumes an already validated IR, so there are no source
//! spans to point at. A diagnostic names the instantiation (or file) it
//! concerns and is rendered as a headline report with notes and help.

use std::ops::Range;
use std::path::Path;

/// A backend diagnostic (error or warning).
#[derive(Clone, Debug)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
    pub notes: Vec<String>,
    pub help: Option<String>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Severity {
    Error,
    Warning,
}

impl Diagnostic {
    pub fn error(message: String) -> Self {
        Self {
            severity: Severity::Error,
            message,
            notes: Vec::new(),
            help: None,
        }
    }

    pub fn warning(message: String) -> Self {
        Self {
            severity: Severity::Warning,
            message,
            notes: Vec::new(),
            help: None,
        }
    }

    /// `cannot write '<path>': <os error>`
    pub fn write_failed(path: &Path, err: &std::io::Error) -> Self {
        Self::error(format!("cannot write '{}': {}", path.display(), err))
    }

    /// `cannot read '<path>': <os error>`
    pub fn read_failed(path: &Path, err: &std::io::Error) -> Self {
        Self::error(format!("cannot read '{}': {}", path.display(), err))
    }

    pub fn with_note(mut self, note: String) -> Self {
        self.notes.push(note);
        self
    }

    pub fn with_help(mut self, help: String) -> Self {
        self.help = Some(help);
        self
    }

    pub fn is_error(&self) -> bool {
        self.severity == Severity::Error
    }

    /// Render the diagnostic to stderr using ariadne.
    ///
    /// `origin` names what the diagnostic concerns (an IR file or an
    /// instantiation); `source` is its text, if there is any.
    pub fn render(&self, origin: &str, source: &str) {
        use ariadne::{Report, ReportKind, Source};

        let kind = match self.severity {
            Severity::Error => ReportKind::Error,
            Severity::Warning => ReportKind::Warning,
        };

        let mut report = Report::<(&str, Range<usize>)>::build(kind, origin, 0)
            .with_message(&self.message);

        for note in &self.notes {
            report = report.with_note(note);
        }

        if let Some(help) = &self.help {
            report = report.with_help(help);
        }

        if report
            .finish()
            .eprint((origin, Source::from(source)))
            .is_err()
        {
            eprintln!("error: {}", self.message);
        }
    }
}

/// Render a list of diagnostics.
pub fn render_diagnostics(diagnostics: &[Diagnostic], origin: &str, source: &str) {
    for diag in diagnostics {
        diag.render(origin, source);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_construction() {
        let d = Diagnostic::error("intervals in a stage must have same levels".to_string());
        assert_eq!(d.severity, Severity::Error);
        assert!(d.is_error());
        assert_eq!(d.message, "intervals in a stage must have same levels");
        assert!(d.notes.is_empty());
        assert!(d.help.is_none());
    }

    #[test]
    fn test_warning_construction() {
        let d = Diagnostic::warning("stencil has no stages".to_string());
        assert_eq!(d.severity, Severity::Warning);
        assert!(!d.is_error());
    }

    #[test]
    fn test_chained_builders() {
        let d = Diagnostic::error("unknown subdomain".to_string())
            .with_note("stage 3".to_string())
            .with_help("valid codes: 0, 1000, 2000, 3000, 4000".to_string())
            .with_note("location Cells".to_string());
        assert_eq!(d.notes.len(), 2);
        assert_eq!(d.notes[1], "location Cells");
        assert_eq!(
            d.help.as_deref(),
            Some("valid codes: 0, 1000, 2000, 3000, 4000")
        );
    }

    #[test]
    fn test_write_failed_mentions_path_and_os_error() {
        let err = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "permission denied");
        let d = Diagnostic::write_failed(Path::new("/tmp/out.cu"), &err);
        assert_eq!(d.message, "cannot write '/tmp/out.cu': permission denied");
    }

    #[test]
    fn test_render_does_not_panic() {
        let d = Diagnostic::error("missing neighbor table".to_string())
            .with_note("chain Cells -> Edges".to_string());
        d.render("laplacian", "");
        render_diagnostics(&[d.clone(), d], "laplacian.json", "{}");
    }
}
