//! Indented source text writer shared by kernel, host and interface emission.

pub struct SourceWriter {
    out: String,
    level: usize,
    unit: &'static str,
}

impl Default for SourceWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl SourceWriter {
    /// Two-space indentation (C++/CUDA).
    pub fn new() -> Self {
        Self::with_unit("  ")
    }

    pub fn with_unit(unit: &'static str) -> Self {
        Self {
            out: String::new(),
            level: 0,
            unit,
        }
    }

    pub fn line(&mut self, text: impl AsRef<str>) {
        let text = text.as_ref();
        if !text.is_empty() {
            for _ in 0..self.level {
                self.out.push_str(self.unit);
            }
            self.out.push_str(text);
        }
        self.out.push('\n');
    }

    /// A line at column 0 (preprocessor directives).
    pub fn raw(&mut self, text: impl AsRef<str>) {
        self.out.push_str(text.as_ref());
        self.out.push('\n');
    }

    /// Append pre-rendered text verbatim.
    pub fn append(&mut self, text: &str) {
        self.out.push_str(text);
    }

    pub fn indent(&mut self) {
        self.level += 1;
    }

    pub fn dedent(&mut self) {
        self.level = self.level.saturating_sub(1);
    }

    /// `head {` and indent.
    pub fn open(&mut self, head: impl AsRef<str>) {
        let head = head.as_ref();
        if head.is_empty() {
            self.line("{");
        } else {
            self.line(format!("{} {{", head));
        }
        self.indent();
    }

    /// Dedent and `}`.
    pub fn close(&mut self) {
        self.close_with("}");
    }

    /// Dedent and write a closing line such as `};` or `} else {`.
    pub fn close_with(&mut self, text: &str) {
        self.dedent();
        self.line(text);
    }

    /// `head { ... }` around whatever `body` writes.
    pub fn block<E>(
        &mut self,
        head: impl AsRef<str>,
        body: impl FnOnce(&mut Self) -> Result<(), E>,
    ) -> Result<(), E> {
        self.open(head);
        body(self)?;
        self.close();
        Ok(())
    }

    pub fn as_str(&self) -> &str {
        &self.out
    }

    pub fn finish(self) -> String {
        self.out
    }
}
