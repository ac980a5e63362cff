use std::path::{Path, PathBuf};

use crate::diagnostic::Diagnostic;

/// Code generation options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CodegenOptions {
    /// Threads per block along X (`BLOCK_SIZE`).
    pub block_size: u32,
    /// Vertical levels each thread handles in Parallel multistages
    /// (`LEVELS_PER_THREAD`).
    pub levels_per_thread: u32,
    /// Where to write the C header with the entry point declarations.
    pub output_c_header: Option<PathBuf>,
    /// Where to write the Fortran interface module.
    pub output_fortran_interface: Option<PathBuf>,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            block_size: 128,
            levels_per_thread: 1,
            output_c_header: None,
            output_fortran_interface: None,
        }
    }
}

impl CodegenOptions {
    /// Load options from an `icogen.toml`-style file. Relative paths are
    /// resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self, Diagnostic> {
        let content =
            std::fs::read_to_string(path).map_err(|e| Diagnostic::read_failed(path, &e))?;
        let base = path.parent().unwrap_or(Path::new("."));
        Self::parse(&content, base)
    }

    /// Section-aware minimal TOML parsing of the `[codegen]` table.
    pub fn parse(content: &str, base: &Path) -> Result<Self, Diagnostic> {
        let mut opts = Self::default();
        let mut section = String::new();

        for (lineno, line) in content.lines().enumerate() {
            let trimmed = line.trim();
            if trimmed.starts_with('#') || trimmed.is_empty() {
                continue;
            }
            if trimmed.starts_with('[') && trimmed.ends_with(']') {
                section = trimmed[1..trimmed.len() - 1].trim().to_string();
                continue;
            }
            if section != "codegen" {
                continue;
            }
            let Some((key, value)) = trimmed.split_once('=') else {
                return Err(Diagnostic::error(format!(
                    "line {}: expected 'key = value'",
                    lineno + 1
                )));
            };
            let key = key.trim().trim_matches('"');
            let value = value.trim();
            match key {
                "block_size" => opts.block_size = parse_count(key, value, lineno)?,
                "levels_per_thread" => opts.levels_per_thread = parse_count(key, value, lineno)?,
                "c_header" => opts.output_c_header = Some(base.join(value.trim_matches('"'))),
                "fortran_interface" => {
                    opts.output_fortran_interface = Some(base.join(value.trim_matches('"')))
                }
                _ => {
                    return Err(Diagnostic::error(format!(
                        "line {}: unknown codegen option '{}'",
                        lineno + 1,
                        key
                    ))
                    .with_help(
                        "known options: block_size, levels_per_thread, c_header, fortran_interface"
                            .to_string(),
                    ))
                }
            }
        }

        opts.validate()?;
        Ok(opts)
    }

    pub fn validate(&self) -> Result<(), Diagnostic> {
        if self.block_size == 0 {
            return Err(Diagnostic::error("block_size must be positive".to_string()));
        }
        if self.levels_per_thread == 0 {
            return Err(Diagnostic::error(
                "levels_per_thread must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_count(key: &str, value: &str, lineno: usize) -> Result<u32, Diagnostic> {
    value.parse::<u32>().map_err(|_| {
        Diagnostic::error(format!(
            "line {}: '{}' must be a non-negative integer, got '{}'",
            lineno + 1,
            key,
            value
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_defaults() {
        let o = CodegenOptions::default();
        assert_eq!(o.block_size, 128);
        assert_eq!(o.levels_per_thread, 1);
        assert!(o.output_c_header.is_none());
        assert!(o.output_fortran_interface.is_none());
    }

    #[test]
    fn test_load_codegen_section() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("icogen.toml");
        fs::write(
            &path,
            r#"# build settings
[other]
block_size = "ignored"

[codegen]
block_size = 64
levels_per_thread = 4
c_header = "out/stencils.h"
fortran_interface = "out/stencils.f90"
"#,
        )
        .unwrap();

        let o = CodegenOptions::load(&path).unwrap();
        assert_eq!(o.block_size, 64);
        assert_eq!(o.levels_per_thread, 4);
        assert_eq!(o.output_c_header, Some(dir.path().join("out/stencils.h")));
        assert_eq!(
            o.output_fortran_interface,
            Some(dir.path().join("out/stencils.f90"))
        );
    }

    #[test]
    fn test_zero_levels_rejected() {
        let err = CodegenOptions::parse("[codegen]\nlevels_per_thread = 0\n", Path::new("."))
            .unwrap_err();
        assert_eq!(err.message, "levels_per_thread must be positive");
    }

    #[test]
    fn test_bad_value_and_unknown_key() {
        let err =
            CodegenOptions::parse("[codegen]\nblock_size = big\n", Path::new(".")).unwrap_err();
        assert!(err.message.starts_with("line 2: 'block_size'"));

        let err = CodegenOptions::parse("[codegen]\natlas = true\n", Path::new(".")).unwrap_err();
        assert!(err.message.contains("unknown codegen option 'atlas'"));
        assert!(err.help.is_some());
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = CodegenOptions::load(&dir.path().join("nope.toml")).unwrap_err();
        assert!(err.message.starts_with("cannot read '"));
    }
}
