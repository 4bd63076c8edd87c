//! Include/exclude path filtering shared by source adapters.

use std::path::Path;

use regex::Regex;

use crate::error::SourceError;

/// Path filter assembled from newline-separated regex files.
///
/// An empty include set admits every path; the exclude set always wins.
#[derive(Debug, Default)]
pub struct PathFilter {
    includes: Vec<Regex>,
    excludes: Vec<Regex>,
}

impl PathFilter {
    /// Loads filter rules from optional include/exclude files, one regex
    /// per line. Blank lines and `#` comments are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] when a file cannot be read or a
    /// line fails to compile.
    pub fn from_files(include: Option<&Path>, exclude: Option<&Path>) -> Result<Self, SourceError> {
        Ok(Self {
            includes: load_patterns(include)?,
            excludes: load_patterns(exclude)?,
        })
    }

    /// Builds a filter from in-memory pattern lists.
    ///
    /// # Errors
    ///
    /// Returns [`SourceError::Config`] when a pattern fails to compile.
    pub fn from_patterns(includes: &[String], excludes: &[String]) -> Result<Self, SourceError> {
        Ok(Self {
            includes: compile(includes)?,
            excludes: compile(excludes)?,
        })
    }

    /// Returns `true` when `path` passes the filter.
    #[must_use]
    pub fn is_match(&self, path: &str) -> bool {
        if !self.includes.is_empty() && !self.includes.iter().any(|re| re.is_match(path)) {
            return false;
        }
        !self.excludes.iter().any(|re| re.is_match(path))
    }
}

fn load_patterns(file: Option<&Path>) -> Result<Vec<Regex>, SourceError> {
    let Some(file) = file else {
        return Ok(Vec::new());
    };

    let content = std::fs::read_to_string(file)
        .map_err(|e| SourceError::Config(format!("cannot read path filter file '{}': {e}", file.display())))?;

    let lines: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect();
    compile(&lines)
}

fn compile(patterns: &[String]) -> Result<Vec<Regex>, SourceError> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|e| SourceError::Config(format!("invalid path pattern '{pattern}': {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_filter_admits_everything() {
        let filter = PathFilter::default();
        assert!(filter.is_match("src/main.rs"));
        assert!(filter.is_match("anything"));
    }

    #[test]
    fn include_patterns_restrict_matches() {
        let filter = PathFilter::from_patterns(&[r"\.rs$".to_string()], &[]).unwrap();
        assert!(filter.is_match("src/main.rs"));
        assert!(!filter.is_match("README.md"));
    }

    #[test]
    fn exclude_wins_over_include() {
        let filter =
            PathFilter::from_patterns(&[r"\.rs$".to_string()], &[r"generated".to_string()]).unwrap();
        assert!(filter.is_match("src/main.rs"));
        assert!(!filter.is_match("src/generated/schema.rs"));
    }

    #[test]
    fn invalid_pattern_is_a_config_error() {
        let err = PathFilter::from_patterns(&["(unclosed".to_string()], &[]).unwrap_err();
        assert!(matches!(err, SourceError::Config(_)));
    }

    #[test]
    fn filter_files_skip_blanks_and_comments() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("includes.txt");
        std::fs::write(&file, "# only sources\n\n\\.rs$\n").unwrap();

        let filter = PathFilter::from_files(Some(&file), None).unwrap();
        assert!(filter.is_match("lib.rs"));
        assert!(!filter.is_match("lib.py"));
    }

    #[test]
    fn missing_filter_file_is_a_config_error() {
        let err = PathFilter::from_files(Some(Path::new("/definitely/not/here")), None).unwrap_err();
        assert!(matches!(err, SourceError::Config(_)));
    }
}
