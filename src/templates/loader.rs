//! Template sources

use super::RawTemplate;
use crate::config::TemplateProducer;
use std::fmt;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Something a job can load raw templates from
pub trait TemplateSource: Send + Sync + fmt::Debug {
    fn load(&self) -> Result<Vec<RawTemplate>, String>;

    /// Human readable origin, used in logs and errors
    fn describe(&self) -> String;
}

/// All `*.yaml` / `*.yml` files below a directory, in path order
#[derive(Debug, Clone)]
pub struct DirectorySource {
    root: PathBuf,
}

impl DirectorySource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl TemplateSource for DirectorySource {
    fn load(&self) -> Result<Vec<RawTemplate>, String> {
        if !self.root.is_dir() {
            return Err(format!("{} is not a directory", self.root.display()));
        }

        let mut templates = Vec::new();
        let walker = WalkDir::new(&self.root).follow_links(true).sort_by_file_name();

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("skipping unreadable template path: {}", e);
                    continue;
                }
            };
            if !entry.file_type().is_file() || !is_template_file(entry.path()) {
                continue;
            }

            match std::fs::read_to_string(entry.path()) {
                Ok(original) => {
                    let id = template_id(&original).unwrap_or_else(|| file_stem(entry.path()));
                    templates.push(RawTemplate { id, original });
                }
                Err(e) => log::warn!("skipping template {}: {}", entry.path().display(), e),
            }
        }

        log::debug!("loaded {} templates from {}", templates.len(), self.root.display());
        Ok(templates)
    }

    fn describe(&self) -> String {
        format!("directory {}", self.root.display())
    }
}

fn is_template_file(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|e| e.to_str()).map(str::to_ascii_lowercase).as_deref(),
        Some("yaml") | Some("yml")
    )
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default()
}

/// Top-level `id:` line, without parsing the whole document
fn template_id(source: &str) -> Option<String> {
    source.lines().find_map(|line| {
        let value = line.strip_prefix("id:")?.trim();
        let value = value.trim_matches(|c| c == '"' || c == '\'');
        (!value.is_empty()).then(|| value.to_string())
    })
}

/// Templates produced by a caller-supplied function
#[derive(Clone)]
pub struct FnSource {
    producer: TemplateProducer,
}

impl FnSource {
    pub fn new(producer: TemplateProducer) -> Self {
        Self { producer }
    }
}

impl fmt::Debug for FnSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnSource").finish_non_exhaustive()
    }
}

impl TemplateSource for FnSource {
    fn load(&self) -> Result<Vec<RawTemplate>, String> {
        Ok((self.producer)())
    }

    fn describe(&self) -> String {
        "template function".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    #[test]
    fn test_directory_source_walks_yaml_files() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir(dir.path().join("network")).unwrap();
        std::fs::write(dir.path().join("network/b.yaml"), "id: beta\ninfo: {}\n").unwrap();
        std::fs::write(dir.path().join("a.yml"), "info: {}\n").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "id: ignored\n").unwrap();

        let templates = DirectorySource::new(dir.path()).load().unwrap();
        let ids: Vec<&str> = templates.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "beta"]);
        assert!(templates[1].original.starts_with("id: beta"));
    }

    #[test]
    fn test_directory_source_missing_root() {
        let dir = TempDir::new().unwrap();
        let source = DirectorySource::new(dir.path().join("missing"));
        assert!(source.load().is_err());
    }

    #[test]
    fn test_template_id_line() {
        assert_eq!(template_id("info: {}\nid: \"quoted\"\n"), Some("quoted".to_string()));
        assert_eq!(template_id("  id: nested\n"), None);
    }

    #[test]
    fn test_fn_source() {
        let source = FnSource::new(Arc::new(|| vec![RawTemplate::new("x", "id: x")]));
        assert_eq!(source.load().unwrap().len(), 1);
        assert_eq!(source.describe(), "template function");
    }
}
