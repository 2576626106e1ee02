//! `#include` expansion.
//!
//! Sources are scanned line by line. A line of the form
//! `#include "name"`, `#include 'name'` or `#include <name>` is replaced by
//! the expanded contents of `name`; every other line is copied through with
//! a `\n` terminator.
//!
//! Expanded files are cached by their resolved key for the lifetime of the
//! [`Preprocessor`]. A file is only cached once it expanded completely, and
//! a failed top-level call removes everything it cached, so errors never
//! leave partial entries behind.

use std::fs;
use std::path::{Path, PathBuf};

use hashbrown::HashMap;

use crate::error::{Result, ShaderError};

/// Where included files come from.
pub trait SourceProvider {
    /// Find `name` and return the key it is cached and cycle-checked under.
    fn resolve(&self, name: &str) -> Result<String>;

    /// Read the file behind a key returned by [`resolve`](Self::resolve).
    fn read(&self, key: &str) -> Result<String>;
}

/// Files on disk, looked up as given and then under each search path.
#[derive(Debug, Clone, Default)]
pub struct FileSystem {
    search_paths: Vec<PathBuf>,
}

impl FileSystem {
    pub fn new(search_paths: Vec<PathBuf>) -> Self {
        Self { search_paths }
    }
}

impl SourceProvider for FileSystem {
    fn resolve(&self, name: &str) -> Result<String> {
        let direct = PathBuf::from(name);
        let found = std::iter::once(direct.clone())
            .chain(self.search_paths.iter().map(|dir| dir.join(name)))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| ShaderError::FailedToOpenFile {
                path: direct,
                source: std::io::ErrorKind::NotFound.into(),
            })?;

        let canonical = found
            .canonicalize()
            .map_err(|source| ShaderError::FailedToOpenFile {
                path: found.clone(),
                source,
            })?;
        Ok(canonical.to_string_lossy().into_owned())
    }

    fn read(&self, key: &str) -> Result<String> {
        fs::read_to_string(key).map_err(|source| ShaderError::FailedToOpenFile {
            path: Path::new(key).to_path_buf(),
            source,
        })
    }
}

/// Named in-memory sources.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: HashMap<String, String>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a file.
    pub fn insert(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.files.insert(name.into(), text.into());
    }

    /// Builder form of [`insert`](Self::insert).
    pub fn with(mut self, name: impl Into<String>, text: impl Into<String>) -> Self {
        self.insert(name, text);
        self
    }
}

impl SourceProvider for MemorySource {
    fn resolve(&self, name: &str) -> Result<String> {
        if self.files.contains_key(name) {
            Ok(name.to_owned())
        } else {
            Err(ShaderError::FailedToOpenFile {
                path: PathBuf::from(name),
                source: std::io::ErrorKind::NotFound.into(),
            })
        }
    }

    fn read(&self, key: &str) -> Result<String> {
        self.resolve(key)?;
        Ok(self.files.get(key).cloned().unwrap_or_default())
    }
}

/// Name referenced by an include line, if `line` is one.
fn include_target(line: &str) -> Option<&str> {
    let rest = line.strip_prefix("#include")?.trim_start();
    let mut chars = rest.chars();
    let close = match chars.next()? {
        '"' => '"',
        '\'' => '\'',
        '<' => '>',
        _ => return None,
    };
    let rest = chars.as_str();
    let name = &rest[..rest.find(close)?];
    (!name.is_empty() && !name.contains(char::is_whitespace)).then_some(name)
}

/// Recursive include expander.
pub struct Preprocessor<S> {
    source: S,
    loaded: HashMap<String, String>,
    stack: Vec<String>,
    added: Vec<String>,
}

impl<S: SourceProvider> Preprocessor<S> {
    pub fn new(source: S) -> Self {
        Self {
            source,
            loaded: HashMap::new(),
            stack: Vec::new(),
            added: Vec::new(),
        }
    }

    /// Expand the file `name`.
    pub fn preprocess_file(&mut self, name: &str) -> Result<String> {
        self.transaction(|this| this.load(name))
    }

    /// Expand the includes of `text`, which is not itself a file and so can
    /// not take part in a cycle.
    pub fn preprocess_source(&mut self, text: &str) -> Result<String> {
        self.transaction(|this| this.expand(text))
    }

    fn transaction(&mut self, run: impl FnOnce(&mut Self) -> Result<String>) -> Result<String> {
        self.added.clear();
        let result = run(self);
        if result.is_err() {
            for key in self.added.drain(..) {
                self.loaded.remove(&key);
            }
            self.stack.clear();
        }
        self.added.clear();
        result
    }

    fn load(&mut self, name: &str) -> Result<String> {
        let key = self.source.resolve(name)?;
        if self.stack.contains(&key) {
            return Err(ShaderError::CircularInclude(key));
        }
        if let Some(expanded) = self.loaded.get(&key) {
            return Ok(expanded.clone());
        }

        let text = self.source.read(&key)?;
        self.stack.push(key.clone());
        let expanded = self.expand(&text)?;
        self.stack.pop();

        tracing::trace!("Expanded shader include {}", key);
        self.loaded.insert(key.clone(), expanded.clone());
        self.added.push(key);
        Ok(expanded)
    }

    fn expand(&mut self, text: &str) -> Result<String> {
        let mut out = String::with_capacity(text.len());
        for line in text.lines() {
            match include_target(line) {
                Some(name) => out.push_str(&self.load(name)?),
                None => {
                    out.push_str(line);
                    out.push('\n');
                }
            }
        }
        Ok(out)
    }

    /// Whether the file cached under `key` has been expanded.
    pub fn is_cached(&self, key: &str) -> bool {
        self.loaded.contains_key(key)
    }

    /// Number of cached files.
    pub fn cached_len(&self) -> usize {
        self.loaded.len()
    }

    /// Forget every cached file.
    pub fn clear(&mut self) {
        self.loaded.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn preprocessor(files: &[(&str, &str)]) -> Preprocessor<MemorySource> {
        let source = files
            .iter()
            .fold(MemorySource::new(), |source, (name, text)| source.with(*name, *text));
        Preprocessor::new(source)
    }

    #[test]
    fn include_lines_are_recognized() {
        assert_eq!(include_target("#include \"common.glsl\""), Some("common.glsl"));
        assert_eq!(include_target("#include <lights.glsl>"), Some("lights.glsl"));
        assert_eq!(include_target("#include 'a.glsl';"), Some("a.glsl"));
        assert_eq!(include_target("#include\t\"tab.glsl\""), Some("tab.glsl"));
        assert_eq!(include_target("  #include \"indented.glsl\""), None);
        assert_eq!(include_target("#include \"\""), None);
        assert_eq!(include_target("#include \"unterminated"), None);
        assert_eq!(include_target("#version 450"), None);
    }

    #[test]
    fn includes_expand_in_place() {
        let mut pp = preprocessor(&[
            ("main.frag", "#version 450\n#include \"common.glsl\"\nvoid main() {}\n"),
            ("common.glsl", "#include <consts.glsl>\nfloat twice(float x) { return x * TWO; }"),
            ("consts.glsl", "#define TWO 2.0"),
        ]);
        let out = pp.preprocess_file("main.frag").unwrap();
        insta::assert_snapshot!(out.trim_end(), @r"
        #version 450
        #define TWO 2.0
        float twice(float x) { return x * TWO; }
        void main() {}
        ");
        assert_eq!(pp.cached_len(), 3);
    }

    #[test]
    fn repeated_includes_are_expanded_each_time() {
        let mut pp = preprocessor(&[
            ("a", "#include \"b\"\n#include \"c\""),
            ("b", "#include \"d\"\nb"),
            ("c", "#include \"d\"\nc"),
            ("d", "d"),
        ]);
        assert_eq!(pp.preprocess_file("a").unwrap(), "d\nb\nd\nc\n");
        assert!(pp.is_cached("d"));
    }

    #[test]
    fn preprocessing_is_idempotent() {
        let text = "#include \"lib\"\r\nvoid main() {}\r\n";
        let mut pp = preprocessor(&[("lib", "int x;")]);
        let first = pp.preprocess_source(text).unwrap();
        let second = pp.preprocess_source(text).unwrap();
        assert_eq!(first, second);

        let mut fresh = preprocessor(&[("lib", "int x;")]);
        assert_eq!(fresh.preprocess_source(text).unwrap(), first);
    }

    #[test]
    fn circular_include_is_rejected_without_cache_entries() {
        let mut pp = preprocessor(&[("A", "#include \"B\""), ("B", "#include \"A\"")]);
        assert!(matches!(
            pp.preprocess_file("A"),
            Err(ShaderError::CircularInclude(key)) if key == "A"
        ));
        assert_eq!(pp.cached_len(), 0);
    }

    #[test]
    fn self_include_is_circular() {
        let mut pp = preprocessor(&[("A", "x\n#include \"A\"")]);
        assert!(matches!(
            pp.preprocess_file("A"),
            Err(ShaderError::CircularInclude(_))
        ));
    }

    #[test]
    fn failed_expansion_rolls_back_completed_files() {
        let mut pp = preprocessor(&[
            ("main", "#include \"ok\"\n#include \"missing\""),
            ("ok", "fine"),
        ]);
        assert!(matches!(
            pp.preprocess_file("main"),
            Err(ShaderError::FailedToOpenFile { .. })
        ));
        assert_eq!(pp.cached_len(), 0);

        // Entries from earlier successful calls survive a later failure.
        assert_eq!(pp.preprocess_file("ok").unwrap(), "fine\n");
        assert!(pp.preprocess_file("main").is_err());
        assert!(pp.is_cached("ok"));
    }

    #[test]
    fn file_system_uses_search_paths() {
        let root = std::env::temp_dir().join(format!("kestrel-pp-{}", std::process::id()));
        let include_dir = root.join("include");
        fs::create_dir_all(&include_dir).unwrap();
        fs::write(include_dir.join("shared.glsl"), "shared").unwrap();
        let main = root.join("main.vert");
        fs::write(&main, "#include <shared.glsl>\nmain").unwrap();

        let mut pp = Preprocessor::new(FileSystem::new(vec![include_dir]));
        let out = pp.preprocess_file(main.to_str().unwrap());
        fs::remove_dir_all(&root).unwrap();

        assert_eq!(out.unwrap(), "shared\nmain\n");
    }
}
