use crate::config::{Settings, default_extensions, default_interpreters};
use crate::error::HubError;
use crate::model::ScriptDescriptor;
use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

const HINT_PROBE_LIMIT: u64 = 256 * 1024;

// argparse / optparse declarations: add_argument("--name", ...), add_option('-n', "--name")
static ARGPARSE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"add_(?:argument|option)\(\s*((?:['"][^'"]+['"]\s*,\s*)*['"][^'"]+['"])"#)
        .expect("valid regex")
});
static CLICK_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"@click\.(?:option|argument)\(\s*((?:['"][^'"]+['"]\s*,\s*)*['"][^'"]+['"])"#)
        .expect("valid regex")
});
static QUOTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"['"]([^'"]+)['"]"#).expect("valid regex"));

/// Flat (or optionally recursive) scan of a script directory.
#[derive(Debug, Clone)]
pub struct Registry {
    root: PathBuf,
    recursive: bool,
    extensions: Vec<String>,
    interpreters: HashMap<String, String>,
}

impl Registry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            recursive: false,
            extensions: default_extensions(),
            interpreters: default_interpreters(),
        }
    }

    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            root: settings.script_directory.clone(),
            recursive: settings.recursive,
            extensions: settings.extensions.clone(),
            interpreters: settings.interpreters.clone(),
        }
    }

    pub fn recursive(mut self, recursive: bool) -> Self {
        self.recursive = recursive;
        self
    }

    pub fn extensions<I, S>(mut self, extensions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extensions = extensions.into_iter().map(Into::into).collect();
        self
    }

    pub fn interpreters(mut self, interpreters: HashMap<String, String>) -> Self {
        self.interpreters = interpreters;
        self
    }

    /// Lists the scripts currently on disk, sorted by name.
    ///
    /// Names are compared case-insensitively; the first one seen wins.
    pub fn list_scripts(&self) -> Result<Vec<ScriptDescriptor>, HubError> {
        if !self.root.is_dir() {
            return Err(HubError::configuration(format!(
                "script directory {} does not exist",
                self.root.display()
            )));
        }

        let mut found = Vec::new();
        self.collect(&self.root, &mut found)?;
        found.sort_by(|a, b| a.0.cmp(&b.0));

        let mut seen = HashSet::new();
        let mut scripts = Vec::with_capacity(found.len());

        for (name, path) in found {
            if !seen.insert(name.to_lowercase()) {
                tracing::debug!(
                    script = %name,
                    path = %path.display(),
                    "skipping duplicate script name"
                );
                continue;
            }

            let interpreter =
                extension_of(&path).and_then(|ext| self.interpreters.get(&ext).cloned());
            let path = fs::canonicalize(&path).unwrap_or(path);
            let parameter_hints = probe_parameter_hints(&path);

            scripts.push(ScriptDescriptor {
                name,
                path,
                interpreter,
                parameter_hints,
            });
        }

        tracing::debug!(
            root = %self.root.display(),
            count = scripts.len(),
            "scanned script directory"
        );
        Ok(scripts)
    }

    /// Finds a script by name using the same rules as [`Registry::list_scripts`].
    pub fn find(&self, name: &str) -> Result<ScriptDescriptor, HubError> {
        let wanted = name.to_lowercase();
        self.list_scripts()?
            .into_iter()
            .find(|script| script.name.to_lowercase() == wanted)
            .ok_or_else(|| HubError::NotFound(name.to_string()))
    }

    fn collect(&self, dir: &Path, out: &mut Vec<(String, PathBuf)>) -> Result<(), HubError> {
        let entries = fs::read_dir(dir).map_err(|e| {
            HubError::configuration(format!("read script directory {}: {e}", dir.display()))
        })?;

        for entry in entries {
            let Ok(entry) = entry else {
                continue;
            };
            let path = entry.path();
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            let file_name = entry.file_name().to_string_lossy().to_string();

            if file_name.starts_with('.') {
                continue;
            }

            if file_type.is_dir() {
                if self.recursive && !file_name.starts_with("__") {
                    self.collect(&path, out)?;
                }
                continue;
            }

            // follow symlinks to regular files
            if !path.is_file() || !self.is_script(&path, &file_name) {
                continue;
            }

            let name = match path.strip_prefix(&self.root) {
                Ok(rel) => rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().to_string())
                    .collect::<Vec<_>>()
                    .join("/"),
                Err(_) => file_name,
            };
            out.push((name, path));
        }

        Ok(())
    }

    fn is_script(&self, path: &Path, file_name: &str) -> bool {
        let Some(ext) = extension_of(path) else {
            return false;
        };

        if !self
            .extensions
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(&ext))
        {
            return false;
        }

        let stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        !(file_name.starts_with("__") || file_name.starts_with("test_") || stem.ends_with("_test"))
    }
}

fn extension_of(path: &Path) -> Option<String> {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
}

/// Best-effort scan of a script's source for declared parameter names.
///
/// Never fails: unreadable files simply have no hints.
pub fn probe_parameter_hints(path: &Path) -> Vec<String> {
    let mut buf = Vec::new();
    let read =
        File::open(path).and_then(|file| file.take(HINT_PROBE_LIMIT).read_to_end(&mut buf));
    if let Err(err) = read {
        tracing::debug!(path = %path.display(), error = %err, "parameter hint probe skipped");
        return Vec::new();
    }

    extract_parameter_hints(&String::from_utf8_lossy(&buf))
}

pub fn extract_parameter_hints(source: &str) -> Vec<String> {
    let mut hints: Vec<String> = Vec::new();

    for re in [&*ARGPARSE_RE, &*CLICK_RE] {
        for caps in re.captures_iter(source) {
            let Some(group) = caps.get(1) else {
                continue;
            };

            // prefer the long form when both -n and --name are declared
            let names: Vec<&str> = QUOTED_RE
                .captures_iter(group.as_str())
                .filter_map(|c| c.get(1).map(|m| m.as_str()))
                .collect();
            let chosen = names
                .iter()
                .find(|n| n.starts_with("--"))
                .or_else(|| names.last())
                .copied();

            let Some(raw) = chosen else {
                continue;
            };
            let name = raw.trim_start_matches('-').to_string();
            if name.is_empty() || name == "h" || name == "help" {
                continue;
            }
            if !hints.contains(&name) {
                hints.push(name);
            }
        }
    }

    hints
}
