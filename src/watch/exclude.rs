//! Exclude pattern matching for watched paths.
//!
//! Patterns are anchored at the sync root. `*` and `?` stay within one path
//! segment, `**` crosses segments. A bare name such as `node_modules` (no
//! separator, no wildcard) excludes that name at any depth together with
//! everything below it. Matching ignores case and treats `\` as `/`.

use std::path::Path;

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

/// Compiled exclusion predicate for one profile.
#[derive(Debug, Clone)]
pub struct ExcludeMatcher {
    glob_set: GlobSet,
    patterns: Vec<String>,
}

impl Default for ExcludeMatcher {
    fn default() -> Self {
        Self::empty()
    }
}

impl ExcludeMatcher {
    /// Matcher that excludes nothing.
    pub fn empty() -> Self {
        Self {
            glob_set: GlobSet::empty(),
            patterns: Vec::new(),
        }
    }

    /// Compile an ordered pattern list. Blank entries are ignored.
    pub fn new<S: AsRef<str>>(patterns: &[S]) -> Result<Self, globset::Error> {
        let mut builder = GlobSetBuilder::new();
        let mut kept = Vec::new();

        for raw in patterns {
            let pattern = normalize(raw.as_ref());
            if pattern.is_empty() {
                continue;
            }
            for expanded in expand(&pattern) {
                let glob = GlobBuilder::new(&expanded)
                    .literal_separator(true)
                    .case_insensitive(true)
                    .build()?;
                builder.add(glob);
            }
            kept.push(raw.as_ref().to_string());
        }

        Ok(Self {
            glob_set: builder.build()?,
            patterns: kept,
        })
    }

    /// Whether `path` (relative to the sync root) is excluded.
    pub fn is_excluded(&self, path: &str) -> bool {
        if self.patterns.is_empty() {
            return false;
        }
        let normalized = normalize(path);
        if normalized.is_empty() {
            return false;
        }
        self.glob_set.is_match(normalized.as_str())
    }

    pub fn is_excluded_path(&self, path: &Path) -> bool {
        self.is_excluded(&path.to_string_lossy())
    }

    /// Patterns as given, for display and for the transfer command.
    pub fn patterns(&self) -> &[String] {
        &self.patterns
    }

    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }
}

/// Unify separators and strip leading `./` or `/` and any trailing `/`.
fn normalize(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut rest = unified.as_str();
    loop {
        if let Some(stripped) = rest.strip_prefix("./") {
            rest = stripped;
        } else if let Some(stripped) = rest.strip_prefix('/') {
            rest = stripped;
        } else {
            break;
        }
    }
    rest.trim_end_matches('/').to_string()
}

fn is_bare_name(pattern: &str) -> bool {
    !pattern.contains(['/', '*', '?', '[', '{'])
}

/// Globs that implement one pattern.
fn expand(pattern: &str) -> Vec<String> {
    if is_bare_name(pattern) {
        vec![
            pattern.to_string(),
            format!("{pattern}/**"),
            format!("**/{pattern}"),
            format!("**/{pattern}/**"),
        ]
    } else if pattern.ends_with("**") {
        vec![pattern.to_string()]
    } else {
        // A matching directory takes its contents with it.
        vec![pattern.to_string(), format!("{pattern}/**")]
    }
}
