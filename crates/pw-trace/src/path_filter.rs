//! Path normalisation, filtering and de-duplication.
//!
//! Traced open events report paths exactly as processes passed them to the
//! kernel. Before the scanner touches anything we canonicalise the string,
//! drop paths not worth caching, optionally rewrite onto an alternate root,
//! and collapse repeat opens of the same path.

use pw_pack::PACK_PATH_MAX;
use pw_types::Dev;
use std::collections::HashSet;
use std::os::unix::fs::MetadataExt;
use tracing::warn;

/// Trees that are virtual or temporary; caching them would waste pack space.
const IGNORE_PREFIXES: [&str; 8] = [
    "/proc/",
    "/sys/",
    "/dev/",
    "/tmp/",
    "/run/",
    "/var/run/",
    "/var/log/",
    "/var/lock/",
];

/// Prefix to try prepending to absolute paths, with the device the prefixed
/// form must live on. Supports tracing against a mounted alternate root.
#[derive(Debug, Clone)]
pub struct PathPrefix {
    pub dev: Dev,
    pub prefix: String,
}

/// Canonicalise an absolute path in one left-to-right pass.
///
/// Collapses `//` and `/./`, resolves `/../` against the preceding segment
/// (never past the root), and strips trailing slashes except on `/` itself.
#[must_use]
pub fn normalise(path: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            other => segments.push(other),
        }
    }

    if segments.is_empty() {
        "/".to_owned()
    } else {
        let mut out = String::with_capacity(path.len());
        for segment in segments {
            out.push('/');
            out.push_str(segment);
        }
        out
    }
}

fn is_ignored(path: &str) -> bool {
    IGNORE_PREFIXES.iter().any(|p| path.starts_with(p))
}

/// Admission filter in front of the scanner, owned by one trace session.
#[derive(Debug)]
pub struct PathFilter {
    prefix_filter: Option<String>,
    path_prefix: Option<PathPrefix>,
    seen: HashSet<String>,
}

impl PathFilter {
    #[must_use]
    pub fn new(prefix_filter: Option<String>, path_prefix: Option<PathPrefix>) -> Self {
        Self {
            prefix_filter,
            path_prefix,
            seen: HashSet::new(),
        }
    }

    /// Run a raw traced path through the filter chain. Returns the canonical
    /// path to scan, or `None` when the path is rejected or already seen.
    ///
    /// The ignore and length checks apply to the final form: a path that
    /// rewrites onto the configured device is judged by its rewritten name,
    /// so `/tmp/foo` rewritten to `/mnt/root/tmp/foo` is kept.
    pub fn admit(&mut self, raw: &str) -> Option<String> {
        // Relative paths are meaningless here: the working directory they
        // were opened from is long gone.
        if !raw.starts_with('/') {
            warn!(path = raw, "ignored relative path");
            return None;
        }

        let mut path = normalise(raw);

        if let Some(filter) = &self.prefix_filter {
            if !path.starts_with(filter.as_str()) {
                warn!(path, "skipped by path prefix filter");
                return None;
            }
        }

        if let Some(prefix) = &self.path_prefix {
            let rewritten = format!("{}{}", prefix.prefix, path);
            if let Ok(meta) = std::fs::symlink_metadata(&rewritten) {
                if Dev::from_raw(meta.dev()) == prefix.dev {
                    path = rewritten;
                }
            }
        }

        if is_ignored(&path) {
            return None;
        }

        if path.len() > PACK_PATH_MAX {
            warn!(path, "ignored far too long path");
            return None;
        }

        if !self.seen.insert(path.clone()) {
            return None;
        }

        Some(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalise_collapses_dot_and_double_slash() {
        assert_eq!(normalise("/a//b/./c/../d/"), "/a/b/d");
        assert_eq!(normalise("//etc///passwd"), "/etc/passwd");
        assert_eq!(normalise("/a/./b"), "/a/b");
    }

    #[test]
    fn normalise_resolves_dotdot_at_root() {
        assert_eq!(normalise("/../x"), "/x");
        assert_eq!(normalise("/.."), "/");
        assert_eq!(normalise("/a/../.."), "/");
    }

    #[test]
    fn normalise_preserves_root() {
        assert_eq!(normalise("/"), "/");
        assert_eq!(normalise("///"), "/");
    }

    #[test]
    fn normalise_strips_trailing_slashes() {
        assert_eq!(normalise("/usr/lib/"), "/usr/lib");
        assert_eq!(normalise("/usr//"), "/usr");
    }

    #[test]
    fn normalise_is_idempotent() {
        for path in [
            "/a//b/./c/../d/",
            "/../x",
            "/",
            "/usr/lib/locale//C.UTF-8/./LC_NAME",
        ] {
            let once = normalise(path);
            assert_eq!(normalise(&once), once, "input {path}");
        }
    }

    #[test]
    fn admit_rejects_relative_paths() {
        let mut filter = PathFilter::new(None, None);
        assert_eq!(filter.admit("a/b"), None);
        assert_eq!(filter.admit("./x"), None);
    }

    #[test]
    fn admit_rejects_ignored_trees() {
        let mut filter = PathFilter::new(None, None);
        for path in [
            "/proc/1/maps",
            "/sys/class/block",
            "/dev/null",
            "/tmp/x",
            "/run/lock/f",
            "/var/run/pid",
            "/var/log/syslog",
            "/var/lock/f",
        ] {
            assert_eq!(filter.admit(path), None, "should ignore {path}");
        }
        // Prefixes only: the directories themselves are not under them.
        assert!(filter.admit("/procfile").is_some());
    }

    #[test]
    fn admit_rejects_over_long_paths() {
        let mut filter = PathFilter::new(None, None);
        let long = format!("/{}", "a".repeat(PACK_PATH_MAX + 10));
        assert_eq!(filter.admit(&long), None);
    }

    #[test]
    fn admit_deduplicates() {
        let mut filter = PathFilter::new(None, None);
        assert_eq!(filter.admit("/etc/passwd"), Some("/etc/passwd".into()));
        assert_eq!(filter.admit("/etc/passwd"), None);
        // Different spellings of the same path collapse too.
        assert_eq!(filter.admit("/etc//passwd"), None);
    }

    #[test]
    fn admit_applies_prefix_filter() {
        let mut filter = PathFilter::new(Some("/usr/".into()), None);
        assert!(filter.admit("/usr/bin/env").is_some());
        assert_eq!(filter.admit("/etc/passwd"), None);
    }

    #[test]
    fn admit_rewrites_onto_prefix_device() {
        // Not tempfile::tempdir(): /tmp is one of the ignored prefixes, and
        // the ignore check applies to the rewritten path.
        let dir = tempfile::tempdir_in(env!("CARGO_MANIFEST_DIR")).expect("tempdir");
        let root = dir.path().to_str().unwrap().to_owned();
        std::fs::create_dir_all(format!("{root}/etc")).unwrap();
        std::fs::write(format!("{root}/etc/fstab"), b"x").unwrap();
        let dev = Dev::from_raw(std::fs::metadata(dir.path()).unwrap().dev());

        let mut filter = PathFilter::new(
            None,
            Some(PathPrefix {
                dev,
                prefix: root.clone(),
            }),
        );

        // Exists under the prefix on the right device: rewritten.
        assert_eq!(
            filter.admit("/etc/fstab"),
            Some(format!("{root}/etc/fstab"))
        );
        // Does not exist under the prefix: left alone.
        assert_eq!(
            filter.admit("/etc/no-such-file"),
            Some("/etc/no-such-file".into())
        );
    }

    #[test]
    fn admit_judges_ignore_list_after_rewrite() {
        let dir = tempfile::tempdir_in(env!("CARGO_MANIFEST_DIR")).expect("tempdir");
        let root = dir.path().to_str().unwrap().to_owned();
        std::fs::create_dir_all(format!("{root}/tmp")).unwrap();
        std::fs::write(format!("{root}/tmp/cache"), b"x").unwrap();
        let dev = Dev::from_raw(std::fs::metadata(dir.path()).unwrap().dev());

        let mut filter = PathFilter::new(
            None,
            Some(PathPrefix {
                dev,
                prefix: root.clone(),
            }),
        );

        // Under an ignored tree as traced, but the rewritten form is not:
        // the rewrite wins, so the alternate root's copy is kept.
        assert_eq!(
            filter.admit("/tmp/cache"),
            Some(format!("{root}/tmp/cache"))
        );
        // No rewrite target exists: the path stays /tmp/... and is dropped.
        assert_eq!(filter.admit("/tmp/other"), None);
    }
}
