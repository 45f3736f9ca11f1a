//! Topology and launcher configuration, loaded from TOML.
//!
//! Every node in a deployment loads the same file, so each one can see the
//! whole tree: its own parent and children, but also the subtree under any
//! peer (exception accounting needs to name the members of a failed
//! subtree). The host list order is significant — leader rotation walks it
//! round-robin.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("config invalid: {0}")]
    Invalid(String),
}

/// One host entry: its name and the names of its children.
#[derive(Debug, Clone, Deserialize)]
pub struct HostSpec {
    pub name: String,

    /// Children in tree order; empty for leaves.
    #[serde(default)]
    pub children: Vec<String>,
}

/// A full deployment description.
///
/// The first host with no parent is the initial root (view 0).
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// All hosts, in leader-rotation order.
    pub hosts: Vec<HostSpec>,

    /// Suite token; only "ed25519" is configured in this build.
    #[serde(default = "default_suite")]
    pub suite: String,

    /// Per-operation transport deadline in milliseconds.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

fn default_suite() -> String {
    "ed25519".to_string()
}

fn default_timeout_ms() -> u64 {
    500
}

impl Config {
    /// Load and validate a config file.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
        let raw = fs::read_to_string(path.as_ref())?;
        let cfg: Config = toml::from_str(&raw)?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural validation: unique names, known children, a single root,
    /// no cycles (every non-root has exactly one parent).
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.hosts.is_empty() {
            return Err(ConfigError::Invalid("no hosts configured".into()));
        }
        if self.suite != "ed25519" {
            return Err(ConfigError::Invalid(format!(
                "unsupported suite '{}', only 'ed25519' is available",
                self.suite
            )));
        }

        let mut seen = HashMap::new();
        for host in &self.hosts {
            if seen.insert(host.name.as_str(), ()).is_some() {
                return Err(ConfigError::Invalid(format!(
                    "duplicate host name '{}'",
                    host.name
                )));
            }
        }

        let mut parent_of: HashMap<&str, &str> = HashMap::new();
        for host in &self.hosts {
            for child in &host.children {
                if !seen.contains_key(child.as_str()) {
                    return Err(ConfigError::Invalid(format!(
                        "host '{}' lists unknown child '{}'",
                        host.name, child
                    )));
                }
                if parent_of.insert(child.as_str(), host.name.as_str()).is_some() {
                    return Err(ConfigError::Invalid(format!(
                        "host '{child}' has more than one parent"
                    )));
                }
            }
        }

        let roots: Vec<&str> = self
            .hosts
            .iter()
            .map(|h| h.name.as_str())
            .filter(|name| !parent_of.contains_key(name))
            .collect();
        if roots.len() != 1 {
            return Err(ConfigError::Invalid(format!(
                "expected exactly one root, found {}",
                roots.len()
            )));
        }
        Ok(())
    }

    /// Host names in rotation order.
    #[must_use]
    pub fn host_list(&self) -> Vec<String> {
        self.hosts.iter().map(|h| h.name.clone()).collect()
    }

    /// The parent of each non-root host.
    #[must_use]
    pub fn parent_map(&self) -> HashMap<String, String> {
        let mut parents = HashMap::new();
        for host in &self.hosts {
            for child in &host.children {
                parents.insert(child.clone(), host.name.clone());
            }
        }
        parents
    }

    /// Children of each host (empty vec for leaves).
    #[must_use]
    pub fn tree(&self) -> HashMap<String, Vec<String>> {
        self.hosts
            .iter()
            .map(|h| (h.name.clone(), h.children.clone()))
            .collect()
    }

    /// The initial root: the unique host without a parent.
    #[must_use]
    pub fn root(&self) -> String {
        let parents = self.parent_map();
        self.hosts
            .iter()
            .map(|h| h.name.clone())
            .find(|name| !parents.contains_key(name))
            .unwrap_or_else(|| self.hosts[0].name.clone())
    }

    /// Tree height above `name`: 0 for leaves, parents one more than their
    /// tallest child. Timeouts scale with this.
    #[must_use]
    pub fn height_of(&self, name: &str) -> u32 {
        let tree = self.tree();
        fn rec(tree: &HashMap<String, Vec<String>>, name: &str) -> u32 {
            match tree.get(name) {
                Some(children) if !children.is_empty() => {
                    1 + children.iter().map(|c| rec(tree, c)).max().unwrap_or(0)
                }
                _ => 0,
            }
        }
        rec(&tree, name)
    }

    /// Every host in the subtree rooted at `name`, including `name` itself.
    #[must_use]
    pub fn subtree_of(&self, name: &str) -> Vec<String> {
        let tree = self.tree();
        let mut out = Vec::new();
        let mut stack = vec![name.to_string()];
        while let Some(current) = stack.pop() {
            if let Some(children) = tree.get(&current) {
                stack.extend(children.iter().cloned());
            }
            out.push(current);
        }
        out.sort();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const EXAMPLE: &str = r#"
        suite = "ed25519"
        default_timeout_ms = 250

        [[hosts]]
        name = "host0"
        children = ["host1", "host4"]

        [[hosts]]
        name = "host1"
        children = ["host2", "host3"]

        [[hosts]]
        name = "host2"

        [[hosts]]
        name = "host3"

        [[hosts]]
        name = "host4"
        children = ["host5"]

        [[hosts]]
        name = "host5"
    "#;

    fn parse(s: &str) -> Result<Config, ConfigError> {
        let cfg: Config = toml::from_str(s).map_err(ConfigError::Parse)?;
        cfg.validate()?;
        Ok(cfg)
    }

    #[test]
    fn test_load_from_file_roundtrip() {
        let mut tmp = tempfile::NamedTempFile::new().expect("temp file");
        write!(tmp, "{EXAMPLE}").expect("write");
        let cfg = Config::load_from_file(tmp.path()).expect("load");
        assert_eq!(cfg.hosts.len(), 6);
        assert_eq!(cfg.default_timeout_ms, 250);
        assert_eq!(cfg.root(), "host0");
    }

    #[test]
    fn test_parent_map_and_tree() {
        let cfg = parse(EXAMPLE).unwrap();
        let parents = cfg.parent_map();
        assert_eq!(parents.get("host5").map(String::as_str), Some("host4"));
        assert_eq!(parents.get("host0"), None);
        assert_eq!(cfg.tree()["host1"], vec!["host2", "host3"]);
    }

    #[test]
    fn test_heights() {
        let cfg = parse(EXAMPLE).unwrap();
        assert_eq!(cfg.height_of("host0"), 2);
        assert_eq!(cfg.height_of("host1"), 1);
        assert_eq!(cfg.height_of("host2"), 0);
        assert_eq!(cfg.height_of("host4"), 1);
    }

    #[test]
    fn test_subtree_enumeration() {
        let cfg = parse(EXAMPLE).unwrap();
        assert_eq!(cfg.subtree_of("host1"), vec!["host1", "host2", "host3"]);
        assert_eq!(cfg.subtree_of("host5"), vec!["host5"]);
        assert_eq!(cfg.subtree_of("host0").len(), 6);
    }

    #[test]
    fn test_rejects_two_roots() {
        let bad = r#"
            [[hosts]]
            name = "a"
            [[hosts]]
            name = "b"
        "#;
        assert!(matches!(parse(bad), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_unknown_child() {
        let bad = r#"
            [[hosts]]
            name = "a"
            children = ["ghost"]
        "#;
        assert!(matches!(parse(bad), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_unknown_suite() {
        let bad = r#"
            suite = "nist256"
            [[hosts]]
            name = "a"
        "#;
        assert!(matches!(parse(bad), Err(ConfigError::Invalid(_))));
    }
}
