use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub socket_path: String,
    /// Directory where accepted messages are saved, one JSON file per session.
    pub savedir: String,
    pub pid_file: String,
    pub log_level: Option<String>,
    /// Recipient domain -> categories to run, in order. `default` is the fallback.
    pub domains: BTreeMap<String, CategoryList>,
    pub rules: RuleSources,
}

/// Category names for one domain, either as a YAML list or as a
/// comma-separated string (`"ipfromto, headers, wordscan"`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CategoryList {
    List(Vec<String>),
    Joined(String),
}

impl CategoryList {
    pub fn names(&self) -> Vec<String> {
        match self {
            CategoryList::List(names) => names.iter().map(|n| n.trim().to_string()).collect(),
            CategoryList::Joined(joined) => joined
                .split(',')
                .map(|n| n.trim().to_string())
                .filter(|n| !n.is_empty())
                .collect(),
        }
    }
}

/// Raw rule patterns per category, in declaration order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuleSources {
    pub ipfromto: Vec<String>,
    pub headers: Vec<String>,
    pub wordscan: Vec<String>,
}

impl Default for Config {
    fn default() -> Self {
        let mut domains = BTreeMap::new();
        domains.insert(
            "default".to_string(),
            CategoryList::List(vec![
                "ipfromto".to_string(),
                "headers".to_string(),
                "wordscan".to_string(),
            ]),
        );

        Config {
            socket_path: "/var/run/sspamm.sock".to_string(),
            savedir: "/var/spool/sspamm".to_string(),
            pid_file: "/var/run/sspamm.pid".to_string(),
            log_level: Some("info".to_string()),
            domains,
            rules: RuleSources {
                ipfromto: vec![r"(?#accept)^localhost:".to_string()],
                headers: vec![r"(?#flag)^X-Spam-Flag:\s*YES".to_string()],
                wordscan: vec![r"(?i)\bviagra\b".to_string()],
            },
        }
    }
}

impl Config {
    pub fn from_file(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read configuration file '{path}'"))?;
        Self::from_yaml(&content).with_context(|| format!("Invalid configuration in '{path}'"))
    }

    pub fn from_yaml(content: &str) -> anyhow::Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    pub fn to_file(&self, path: &str) -> anyhow::Result<()> {
        let content = serde_yaml::to_string(self)?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write configuration file '{path}'"))?;
        Ok(())
    }
}
