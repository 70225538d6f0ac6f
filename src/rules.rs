//! Rule compilation and per-domain category policy.
//!
//! A rule is a regular expression with an optional leading `(?#word)`
//! annotation naming the action taken when it matches. Rules without an
//! annotation use [`DEFAULT_ACTION`].

use crate::config::{CategoryList, RuleSources};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

pub const DEFAULT_ACTION: &str = "delete";

/// Domain key used when a recipient domain has no policy of its own.
pub const DEFAULT_DOMAIN: &str = "default";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Category {
    IpFromTo,
    Headers,
    Wordscan,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::IpFromTo, Category::Headers, Category::Wordscan];

    pub fn as_str(self) -> &'static str {
        match self {
            Category::IpFromTo => "ipfromto",
            Category::Headers => "headers",
            Category::Wordscan => "wordscan",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "ipfromto" => Ok(Category::IpFromTo),
            "headers" => Ok(Category::Headers),
            "wordscan" => Ok(Category::Wordscan),
            other => Err(anyhow::anyhow!("Unknown rule category '{other}'")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Rule {
    pub pattern: Regex,
    pub action: String,
}

impl Rule {
    pub fn is_match(&self, probe: &str) -> bool {
        self.pattern.is_match(probe)
    }
}

/// A pattern that was left out of the rule set because it did not compile.
#[derive(Debug, Clone)]
pub struct SkippedRule {
    pub category: Category,
    pub pattern: String,
    pub error: String,
}

#[derive(Debug, Clone, Default)]
pub struct RuleSet {
    rules: HashMap<Category, Vec<Rule>>,
    skipped: Vec<SkippedRule>,
}

impl RuleSet {
    /// Compile `(category, pattern)` pairs in declaration order. A pattern
    /// that fails to compile is logged and skipped; its siblings still load.
    pub fn compile<I, S>(sources: I) -> Self
    where
        I: IntoIterator<Item = (Category, S)>,
        S: AsRef<str>,
    {
        let mut rule_set = RuleSet::default();

        for (category, text) in sources {
            let text = text.as_ref();
            let (action, body) = split_annotation(text);
            match Regex::new(&body) {
                Ok(pattern) => {
                    log::debug!("Loaded [{category}] rule '{text}' with action '{action}'");
                    rule_set
                        .rules
                        .entry(category)
                        .or_default()
                        .push(Rule { pattern, action });
                }
                Err(e) => {
                    log::warn!("Invalid regex in [{category}]: {text} ({e})");
                    rule_set.skipped.push(SkippedRule {
                        category,
                        pattern: text.to_string(),
                        error: e.to_string(),
                    });
                }
            }
        }

        rule_set
    }

    pub fn from_sources(sources: &RuleSources) -> Self {
        let pairs = sources
            .ipfromto
            .iter()
            .map(|p| (Category::IpFromTo, p))
            .chain(sources.headers.iter().map(|p| (Category::Headers, p)))
            .chain(sources.wordscan.iter().map(|p| (Category::Wordscan, p)));
        Self::compile(pairs)
    }

    pub fn rules(&self, category: Category) -> &[Rule] {
        self.rules.get(&category).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn skipped(&self) -> &[SkippedRule] {
        &self.skipped
    }
}

/// Split a leading `(?#word)` annotation off a rule.
///
/// Returns the action tag and the pattern to compile. Only a leading
/// comment that is a single word names the action; otherwise the action is
/// [`DEFAULT_ACTION`]. `regex` has no comment-group syntax, so every
/// `(?#...)` group is removed before compiling. They match nothing, so the
/// pattern's meaning is unchanged.
fn split_annotation(text: &str) -> (String, String) {
    let mut action = DEFAULT_ACTION;
    if let Some(rest) = text.strip_prefix("(?#") {
        if let Some(end) = rest.find(')') {
            let comment = &rest[..end];
            if !comment.is_empty() && comment.chars().all(|c| c.is_alphanumeric() || c == '_') {
                action = comment;
            }
        }
    }
    (action.to_string(), strip_comments(text))
}

/// Remove `(?#...)` groups outside character classes and escapes. A comment
/// runs to the first `)`; an unterminated one is kept as is.
fn strip_comments(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    let mut in_class = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                out.push(c);
                if let Some(escaped) = chars.next() {
                    out.push(escaped);
                }
            }
            '[' if !in_class => {
                in_class = true;
                out.push(c);
                if chars.peek() == Some(&'^') {
                    out.extend(chars.next());
                }
                // `]` right after the opening bracket is a literal
                if chars.peek() == Some(&']') {
                    out.extend(chars.next());
                }
            }
            ']' if in_class => {
                in_class = false;
                out.push(c);
            }
            '(' if !in_class && chars.clone().take(2).eq("?#".chars()) => {
                let mut rest = chars.clone();
                if rest.any(|c| c == ')') {
                    chars = rest;
                } else {
                    // unterminated, left for the regex parser to reject
                    out.push(c);
                }
            }
            _ => out.push(c),
        }
    }

    out
}

/// Recipient domain -> ordered categories, resolved once at load time.
#[derive(Debug, Clone, Default)]
pub struct DomainPolicy {
    domains: BTreeMap<String, Vec<Category>>,
}

impl DomainPolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_domain(mut self, domain: &str, categories: Vec<Category>) -> Self {
        self.domains.insert(domain.to_lowercase(), categories);
        self
    }

    pub fn from_config(domains: &BTreeMap<String, CategoryList>) -> Self {
        let mut policy = DomainPolicy::new();
        for (domain, list) in domains {
            let mut categories = Vec::new();
            for name in list.names() {
                match name.parse::<Category>() {
                    Ok(category) => categories.push(category),
                    Err(e) => log::warn!("Ignoring category for domain '{domain}': {e}"),
                }
            }
            policy = policy.with_domain(domain, categories);
        }
        policy
    }

    /// Categories to run for `domain`, falling back to `default`. An empty
    /// slice means nothing runs and the message is accepted.
    pub fn categories_for(&self, domain: &str) -> &[Category] {
        self.domains
            .get(domain)
            .or_else(|| self.domains.get(DEFAULT_DOMAIN))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn domains(&self) -> impl Iterator<Item = (&str, &[Category])> {
        self.domains.iter().map(|(d, c)| (d.as_str(), c.as_slice()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_annotation_sets_action() {
        let rules = RuleSet::compile([(Category::Headers, r"(?#flag)X-Spam:.*yes")]);
        let rule = &rules.rules(Category::Headers)[0];
        assert_eq!(rule.action, "flag");
        assert!(rule.is_match("X-Spam: yes"));
        assert!(!rule.is_match("X-Spam: no"));
    }

    #[test]
    fn test_missing_annotation_defaults_to_delete() {
        let rules = RuleSet::compile([(Category::Wordscan, r"(?i)viagra")]);
        assert_eq!(rules.rules(Category::Wordscan)[0].action, DEFAULT_ACTION);
    }

    #[test]
    fn test_annotation_does_not_change_what_matches() {
        let rules = RuleSet::compile([
            (Category::Wordscan, r"(?#keep)^offer$"),
            (Category::Wordscan, r"^offer$"),
        ]);
        let [annotated, plain] = rules.rules(Category::Wordscan) else {
            panic!("expected two rules");
        };
        for probe in ["offer", "(?#keep)offer", "special offer"] {
            assert_eq!(annotated.is_match(probe), plain.is_match(probe), "{probe}");
        }
    }

    #[test]
    fn test_non_word_comment_keeps_default_action() {
        let rules = RuleSet::compile([(Category::Wordscan, r"(?#two words)lottery")]);
        let rule = &rules.rules(Category::Wordscan)[0];
        assert_eq!(rule.action, DEFAULT_ACTION);
        assert!(rule.is_match("you won the lottery"));
    }

    #[test]
    fn test_comment_inside_pattern_is_ignored() {
        let rules = RuleSet::compile([
            (Category::Wordscan, r"(?#flag)viagra(?#drug)"),
            (Category::Wordscan, r"cheap(?#adjective) pills"),
        ]);
        assert!(rules.skipped().is_empty());
        let [first, second] = rules.rules(Category::Wordscan) else {
            panic!("expected two rules");
        };
        assert_eq!(first.action, "flag");
        assert!(first.is_match("buy viagra now"));
        assert_eq!(second.action, DEFAULT_ACTION);
        assert!(second.is_match("cheap pills"));
    }

    #[test]
    fn test_comment_syntax_in_class_or_escape_is_literal() {
        assert_eq!(strip_comments(r"[(?#)]x"), r"[(?#)]x");
        assert_eq!(strip_comments(r"\(?#)"), r"\(?#)");
        assert_eq!(strip_comments(r"[]](?#c)y"), r"[]]y");
        assert_eq!(strip_comments(r"a(?#unterminated"), r"a(?#unterminated");

        let rules = RuleSet::compile([(Category::Wordscan, r"a(?#unterminated")]);
        assert_eq!(rules.skipped().len(), 1);
    }

    #[test]
    fn test_bad_pattern_does_not_disable_siblings() {
        let rules = RuleSet::compile([
            (Category::Wordscan, "first"),
            (Category::Wordscan, "(unclosed"),
            (Category::Wordscan, "third"),
            (Category::Headers, "[z-a]"),
        ]);
        let names: Vec<_> = rules
            .rules(Category::Wordscan)
            .iter()
            .map(|r| r.pattern.as_str())
            .collect();
        assert_eq!(names, vec!["first", "third"]);
        assert!(rules.rules(Category::Headers).is_empty());
        assert_eq!(rules.skipped().len(), 2);
        assert_eq!(rules.skipped()[0].pattern, "(unclosed");
        assert_eq!(rules.skipped()[1].category, Category::Headers);
    }

    #[test]
    fn test_from_sources_keeps_declaration_order() {
        let sources = RuleSources {
            ipfromto: vec!["b".to_string(), "a".to_string()],
            headers: vec![],
            wordscan: vec!["(?#x)z".to_string()],
        };
        let rules = RuleSet::from_sources(&sources);
        let order: Vec<_> = rules
            .rules(Category::IpFromTo)
            .iter()
            .map(|r| r.pattern.as_str())
            .collect();
        assert_eq!(order, vec!["b", "a"]);
        assert_eq!(rules.rules(Category::Wordscan)[0].action, "x");
    }

    #[test]
    fn test_policy_falls_back_to_default() {
        let policy = DomainPolicy::new()
            .with_domain("default", vec![Category::Wordscan])
            .with_domain("Example.COM", vec![Category::Headers, Category::IpFromTo]);

        assert_eq!(
            policy.categories_for("example.com"),
            &[Category::Headers, Category::IpFromTo]
        );
        assert_eq!(policy.categories_for("other.org"), &[Category::Wordscan]);
    }

    #[test]
    fn test_policy_without_default_runs_nothing() {
        let policy = DomainPolicy::new().with_domain("example.com", vec![Category::Headers]);
        assert!(policy.categories_for("other.org").is_empty());
    }

    #[test]
    fn test_policy_from_config_skips_unknown_categories() {
        let mut domains = BTreeMap::new();
        domains.insert(
            "default".to_string(),
            CategoryList::Joined("headers, bayes, WORDSCAN".to_string()),
        );
        let policy = DomainPolicy::from_config(&domains);
        assert_eq!(
            policy.categories_for("default"),
            &[Category::Headers, Category::Wordscan]
        );
    }
}
