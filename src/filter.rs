use crate::config::Config;
use crate::record::MailRecord;
use crate::rules::{Category, DomainPolicy, Rule, RuleSet, DEFAULT_ACTION};

/// SMTP reply sent whenever a rule resolves to the `delete` action.
pub const REJECT_REPLY: &str = "550 5.7.1 Message rejected as spam";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Accept { actions: Vec<String> },
    Reject { actions: Vec<String>, reply: String },
}

impl Verdict {
    pub fn actions(&self) -> &[String] {
        match self {
            Verdict::Accept { actions } | Verdict::Reject { actions, .. } => actions,
        }
    }

    pub fn is_reject(&self) -> bool {
        matches!(self, Verdict::Reject { .. })
    }
}

/// What a single category produced: the action of its first matching rule,
/// and the reply to reject with when that action is `delete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CategoryOutcome {
    pub action: String,
    pub reply: Option<&'static str>,
}

impl CategoryOutcome {
    fn from_action(action: &str) -> Self {
        CategoryOutcome {
            action: action.to_string(),
            reply: (action == DEFAULT_ACTION).then_some(REJECT_REPLY),
        }
    }
}

/// Immutable rules and policy shared by every session.
pub struct FilterEngine {
    rules: RuleSet,
    policy: DomainPolicy,
}

impl FilterEngine {
    pub fn new(rules: RuleSet, policy: DomainPolicy) -> Self {
        FilterEngine { rules, policy }
    }

    pub fn from_config(config: &Config) -> Self {
        let rules = RuleSet::from_sources(&config.rules);
        let policy = DomainPolicy::from_config(&config.domains);
        for category in Category::ALL {
            log::info!(
                "Loaded {} [{category}] rules",
                rules.rules(category).len()
            );
        }
        if !rules.skipped().is_empty() {
            log::warn!("{} rules skipped due to invalid patterns", rules.skipped().len());
        }
        Self::new(rules, policy)
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    pub fn policy(&self) -> &DomainPolicy {
        &self.policy
    }

    /// Run the categories configured for the record's recipient domain.
    ///
    /// Any result and action list from an earlier run is discarded first,
    /// so evaluating the same record twice gives the same outcome.
    pub fn evaluate(&self, record: &mut MailRecord) -> Verdict {
        record.clear_decision();

        let domain = record.recipient_domain();
        let categories = self.policy.categories_for(&domain);
        log::debug!(
            "[{}] domain '{domain}' runs {:?}",
            record.id,
            categories.iter().map(|c| c.as_str()).collect::<Vec<_>>()
        );

        let mut actions = Vec::new();
        for &category in categories {
            let Some(outcome) = self.evaluate_category(category, record) else {
                continue;
            };
            actions.push(outcome.action);
            if let Some(reply) = outcome.reply {
                log::debug!("[{}] rejected by [{category}]", record.id);
                return Verdict::Reject {
                    actions,
                    reply: reply.to_string(),
                };
            }
        }

        log::debug!("[{}] accepted with actions {:?}", record.id, actions);
        Verdict::Accept { actions }
    }

    pub fn evaluate_category(
        &self,
        category: Category,
        record: &mut MailRecord,
    ) -> Option<CategoryOutcome> {
        let rules = self.rules.rules(category);
        match category {
            Category::IpFromTo => check_ipfromto(rules, record),
            Category::Headers => check_headers(rules, record),
            Category::Wordscan => check_wordscan(rules, record),
        }
    }
}

fn first_match<'r>(rules: &'r [Rule], probe: &str) -> Option<&'r Rule> {
    rules.iter().find(|rule| rule.is_match(probe))
}

fn hit(
    category: Category,
    rule: &Rule,
    matched: String,
    record: &mut MailRecord,
) -> Option<CategoryOutcome> {
    log::debug!(
        "[{}] [{category}] '{}' matched '{matched}' -> {}",
        record.id,
        rule.pattern.as_str(),
        rule.action
    );
    record.record_hit(category, &rule.action, matched);
    Some(CategoryOutcome::from_action(&rule.action))
}

/// Probe: `"<dns>:<sender>"`.
fn check_ipfromto(rules: &[Rule], record: &mut MailRecord) -> Option<CategoryOutcome> {
    let probe = format!("{}:{}", record.connection.dns, record.sender_address());
    let recipient = record.recipient_address().to_string();
    record.ipfromto.insert(recipient, vec![probe.clone()]);

    let rule = first_match(rules, &probe)?;
    hit(Category::IpFromTo, rule, probe, record)
}

/// Probe: `"<name>:<value>"` for each header in record order. The first
/// header that matches any rule ends the category.
fn check_headers(rules: &[Rule], record: &mut MailRecord) -> Option<CategoryOutcome> {
    let (rule, probe) = record.headers.iter().find_map(|(name, value)| {
        let probe = format!("{name}:{value}");
        first_match(rules, &probe).map(|rule| (rule, probe))
    })?;
    hit(Category::Headers, rule, probe, record)
}

/// Probe: the subject, or an empty string when there is none.
fn check_wordscan(rules: &[Rule], record: &mut MailRecord) -> Option<CategoryOutcome> {
    let subject = record.subject.clone().unwrap_or_default();
    let rule = first_match(rules, &subject)?;
    hit(Category::Wordscan, rule, subject, record)
}
