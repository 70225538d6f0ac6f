//! Offline replay of saved records, for checking rule changes against mail
//! that was already seen.

use crate::filter::{FilterEngine, Verdict};
use crate::record::{ConnectionInfo, MailRecord};
use anyhow::{bail, Context};
use std::path::Path;

/// Load a saved record. Files ending in `.var` use the legacy key-value
/// format; anything else is read as a JSON record.
pub fn load_record(path: &Path) -> anyhow::Result<MailRecord> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    if path.extension().is_some_and(|ext| ext == "var") {
        parse_legacy(&content).with_context(|| format!("Malformed legacy record {}", path.display()))
    } else {
        serde_json::from_str(&content)
            .with_context(|| format!("Malformed JSON record {}", path.display()))
    }
}

/// Parse the legacy flat `key: value` format.
///
/// ```text
/// id: 1234
/// ip: 192.0.2.1
/// helo: client.example.org
/// dns: client.example.org
/// from: <alice@example.org>
/// to: <bob@example.com>
/// subject: Hello
/// header.X-Mailer: Foo 1.0
/// ```
pub fn parse_legacy(content: &str) -> anyhow::Result<MailRecord> {
    let mut id = None;
    let mut record = MailRecord::new(0, ConnectionInfo::default());

    for (number, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            bail!("line {}: expected 'key: value', got '{line}'", number + 1);
        };
        let value = value.trim().to_string();

        match key.trim() {
            "id" => {
                let parsed = value
                    .parse::<u64>()
                    .with_context(|| format!("line {}: invalid id '{value}'", number + 1))?;
                id = Some(parsed);
            }
            "ip" => record.connection.ip = value,
            "helo" => record.connection.helo = value,
            "dns" => record.connection.dns = value,
            "from" => record.sender = Some(value),
            "to" => record.recipients.push(value),
            "subject" => record.add_header("Subject".to_string(), value),
            key => match key.strip_prefix("header.") {
                Some(name) if !name.is_empty() => record.add_header(name.to_string(), value),
                _ => log::warn!("line {}: ignoring unknown key '{key}'", number + 1),
            },
        }
    }

    record.id = id.context("record has no id")?;
    Ok(record)
}

/// Re-run the filter against a saved record. Earlier results in the record
/// are replaced, so replaying twice gives the same answer.
pub fn replay(engine: &FilterEngine, record: &mut MailRecord) -> Verdict {
    log::debug!("[{}] replaying record", record.id);
    engine.evaluate(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::REJECT_REPLY;
    use crate::rules::{Category, DomainPolicy, RuleSet};
    use crate::sink::{JsonDirSink, RecordSink};

    fn engine() -> FilterEngine {
        FilterEngine::new(
            RuleSet::compile([
                (Category::Headers, "(?#flag)^X-Mailer:.*Bulk"),
                (Category::Wordscan, "(?i)viagra"),
            ]),
            DomainPolicy::new().with_domain("default", vec![Category::Headers, Category::Wordscan]),
        )
    }

    #[test]
    fn test_parse_legacy() {
        let record = parse_legacy(
            "# saved by an older version\n\
             id: 17\n\
             ip: 192.0.2.1\n\
             dns: mx.example.org\n\
             from: <alice@example.org>\n\
             to: <bob@example.com>\n\
             to: <carol@example.com>\n\
             subject: Hello: again\n\
             header.X-Mailer: Bulk 2.0\n\
             \n\
             colour: blue\n",
        )
        .unwrap();

        assert_eq!(record.id, 17);
        assert_eq!(record.connection.ip, "192.0.2.1");
        assert_eq!(record.connection.dns, "mx.example.org");
        assert_eq!(record.sender.as_deref(), Some("<alice@example.org>"));
        assert_eq!(record.recipients.len(), 2);
        assert_eq!(record.subject.as_deref(), Some("Hello: again"));
        assert_eq!(record.headers.get("X-Mailer"), Some("Bulk 2.0"));
    }

    #[test]
    fn test_parse_legacy_errors() {
        assert!(parse_legacy("ip: 192.0.2.1\n").is_err());
        assert!(parse_legacy("id: twelve\n").is_err());
        assert!(parse_legacy("id: 1\nthis line has no separator\n").is_err());
    }

    #[test]
    fn test_replay_legacy_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000003.var");
        std::fs::write(&path, "id: 3\nto: bob@example.com\nsubject: viagra deals\n").unwrap();

        let mut record = load_record(&path).unwrap();
        let verdict = replay(&engine(), &mut record);
        assert_eq!(
            verdict,
            Verdict::Reject {
                actions: vec!["delete".to_string()],
                reply: REJECT_REPLY.to_string(),
            }
        );
    }

    #[test]
    fn test_replay_saved_json_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonDirSink::new(dir.path());

        let mut original = MailRecord::new(9, ConnectionInfo::default());
        original.recipients.push("bob@example.com".to_string());
        original.add_header("X-Mailer".to_string(), "Bulk 2.0".to_string());
        original.add_header("Subject".to_string(), "Minutes".to_string());
        let engine = engine();
        engine.evaluate(&mut original);
        sink.store(&original).unwrap();

        let mut record = load_record(&sink.path_for(9)).unwrap();
        assert_eq!(record, original);

        let first = replay(&engine, &mut record);
        let after_first = record.clone();
        let second = replay(&engine, &mut record);
        assert_eq!(first, second);
        assert_eq!(after_first, record);
        assert_eq!(first, Verdict::Accept { actions: vec!["flag".to_string()] });
    }

    #[test]
    fn test_malformed_json_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("00000001");
        std::fs::write(&path, "{\"id\": 1, \"header\": ").unwrap();
        assert!(load_record(&path).is_err());
        assert!(load_record(&dir.path().join("missing")).is_err());
    }
}
