//! The per-session mail record and its on-disk JSON layout.

use crate::rules::{Category, DEFAULT_DOMAIN};
use serde::de::{MapAccess, Visitor};
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionInfo {
    pub ip: String,
    pub helo: String,
    pub dns: String,
}

/// `[action, matched text]` recorded for a category that matched.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleHit(pub String, pub String);

impl RuleHit {
    pub fn action(&self) -> &str {
        &self.0
    }

    pub fn matched(&self) -> &str {
        &self.1
    }
}

/// Header name -> value in arrival order. Inserting a name that is already
/// present replaces its value in place, so repeated headers keep only the
/// last value.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderMap(Vec<(String, String)>);

impl HeaderMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: String, value: String) {
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Serialize for HeaderMap {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for HeaderMap {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct HeaderMapVisitor;

        impl<'de> Visitor<'de> for HeaderMapVisitor {
            type Value = HeaderMap;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a map of header names to values")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> Result<HeaderMap, A::Error> {
                let mut headers = HeaderMap::new();
                while let Some((name, value)) = access.next_entry::<String, String>()? {
                    headers.insert(name, value);
                }
                Ok(headers)
            }
        }

        deserializer.deserialize_map(HeaderMapVisitor)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailRecord {
    pub id: u64,
    #[serde(rename = "received", with = "received")]
    pub connection: ConnectionInfo,
    #[serde(rename = "from", default, with = "sender_slot")]
    pub sender: Option<String>,
    #[serde(rename = "to", default)]
    pub recipients: Vec<String>,
    #[serde(rename = "header", default)]
    pub headers: HeaderMap,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    /// Probe strings tested by the ipfromto category, keyed by recipient.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub ipfromto: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub result: BTreeMap<Category, RuleHit>,
    #[serde(rename = "action", default)]
    pub actions: Vec<String>,
}

impl MailRecord {
    pub fn new(id: u64, connection: ConnectionInfo) -> Self {
        MailRecord {
            id,
            connection,
            ..Default::default()
        }
    }

    pub fn add_header(&mut self, name: String, value: String) {
        if name.eq_ignore_ascii_case("subject") {
            self.subject = Some(value.clone());
        }
        self.headers.insert(name, value);
    }

    /// Envelope sender, or an empty string when none was recorded.
    pub fn sender_address(&self) -> &str {
        self.sender.as_deref().unwrap_or("")
    }

    /// First envelope recipient, or an empty string when none was recorded.
    pub fn recipient_address(&self) -> &str {
        self.recipients.first().map(String::as_str).unwrap_or("")
    }

    /// Lower-cased host part of the first recipient, or `default`.
    pub fn recipient_domain(&self) -> String {
        self.recipients
            .first()
            .and_then(|rcpt| domain_of(rcpt))
            .unwrap_or_else(|| DEFAULT_DOMAIN.to_string())
    }

    /// Forget the output of any earlier decision so it can be made again.
    pub fn clear_decision(&mut self) {
        self.ipfromto.clear();
        self.result.clear();
        self.actions.clear();
    }

    pub(crate) fn record_hit(&mut self, category: Category, action: &str, matched: String) {
        self.result
            .insert(category, RuleHit(action.to_string(), matched));
        self.actions.push(action.to_string());
    }
}

fn domain_of(address: &str) -> Option<String> {
    let address = address.trim().trim_start_matches('<').trim_end_matches('>');
    let (_, host) = address.rsplit_once('@')?;
    if host.is_empty() {
        return None;
    }
    Some(host.to_lowercase())
}

/// Connection info is stored as `{"1": {...}}`, one entry per receiving hop.
mod received {
    use super::ConnectionInfo;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::collections::BTreeMap;

    pub fn serialize<S: Serializer>(info: &ConnectionInfo, serializer: S) -> Result<S::Ok, S::Error> {
        let mut hops = BTreeMap::new();
        hops.insert("1", info);
        hops.serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<ConnectionInfo, D::Error> {
        let mut hops = BTreeMap::<String, ConnectionInfo>::deserialize(deserializer)?;
        hops.remove("1")
            .ok_or_else(|| D::Error::custom("received has no entry \"1\""))
    }
}

/// The envelope sender is stored as a one-element list.
mod sender_slot {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(sender: &Option<String>, serializer: S) -> Result<S::Ok, S::Error> {
        match sender {
            Some(sender) => [sender].serialize(serializer),
            None => Vec::<String>::new().serialize(serializer),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
        let senders = Vec::<String>::deserialize(deserializer)?;
        Ok(senders.into_iter().next())
    }
}
