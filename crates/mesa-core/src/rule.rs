//! Capability flags advertised to clients.

use crate::config::ServerConfig;
use serde::{Deserialize, Serialize};

/// A capability flag derived from server configuration and enforced client-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Rule {
    /// Client and server must run the same protocol version.
    EnforceEqualVersions,
    /// Both sides keep sent/received history.
    StoreMessages,
    /// The authentication result echoes the identity data back.
    SendsUserObject,
}

/// The set of rules in force for a deployment, in canonical order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rules(Vec<Rule>);

impl Rules {
    pub fn derive(config: &ServerConfig) -> Self {
        let flags = [
            (Rule::EnforceEqualVersions, config.client.enforce_equal_versions),
            (Rule::StoreMessages, config.store_messages),
            (
                Rule::SendsUserObject,
                config.authentication.send_identity_data_on_ack,
            ),
        ];
        Self(
            flags
                .into_iter()
                .filter_map(|(rule, on)| on.then_some(rule))
                .collect(),
        )
    }

    pub fn contains(&self, rule: Rule) -> bool {
        self.0.contains(&rule)
    }

    pub fn iter(&self) -> impl Iterator<Item = Rule> + '_ {
        self.0.iter().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<Rule> for Rules {
    fn from_iter<T: IntoIterator<Item = Rule>>(iter: T) -> Self {
        let mut rules: Vec<Rule> = iter.into_iter().collect();
        rules.sort();
        rules.dedup();
        Self(rules)
    }
}
