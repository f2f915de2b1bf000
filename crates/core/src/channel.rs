//! Channel classification of session properties.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::properties::{display_value, keys, PropertiesMap};

/// Value matching an absent or empty property.
pub const NONE_VALUE: &str = "$none";

/// Channel used when no rule matches.
pub const FALLBACK_CHANNEL: &str = "Others";

/// Assigns a marketing channel label to a session.
pub trait ChannelClassifier: Send + Sync {
    fn classify(&self, project_id: &str, session_properties: &PropertiesMap) -> Result<String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Equals,
    NotEquals,
    Contains,
    NotContains,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalOp {
    #[default]
    And,
    Or,
}

/// One comparison against a session property.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelCondition {
    pub property: String,
    pub condition: ConditionOp,
    pub value: String,
    /// How this condition joins the previous one on the same property
    #[serde(default)]
    pub logical_op: LogicalOp,
}

impl ChannelCondition {
    pub fn new(property: &str, condition: ConditionOp, value: &str) -> Self {
        Self {
            property: property.to_string(),
            condition,
            value: value.to_string(),
            logical_op: LogicalOp::And,
        }
    }

    pub fn or(mut self) -> Self {
        self.logical_op = LogicalOp::Or;
        self
    }

    fn matches(&self, properties: &PropertiesMap) -> bool {
        let actual = properties
            .get(&self.property)
            .map(display_value)
            .unwrap_or_default()
            .to_lowercase();
        let expected = self.value.to_lowercase();
        let is_none = expected == NONE_VALUE;

        let equals = if is_none {
            actual.is_empty() || actual == NONE_VALUE
        } else {
            actual == expected
        };

        match self.condition {
            ConditionOp::Equals => equals,
            ConditionOp::NotEquals => !equals,
            ConditionOp::Contains => actual.contains(&expected),
            ConditionOp::NotContains => !actual.contains(&expected),
        }
    }
}

/// A channel and the conditions a session must satisfy to belong to it.
///
/// Conditions on the same property are combined left to right by their
/// logical operator; the per-property results are then ANDed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRule {
    pub channel: String,
    pub conditions: Vec<ChannelCondition>,
}

impl ChannelRule {
    pub fn new(channel: &str, conditions: Vec<ChannelCondition>) -> Self {
        Self {
            channel: channel.to_string(),
            conditions,
        }
    }

    pub fn matches(&self, properties: &PropertiesMap) -> bool {
        let mut groups: Vec<(&str, bool)> = Vec::new();
        for condition in &self.conditions {
            let matched = condition.matches(properties);
            match groups.iter_mut().find(|(p, _)| *p == condition.property) {
                Some((_, result)) => {
                    *result = match condition.logical_op {
                        LogicalOp::And => *result && matched,
                        LogicalOp::Or => *result || matched,
                    };
                }
                None => groups.push((condition.property.as_str(), matched)),
            }
        }
        groups.iter().all(|(_, result)| *result)
    }
}

/// Ordered rule classifier. The first matching rule wins.
#[derive(Debug, Clone)]
pub struct RuleChannelClassifier {
    rules: Vec<ChannelRule>,
    project_rules: HashMap<String, Vec<ChannelRule>>,
}

impl Default for RuleChannelClassifier {
    fn default() -> Self {
        Self::new(default_channel_rules())
    }
}

impl RuleChannelClassifier {
    pub fn new(rules: Vec<ChannelRule>) -> Self {
        Self {
            rules,
            project_rules: HashMap::new(),
        }
    }

    /// Replaces the rules for one project.
    pub fn with_project_rules(mut self, project_id: impl Into<String>, rules: Vec<ChannelRule>) -> Self {
        self.project_rules.insert(project_id.into(), rules);
        self
    }

    fn rules_for(&self, project_id: &str) -> &[ChannelRule] {
        self.project_rules
            .get(project_id)
            .map(Vec::as_slice)
            .unwrap_or(&self.rules)
    }
}

impl ChannelClassifier for RuleChannelClassifier {
    fn classify(&self, project_id: &str, session_properties: &PropertiesMap) -> Result<String> {
        let rules = self.rules_for(project_id);
        if rules.is_empty() {
            return Err(Error::classification(format!(
                "no channel rules configured for project {}",
                project_id
            )));
        }

        Ok(rules
            .iter()
            .find(|rule| rule.matches(session_properties))
            .map(|rule| rule.channel.clone())
            .unwrap_or_else(|| FALLBACK_CHANNEL.to_string()))
    }
}

const SEARCH_ENGINES: [&str; 6] = ["google.", "bing.", "duckduckgo.", "yahoo.", "yandex.", "baidu."];
const PAID_MEDIUMS: [&str; 4] = ["paid", "cpc", "ppc", "cpm"];

fn any_of(property: &str, op: ConditionOp, values: &[&str]) -> Vec<ChannelCondition> {
    values
        .iter()
        .enumerate()
        .map(|(i, value)| {
            let condition = ChannelCondition::new(property, op, value);
            if i == 0 {
                condition
            } else {
                condition.or()
            }
        })
        .collect()
}

fn none(property: &str) -> ChannelCondition {
    ChannelCondition::new(property, ConditionOp::Equals, NONE_VALUE)
}

fn some(property: &str) -> ChannelCondition {
    ChannelCondition::new(property, ConditionOp::NotEquals, NONE_VALUE)
}

fn eq(property: &str, value: &str) -> ChannelCondition {
    ChannelCondition::new(property, ConditionOp::Equals, value)
}

/// Built-in channel grouping.
pub fn default_channel_rules() -> Vec<ChannelRule> {
    use ConditionOp::*;

    let referrer = keys::INITIAL_REFERRER_DOMAIN;
    let social_domains = [
        "facebook.", "linkedin.", "quora.", "pinterest.", "twitter.", "snapchat.", "instagram.",
    ];
    let organic_social_domains = [
        "facebook.", "linkedin.", "quora.", "pinterest.", "twitter.", "snapchat.", "youtube.", "instagram.",
    ];

    vec![
        ChannelRule::new(
            "Direct",
            vec![
                none(keys::SOURCE),
                none(keys::MEDIUM),
                none(keys::INITIAL_REFERRER),
                none(referrer),
                none(keys::GCLID),
                none(keys::FBCLID),
                none(keys::CAMPAIGN),
            ],
        ),
        ChannelRule::new("Paid Search", vec![some(keys::GCLID)]),
        ChannelRule::new(
            "Paid Search",
            [
                any_of(keys::SOURCE, Equals, &["google", "bing", "adwords", "youtube"]),
                any_of(keys::MEDIUM, Equals, &["paid", "cpc", "ppc", "adwords", "display", "cpm"]),
            ]
            .concat(),
        ),
        ChannelRule::new(
            "Paid Search",
            [any_of(referrer, Contains, &SEARCH_ENGINES), vec![some(keys::CAMPAIGN)]].concat(),
        ),
        ChannelRule::new("Paid Social", vec![some(keys::FBCLID)]),
        ChannelRule::new(
            "Paid Social",
            [
                any_of(
                    keys::SOURCE,
                    Equals,
                    &["facebook", "fb", "linkedin", "twitter", "quora", "pinterest", "snapchat", "instagram"],
                ),
                any_of(keys::MEDIUM, Equals, &PAID_MEDIUMS),
            ]
            .concat(),
        ),
        ChannelRule::new("Paid Social", vec![eq(keys::SOURCE, "paidsocial")]),
        ChannelRule::new("Paid Social", vec![eq(keys::MEDIUM, "paidsocial")]),
        ChannelRule::new(
            "Paid Social",
            [
                any_of(keys::MEDIUM, Equals, &PAID_MEDIUMS),
                any_of(referrer, Contains, &social_domains),
            ]
            .concat(),
        ),
        ChannelRule::new(
            "Organic Social",
            [
                vec![none(keys::FBCLID)],
                any_of(keys::MEDIUM, NotEquals, &PAID_MEDIUMS),
                any_of(referrer, Contains, &organic_social_domains),
            ]
            .concat(),
        ),
        ChannelRule::new(
            "Organic Search",
            [
                vec![
                    none(keys::GCLID),
                    none(keys::FBCLID),
                    none(keys::SOURCE),
                    none(keys::MEDIUM),
                    none(keys::CAMPAIGN),
                ],
                any_of(referrer, Contains, &SEARCH_ENGINES),
            ]
            .concat(),
        ),
        ChannelRule::new("Email", vec![eq(keys::SOURCE, "email")]),
        ChannelRule::new("Email", vec![eq(keys::MEDIUM, "email")]),
        ChannelRule::new("Affiliate", vec![eq(keys::SOURCE, "affiliate")]),
        ChannelRule::new("Affiliate", vec![eq(keys::MEDIUM, "affiliate")]),
        ChannelRule::new("Other Campaigns", vec![some(keys::CAMPAIGN)]),
        ChannelRule::new("Referral", vec![some(referrer)]),
    ]
}
