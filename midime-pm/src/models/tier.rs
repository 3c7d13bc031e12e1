//! Tier policies
//!
//! A tier is resolved once per request into a `TierPolicy` value that is passed
//! to every component needing it (section caps in the duplicate guard, result
//! caps in the ranker). Changing a tier's behavior is a data edit here or in
//! the `[tiers]` config table.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Subscription tier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Creator,
    Pro,
}

impl Tier {
    pub const ALL: [Tier; 3] = [Tier::Free, Tier::Creator, Tier::Pro];

    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Free => "free",
            Tier::Creator => "creator",
            Tier::Pro => "pro",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Tier::Free),
            "creator" => Ok(Tier::Creator),
            "pro" => Ok(Tier::Pro),
            other => Err(format!("Unknown tier: {}", other)),
        }
    }
}

/// Result-count cap applied by the ranker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultCap {
    /// Score buckets only, no pattern ids, at most N groups
    Preview(usize),
    /// At most N groups with full detail
    Limited(usize),
    Unlimited,
}

impl ResultCap {
    /// Maximum number of groups this cap allows
    pub fn max_groups(&self) -> Option<usize> {
        match self {
            ResultCap::Preview(n) | ResultCap::Limited(n) => Some(*n),
            ResultCap::Unlimited => None,
        }
    }

    pub fn is_preview(&self) -> bool {
        matches!(self, ResultCap::Preview(_))
    }
}

/// Policy bundle for one tier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TierPolicy {
    #[serde(skip)]
    pub tier: Option<Tier>,
    /// Maximum sections a user may submit per source song (None = unlimited)
    #[serde(default)]
    pub max_sections_per_song: Option<u32>,
    pub result_cap: ResultCap,
}

impl TierPolicy {
    /// Built-in policy for a tier
    pub fn builtin(tier: Tier) -> Self {
        match tier {
            Tier::Free => Self {
                tier: Some(tier),
                max_sections_per_song: Some(1),
                result_cap: ResultCap::Preview(5),
            },
            Tier::Creator => Self {
                tier: Some(tier),
                max_sections_per_song: Some(3),
                result_cap: ResultCap::Limited(25),
            },
            Tier::Pro => Self {
                tier: Some(tier),
                max_sections_per_song: None,
                result_cap: ResultCap::Unlimited,
            },
        }
    }

    /// Whether another section may be added given the existing count
    pub fn allows_another_section(&self, existing_sections: usize) -> bool {
        match self.max_sections_per_song {
            Some(max) => existing_sections < max as usize,
            None => true,
        }
    }
}

/// Tier name -> policy table, resolved once per request
#[derive(Debug, Clone, PartialEq)]
pub struct TierPolicies {
    policies: HashMap<Tier, TierPolicy>,
}

impl TierPolicies {
    /// Built-in policies with optional overrides keyed by tier name
    pub fn with_overrides(overrides: &HashMap<String, TierPolicy>) -> Result<Self, String> {
        let mut policies: HashMap<Tier, TierPolicy> = Tier::ALL
            .iter()
            .map(|tier| (*tier, TierPolicy::builtin(*tier)))
            .collect();

        for (name, policy) in overrides {
            let tier: Tier = name.parse()?;
            let mut policy = policy.clone();
            policy.tier = Some(tier);
            policies.insert(tier, policy);
        }

        Ok(Self { policies })
    }

    pub fn resolve(&self, tier: Tier) -> TierPolicy {
        self.policies
            .get(&tier)
            .cloned()
            .unwrap_or_else(|| TierPolicy::builtin(tier))
    }
}

impl Default for TierPolicies {
    fn default() -> Self {
        Self {
            policies: Tier::ALL
                .iter()
                .map(|tier| (*tier, TierPolicy::builtin(*tier)))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_section_caps() {
        let free = TierPolicy::builtin(Tier::Free);
        assert!(free.allows_another_section(0));
        assert!(!free.allows_another_section(1));

        let pro = TierPolicy::builtin(Tier::Pro);
        assert!(pro.allows_another_section(10_000));
    }

    #[test]
    fn test_overrides_replace_builtin() {
        let mut overrides = HashMap::new();
        overrides.insert(
            "creator".to_string(),
            TierPolicy {
                tier: None,
                max_sections_per_song: Some(5),
                result_cap: ResultCap::Limited(50),
            },
        );
        let policies = TierPolicies::with_overrides(&overrides).unwrap();

        let creator = policies.resolve(Tier::Creator);
        assert_eq!(creator.tier, Some(Tier::Creator));
        assert_eq!(creator.max_sections_per_song, Some(5));
        assert_eq!(creator.result_cap.max_groups(), Some(50));
        assert_eq!(policies.resolve(Tier::Free), TierPolicy::builtin(Tier::Free));
    }

    #[test]
    fn test_unknown_tier_override_fails() {
        let mut overrides = HashMap::new();
        overrides.insert("platinum".to_string(), TierPolicy::builtin(Tier::Pro));
        assert!(TierPolicies::with_overrides(&overrides).is_err());
    }

    #[test]
    fn test_result_cap_from_toml() {
        #[derive(Deserialize)]
        struct Wrapper {
            a: ResultCap,
            b: ResultCap,
        }
        let parsed: Wrapper = toml::from_str("a = { preview = 5 }\nb = \"unlimited\"").unwrap();
        assert_eq!(parsed.a, ResultCap::Preview(5));
        assert_eq!(parsed.b, ResultCap::Unlimited);
    }
}
