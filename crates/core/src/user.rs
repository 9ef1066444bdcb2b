//! Account and rate-limit-override domain types, backing the `users` table.

use serde::{Deserialize, Serialize};

/// Per-user overrides of the process-wide rate-limit defaults. Any field left
/// `None` falls through to the matching `RateLimitDefaults` value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimits {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_rate_limit_minute: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_rate_limit_hour: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_rate_limit_day: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_rate_limit: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_rate_limit_minute: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_rate_limit_hour: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_rate_limit_day: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search_rate_limit: Option<i64>,
}

/// Process-wide fallback limits, sourced from `AppConfig`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitDefaults {
    pub minute: i64,
    pub hour: i64,
    pub day: i64,
    pub forever: i64,
    pub web_search_minute: i64,
    pub web_search_hour: i64,
    pub web_search_day: i64,
}

/// Effective, fully-resolved limits for a single user: override-or-default.
#[derive(Debug, Clone, Copy)]
pub struct EffectiveRateLimits {
    pub minute: i64,
    pub hour: i64,
    pub day: i64,
    pub forever: i64,
    pub web_search_minute: i64,
    pub web_search_hour: i64,
    pub web_search_day: i64,
    /// Matches the source behavior: there is no dedicated forever limit for
    /// web search, so it falls back to the chat `forever` limit rather than
    /// a distinct default (documented in DESIGN.md as an intentional quirk
    /// preserved from the original implementation).
    pub web_search_forever: i64,
}

impl RateLimits {
    pub fn get_effective_limits(&self, defaults: RateLimitDefaults) -> EffectiveRateLimits {
        EffectiveRateLimits {
            minute: self.user_rate_limit_minute.unwrap_or(defaults.minute),
            hour: self.user_rate_limit_hour.unwrap_or(defaults.hour),
            day: self.user_rate_limit_day.unwrap_or(defaults.day),
            forever: self.user_rate_limit.unwrap_or(defaults.forever),
            web_search_minute: self
                .web_search_rate_limit_minute
                .unwrap_or(defaults.web_search_minute),
            web_search_hour: self
                .web_search_rate_limit_hour
                .unwrap_or(defaults.web_search_hour),
            web_search_day: self
                .web_search_rate_limit_day
                .unwrap_or(defaults.web_search_day),
            web_search_forever: self
                .web_search_rate_limit
                .unwrap_or(self.user_rate_limit.unwrap_or(defaults.forever)),
        }
    }
}

/// A registered account, as persisted in the `users` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: String,
    #[serde(default)]
    pub rate_limits: RateLimits,
}

impl User {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            rate_limits: RateLimits::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn defaults() -> RateLimitDefaults {
        RateLimitDefaults {
            minute: 10,
            hour: 100,
            day: 1000,
            forever: -1,
            web_search_minute: 5,
            web_search_hour: 50,
            web_search_day: 500,
        }
    }

    #[test]
    fn overrides_take_precedence_over_defaults() {
        let limits = RateLimits {
            user_rate_limit_minute: Some(3),
            ..Default::default()
        };
        let effective = limits.get_effective_limits(defaults());
        assert_eq!(effective.minute, 3);
        assert_eq!(effective.hour, 100);
    }

    #[test]
    fn web_search_forever_falls_back_to_chat_forever_not_default() {
        let limits = RateLimits {
            user_rate_limit: Some(42),
            ..Default::default()
        };
        let effective = limits.get_effective_limits(defaults());
        assert_eq!(effective.web_search_forever, 42);
    }
}
