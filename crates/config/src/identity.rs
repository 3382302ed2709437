//! Client identification configuration.
//!
//! Describes where the gateway should read a caller's identity and plan tag
//! from, on the wire. Authentication itself (verifying the caller is who the
//! header claims) is the surrounding system's job; this crate only records
//! where to look.

use serde::Deserialize;

/// Where to read a piece of client identity from an incoming request.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IdentificationSource {
    /// HTTP header name to read the value from (e.g. "X-Client-Id").
    pub header: String,
}

/// Client identification extraction configuration.
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default, deny_unknown_fields)]
pub struct IdentificationConfig {
    /// Whether client identification is enabled. When disabled, every
    /// caller is identified by its remote IP and the `free` plan.
    pub enabled: bool,

    /// Source for the user key.
    pub user_id: Option<IdentificationSource>,

    /// Source for the plan tag. Missing or empty falls back to `free`.
    pub plan: Option<IdentificationSource>,

    /// Plans that are recognized; an unrecognized plan tag falls back to
    /// `free` rather than failing the request.
    #[serde(default)]
    pub known_plans: Vec<String>,
}

/// The default plan assigned when identification is disabled, missing, or
/// reports a plan outside of `known_plans`.
pub const DEFAULT_PLAN: &str = "free";

/// The identity resolved for one request: who is calling, and under which
/// plan their budgets are evaluated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Identity {
    /// Caller identifier, already normalized for use in storage keys.
    pub user_key: String,
    /// Plan tag, always one of `known_plans` or [`DEFAULT_PLAN`].
    pub plan: String,
}

impl Identity {
    /// Build an identity, falling back to [`DEFAULT_PLAN`] for an empty plan.
    pub fn new(user_key: impl Into<String>, plan: impl Into<String>) -> Self {
        let plan = plan.into();

        Self {
            user_key: user_key.into(),
            plan: if plan.is_empty() { DEFAULT_PLAN.to_string() } else { plan },
        }
    }
}

#[cfg(test)]
mod tests {
    use indoc::indoc;
    use insta::assert_debug_snapshot;

    use crate::Config;

    #[test]
    fn identification_config() {
        let config = indoc! {r#"
            [identification]
            enabled = true
            user_id.header = "X-Client-Id"
            plan.header = "X-Plan"
            known_plans = ["free", "pro", "enterprise"]
        "#};

        let config: Config = toml::from_str(config).unwrap();

        assert_debug_snapshot!(&config.identification, @r#"
        IdentificationConfig {
            enabled: true,
            user_id: Some(
                IdentificationSource {
                    header: "X-Client-Id",
                },
            ),
            plan: Some(
                IdentificationSource {
                    header: "X-Plan",
                },
            ),
            known_plans: [
                "free",
                "pro",
                "enterprise",
            ],
        }
        "#);
    }
}
