//! Credentials and regional routing.
//!
//! A [`Credentials`] bundle is resolved once per workspace and never
//! mutated. The shared secret is redacted from `Debug` and `Display`
//! renderings and skipped during serialization; no code path in this crate
//! writes it to a log line or error message.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MixpanelError, Result};

/// Environment variable carrying the service-account username.
pub const ENV_USERNAME: &str = "MP_USERNAME";
/// Environment variable carrying the service-account secret.
pub const ENV_SECRET: &str = "MP_SECRET";
/// Environment variable carrying the numeric project id.
pub const ENV_PROJECT_ID: &str = "MP_PROJECT_ID";
/// Environment variable carrying the region code (`US`, `EU`, or `IN`).
pub const ENV_REGION: &str = "MP_REGION";

/// Placeholder substituted for the secret in human-readable renderings.
const SECRET_PLACEHOLDER: &str = "********";

/// Mixpanel data-residency region.
///
/// Selects the base URLs for the query API and the raw-export host. The
/// mapping is total: every region has both URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Region {
    /// United States (default).
    #[default]
    Us,
    /// European Union.
    Eu,
    /// India.
    In,
}

impl Region {
    /// Base URL for the query API (`/query/...` endpoints).
    pub fn api_base(&self) -> &'static str {
        match self {
            Region::Us => "https://mixpanel.com/api",
            Region::Eu => "https://eu.mixpanel.com/api",
            Region::In => "https://in.mixpanel.com/api",
        }
    }

    /// Base URL for the raw event export host (`/export`).
    pub fn export_base(&self) -> &'static str {
        match self {
            Region::Us => "https://data.mixpanel.com/api/2.0",
            Region::Eu => "https://data-eu.mixpanel.com/api/2.0",
            Region::In => "https://data-in.mixpanel.com/api/2.0",
        }
    }
}

impl FromStr for Region {
    type Err = MixpanelError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "US" => Ok(Region::Us),
            "EU" => Ok(Region::Eu),
            "IN" => Ok(Region::In),
            other => Err(MixpanelError::config(format!(
                "unknown region '{}', expected US, EU, or IN",
                other
            ))),
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Region::Us => "US",
            Region::Eu => "EU",
            Region::In => "IN",
        };
        f.write_str(name)
    }
}

/// Immutable authentication material for one Mixpanel project.
///
/// Constructed once per [`Workspace`](crate::Workspace). The secret never
/// appears in `Debug`, `Display`, or serialized output.
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Service-account username (HTTP basic-auth username).
    pub username: String,
    /// Service-account secret (HTTP basic-auth password). Redacted on
    /// display; skipped during serialization.
    #[serde(skip_serializing, default)]
    pub secret: String,
    /// Numeric project identifier, sent as `project_id` on every query.
    pub project_id: String,
    /// Data-residency region.
    pub region: Region,
}

impl Credentials {
    pub fn new(
        username: impl Into<String>,
        secret: impl Into<String>,
        project_id: impl Into<String>,
        region: Region,
    ) -> Self {
        Self {
            username: username.into(),
            secret: secret.into(),
            project_id: project_id.into(),
            region,
        }
    }

    /// Read credentials from the `MP_*` environment variables.
    ///
    /// Returns `Ok(Some(..))` when all four variables are present,
    /// `Ok(None)` when none are set, and an error when only some are set
    /// (a partial environment is almost always a misconfiguration).
    pub fn from_env() -> Result<Option<Self>> {
        let vars = [ENV_USERNAME, ENV_SECRET, ENV_PROJECT_ID, ENV_REGION];
        let values: Vec<Option<String>> = vars
            .iter()
            .map(|v| std::env::var(v).ok().filter(|s| !s.is_empty()))
            .collect();

        let present = values.iter().filter(|v| v.is_some()).count();
        if present == 0 {
            return Ok(None);
        }
        if present < vars.len() {
            let missing: Vec<&str> = vars
                .iter()
                .zip(&values)
                .filter(|(_, v)| v.is_none())
                .map(|(name, _)| *name)
                .collect();
            return Err(MixpanelError::config(format!(
                "incomplete credentials in environment, missing {}",
                missing.join(", ")
            )));
        }

        let mut values = values.into_iter().flatten();
        let username = values.next().unwrap_or_default();
        let secret = values.next().unwrap_or_default();
        let project_id = values.next().unwrap_or_default();
        let region: Region = values.next().unwrap_or_default().parse()?;

        Ok(Some(Self::new(username, secret, project_id, region)))
    }

    /// Resolve effective credentials: the environment overrides an explicit
    /// bundle when fully present; otherwise the explicit bundle is used;
    /// with neither, construction fails.
    pub fn resolve(explicit: Option<Credentials>) -> Result<Self> {
        if let Some(from_env) = Self::from_env()? {
            return Ok(from_env);
        }
        explicit.ok_or_else(|| {
            MixpanelError::config(format!(
                "no credentials: pass them explicitly or set {}, {}, {}, {}",
                ENV_USERNAME, ENV_SECRET, ENV_PROJECT_ID, ENV_REGION
            ))
        })
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("secret", &SECRET_PLACEHOLDER)
            .field("project_id", &self.project_id)
            .field("region", &self.region)
            .finish()
    }
}

impl fmt::Display for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} @ project {} ({})",
            self.username, self.project_id, self.region
        )
    }
}
