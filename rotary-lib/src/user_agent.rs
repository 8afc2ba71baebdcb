//! User-agent catalog used to vary the fingerprint of each identity.

use async_trait::async_trait;
use log::info;
use rand::seq::IteratorRandom;
use serde::{Deserialize, Serialize};

use crate::{ErrorKind, Result};

/// Records seen fewer times than this are considered too rare to blend in
pub const MIN_TIMES_SEEN: u64 = 1000;

/// One user-agent record as published by the catalog source
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct UserAgent {
    /// The `User-Agent` header value
    pub user_agent: String,
    /// Short code of the browser or client software
    pub software_name_code: String,
    /// How often the record was observed in the wild
    pub time_seen: u64,
    /// Major version of the software
    pub software_version: u32,
    /// Hardware class, e.g. `computer` or `mobile`
    pub hardware_type: String,
}

/// Fetches user-agent records, typically from a remote catalog
#[async_trait]
pub trait UserAgentSource: Send + Sync {
    /// Fetch every available record
    async fn fetch(&self) -> Result<Vec<UserAgent>>;
}

/// Common user agents to pick from at random
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserAgentCatalog {
    agents: Vec<UserAgent>,
}

impl UserAgentCatalog {
    /// Create a catalog, keeping only records seen at least [`MIN_TIMES_SEEN`] times
    #[must_use]
    pub fn new(agents: Vec<UserAgent>) -> Self {
        let agents = agents
            .into_iter()
            .filter(|agent| agent.time_seen >= MIN_TIMES_SEEN && !agent.user_agent.is_empty())
            .collect();
        Self { agents }
    }

    /// Fetch the records from `source` and build a catalog
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::CollaboratorUnavailable`] if the source fails
    pub async fn load(source: &dyn UserAgentSource) -> Result<Self> {
        let agents = source
            .fetch()
            .await
            .map_err(|e| ErrorKind::collaborator("user agent source", e))?;
        let fetched = agents.len();
        let catalog = Self::new(agents);
        info!(
            "Loaded {} of {fetched} user agents from catalog",
            catalog.len()
        );
        Ok(catalog)
    }

    /// A random record
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NoUserAgent`] if the catalog is empty
    pub fn random(&self) -> Result<&UserAgent> {
        self.agents
            .iter()
            .choose(&mut rand::thread_rng())
            .ok_or(ErrorKind::NoUserAgent(None))
    }

    /// A random record of the given hardware type
    ///
    /// # Errors
    ///
    /// Returns [`ErrorKind::NoUserAgent`] if no record has that hardware type
    pub fn random_for_hardware(&self, hardware_type: &str) -> Result<&UserAgent> {
        self.agents
            .iter()
            .filter(|agent| agent.hardware_type == hardware_type)
            .choose(&mut rand::thread_rng())
            .ok_or_else(|| ErrorKind::NoUserAgent(Some(hardware_type.to_string())))
    }

    /// Number of records in the catalog
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// True if the catalog has no records
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn agent(user_agent: &str, time_seen: u64, hardware_type: &str) -> UserAgent {
        UserAgent {
            user_agent: user_agent.to_string(),
            time_seen,
            hardware_type: hardware_type.to_string(),
            ..UserAgent::default()
        }
    }

    struct StaticSource(Vec<UserAgent>);

    #[async_trait]
    impl UserAgentSource for StaticSource {
        async fn fetch(&self) -> Result<Vec<UserAgent>> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_deserialize_camel_case() {
        let agents: Vec<UserAgent> = serde_json::from_str(
            r#"[{"userAgent": "Mozilla/5.0", "softwareNameCode": "chrome",
                 "timeSeen": 4200, "softwareVersion": 120, "hardwareType": "computer"}]"#,
        )
        .unwrap();
        assert_eq!(agents[0].user_agent, "Mozilla/5.0");
        assert_eq!(agents[0].time_seen, 4200);
        assert_eq!(agents[0].software_version, 120);
        assert_eq!(agents[0].hardware_type, "computer");
    }

    #[test]
    fn test_rare_records_are_dropped() {
        let catalog = UserAgentCatalog::new(vec![
            agent("common", 1000, "computer"),
            agent("rare", 999, "computer"),
            agent("", 5000, "computer"),
        ]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.random().unwrap().user_agent, "common");
    }

    #[test]
    fn test_random_for_hardware() {
        let catalog = UserAgentCatalog::new(vec![
            agent("desktop", 2000, "computer"),
            agent("phone", 2000, "mobile"),
        ]);
        assert_eq!(catalog.random_for_hardware("mobile").unwrap().user_agent, "phone");
        assert_eq!(
            catalog.random_for_hardware("tablet"),
            Err(ErrorKind::NoUserAgent(Some("tablet".into())))
        );
    }

    #[test]
    fn test_empty_catalog() {
        assert_eq!(
            UserAgentCatalog::default().random(),
            Err(ErrorKind::NoUserAgent(None))
        );
    }

    #[tokio::test]
    async fn test_load_from_source() {
        let source = StaticSource(vec![agent("a", 1500, "computer"), agent("b", 10, "computer")]);
        let catalog = UserAgentCatalog::load(&source).await.unwrap();
        assert_eq!(catalog.len(), 1);
    }
}
