//! Linked social networks.

use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};

use crate::error::{LoyaltyError, Result};
use crate::store::LoyaltyStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SocialNetwork {
    Vk,
    Instagram,
}

impl SocialNetwork {
    pub fn as_str(&self) -> &'static str {
        match self {
            SocialNetwork::Vk => "vk",
            SocialNetwork::Instagram => "instagram",
        }
    }
}

impl std::fmt::Display for SocialNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for SocialNetwork {
    type Err = LoyaltyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "vk" => Ok(SocialNetwork::Vk),
            "instagram" | "ig" => Ok(SocialNetwork::Instagram),
            _ => Err(LoyaltyError::not_found("social network", s)),
        }
    }
}

impl ToSql for SocialNetwork {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for SocialNetwork {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|e: LoyaltyError| FromSqlError::Other(Box::new(e)))
    }
}

/// Link a network to an existing account. Returns false if it was already linked.
pub(crate) fn link_in(
    store: &dyn LoyaltyStore,
    account_id: &str,
    network: SocialNetwork,
    now: DateTime<Utc>,
) -> Result<bool> {
    if store.load_account(account_id)?.is_none() {
        return Err(LoyaltyError::not_found("account", account_id));
    }
    store.insert_social_link(account_id, network, now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LoyaltyDb;

    #[test]
    fn test_parse_networks() {
        assert_eq!("VK".parse::<SocialNetwork>().unwrap(), SocialNetwork::Vk);
        assert_eq!("ig".parse::<SocialNetwork>().unwrap(), SocialNetwork::Instagram);
        assert!("myspace".parse::<SocialNetwork>().is_err());
    }

    #[tokio::test]
    async fn test_link_is_idempotent() {
        let db = LoyaltyDb::open_in_memory().await.unwrap();
        let (first, second, linked) = db
            .transact(|conn| {
                let now = Utc::now();
                conn.insert_account("anna", "Bronze", now)?;
                let first = link_in(conn, "anna", SocialNetwork::Vk, now)?;
                let second = link_in(conn, "anna", SocialNetwork::Vk, now)?;
                Ok((first, second, conn.linked_networks("anna")?))
            })
            .await
            .unwrap();
        assert!(first);
        assert!(!second);
        assert_eq!(linked, vec![SocialNetwork::Vk]);
    }

    #[tokio::test]
    async fn test_link_requires_account() {
        let db = LoyaltyDb::open_in_memory().await.unwrap();
        let result = db
            .transact(|conn| link_in(conn, "ghost", SocialNetwork::Instagram, Utc::now()))
            .await;
        assert!(matches!(result, Err(LoyaltyError::NotFound { entity: "account", .. })));
    }
}
