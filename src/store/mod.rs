// ============================================================================
// SECTION 14: SOURCE STORE CONTRACT
// ============================================================================
// The only path by which pipelines read switch state. Two operations, both
// bounded by a caller-supplied deadline:
// - scan keys matching a glob pattern, paged by a batch size
// - fetch every field of one hash key
// ============================================================================

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{SourceError, SourceResult};

mod memory;
mod redis;

pub use memory::{FixtureDocument, MemoryStore};
pub use redis::{RedisStore, StoreAddress};

/// Field name → value mapping of one hash key. Ordered so that any iteration
/// over fields is deterministic.
pub type FieldMap = BTreeMap<String, String>;

// ----------------------------------------------------------------------------
// 14.1 Databases
// ----------------------------------------------------------------------------

/// Logical SONiC databases with their redis indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Database {
    #[serde(rename = "APPL_DB")]
    ApplDb,
    #[serde(rename = "ASIC_DB")]
    AsicDb,
    #[serde(rename = "COUNTERS_DB")]
    CountersDb,
    #[serde(rename = "CONFIG_DB")]
    ConfigDb,
    #[serde(rename = "STATE_DB")]
    StateDb,
}

impl Database {
    pub const ALL: [Database; 5] = [
        Database::ApplDb,
        Database::AsicDb,
        Database::CountersDb,
        Database::ConfigDb,
        Database::StateDb,
    ];

    /// Redis database index used by SONiC.
    pub fn index(&self) -> u8 {
        match self {
            Database::ApplDb => 0,
            Database::AsicDb => 1,
            Database::CountersDb => 2,
            Database::ConfigDb => 4,
            Database::StateDb => 6,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Database::ApplDb => "APPL_DB",
            Database::AsicDb => "ASIC_DB",
            Database::CountersDb => "COUNTERS_DB",
            Database::ConfigDb => "CONFIG_DB",
            Database::StateDb => "STATE_DB",
        }
    }
}

impl Display for Database {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Database {
    type Err = SourceError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Database::ALL
            .iter()
            .copied()
            .find(|db| db.as_str().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| SourceError::UnknownDatabase { name: s.to_string() })
    }
}

// ----------------------------------------------------------------------------
// 14.2 Store Trait
// ----------------------------------------------------------------------------

/// Read-only access to the switch databases.
///
/// Implementations must fail fast with [`SourceError::DeadlineExceeded`]
/// once `deadline` has passed; they must never mutate the store.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SourceStore: Send + Sync {
    /// Keys in `db` matching the glob `pattern`, fetched `count` at a time.
    async fn scan_keys(
        &self,
        db: Database,
        pattern: &str,
        count: usize,
        deadline: Instant,
    ) -> SourceResult<Vec<String>>;

    /// Every field of the hash at `key`; empty when the key does not exist.
    async fn hget_all(&self, db: Database, key: &str, deadline: Instant) -> SourceResult<FieldMap>;

    /// Server self-description, when the backend has one.
    async fn server_info(&self, _deadline: Instant) -> SourceResult<FieldMap> {
        Ok(FieldMap::new())
    }

    /// Human readable address, for logs and errors.
    fn endpoint(&self) -> String;
}

/// Fail with a deadline error when `deadline` has already passed.
pub(crate) fn check_deadline(deadline: Instant, operation: &str) -> SourceResult<()> {
    if Instant::now() >= deadline {
        return Err(SourceError::deadline(operation));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_database_names_roundtrip() {
        for db in Database::ALL {
            assert_eq!(db.as_str().parse::<Database>().ok(), Some(db));
        }
        assert_eq!("config_db".parse::<Database>().ok(), Some(Database::ConfigDb));
        assert!("FLEX_DB".parse::<Database>().is_err());
        assert_eq!(Database::StateDb.index(), 6);
    }
}
