// ============================================================================
// SECTION 16: FORWARDING ENTRY JOIN RESOLVER
// ============================================================================
// Per-cycle cross-reference maps for the forwarding table:
// - object id → port or LAG name (counter name maps, inverted)
// - bridge port object → display name (via the map above)
// - VLAN object id → numeric VLAN id
// Maps are built once per cycle and only read afterwards; entries are never
// resolved against the store one at a time.
// ============================================================================

use ahash::AHashMap;
use serde::Deserialize;
use tracing::trace;

use crate::accounting::SkipLedger;
use crate::error::{SkipReason, SourceResult};
use crate::fields::{field, strip_identifier};
use crate::pipeline::ScrapeContext;
use crate::store::Database;
use crate::UNKNOWN_LABEL;

pub const FDB_ENTRY_PREFIX: &str = "ASIC_STATE:SAI_OBJECT_TYPE_FDB_ENTRY:";
pub const VLAN_OBJECT_PREFIX: &str = "ASIC_STATE:SAI_OBJECT_TYPE_VLAN:";
pub const BRIDGE_PORT_PREFIX: &str = "ASIC_STATE:SAI_OBJECT_TYPE_BRIDGE_PORT:";
pub const PORT_NAME_MAP: &str = "COUNTERS_PORT_NAME_MAP";
pub const LAG_NAME_MAP: &str = "COUNTERS_LAG_NAME_MAP";

const VLAN_ID_FIELD: &str = "SAI_VLAN_ATTR_VLAN_ID";
const BRIDGE_PORT_ID_FIELD: &str = "SAI_BRIDGE_PORT_ATTR_PORT_ID";
const FDB_TYPE_PREFIX: &str = "sai_fdb_entry_type_";

// ----------------------------------------------------------------------------
// 16.1 Entry Keys
// ----------------------------------------------------------------------------

/// JSON payload embedded in a forwarding entry key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct FdbEntryKey {
    #[serde(default)]
    pub bvid: String,
    #[serde(default)]
    pub vlan: String,
    #[serde(default)]
    pub mac: String,
}

/// Decode `ASIC_STATE:SAI_OBJECT_TYPE_FDB_ENTRY:{json}`. Entries without a
/// MAC address are rejected.
pub fn parse_fdb_key(key: &str) -> Option<FdbEntryKey> {
    let payload = strip_identifier(key, FDB_ENTRY_PREFIX)?;
    let entry: FdbEntryKey = serde_json::from_str(payload).ok()?;
    if entry.mac.trim().is_empty() {
        return None;
    }
    Some(entry)
}

/// `SAI_FDB_ENTRY_TYPE_DYNAMIC` → `dynamic`; blank → `unknown`.
pub fn normalize_fdb_type(raw: &str) -> String {
    let lowered = raw.trim().to_lowercase();
    let stripped = lowered.strip_prefix(FDB_TYPE_PREFIX).unwrap_or(&lowered);
    if stripped.is_empty() {
        UNKNOWN_LABEL.to_string()
    } else {
        stripped.to_string()
    }
}

// ----------------------------------------------------------------------------
// 16.2 Resolution Results
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VlanResolution {
    /// VLAN id carried in the entry key itself
    Embedded(String),
    /// Resolved through the bridge VLAN object
    Bridged(String),
    Unknown,
}

impl VlanResolution {
    pub fn label(&self) -> &str {
        match self {
            VlanResolution::Embedded(v) | VlanResolution::Bridged(v) => v,
            VlanResolution::Unknown => UNKNOWN_LABEL,
        }
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, VlanResolution::Unknown)
    }
}

// ----------------------------------------------------------------------------
// 16.3 Join Maps
// ----------------------------------------------------------------------------

/// Cross-reference maps for one refresh cycle.
#[derive(Debug, Clone, Default)]
pub struct JoinMaps {
    object_names: AHashMap<String, String>,
    bridge_ports: AHashMap<String, String>,
    bvid_to_vlan: AHashMap<String, String>,
}

impl JoinMaps {
    /// Build every map from the store, booking unusable auxiliary objects.
    pub async fn build(ctx: &ScrapeContext, ledger: &mut SkipLedger) -> SourceResult<Self> {
        let mut maps = JoinMaps::default();

        // Port names first, then LAG names; a LAG name wins on a shared id.
        for table in [PORT_NAME_MAP, LAG_NAME_MAP] {
            let names = ctx.hget_all(Database::CountersDb, table).await?;
            for (name, oid) in names {
                maps.object_names.insert(oid, name);
            }
        }

        // Each auxiliary object is booked once: accepted only when it resolves.
        let bridge_keys = ctx.scan(Database::AsicDb, BRIDGE_PORT_PREFIX).await?;
        ledger.seen(BRIDGE_PORT_PREFIX, bridge_keys.len());
        for key in &bridge_keys {
            let Some(bridge_id) = strip_identifier(key, BRIDGE_PORT_PREFIX) else {
                ledger.skip(BRIDGE_PORT_PREFIX, SkipReason::MalformedKey);
                continue;
            };
            let fields = ctx.hget_all(Database::AsicDb, key).await?;
            let port_oid = field(&fields, BRIDGE_PORT_ID_FIELD).trim();
            match maps.object_names.get(port_oid) {
                Some(name) if !port_oid.is_empty() => {
                    maps.bridge_ports.insert(bridge_id.to_string(), name.clone());
                    ledger.accept(BRIDGE_PORT_PREFIX);
                }
                _ => {
                    trace!(target: "sonic::fdb", bridge_port = bridge_id, port_oid, "Bridge port did not resolve");
                    ledger.skip(BRIDGE_PORT_PREFIX, SkipReason::MissingRequiredField);
                }
            }
        }

        let vlan_keys = ctx.scan(Database::AsicDb, VLAN_OBJECT_PREFIX).await?;
        ledger.seen(VLAN_OBJECT_PREFIX, vlan_keys.len());
        for key in &vlan_keys {
            let Some(bvid) = strip_identifier(key, VLAN_OBJECT_PREFIX) else {
                ledger.skip(VLAN_OBJECT_PREFIX, SkipReason::MalformedKey);
                continue;
            };
            let fields = ctx.hget_all(Database::AsicDb, key).await?;
            let vlan_id = field(&fields, VLAN_ID_FIELD).trim();
            if vlan_id.is_empty() {
                ledger.skip(VLAN_OBJECT_PREFIX, SkipReason::MissingRequiredField);
                continue;
            }
            maps.bvid_to_vlan.insert(bvid.to_string(), vlan_id.to_string());
            ledger.accept(VLAN_OBJECT_PREFIX);
        }

        Ok(maps)
    }

    /// Construct directly from already-resolved tables.
    pub fn from_parts<I, J, K>(object_names: I, bridge_ports: J, bvid_to_vlan: K) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
        J: IntoIterator<Item = (String, String)>,
        K: IntoIterator<Item = (String, String)>,
    {
        Self {
            object_names: object_names.into_iter().collect(),
            bridge_ports: bridge_ports.into_iter().collect(),
            bvid_to_vlan: bvid_to_vlan.into_iter().collect(),
        }
    }

    pub fn resolve_vlan(&self, key: &FdbEntryKey) -> VlanResolution {
        let embedded = key.vlan.trim();
        if !embedded.is_empty() {
            return VlanResolution::Embedded(embedded.to_string());
        }
        match self.bvid_to_vlan.get(key.bvid.trim()) {
            Some(vlan) => VlanResolution::Bridged(vlan.clone()),
            None => VlanResolution::Unknown,
        }
    }

    /// Display name for a bridge port object, or `unknown`.
    pub fn resolve_port(&self, bridge_port_id: &str) -> &str {
        self.bridge_ports
            .get(bridge_port_id.trim())
            .map(String::as_str)
            .unwrap_or(UNKNOWN_LABEL)
    }

    pub fn object_name(&self, oid: &str) -> Option<&str> {
        self.object_names.get(oid).map(String::as_str)
    }

    pub fn bridge_port_count(&self) -> usize {
        self.bridge_ports.len()
    }

    pub fn vlan_count(&self) -> usize {
        self.bvid_to_vlan.len()
    }
}
