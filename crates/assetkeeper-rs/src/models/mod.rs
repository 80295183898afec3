use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// A host reported by the probe. Held only in scan results until imported.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DiscoveredDevice {
    #[serde(deserialize_with = "nullable")]
    pub asset_id: String,
    #[serde(deserialize_with = "nullable")]
    pub group: String,
    #[serde(deserialize_with = "nullable")]
    pub asset_type: String,
    #[serde(deserialize_with = "nullable")]
    pub brand_model: String,
    #[serde(deserialize_with = "nullable")]
    pub serial_number: String,
    #[serde(deserialize_with = "nullable")]
    pub assigned_to: String,
    #[serde(deserialize_with = "nullable")]
    pub ip_address: String,
    #[serde(deserialize_with = "nullable")]
    pub mac_address: String,
    #[serde(deserialize_with = "nullable")]
    pub os_firmware: String,
    #[serde(deserialize_with = "nullable")]
    pub cpu: String,
    #[serde(deserialize_with = "nullable")]
    pub ram: String,
    #[serde(deserialize_with = "nullable")]
    pub storage: String,
    #[serde(deserialize_with = "nullable")]
    pub port_details: String,
    #[serde(deserialize_with = "nullable")]
    pub status: String,
    #[serde(deserialize_with = "nullable")]
    pub remarks: String,
}

// The probe writes `null` for attributes it could not read.
fn nullable<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

impl DiscoveredDevice {
    /// Names of the minimal fields that are blank on this record.
    pub fn missing_required(&self) -> Vec<&'static str> {
        [
            ("assetId", &self.asset_id),
            ("group", &self.group),
            ("assetType", &self.asset_type),
        ]
        .into_iter()
        .filter(|(_, v)| v.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct AssetRecord {
    pub asset_id: String,
    #[sqlx(rename = "asset_group")]
    pub group: String,
    pub asset_type: String,
    pub brand_model: String,
    pub serial_number: String,
    pub assigned_to: String,
    pub ip_address: String,
    pub mac_address: String,
    pub os_firmware: String,
    pub cpu: String,
    pub ram: String,
    pub storage: String,
    pub port_details: String,
    pub status: String,
    pub remarks: String,
    pub created_at: DateTime<Utc>,
}

/// Normalized, non-empty fingerprints already present in the inventory.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Fingerprints {
    pub ips: Vec<String>,
    pub macs: Vec<String>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ImportSummary {
    pub inserted: usize,
    pub skipped: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn probe_payload_with_nulls_and_extra_fields_parses() {
        let raw = r#"{
            "assetId": "PC-004",
            "group": "Windows",
            "assetType": "PC",
            "assignedTo": null,
            "ipAddress": "10.27.16.40",
            "macAddress": "Unknown",
            "powerConsumption": "",
            "licenseKey": ""
        }"#;
        let device: DiscoveredDevice = serde_json::from_str(raw).expect("payload should parse");
        assert_eq!(device.asset_id, "PC-004");
        assert_eq!(device.assigned_to, "");
        assert_eq!(device.brand_model, "");
        assert!(device.missing_required().is_empty());
    }

    #[test]
    fn blank_required_fields_are_reported() {
        let device = DiscoveredDevice {
            asset_id: "  ".into(),
            asset_type: "Server".into(),
            ..Default::default()
        };
        assert_eq!(device.missing_required(), vec!["assetId", "group"]);
    }
}
