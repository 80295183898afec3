//! Reads and writes against the asset table: known fingerprints, scan-result
//! reconciliation, the bulk importer and the single-item write paths.

use std::collections::{BTreeSet, HashSet};

use serde::Deserialize;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::{
    error::{InventoryError, InventoryResult},
    ledger::{self, IdSequence},
    models::{AssetRecord, DiscoveredDevice, Fingerprints, ImportSummary},
    normalize::{normalize_ip, normalize_mac},
};

const INSERT_COLUMNS: &str = "asset_id, asset_group, asset_type, brand_model, serial_number, assigned_to, \
     ip_address, mac_address, os_firmware, cpu, ram, storage, port_details, status, remarks";

/// Every distinct non-empty normalized IP and MAC in the inventory.
pub async fn known_fingerprints(pool: &SqlitePool) -> InventoryResult<Fingerprints> {
    let rows: Vec<(String, String)> = sqlx::query_as("SELECT ip_address, mac_address FROM assets")
        .fetch_all(pool)
        .await?;

    let mut ips = BTreeSet::new();
    let mut macs = BTreeSet::new();
    for (ip, mac) in rows {
        let ip = normalize_ip(&ip);
        let mac = normalize_mac(&mac);
        if !ip.is_empty() {
            ips.insert(ip);
        }
        if !mac.is_empty() {
            macs.insert(mac);
        }
    }

    Ok(Fingerprints {
        ips: ips.into_iter().collect(),
        macs: macs.into_iter().collect(),
    })
}

fn normalized(device: &DiscoveredDevice) -> DiscoveredDevice {
    DiscoveredDevice {
        asset_id: device.asset_id.trim().to_string(),
        ip_address: normalize_ip(&device.ip_address),
        mac_address: normalize_mac(&device.mac_address),
        ..device.clone()
    }
}

fn insert_sql(conflict: &str) -> String {
    format!("INSERT {conflict} INTO assets({INSERT_COLUMNS}) VALUES(?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")
}

fn bind_device<'q>(
    sql: &'q str,
    d: &'q DiscoveredDevice,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    sqlx::query(sql)
        .bind(&d.asset_id)
        .bind(&d.group)
        .bind(&d.asset_type)
        .bind(&d.brand_model)
        .bind(&d.serial_number)
        .bind(&d.assigned_to)
        .bind(&d.ip_address)
        .bind(&d.mac_address)
        .bind(&d.os_firmware)
        .bind(&d.cpu)
        .bind(&d.ram)
        .bind(&d.storage)
        .bind(&d.port_details)
        .bind(&d.status)
        .bind(&d.remarks)
}

/// Rejects an empty batch or one where any entry lacks a minimal field.
pub fn validate_batch(devices: &[DiscoveredDevice]) -> InventoryResult<()> {
    if devices.is_empty() {
        return Err(InventoryError::Validation("no assets provided".to_string()));
    }
    for (idx, device) in devices.iter().enumerate() {
        let missing = device.missing_required();
        if !missing.is_empty() {
            return Err(InventoryError::Validation(format!(
                "asset at index {idx} missing required fields: {}",
                missing.join(", ")
            )));
        }
    }
    Ok(())
}

/// Inserts a caller-selected subset of scan results.
///
/// Entries colliding with an existing asset id, MAC or IP are skipped, not
/// reported. Each entry is committed on its own so a failure never affects
/// its siblings; a failed entry counts as skipped.
pub async fn import(pool: &SqlitePool, devices: &[DiscoveredDevice]) -> InventoryResult<ImportSummary> {
    validate_batch(devices)?;

    let sql = insert_sql("OR IGNORE");
    let mut summary = ImportSummary::default();
    for device in devices {
        let device = normalized(device);
        match import_one(pool, &sql, &device).await {
            Ok(true) => summary.inserted += 1,
            Ok(false) => summary.skipped += 1,
            Err(e) => {
                warn!(error = %e, asset_id = %device.asset_id, "import entry failed");
                summary.skipped += 1;
            }
        }
    }

    info!(inserted = summary.inserted, skipped = summary.skipped, "bulk import finished");
    Ok(summary)
}

async fn import_one(pool: &SqlitePool, sql: &str, device: &DiscoveredDevice) -> InventoryResult<bool> {
    let mut tx = pool.begin().await?;
    let inserted = bind_device(sql, device).execute(&mut *tx).await?.rows_affected() == 1;
    if inserted {
        ledger::record(&mut *tx, &device.asset_id).await?;
    }
    tx.commit().await?;
    Ok(inserted)
}

/// Which fingerprint a unique-constraint failure names, if any. SQLite
/// reports the offending column as `assets.<column>`.
fn unique_field(e: &sqlx::Error) -> Option<&'static str> {
    let db = e.as_database_error()?;
    if !db.is_unique_violation() {
        return None;
    }
    let message = db.message();
    let field = if message.contains("assets.mac_address") {
        "macAddress"
    } else if message.contains("assets.ip_address") {
        "ipAddress"
    } else {
        "assetId"
    };
    Some(field)
}

fn conflict(e: sqlx::Error, device: &DiscoveredDevice) -> InventoryError {
    let value = |field: &str| match field {
        "macAddress" => device.mac_address.clone(),
        "ipAddress" => device.ip_address.clone(),
        _ => device.asset_id.clone(),
    };
    match unique_field(&e) {
        Some(field) => InventoryError::DuplicateFingerprint {
            field,
            value: value(field),
        },
        None => e.into(),
    }
}

/// First fingerprint of `device` already held by a row other than `exclude`.
async fn find_conflict(
    conn: &mut sqlx::SqliteConnection,
    device: &DiscoveredDevice,
    exclude: &str,
) -> InventoryResult<Option<InventoryError>> {
    for (field, column, value) in [
        ("assetId", "asset_id", &device.asset_id),
        ("macAddress", "mac_address", &device.mac_address),
        ("ipAddress", "ip_address", &device.ip_address),
    ] {
        if value.is_empty() {
            continue;
        }
        let taken: Option<String> = sqlx::query_scalar(&format!(
            "SELECT asset_id FROM assets WHERE {column} = ? AND asset_id <> ? LIMIT 1"
        ))
        .bind(value)
        .bind(exclude)
        .fetch_optional(&mut *conn)
        .await?;
        if taken.is_some() {
            return Ok(Some(InventoryError::DuplicateFingerprint {
                field,
                value: value.clone(),
            }));
        }
    }
    Ok(None)
}

fn require_fields(device: &DiscoveredDevice) -> InventoryResult<()> {
    let missing = device.missing_required();
    if !missing.is_empty() {
        return Err(InventoryError::Validation(format!(
            "missing required fields: {}",
            missing.join(", ")
        )));
    }
    Ok(())
}

/// Single-item create. Collisions are reported as
/// [`InventoryError::DuplicateFingerprint`] instead of being skipped.
pub async fn create(pool: &SqlitePool, device: &DiscoveredDevice) -> InventoryResult<String> {
    require_fields(device)?;
    let device = normalized(device);

    let mut tx = pool.begin().await?;
    if let Some(err) = find_conflict(&mut *tx, &device, "").await? {
        return Err(err);
    }

    let sql = insert_sql("");
    bind_device(&sql, &device)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict(e, &device))?;
    ledger::record(&mut *tx, &device.asset_id).await?;
    tx.commit().await?;

    info!(asset_id = %device.asset_id, "asset created");
    Ok(device.asset_id)
}

/// Replaces the asset stored under `current_id`. A different `asset_id` in
/// `device` renames it; the new id is ledgered and the old one stays
/// ledgered. Returns the number of rows changed, 0 when `current_id` is
/// unknown.
pub async fn update(pool: &SqlitePool, current_id: &str, device: &DiscoveredDevice) -> InventoryResult<u64> {
    require_fields(device)?;
    let device = normalized(device);

    let mut tx = pool.begin().await?;
    if let Some(err) = find_conflict(&mut *tx, &device, current_id).await? {
        return Err(err);
    }

    let sql = format!(
        "UPDATE assets SET ({INSERT_COLUMNS}) = (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) WHERE asset_id = ?"
    );
    let changed = bind_device(&sql, &device)
        .bind(current_id)
        .execute(&mut *tx)
        .await
        .map_err(|e| conflict(e, &device))?
        .rows_affected();
    if changed == 0 {
        return Ok(0);
    }
    ledger::record(&mut *tx, &device.asset_id).await?;
    tx.commit().await?;

    if device.asset_id != current_id {
        info!(from = %current_id, to = %device.asset_id, "asset renamed");
    }
    Ok(changed)
}

pub async fn list(pool: &SqlitePool) -> InventoryResult<Vec<AssetRecord>> {
    Ok(sqlx::query_as::<_, AssetRecord>(&format!(
        "SELECT {INSERT_COLUMNS}, created_at FROM assets ORDER BY asset_id"
    ))
    .fetch_all(pool)
    .await?)
}

/// Removes the asset row. The ledger keeps the id.
pub async fn delete(pool: &SqlitePool, asset_id: &str) -> InventoryResult<u64> {
    let res = sqlx::query("DELETE FROM assets WHERE asset_id = ?")
        .bind(asset_id)
        .execute(pool)
        .await?;
    Ok(res.rows_affected())
}

/// Match criteria for [`force_delete`]; blank fields are ignored.
#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ForceDelete {
    pub asset_id: String,
    pub mac_address: String,
    pub ip_address: String,
}

/// Removes every asset matching any given id, MAC or IP. The ledger keeps
/// the ids.
pub async fn force_delete(pool: &SqlitePool, criteria: &ForceDelete) -> InventoryResult<u64> {
    let conditions: Vec<(&str, String)> = [
        ("asset_id", criteria.asset_id.trim().to_string()),
        ("mac_address", normalize_mac(&criteria.mac_address)),
        ("ip_address", normalize_ip(&criteria.ip_address)),
    ]
    .into_iter()
    .filter(|(_, value)| !value.is_empty())
    .collect();
    if conditions.is_empty() {
        return Err(InventoryError::Validation(
            "must provide at least assetId, macAddress, or ipAddress".to_string(),
        ));
    }

    let clause = conditions
        .iter()
        .map(|(column, _)| format!("{column} = ?"))
        .collect::<Vec<_>>()
        .join(" OR ");
    let sql = format!("DELETE FROM assets WHERE {clause}");
    let mut query = sqlx::query(&sql);
    for (_, value) in &conditions {
        query = query.bind(value);
    }
    let deleted = query.execute(pool).await?.rows_affected();
    info!(?criteria, deleted, "force delete");
    Ok(deleted)
}

/// Prepares raw probe output for preview: normalizes fingerprints, drops
/// devices already in the inventory or repeated within the result set, and
/// fills in missing ids from a per-scan [`IdSequence`].
#[derive(Clone)]
pub struct Reconciler {
    pool: SqlitePool,
}

impl Reconciler {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn prepare(&self, devices: Vec<DiscoveredDevice>) -> InventoryResult<Vec<DiscoveredDevice>> {
        let known = known_fingerprints(&self.pool).await?;
        let mut ips: HashSet<String> = known.ips.into_iter().collect();
        let mut macs: HashSet<String> = known.macs.into_iter().collect();
        let mut ids = IdSequence::default();
        let mut out = Vec::with_capacity(devices.len());

        for device in devices {
            let mut device = normalized(&device);
            let dup_ip = !device.ip_address.is_empty() && ips.contains(&device.ip_address);
            let dup_mac = !device.mac_address.is_empty() && macs.contains(&device.mac_address);
            if dup_ip || dup_mac {
                info!(ip = %device.ip_address, mac = %device.mac_address, "known device skipped");
                continue;
            }
            if !device.ip_address.is_empty() {
                ips.insert(device.ip_address.clone());
            }
            if !device.mac_address.is_empty() {
                macs.insert(device.mac_address.clone());
            }
            if device.asset_id.is_empty() {
                device.asset_id = ids.propose(&self.pool, &device.asset_type).await?;
            }
            out.push(device);
        }

        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;

    fn device(id: &str, ip: &str, mac: &str) -> DiscoveredDevice {
        DiscoveredDevice {
            asset_id: id.into(),
            group: "Servers & Infra".into(),
            asset_type: "Server".into(),
            ip_address: ip.into(),
            mac_address: mac.into(),
            ..Default::default()
        }
    }

    async fn seed(pool: &SqlitePool, devices: &[DiscoveredDevice]) {
        for d in devices {
            create(pool, d).await.expect("seed insert");
        }
    }

    #[tokio::test]
    async fn import_skips_entries_sharing_a_mac() {
        let pool = test_pool().await;
        seed(
            &pool,
            &[
                device("SER-001", "10.0.0.1", "aa:aa:aa:aa:aa:01"),
                device("SER-002", "10.0.0.2", "aa:aa:aa:aa:aa:02"),
            ],
        )
        .await;

        let batch = vec![
            device("SER-010", "10.0.1.10", "AA-AA-AA-AA-AA-01"),
            device("SER-011", "10.0.1.11", "aaaaaaaaaa02"),
            device("SER-012", "10.0.1.12", "bb:bb:bb:bb:bb:01"),
            device("SER-013", "10.0.1.13", "bb:bb:bb:bb:bb:02"),
            device("SER-014", "10.0.1.14", "bb:bb:bb:bb:bb:03"),
        ];
        let first = import(&pool, &batch).await.unwrap();
        assert_eq!(first, ImportSummary { inserted: 3, skipped: 2 });
        assert_eq!(first.inserted + first.skipped, batch.len());

        let again = import(&pool, &batch).await.unwrap();
        assert_eq!(again, ImportSummary { inserted: 0, skipped: 5 });
    }

    #[tokio::test]
    async fn import_ledgers_only_inserted_ids() {
        let pool = test_pool().await;
        seed(&pool, &[device("SER-001", "10.0.0.1", "")]).await;

        let batch = vec![device("SER-002", "10.0.0.1", ""), device("SER-003", "10.0.0.3", "")];
        let summary = import(&pool, &batch).await.unwrap();
        assert_eq!(summary, ImportSummary { inserted: 1, skipped: 1 });

        let ids: Vec<String> = sqlx::query_scalar("SELECT asset_id FROM used_ids ORDER BY asset_id")
            .fetch_all(&pool)
            .await
            .unwrap();
        assert_eq!(ids, vec!["SER-001", "SER-003"]);
    }

    #[tokio::test]
    async fn blank_fingerprints_never_collide() {
        let pool = test_pool().await;
        let batch = vec![
            device("PC-001", "", "Unknown"),
            device("PC-002", "", ""),
            device("PC-003", "  ", "unknown"),
        ];
        let summary = import(&pool, &batch).await.unwrap();
        assert_eq!(summary, ImportSummary { inserted: 3, skipped: 0 });
    }

    #[tokio::test]
    async fn import_validates_batch() {
        let pool = test_pool().await;
        assert!(matches!(import(&pool, &[]).await, Err(InventoryError::Validation(_))));

        let mut bad = device("SER-001", "10.0.0.1", "");
        bad.group = String::new();
        let err = import(&pool, &[device("SER-002", "10.0.0.2", ""), bad])
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "asset at index 1 missing required fields: group");

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM assets")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn single_create_reports_conflicts() {
        let pool = test_pool().await;
        seed(&pool, &[device("SER-001", "10.0.0.1", "aa:bb:cc:dd:ee:ff")]).await;

        let err = create(&pool, &device("SER-002", "10.0.0.9", "AABBCCDDEEFF"))
            .await
            .unwrap_err();
        assert!(matches!(err, InventoryError::DuplicateFingerprint { field: "macAddress", .. }));

        let err = create(&pool, &device("SER-001", "10.0.0.9", "")).await.unwrap_err();
        assert!(matches!(err, InventoryError::DuplicateFingerprint { field: "assetId", .. }));

        let err = create(&pool, &device("SER-003", " 10.0.0.1 ", "")).await.unwrap_err();
        assert!(matches!(err, InventoryError::DuplicateFingerprint { field: "ipAddress", .. }));
    }

    #[tokio::test]
    async fn fingerprints_are_normalized_and_distinct() {
        let pool = test_pool().await;
        seed(
            &pool,
            &[
                device("SER-001", "10.0.0.1", "aa-bb-cc-dd-ee-ff"),
                device("SER-002", "", "Unknown"),
                device("SER-003", "10.0.0.3", ""),
            ],
        )
        .await;

        let fp = known_fingerprints(&pool).await.unwrap();
        assert_eq!(fp.ips, vec!["10.0.0.1", "10.0.0.3"]);
        assert_eq!(fp.macs, vec!["AA:BB:CC:DD:EE:FF"]);
    }

    #[tokio::test]
    async fn delete_keeps_ledger_entry() {
        let pool = test_pool().await;
        seed(&pool, &[device("SER-001", "10.0.0.1", "")]).await;
        assert_eq!(delete(&pool, "SER-001").await.unwrap(), 1);
        assert!(list(&pool).await.unwrap().is_empty());
        assert_eq!(ledger::next_id(&pool, "server").await.unwrap(), "SER-002");
    }

    #[tokio::test]
    async fn reconciler_drops_known_and_repeated_devices() {
        let pool = test_pool().await;
        seed(&pool, &[device("SER-001", "10.0.0.1", "aa:bb:cc:dd:ee:ff")]).await;

        let raw = vec![
            device("", "10.0.0.1", ""),
            device("", "10.0.0.7", "AABBCCDDEEFF"),
            device("", "10.0.0.8", "11:22:33:44:55:66"),
            device("", "10.0.0.8", ""),
            device("", "10.0.0.9", "unknown"),
        ];
        let prepared = Reconciler::new(pool.clone()).prepare(raw).await.unwrap();

        let ids: Vec<&str> = prepared.iter().map(|d| d.asset_id.as_str()).collect();
        assert_eq!(ids, vec!["SER-002", "SER-003"]);
        assert_eq!(prepared[0].mac_address, "11:22:33:44:55:66");
        assert_eq!(prepared[1].mac_address, "");
    }

    async fn ledgered(pool: &SqlitePool) -> Vec<String> {
        sqlx::query_scalar("SELECT asset_id FROM used_ids ORDER BY asset_id")
            .fetch_all(pool)
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn failing_entry_does_not_abort_siblings() {
        let pool = test_pool().await;
        sqlx::query(
            "CREATE TRIGGER reject_bad BEFORE INSERT ON assets WHEN NEW.asset_id = 'BAD-001' \
             BEGIN SELECT RAISE(ABORT, 'rejected'); END",
        )
        .execute(&pool)
        .await
        .unwrap();

        let batch = vec![
            device("SER-001", "10.0.0.1", ""),
            device("BAD-001", "10.0.0.2", ""),
            device("SER-002", "10.0.0.3", ""),
        ];
        let summary = import(&pool, &batch).await.unwrap();
        assert_eq!(summary, ImportSummary { inserted: 2, skipped: 1 });
        assert_eq!(summary.inserted + summary.skipped, batch.len());

        let stored: Vec<String> = list(&pool).await.unwrap().into_iter().map(|a| a.asset_id).collect();
        assert_eq!(stored, vec!["SER-001", "SER-002"]);
        assert_eq!(ledgered(&pool).await, vec!["SER-001", "SER-002"]);
    }

    #[tokio::test]
    async fn constraint_failures_name_the_colliding_field() {
        let pool = test_pool().await;
        seed(&pool, &[device("SER-001", "10.0.0.1", "aa:bb:cc:dd:ee:ff")]).await;
        let sql = insert_sql("");

        let by_mac = normalized(&device("SER-002", "10.0.0.2", "aa:bb:cc:dd:ee:ff"));
        let err = bind_device(&sql, &by_mac).execute(&pool).await.unwrap_err();
        assert_eq!(unique_field(&err), Some("macAddress"));
        assert!(matches!(
            conflict(err, &by_mac),
            InventoryError::DuplicateFingerprint { field: "macAddress", value } if value == "AA:BB:CC:DD:EE:FF"
        ));

        let by_ip = device("SER-003", "10.0.0.1", "");
        let err = bind_device(&sql, &by_ip).execute(&pool).await.unwrap_err();
        assert_eq!(unique_field(&err), Some("ipAddress"));

        let by_id = device("SER-001", "10.0.0.9", "");
        let err = bind_device(&sql, &by_id).execute(&pool).await.unwrap_err();
        assert_eq!(unique_field(&err), Some("assetId"));
    }

    #[tokio::test]
    async fn rename_ledgers_new_id_and_retires_old() {
        let pool = test_pool().await;
        seed(&pool, &[device("SER-001", "10.0.0.1", "")]).await;

        let renamed = device("SER-007", "10.0.0.1", "");
        assert_eq!(update(&pool, "SER-001", &renamed).await.unwrap(), 1);

        let stored: Vec<String> = list(&pool).await.unwrap().into_iter().map(|a| a.asset_id).collect();
        assert_eq!(stored, vec!["SER-007"]);
        assert_eq!(ledgered(&pool).await, vec!["SER-001", "SER-007"]);
        assert_eq!(ledger::next_id(&pool, "server").await.unwrap(), "SER-008");

        assert_eq!(update(&pool, "SER-007", &device("LAB-001", "10.0.0.1", "")).await.unwrap(), 1);
        assert_eq!(ledger::next_id(&pool, "server").await.unwrap(), "SER-008");
        assert_eq!(ledger::next_id(&pool, "lab").await.unwrap(), "LAB-002");
    }

    #[tokio::test]
    async fn update_in_place_and_conflicts() {
        let pool = test_pool().await;
        seed(
            &pool,
            &[
                device("SER-001", "10.0.0.1", "aa:aa:aa:aa:aa:01"),
                device("SER-002", "10.0.0.2", "aa:aa:aa:aa:aa:02"),
            ],
        )
        .await;

        let mut same = device("SER-001", "10.0.0.1", "AAAAAAAAAA01");
        same.remarks = "rack 4".into();
        assert_eq!(update(&pool, "SER-001", &same).await.unwrap(), 1);
        let first = list(&pool).await.unwrap().remove(0);
        assert_eq!(first.remarks, "rack 4");

        let err = update(&pool, "SER-001", &device("SER-002", "10.0.0.1", "")).await.unwrap_err();
        assert!(matches!(err, InventoryError::DuplicateFingerprint { field: "assetId", .. }));

        let err = update(&pool, "SER-001", &device("SER-001", "10.0.0.2", "")).await.unwrap_err();
        assert!(matches!(err, InventoryError::DuplicateFingerprint { field: "ipAddress", .. }));

        assert_eq!(update(&pool, "SER-404", &device("SER-404", "10.0.0.9", "")).await.unwrap(), 0);
        assert_eq!(ledgered(&pool).await, vec!["SER-001", "SER-002"]);
    }

    #[tokio::test]
    async fn force_delete_matches_any_fingerprint() {
        let pool = test_pool().await;
        seed(
            &pool,
            &[
                device("SER-001", "10.0.0.1", "aa:aa:aa:aa:aa:01"),
                device("SER-002", "10.0.0.2", "aa:aa:aa:aa:aa:02"),
                device("SER-003", "10.0.0.3", ""),
            ],
        )
        .await;

        assert!(matches!(
            force_delete(&pool, &ForceDelete::default()).await,
            Err(InventoryError::Validation(_))
        ));

        let criteria = ForceDelete {
            mac_address: "aa-aa-aa-aa-aa-01".into(),
            ip_address: "10.0.0.3".into(),
            ..Default::default()
        };
        assert_eq!(force_delete(&pool, &criteria).await.unwrap(), 2);

        let stored: Vec<String> = list(&pool).await.unwrap().into_iter().map(|a| a.asset_id).collect();
        assert_eq!(stored, vec!["SER-002"]);
        assert_eq!(ledgered(&pool).await, vec!["SER-001", "SER-002", "SER-003"]);
    }
}
