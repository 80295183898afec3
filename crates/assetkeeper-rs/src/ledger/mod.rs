//! Asset identifier allocation over the `used_ids` ledger.
//!
//! Identifiers look like `PFX-NNN`. The ledger, not the live `assets` table,
//! decides the next number, so ids of deleted assets are never handed out
//! again.
//!
//! [`next_id`] does not reserve anything: it reports the number after the
//! highest one in the ledger at call time. Two callers asking for the same
//! prefix before either inserts will receive the same id. The primary key on
//! `assets` rejects the second insert; single-item writers get
//! [`InventoryError::DuplicateFingerprint`] for `assetId` and must request a
//! fresh id and retry, while the bulk importer counts such an entry as
//! skipped.

use std::collections::HashMap;

use sqlx::{SqliteExecutor, SqlitePool};
use tracing::debug;

use crate::error::{InventoryError, InventoryResult};

/// Types whose established prefix differs from the generic rule.
const PREFIX_ALIASES: &[(&str, &str)] = &[("router", "RTR")];

const FALLBACK_PREFIX: &str = "GEN";

/// Maps an asset type or free text to its id prefix.
pub fn derive_prefix(raw: &str) -> InventoryResult<String> {
    if raw.chars().count() < 2 {
        return Err(InventoryError::InvalidPrefix(raw.to_string()));
    }

    let key = raw.trim().to_ascii_lowercase();
    if let Some((_, code)) = PREFIX_ALIASES.iter().find(|(name, _)| *name == key) {
        return Ok((*code).to_string());
    }

    let prefix: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(3)
        .collect::<String>()
        .to_ascii_uppercase();
    if prefix.is_empty() {
        return Err(InventoryError::InvalidPrefix(raw.to_string()));
    }
    Ok(prefix)
}

/// Zero-pads to three digits; larger numbers widen the field.
pub fn format_id(prefix: &str, number: u64) -> String {
    format!("{prefix}-{number:03}")
}

/// Digit suffix of `id` when it is exactly `PREFIX-<digits>`.
fn suffix_digits<'a>(id: &'a str, prefix: &str) -> Option<&'a str> {
    let digits = id.strip_prefix(prefix)?.strip_prefix('-')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some(digits)
}

/// A suffix too large for `u64` cannot be followed, so it exhausts the
/// prefix rather than being skipped.
fn suffix_number(id: &str, prefix: &str) -> InventoryResult<Option<u64>> {
    match suffix_digits(id, prefix) {
        Some(digits) => digits
            .parse()
            .map(Some)
            .map_err(|_| InventoryError::IdSpaceExhausted(prefix.to_string())),
        None => Ok(None),
    }
}

fn successor(prefix: &str, number: u64) -> InventoryResult<u64> {
    number
        .checked_add(1)
        .ok_or_else(|| InventoryError::IdSpaceExhausted(prefix.to_string()))
}

async fn next_number(pool: &SqlitePool, prefix: &str) -> InventoryResult<u64> {
    let issued: Vec<String> = sqlx::query_scalar("SELECT asset_id FROM used_ids WHERE asset_id LIKE ?")
        .bind(format!("{prefix}-%"))
        .fetch_all(pool)
        .await?;

    let mut highest = 0;
    for id in &issued {
        if let Some(n) = suffix_number(id, prefix)? {
            highest = highest.max(n);
        }
    }
    successor(prefix, highest)
}

pub async fn next_id(pool: &SqlitePool, raw_type: &str) -> InventoryResult<String> {
    let prefix = derive_prefix(raw_type)?;
    let number = next_number(pool, &prefix).await?;
    Ok(format_id(&prefix, number))
}

/// Appends `asset_id` to the ledger. Re-recording an existing id is a no-op.
pub async fn record<'e, E>(executor: E, asset_id: &str) -> InventoryResult<()>
where
    E: SqliteExecutor<'e>,
{
    sqlx::query("INSERT OR IGNORE INTO used_ids(asset_id) VALUES(?)")
        .bind(asset_id)
        .execute(executor)
        .await?;
    Ok(())
}

/// Hands out provisional ids for one scan preview.
///
/// The first device of a prefix asks the ledger; later ones increment
/// locally so a preview never repeats an id even though nothing is
/// ledgered until import.
#[derive(Debug, Default)]
pub struct IdSequence {
    next: HashMap<String, u64>,
}

impl IdSequence {
    pub async fn propose(&mut self, pool: &SqlitePool, asset_type: &str) -> InventoryResult<String> {
        let prefix = derive_prefix(asset_type).unwrap_or_else(|_| FALLBACK_PREFIX.to_string());
        let number = match self.next.get(&prefix) {
            Some(n) => *n,
            None => next_number(pool, &prefix).await?,
        };
        self.next.insert(prefix.clone(), successor(&prefix, number)?);
        let id = format_id(&prefix, number);
        debug!(asset_type, id = %id, "proposed provisional id");
        Ok(id)
    }
}
