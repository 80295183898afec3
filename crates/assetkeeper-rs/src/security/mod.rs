use crate::error::{InventoryError, InventoryResult};

/// Trims a scan target (single IP, `a-b` range or CIDR). The probe parses
/// the syntax; only an empty target is rejected here.
pub fn validate_target(raw: &str) -> InventoryResult<String> {
    let target = raw.trim();
    if target.is_empty() {
        return Err(InventoryError::InvalidTarget);
    }
    Ok(target.to_string())
}

/// Constant-time comparison of the presented probe token with the
/// configured one. An empty configured token never matches.
pub fn probe_token_matches(configured: &str, presented: &str) -> bool {
    if configured.is_empty() || configured.len() != presented.len() {
        return false;
    }
    configured
        .bytes()
        .zip(presented.bytes())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn targets_are_trimmed_and_must_be_present() {
        assert_eq!(validate_target(" 10.27.16.0/24 ").unwrap(), "10.27.16.0/24");
        assert_eq!(validate_target("10.0.0.1-10.0.0.9").unwrap(), "10.0.0.1-10.0.0.9");
        assert!(matches!(validate_target(""), Err(InventoryError::InvalidTarget)));
        assert!(matches!(validate_target(" \t"), Err(InventoryError::InvalidTarget)));
    }

    #[test]
    fn probe_token_comparison() {
        assert!(probe_token_matches("s3cret", "s3cret"));
        assert!(!probe_token_matches("s3cret", "s3creT"));
        assert!(!probe_token_matches("s3cret", "s3cre"));
        assert!(!probe_token_matches("", ""));
    }
}
