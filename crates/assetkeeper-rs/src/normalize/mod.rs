//! Canonical forms for the IP and MAC fingerprints used in duplicate checks.
//!
//! Empty output means "no fingerprint": callers must never treat it as a key.

/// Marker the probe emits when a MAC could not be resolved (e.g. ARP miss
/// across a router).
const UNRESOLVED_MAC: &str = "unknown";

/// Trims surrounding whitespace. IP syntax is not validated here.
pub fn normalize_ip(raw: &str) -> String {
    raw.trim().to_string()
}

/// Uppercases and strips separators; a 12-hex-digit result is rendered as
/// `AA:BB:CC:DD:EE:FF`. Anything else is returned uppercased and trimmed so
/// identical non-standard inputs still compare equal to each other.
pub fn normalize_mac(raw: &str) -> String {
    let trimmed = raw.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case(UNRESOLVED_MAC) {
        return String::new();
    }

    let upper = trimmed.to_ascii_uppercase();
    let hex: String = upper
        .chars()
        .filter(|c| !matches!(c, ':' | '-' | '.' | ' '))
        .collect();

    if hex.len() == 12 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
        let mut out = String::with_capacity(17);
        for (i, pair) in hex.as_bytes().chunks(2).enumerate() {
            if i > 0 {
                out.push(':');
            }
            out.push_str(&String::from_utf8_lossy(pair));
        }
        return out;
    }

    upper
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn separator_and_case_variants_collapse() {
        for raw in [
            "aa-bb-cc-dd-ee-ff",
            "AABBCCDDEEFF",
            "aa:bb:cc:dd:ee:ff",
            "aabb.ccdd.eeff",
            "  Aa:bB:cC:Dd:eE:Ff ",
        ] {
            assert_eq!(normalize_mac(raw), "AA:BB:CC:DD:EE:FF", "input {raw:?}");
        }
    }

    #[test]
    fn non_canonical_mac_is_kept_verbatim_uppercased() {
        assert_eq!(normalize_mac("aa:bb:cc"), "AA:BB:CC");
        assert_eq!(normalize_mac("zz:zz:zz:zz:zz:zz"), "ZZ:ZZ:ZZ:ZZ:ZZ:ZZ");
        assert_ne!(normalize_mac("aa:bb:cc"), normalize_mac("AA:BB:CC:00:00:00"));
    }

    #[test]
    fn empty_and_unresolved_mac_have_no_fingerprint() {
        assert_eq!(normalize_mac(""), "");
        assert_eq!(normalize_mac("   "), "");
        assert_eq!(normalize_mac("Unknown"), "");
        assert_eq!(normalize_mac("UNKNOWN"), "");
    }

    #[test]
    fn ip_is_only_trimmed() {
        assert_eq!(normalize_ip(" 10.0.0.5\n"), "10.0.0.5");
        assert_eq!(normalize_ip("not-an-ip"), "not-an-ip");
        assert_eq!(normalize_ip(""), "");
    }
}
