//! Key layout of the coordination store.
//!
//! ```text
//! /cluster/{memberID}             member record, leased
//! /clouds/{providerID}            provider definition
//! /scalers/{providerID}/{id}      scaler definition
//! /healers/{providerID}           healer definition (one per provider)
//! /schedulers/{providerID}/{id}   scheduler definition
//! /nresolvers/{providerID}        name-resolution definition
//! ```

/// Prefix of leased membership records.
pub const CLUSTER_PREFIX: &str = "/cluster/";
/// Prefix of provider definitions.
pub const CLOUDS_PREFIX: &str = "/clouds/";
/// Prefix of scaler definitions.
pub const SCALERS_PREFIX: &str = "/scalers/";
/// Prefix of healer definitions.
pub const HEALERS_PREFIX: &str = "/healers/";
/// Prefix of scheduler definitions.
pub const SCHEDULERS_PREFIX: &str = "/schedulers/";
/// Prefix of name-resolution definitions.
pub const NRESOLVERS_PREFIX: &str = "/nresolvers/";

/// Key of a member record.
#[must_use]
pub fn member_key(member_id: &str) -> String {
    format!("{CLUSTER_PREFIX}{member_id}")
}

/// Key of a scaler definition.
#[must_use]
pub fn scaler_key(provider_id: &str, id: &str) -> String {
    format!("{SCALERS_PREFIX}{provider_id}/{id}")
}

/// Key of a provider's healer definition.
#[must_use]
pub fn healer_key(provider_id: &str) -> String {
    format!("{HEALERS_PREFIX}{provider_id}")
}

/// Key of a scheduler definition.
#[must_use]
pub fn scheduler_key(provider_id: &str, id: &str) -> String {
    format!("{SCHEDULERS_PREFIX}{provider_id}/{id}")
}

/// Strips `prefix` from `key`, returning the remaining path.
#[must_use]
pub fn strip<'a>(key: &'a str, prefix: &str) -> Option<&'a str> {
    key.strip_prefix(prefix).filter(|rest| !rest.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_builds_domain_keys() {
        assert_eq!(member_key("ab12"), "/cluster/ab12");
        assert_eq!(scaler_key("aws", "web"), "/scalers/aws/web");
        assert_eq!(healer_key("aws"), "/healers/aws");
        assert_eq!(scheduler_key("gcp", "nightly"), "/schedulers/gcp/nightly");
    }

    #[test_case("/cluster/ab12", CLUSTER_PREFIX, Some("ab12"); "member id")]
    #[test_case("/cluster/", CLUSTER_PREFIX, None; "bare prefix")]
    #[test_case("/healers/aws", CLUSTER_PREFIX, None; "other prefix")]
    fn test_strip_prefix(key: &str, prefix: &str, expected: Option<&str>) {
        assert_eq!(strip(key, prefix), expected);
    }
}
