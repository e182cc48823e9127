//! Typed ID definitions for controller resources.

use crate::macros::define_id;

// =============================================================================
// Tenancy
// =============================================================================

define_id!(
    /// Project a device belongs to.
    ProjectId,
    "project id"
);

// =============================================================================
// Devices
// =============================================================================

define_id!(
    /// Device identifier issued at registration.
    DeviceId,
    "device id"
);

// =============================================================================
// Applications
// =============================================================================

define_id!(
    /// Application identifier.
    ApplicationId,
    "application id"
);

define_id!(
    /// Name of a service within an application release.
    ///
    /// Service names are the keys of a release's service config map and are
    /// unique only within one application.
    ServiceName,
    "service name"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn test_application_id_display_is_verbatim() {
        let id: ApplicationId = "app_1d2FQKz9wBcd".parse().unwrap();
        assert_eq!(id.to_string(), "app_1d2FQKz9wBcd");
        assert_eq!(id.as_str(), "app_1d2FQKz9wBcd");
    }

    #[test]
    fn test_empty_id_rejected() {
        let result: Result<DeviceId, _> = "".parse();
        assert!(matches!(
            result.unwrap_err(),
            IdError::Empty { kind: "device id" }
        ));
    }

    #[test]
    fn test_path_separator_rejected() {
        let result: Result<ServiceName, _> = "web/../admin".parse();
        assert!(matches!(
            result.unwrap_err(),
            IdError::InvalidCharacter { ch: '/', .. }
        ));
    }

    #[test]
    fn test_query_and_whitespace_rejected() {
        assert!(ApplicationId::parse("app?x=1").is_err());
        assert!(ApplicationId::parse("app 1").is_err());
        assert!(ApplicationId::parse("app#frag").is_err());
        assert!(ApplicationId::parse("app%2F").is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: ProjectId = serde_json::from_str("\"prj_123\"").unwrap();
        assert_eq!(ok.as_str(), "prj_123");

        let err = serde_json::from_str::<ProjectId>("\"\"").unwrap_err();
        assert!(err.to_string().contains("project id cannot be empty"));
    }

    #[test]
    fn test_borrow_allows_str_lookup() {
        let mut set = std::collections::BTreeSet::new();
        set.insert(ServiceName::parse("svcA").unwrap());
        assert!(set.contains("svcA"));
        assert!(!set.contains("svcB"));
    }

    proptest! {
        #[test]
        fn prop_segment_safe_strings_parse(s in "[A-Za-z0-9_.:-]{1,40}") {
            let id = ApplicationId::parse(s.clone()).unwrap();
            prop_assert_eq!(id.as_str(), s.as_str());
        }

        #[test]
        fn prop_strings_with_slash_rejected(a in "[a-z]{0,8}", b in "[a-z]{0,8}") {
            let s = format!("{a}/{b}");
            prop_assert!(ServiceName::parse(s).is_err());
        }
    }
}
