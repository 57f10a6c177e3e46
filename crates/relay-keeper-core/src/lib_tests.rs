//! Tests for the core identity and time types.

use super::*;

mod identity_tests {
    use super::*;

    #[test]
    fn test_valid_identity() {
        let identity = Identity::new("campaign-7:lead-42").unwrap();
        assert_eq!(identity.as_str(), "campaign-7:lead-42");
        assert_eq!(identity.to_string(), "campaign-7:lead-42");
    }

    #[test]
    fn test_empty_identity_rejected() {
        assert!(matches!(
            Identity::new(""),
            Err(ValidationError::Required { .. })
        ));
        assert!(matches!(
            Identity::new("   "),
            Err(ValidationError::Required { .. })
        ));
    }

    #[test]
    fn test_long_identity_rejected() {
        let result = Identity::new("x".repeat(MAX_IDENTITY_LENGTH + 1));
        assert!(matches!(result, Err(ValidationError::TooLong { .. })));

        assert!(Identity::new("x".repeat(MAX_IDENTITY_LENGTH)).is_ok());
    }

    #[test]
    fn test_control_characters_rejected() {
        let result = Identity::new("lead-1\nlead-2");
        assert!(matches!(
            result,
            Err(ValidationError::InvalidCharacters { .. })
        ));
    }

    /// Verify parts are joined in order and empty parts cannot collide.
    #[test]
    fn test_from_parts() {
        let identity = Identity::from_parts(["spring", "lead-42", "+31612345678"]).unwrap();
        assert_eq!(identity.as_str(), "spring:lead-42:+31612345678");

        let result = Identity::from_parts(["spring", "", "lead-42"]);
        assert!(matches!(result, Err(ValidationError::InvalidFormat { .. })));
    }

    #[test]
    fn test_from_str() {
        let identity: Identity = "lead-1".parse().unwrap();
        assert_eq!(identity, Identity::new("lead-1").unwrap());
    }

    #[test]
    fn test_serde_roundtrip_is_plain_string() {
        let identity = Identity::new("lead-1").unwrap();
        let json = serde_json::to_string(&identity).unwrap();
        assert_eq!(json, "\"lead-1\"");
    }
}

mod timestamp_tests {
    use super::*;

    #[test]
    fn test_duration_arithmetic() {
        let start = Timestamp::now();
        let later = start.add_duration(Duration::from_secs(90));

        assert_eq!(later.duration_since(start), Duration::from_secs(90));
        assert_eq!(later.subtract_duration(Duration::from_secs(90)), start);
    }

    #[test]
    fn test_duration_since_later_is_zero() {
        let start = Timestamp::now();
        let later = start.add_duration(Duration::from_secs(5));

        assert_eq!(start.duration_since(later), Duration::ZERO);
    }

    #[test]
    fn test_display_is_rfc3339() {
        let timestamp = Timestamp::from(
            chrono::DateTime::parse_from_rfc3339("2024-03-01T12:00:00Z")
                .unwrap()
                .with_timezone(&chrono::Utc),
        );
        assert_eq!(timestamp.to_string(), "2024-03-01T12:00:00+00:00");
    }
}
