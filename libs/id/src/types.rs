//! Identifier types used across the eventing coordinator.

use crate::define_id;

define_id!(
    /// Identifies one event record. Generated when the event is staged and
    /// carried unchanged when the record is forwarded to another node, so
    /// downstream targets can de-duplicate on it.
    EventId,
    "evt"
);

define_id!(
    /// Correlates an inbound HTTP request with the log lines it produces.
    RequestId,
    "req"
);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::IdError;
    use proptest::prelude::*;

    #[test]
    fn event_id_has_prefix() {
        assert!(EventId::new().to_string().starts_with("evt_"));
    }

    #[test]
    fn event_id_rejects_request_prefix() {
        let err = EventId::parse(&RequestId::new().to_string()).unwrap_err();
        assert!(err.is_prefix_error());
    }

    #[test]
    fn parse_errors() {
        assert_eq!(EventId::parse(""), Err(IdError::Empty));
        assert_eq!(
            EventId::parse("evt01HV4Z2WQXKJNM8GPQY6VBKC3D"),
            Err(IdError::MissingSeparator)
        );
        assert!(matches!(
            EventId::parse("evt_nope"),
            Err(IdError::InvalidUlid(_))
        ));
    }

    #[test]
    fn serializes_as_string() {
        let id = EventId::parse("evt_01HV4Z2WQXKJNM8GPQY6VBKC3D").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"evt_01HV4Z2WQXKJNM8GPQY6VBKC3D\"");
        let back: EventId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn ids_sort_by_creation_time() {
        let first = EventId::new();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = EventId::new();
        assert!(first < second);
    }

    proptest! {
        #[test]
        fn parse_never_panics(s in ".{0,40}") {
            let _ = EventId::parse(&s);
        }
    }
}
