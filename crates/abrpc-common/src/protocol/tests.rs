//! Tests for the protocol module
//!
//! These tests verify request/response construction, ID generation,
//! status classification and error classification.

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::json;
    use std::collections::HashSet;

    #[test]
    fn test_request_creation() {
        let req = Request::new("Echo", "ping", vec![json!("hi")]);
        assert_eq!(req.interface, "Echo");
        assert_eq!(req.method, "ping");
        assert_eq!(req.params, vec![json!("hi")]);
        assert_eq!(req.kind, MessageKind::Normal);
        assert!(req.timeout_ms.is_none());
        assert!(!req.id.is_empty());
    }

    #[test]
    fn test_request_with_timeout() {
        let req = Request::new("Echo", "ping", vec![]).with_timeout(5000);
        assert_eq!(req.timeout_ms, Some(5000));
    }

    #[test]
    fn test_request_with_param_types() {
        let req = Request::new("Calc", "add", vec![json!(1), json!(2)])
            .with_param_types(["i64", "i64"]);
        assert_eq!(req.param_types, vec!["i64".to_string(), "i64".to_string()]);
    }

    #[test]
    fn test_request_id_uniqueness() {
        let ids: HashSet<_> = (0..1000)
            .map(|_| Request::new("Echo", "ping", vec![]).id)
            .collect();
        assert_eq!(ids.len(), 1000, "All request IDs should be unique");
    }

    #[test]
    fn test_reissue_changes_only_the_id() {
        let original = Request::new("Echo", "ping", vec![json!(1)]).with_timeout(100);
        let reissued = original.reissue();
        assert_ne!(original.id, reissued.id);
        assert_eq!(original.interface, reissued.interface);
        assert_eq!(original.params, reissued.params);
        assert_eq!(original.timeout_ms, reissued.timeout_ms);
    }

    #[test]
    fn test_heartbeat_request_uses_reserved_prefix() {
        let hb = Request::heartbeat();
        assert!(hb.is_heartbeat());
        assert!(hb.id.starts_with(HEARTBEAT_ID_PREFIX));
        assert!(hb.params.is_empty());
    }

    #[test]
    fn test_response_success() {
        let resp = Response::success("r1", json!("pong"));
        assert!(resp.is_success());
        assert_eq!(resp.id, "r1");
        assert_eq!(resp.code, 200);
        assert_eq!(resp.result, Some(json!("pong")));
        assert!(resp.message.is_none());
    }

    #[test]
    fn test_response_error() {
        let resp = Response::error("r2", status::NOT_FOUND, "no such method");
        assert!(!resp.is_success());
        assert_eq!(resp.code, 404);
        assert_eq!(resp.message.as_deref(), Some("no such method"));
        assert!(resp.result.is_none());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(StatusClass::of(200), StatusClass::Success);
        for code in [400, 401, 403, 404, 405] {
            assert_eq!(StatusClass::of(code), StatusClass::Client, "code {}", code);
        }
        for code in [429, 500, 502, 503, 504, 599] {
            assert_eq!(StatusClass::of(code), StatusClass::Transient, "code {}", code);
        }
        assert_eq!(StatusClass::of(302), StatusClass::Other);
    }

    #[test]
    fn test_serialization_roundtrip() {
        let req = Request::new("Echo", "echo", vec![json!({"x": 1})]);
        let serialized = serde_json::to_value(&req).unwrap();
        let deserialized: Request = serde_json::from_value(serialized).unwrap();
        assert_eq!(req, deserialized);
    }

    #[test]
    fn test_response_deserializes_with_missing_optional_fields() {
        let resp: Response = serde_json::from_value(json!({"id": "r9", "code": 503})).unwrap();
        assert_eq!(resp.code, 503);
        assert_eq!(resp.kind, MessageKind::Normal);
        assert!(resp.result.is_none());
    }

    #[test]
    fn test_message_accessors() {
        let msg: Message = Response::heartbeat("hb").into();
        assert!(msg.is_heartbeat());
        assert_eq!(msg.id(), "hb");

        let msg: Message = Request::new("Echo", "ping", vec![]).with_id("r1").into();
        assert!(!msg.is_heartbeat());
        assert_eq!(msg.id(), "r1");
    }

    // ========================================================================
    // Error Classification
    // ========================================================================

    #[test]
    fn test_transient_errors() {
        assert!(AbrpcError::Connection("refused".into()).is_transient());
        assert!(AbrpcError::Unavailable("down".into()).is_transient());
        assert!(AbrpcError::Closed("gone".into()).is_transient());
        assert!(AbrpcError::Timeout { request_id: "r1".into(), timeout_ms: 5000 }.is_transient());
        assert!(AbrpcError::Remote { code: 503, message: String::new() }.is_transient());
        assert!(AbrpcError::Remote { code: 429, message: String::new() }.is_transient());
    }

    #[test]
    fn test_permanent_errors() {
        for code in [400, 401, 403, 404, 405] {
            assert!(!AbrpcError::Remote { code, message: String::new() }.is_transient());
        }
        assert!(!AbrpcError::CircuitOpen("Echo".into()).is_transient());
        assert!(!AbrpcError::Cancelled("r1".into()).is_transient());
        assert!(!AbrpcError::InvalidRequest("bad".into()).is_transient());
    }

    #[test]
    fn test_remote_code_through_retries_exhausted() {
        let err = AbrpcError::RetriesExhausted {
            attempts: 4,
            source: Box::new(AbrpcError::Remote { code: 429, message: "slow down".into() }),
        };
        assert_eq!(err.remote_code(), Some(429));
        assert!(err.is_too_many_requests());
        assert!(!err.is_transient());
    }

    // ========================================================================
    // Request ID Stress Tests
    // ========================================================================

    #[test]
    fn test_request_id_uniqueness_under_stress() {
        use std::sync::{Arc, Mutex};
        use std::thread;

        let ids = Arc::new(Mutex::new(HashSet::new()));
        let mut handles = vec![];

        for _ in 0..10 {
            let ids = Arc::clone(&ids);
            handles.push(thread::spawn(move || {
                let local: Vec<_> = (0..1000).map(|_| generate_request_id()).collect();
                ids.lock().unwrap().extend(local);
            }));
        }

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(ids.lock().unwrap().len(), 10_000);
    }
}
