use super::*;

use serde_json::json;

#[test]
fn rejected_envelope_becomes_business_error() {
    let err = print_envelope(Envelope::<Value>::rejected("record missing")).unwrap_err();
    assert!(matches!(err, CliError::Api(ApiError::Business(ref m)) if m == "record missing"));
    assert_eq!(err.to_string(), "record missing");
}

#[test]
fn rejected_envelope_without_text_uses_fallback() {
    let bare = Envelope::<Value> { status: 0, data: None, error: None, message: None };
    let err = print_envelope(bare).unwrap_err();
    assert_eq!(err.to_string(), "request failed");
}

#[test]
fn success_envelope_prints() {
    assert!(print_envelope(Envelope::ok(json!({"id": 9}))).is_ok());
    let empty = Envelope::<Value> { status: 1, data: None, error: None, message: Some("saved".to_owned()) };
    assert!(print_envelope(empty).is_ok());
}
