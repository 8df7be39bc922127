//! Method-specific response validation.

use serde_json::Value;

/// The outcome of validating a JSON-RPC response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Validation {
    /// The response is acceptable.
    Valid,
    /// The client reported a SYNCING payload status.
    Syncing,
    /// The response is a failure.
    Invalid(String),
}

/// Validates a response body for the given method.
///
/// `engine_newPayload*` responses are judged by `result.status`;
/// `engine_forkchoiceUpdated*` by `result.payloadStatus.status`. Any other
/// method only needs a `result` field and no `error`.
pub(crate) fn validate_response(method: &str, body: &str) -> Validation {
    let parsed: Value = match serde_json::from_str(body) {
        Ok(parsed) => parsed,
        Err(e) => return Validation::Invalid(format!("unparseable response: {e}")),
    };

    if let Some(error) = parsed.get("error") {
        if !error.is_null() {
            return Validation::Invalid(format!("rpc error: {error}"));
        }
    }

    let status = if method.starts_with("engine_newPayload") {
        parsed.pointer("/result/status")
    } else if method.starts_with("engine_forkchoiceUpdated") {
        parsed.pointer("/result/payloadStatus/status")
    } else {
        return match parsed.get("result") {
            Some(_) => Validation::Valid,
            None => Validation::Invalid("response without result".into()),
        };
    };

    match status.and_then(Value::as_str) {
        Some("VALID") | Some("ACCEPTED") => Validation::Valid,
        Some("SYNCING") => Validation::Syncing,
        Some(other) => Validation::Invalid(format!("payload status {other}")),
        None => Validation::Invalid("response without payload status".into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_payload_statuses() {
        let body = |status: &str| format!(r#"{{"jsonrpc":"2.0","id":1,"result":{{"status":"{status}"}}}}"#);
        assert_eq!(validate_response("engine_newPayloadV3", &body("VALID")), Validation::Valid);
        assert_eq!(validate_response("engine_newPayloadV3", &body("ACCEPTED")), Validation::Valid);
        assert_eq!(validate_response("engine_newPayloadV3", &body("SYNCING")), Validation::Syncing);
        assert!(matches!(
            validate_response("engine_newPayloadV3", &body("INVALID")),
            Validation::Invalid(_)
        ));
    }

    #[test]
    fn fcu_status_is_nested_under_payload_status() {
        let body = r#"{"result":{"payloadStatus":{"status":"SYNCING"},"payloadId":null}}"#;
        assert_eq!(
            validate_response("engine_forkchoiceUpdatedV3", body),
            Validation::Syncing
        );
    }

    #[test]
    fn rpc_errors_are_invalid_for_any_method() {
        let body = r#"{"error":{"code":-32601,"message":"method not found"}}"#;
        assert!(matches!(
            validate_response("eth_getBlockByNumber", body),
            Validation::Invalid(_)
        ));
    }

    #[test]
    fn plain_methods_only_need_a_result() {
        assert_eq!(
            validate_response("eth_chainId", r#"{"result":"0x1"}"#),
            Validation::Valid
        );
        assert!(matches!(
            validate_response("eth_chainId", r#"{"jsonrpc":"2.0","id":1}"#),
            Validation::Invalid(_)
        ));
        assert!(matches!(
            validate_response("eth_chainId", "not json"),
            Validation::Invalid(_)
        ));
    }

    #[test]
    fn null_error_field_is_not_a_failure() {
        assert_eq!(
            validate_response("eth_chainId", r#"{"result":"0x1","error":null}"#),
            Validation::Valid
        );
    }
}
