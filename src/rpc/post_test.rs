//! Post-test RPC calls.
//!
//! Executed after the test step, untimed and outside the results. Params
//! strings support Go-template-style expansion of `{{.BlockHash}}`,
//! `{{.BlockNumber}}` (decimal) and `{{.BlockNumberHex}}`, recursing into
//! map and list values; non-string values pass through unchanged.

use super::client::{BlockRef, EngineClient};
use crate::{config::PostTestRpcCall, results::layout::RunWriter};
use serde_json::Value;
use tracing::warn;

/// Expands the block template variables in a params value.
pub(crate) fn expand_templates(value: &Value, block: &BlockRef) -> Value {
    match value {
        Value::String(text) => Value::String(
            text.replace("{{.BlockHash}}", &block.hash.to_string())
                .replace("{{.BlockNumber}}", &block.number.to_string())
                .replace("{{.BlockNumberHex}}", &block.number_hex),
        ),
        Value::Array(items) => {
            Value::Array(items.iter().map(|item| expand_templates(item, block)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), expand_templates(item, block)))
                .collect(),
        ),
        other => other.clone(),
    }
}

/// Runs the configured post-test calls against the block captured
/// immediately beforehand. Failures are logged and never affect results.
pub(crate) async fn run_post_test_calls(
    client: &EngineClient,
    calls: &[PostTestRpcCall],
    block: &BlockRef,
    writer: &RunWriter,
    test_name: &str,
) {
    for call in calls {
        let params = expand_templates(&call.params, block);
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": call.method,
            "params": params,
        });
        let request = match serde_json::to_string(&request) {
            Ok(request) => request,
            Err(e) => {
                warn!(target: "rpc", "post-test call {} not serialisable: {e}", call.method);
                continue;
            }
        };

        let outcome = match client.call_raw(&request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(target: "rpc", "post-test call {} failed: {e:#}", call.method);
                continue;
            }
        };

        if let Some(dump) = &call.dump {
            if let Err(e) = writer.write_post_test_dump(test_name, &dump.filename, &outcome.body) {
                warn!(target: "rpc", "post-test dump {} failed: {e:#}", dump.filename);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fsutil::FsWriter;
    use alloy_primitives::B256;

    fn block() -> BlockRef {
        BlockRef {
            number: 4660,
            number_hex: "0x1234".into(),
            hash: B256::from([0xab; 32]),
        }
    }

    #[test]
    fn expands_all_three_variables() {
        let block = block();
        let params = serde_json::json!([
            "{{.BlockNumberHex}}",
            {"tracer": "callTracer", "block": "{{.BlockNumber}}"},
            ["{{.BlockHash}}"],
            42,
            true
        ]);
        let expanded = expand_templates(&params, &block);
        assert_eq!(expanded[0], "0x1234");
        assert_eq!(expanded[1]["block"], "4660");
        assert_eq!(expanded[2][0], format!("0x{}", "ab".repeat(32)));
        // Non-string values are returned unchanged.
        assert_eq!(expanded[3], 42);
        assert_eq!(expanded[4], true);
    }

    #[test]
    fn expansion_is_a_noop_without_variables() {
        let params = serde_json::json!(["latest", {"depth": 3}]);
        assert_eq!(expand_templates(&params, &block()), params);
    }

    #[tokio::test]
    async fn dump_writes_one_file_per_configured_call() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/")
            .with_body(r#"{"jsonrpc":"2.0","id":1,"result":{"calls":[]}}"#)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let writer = RunWriter::new(dir.path().to_path_buf(), FsWriter::new(None)).unwrap();
        let client = EngineClient::new(url::Url::parse(&server.url()).unwrap(), vec![0x42; 32]).unwrap();

        let calls = vec![
            PostTestRpcCall {
                method: "debug_traceBlockByNumber".into(),
                params: serde_json::json!(["{{.BlockNumberHex}}", {"tracer": "callTracer"}]),
                dump: Some(crate::config::DumpConfig {
                    filename: "trace".into(),
                }),
            },
            // No dump configured: executed, nothing written.
            PostTestRpcCall {
                method: "eth_getBlockByNumber".into(),
                params: serde_json::json!(["{{.BlockNumberHex}}", false]),
                dump: None,
            },
        ];
        run_post_test_calls(&client, &calls, &block(), &writer, "001/a.txt").await;

        let dump_dir = dir.path().join("001/a.txt/post_test_rpc_calls");
        let files: Vec<_> = std::fs::read_dir(&dump_dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(files, vec!["trace.json"]);
    }
}
