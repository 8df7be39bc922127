//! The step executor: drives a client through the ordered request lines of
//! one step, measuring server time and host-resource deltas per call.

use super::{
    client::{CallOutcome, EngineClient},
    validate::{validate_response, Validation},
};
use crate::{
    config::RetryConfig,
    container::stats::{StatsReader, StatsSample},
    results::stats::CallRecord,
    source::{StepFile, StepSource},
};
use alloy_primitives::B256;
use color_eyre::Result;
use serde_json::Value;
use std::{str::FromStr, sync::Arc, time::Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Engine payload lines can be tens of MB; size the reader accordingly.
const LINE_BUFFER_CAPACITY: usize = 1 << 20;

/// Receives the hash of every block submitted via `engine_newPayload*`,
/// before the call is issued. External capability for block-log
/// correlation.
pub(crate) trait BlockLogCollector: Send + Sync {
    /// Called with the payload's block hash before submission.
    fn block_submitted(&self, block_hash: B256);
}

/// The outcome of one executed step.
#[derive(Debug, Clone, Default)]
pub(crate) struct StepOutcome {
    /// Per-call records, in call order.
    pub(crate) calls: Vec<CallRecord>,
    /// Raw response bodies, in call order (empty string when the call
    /// produced none).
    pub(crate) responses: Vec<String>,
    /// Step wall time, nanoseconds.
    pub(crate) wall_time_ns: u64,
    /// Whether the step was aborted by cancellation.
    pub(crate) cancelled: bool,
}

/// Drives steps against one client instance.
pub(crate) struct StepExecutor {
    client: EngineClient,
    stats: Option<Arc<dyn StatsReader>>,
    retry: RetryConfig,
    block_log: Option<Arc<dyn BlockLogCollector>>,
    cancel: CancellationToken,
}

impl StepExecutor {
    /// Creates an executor.
    pub(crate) fn new(
        client: EngineClient,
        stats: Option<Arc<dyn StatsReader>>,
        retry: RetryConfig,
        block_log: Option<Arc<dyn BlockLogCollector>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            client,
            stats,
            retry,
            block_log,
            cancel,
        }
    }

    /// Runs one step: every non-empty line is issued in order; a
    /// cancellation aborts between calls.
    pub(crate) async fn run_step(&self, step: &StepFile) -> Result<StepOutcome> {
        let mut outcome = StepOutcome::default();
        let started = Instant::now();
        let mut lines = LineSource::open(&step.source).await?;

        while let Some(line) = lines.next_line().await? {
            if self.cancel.is_cancelled() {
                debug!(target: "rpc", "step {} cancelled", step.name);
                outcome.cancelled = true;
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let (record, response) = self.execute_line(trimmed).await;
            outcome.calls.push(record);
            outcome.responses.push(response);
        }

        outcome.wall_time_ns = started.elapsed().as_nanos() as u64;
        Ok(outcome)
    }

    /// Executes one request line.
    async fn execute_line(&self, line: &str) -> (CallRecord, String) {
        // Unparseable lines are failures, not step aborts.
        let Ok(request) = serde_json::from_str::<Value>(line) else {
            return (failure_record("unknown", "unparseable request line"), String::new());
        };
        let Some(method) = request.get("method").and_then(Value::as_str).map(String::from) else {
            return (failure_record("unknown", "request without method"), String::new());
        };

        let is_new_payload = method.starts_with("engine_newPayload");
        if is_new_payload {
            if let Some(collector) = &self.block_log {
                if let Some(hash) = request
                    .pointer("/params/0/blockHash")
                    .and_then(Value::as_str)
                    .and_then(|hash| B256::from_str(hash).ok())
                {
                    collector.block_submitted(hash);
                }
            }
        }

        let before = self.read_stats().await;
        let (result, error, validated) = self.issue_with_retries(&method, line, is_new_payload).await;
        let after = self.read_stats().await;

        let mut record = match &result {
            Some(outcome) => CallRecord {
                method: method.clone(),
                server_time_ns: outcome.server_time_ns,
                full_duration_ns: outcome.full_duration_ns,
                succeeded: validated,
                error,
                gas_used: None,
                mgas_per_sec: None,
                resources: None,
            },
            None => failure_record(&method, error.as_deref().unwrap_or("transport failure")),
        };
        if let (Some(before), Some(after)) = (before, after) {
            record.resources = Some(StatsSample::delta(before, after));
        }

        if record.succeeded && is_new_payload {
            if let Some(gas) = request
                .pointer("/params/0/gasUsed")
                .and_then(Value::as_str)
                .and_then(|hex| u64::from_str_radix(hex.trim_start_matches("0x"), 16).ok())
            {
                record.gas_used = Some(gas);
                if gas > 0 && record.server_time_ns > 0 {
                    record.mgas_per_sec =
                        Some(gas as f64 * 1_000.0 / record.server_time_ns as f64);
                }
            }
        }

        let response = result.map(|outcome| outcome.body).unwrap_or_default();
        (record, response)
    }

    /// Issues the exact request bytes, retrying SYNCING `engine_newPayload*`
    /// responses with constant backoff. The returned outcome is that of the
    /// final attempt.
    async fn issue_with_retries(
        &self,
        method: &str,
        line: &str,
        is_new_payload: bool,
    ) -> (Option<CallOutcome>, Option<String>, bool) {
        let retries = if is_new_payload && self.retry.enabled {
            self.retry.max_retries
        } else {
            0
        };

        let mut attempt = 0;
        loop {
            let outcome = match self.client.call_raw(line).await {
                Ok(outcome) => outcome,
                Err(e) => return (None, Some(format!("{e:#}")), false),
            };

            match validate_response(method, &outcome.body) {
                Validation::Valid => return (Some(outcome), None, true),
                Validation::Invalid(reason) => return (Some(outcome), Some(reason), false),
                Validation::Syncing => {
                    if attempt >= retries || self.cancel.is_cancelled() {
                        return (Some(outcome), Some("payload status SYNCING".into()), false);
                    }
                    attempt += 1;
                    debug!(target: "rpc", "{method} SYNCING, retry {attempt}/{retries}");
                    tokio::select! {
                        _ = tokio::time::sleep(self.retry.backoff) => {}
                        _ = self.cancel.cancelled() => {}
                    }
                }
            }
        }
    }

    async fn read_stats(&self) -> Option<StatsSample> {
        let reader = self.stats.as_ref()?;
        match reader.read().await {
            Ok(sample) => Some(sample),
            Err(e) => {
                warn!(target: "rpc", "stats read failed: {e:#}");
                None
            }
        }
    }
}

fn failure_record(method: &str, error: &str) -> CallRecord {
    CallRecord {
        method: method.into(),
        server_time_ns: 0,
        full_duration_ns: 0,
        succeeded: false,
        error: Some(error.into()),
        gas_used: None,
        mgas_per_sec: None,
        resources: None,
    }
}

/// An ordered source of request lines, file-backed or in-memory.
enum LineSource {
    File(BufReader<tokio::fs::File>),
    Inline(std::vec::IntoIter<String>),
}

impl LineSource {
    async fn open(source: &StepSource) -> Result<Self> {
        Ok(match source {
            StepSource::File(path) => Self::File(BufReader::with_capacity(
                LINE_BUFFER_CAPACITY,
                tokio::fs::File::open(path).await?,
            )),
            StepSource::Inline(lines) => Self::Inline(lines.clone().into_iter()),
        })
    }

    async fn next_line(&mut self) -> Result<Option<String>> {
        match self {
            Self::File(reader) => {
                let mut line = String::new();
                let read = reader.read_line(&mut line).await?;
                Ok((read > 0).then_some(line))
            }
            Self::Inline(lines) => Ok(lines.next()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, routing::post, Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use url::Url;

    /// Serves scripted JSON-RPC responses, one per request, repeating the
    /// last one once the script is exhausted.
    async fn scripted_server(responses: Vec<Value>) -> (Url, Arc<AtomicUsize>) {
        let hits = Arc::new(AtomicUsize::new(0));
        let state = (Arc::new(responses), hits.clone());

        let app = Router::new().route(
            "/",
            post(
                |State((responses, hits)): State<(Arc<Vec<Value>>, Arc<AtomicUsize>)>,
                 _body: String| async move {
                    let index = hits.fetch_add(1, Ordering::SeqCst).min(responses.len() - 1);
                    Json(responses[index].clone())
                },
            ),
        )
        .with_state(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
        (Url::parse(&format!("http://{addr}/")).unwrap(), hits)
    }

    fn executor(url: Url, retry: RetryConfig) -> StepExecutor {
        let client = EngineClient::new(url, vec![0x42; 32]).unwrap();
        StepExecutor::new(client, None, retry, None, CancellationToken::new())
    }

    fn payload_line(gas_hex: &str) -> String {
        format!(
            r#"{{"jsonrpc":"2.0","id":1,"method":"engine_newPayloadV3","params":[{{"blockHash":"0x{}","gasUsed":"{gas_hex}"}},[],"0x{}"]}}"#,
            "22".repeat(32),
            "00".repeat(32)
        )
    }

    fn valid() -> Value {
        serde_json::json!({"jsonrpc":"2.0","id":1,"result":{"status":"VALID"}})
    }

    fn syncing() -> Value {
        serde_json::json!({"jsonrpc":"2.0","id":1,"result":{"status":"SYNCING"}})
    }

    #[tokio::test]
    async fn step_records_gas_and_mgas_for_valid_payloads() {
        let (url, _) = scripted_server(vec![valid()]).await;
        let executor = executor(url, RetryConfig::default());

        let step = StepFile::from_lines("test", vec![payload_line("0x989680")]);
        let outcome = executor.run_step(&step).await.unwrap();

        assert_eq!(outcome.calls.len(), 1);
        let call = &outcome.calls[0];
        assert!(call.succeeded);
        assert_eq!(call.gas_used, Some(10_000_000));
        assert!(call.mgas_per_sec.unwrap() > 0.0);
        assert!(call.server_time_ns > 0);
        assert_eq!(outcome.responses.len(), 1);
        assert!(outcome.responses[0].contains("VALID"));
        assert!(!outcome.cancelled);
    }

    #[tokio::test]
    async fn unparseable_lines_fail_without_stopping_the_step() {
        let (url, _) = scripted_server(vec![valid()]).await;
        let executor = executor(url, RetryConfig::default());

        let step = StepFile::from_lines(
            "test",
            vec![
                "this is not json".into(),
                "".into(),
                payload_line("0x0"),
            ],
        );
        let outcome = executor.run_step(&step).await.unwrap();

        // The empty line is skipped entirely.
        assert_eq!(outcome.calls.len(), 2);
        assert_eq!(outcome.calls[0].method, "unknown");
        assert!(!outcome.calls[0].succeeded);
        assert!(outcome.calls[1].succeeded);
        // Zero gas yields no MGas/s sample.
        assert_eq!(outcome.calls[1].gas_used, Some(0));
        assert!(outcome.calls[1].mgas_per_sec.is_none());
    }

    #[tokio::test]
    async fn syncing_retries_until_valid() {
        let (url, hits) = scripted_server(vec![syncing(), syncing(), valid()]).await;
        let executor = executor(
            url,
            RetryConfig {
                enabled: true,
                max_retries: 3,
                backoff: std::time::Duration::from_millis(10),
            },
        );

        let step = StepFile::from_lines("test", vec![payload_line("0x989680")]);
        let outcome = executor.run_step(&step).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        assert_eq!(outcome.calls.len(), 1);
        assert!(outcome.calls[0].succeeded);
        assert!(outcome.calls[0].error.is_none());
    }

    #[tokio::test]
    async fn syncing_exhausts_retries_into_failure() {
        let (url, hits) = scripted_server(vec![syncing()]).await;
        let executor = executor(
            url,
            RetryConfig {
                enabled: true,
                max_retries: 2,
                backoff: std::time::Duration::from_millis(1),
            },
        );

        let step = StepFile::from_lines("test", vec![payload_line("0x1")]);
        let outcome = executor.run_step(&step).await.unwrap();

        assert_eq!(hits.load(Ordering::SeqCst), 3);
        let call = &outcome.calls[0];
        assert!(!call.succeeded);
        assert_eq!(call.error.as_deref(), Some("payload status SYNCING"));
        assert!(call.gas_used.is_none());
    }

    #[tokio::test]
    async fn syncing_without_retry_config_fails_immediately() {
        let (url, hits) = scripted_server(vec![syncing()]).await;
        let executor = executor(url, RetryConfig::default());

        let step = StepFile::from_lines("test", vec![payload_line("0x1")]);
        let outcome = executor.run_step(&step).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(!outcome.calls[0].succeeded);
    }

    #[tokio::test]
    async fn cancellation_aborts_between_calls() {
        let (url, _) = scripted_server(vec![valid()]).await;
        let client = EngineClient::new(url, vec![0x42; 32]).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let executor = StepExecutor::new(client, None, RetryConfig::default(), None, cancel);

        let step = StepFile::from_lines("test", vec![payload_line("0x1")]);
        let outcome = executor.run_step(&step).await.unwrap();
        assert!(outcome.cancelled);
        assert!(outcome.calls.is_empty());
    }

    #[tokio::test]
    async fn block_hashes_are_published_before_the_call() {
        #[derive(Default)]
        struct Recorder(std::sync::Mutex<Vec<B256>>);
        impl BlockLogCollector for Recorder {
            fn block_submitted(&self, block_hash: B256) {
                self.0.lock().unwrap().push(block_hash);
            }
        }

        let (url, _) = scripted_server(vec![valid()]).await;
        let client = EngineClient::new(url, vec![0x42; 32]).unwrap();
        let recorder = Arc::new(Recorder::default());
        let executor = StepExecutor::new(
            client,
            None,
            RetryConfig::default(),
            Some(recorder.clone() as Arc<dyn BlockLogCollector>),
            CancellationToken::new(),
        );

        let step = StepFile::from_lines("test", vec![payload_line("0x1")]);
        executor.run_step(&step).await.unwrap();
        assert_eq!(recorder.0.lock().unwrap().as_slice(), &[B256::from([0x22; 32])]);
    }

    #[tokio::test]
    async fn file_backed_steps_read_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("step.txt");
        std::fs::write(
            &path,
            format!(
                "{}\n\n{}\n",
                r#"{"jsonrpc":"2.0","id":1,"method":"eth_chainId","params":[]}"#,
                payload_line("0x1")
            ),
        )
        .unwrap();

        let (url, _) = scripted_server(vec![
            serde_json::json!({"jsonrpc":"2.0","id":1,"result":"0x1"}),
            valid(),
        ])
        .await;
        let executor = executor(url, RetryConfig::default());
        let outcome = executor
            .run_step(&StepFile::from_file("step", path))
            .await
            .unwrap();

        assert_eq!(outcome.calls.len(), 2);
        assert_eq!(outcome.calls[0].method, "eth_chainId");
        assert_eq!(outcome.calls[1].method, "engine_newPayloadV3");
    }
}
