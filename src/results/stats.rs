//! Per-call records and statistic aggregation.
//!
//! All duration statistics are integer nanoseconds; MGas/s statistics are
//! floats. Percentiles use nearest-rank on the sorted vector:
//! `idx = clamp(floor(p * n / 100), 0, n - 1)`.

use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, ops::AddAssign};

/// Per-RPC host-resource usage, computed as `after - before` around a
/// single call. Also used as the summed per-step/per-method totals.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct ResourceDelta {
    /// Bytes read from disk.
    pub(crate) disk_read_bytes: u64,
    /// Bytes written to disk.
    pub(crate) disk_write_bytes: u64,
    /// Disk read operations.
    pub(crate) disk_read_ops: u64,
    /// Disk write operations.
    pub(crate) disk_write_ops: u64,
    /// Microseconds of CPU consumed.
    pub(crate) cpu_usec: u64,
    /// Signed memory delta, bytes.
    pub(crate) memory_delta_bytes: i64,
}

impl AddAssign for ResourceDelta {
    fn add_assign(&mut self, rhs: Self) {
        self.disk_read_bytes += rhs.disk_read_bytes;
        self.disk_write_bytes += rhs.disk_write_bytes;
        self.disk_read_ops += rhs.disk_read_ops;
        self.disk_write_ops += rhs.disk_write_ops;
        self.cpu_usec += rhs.cpu_usec;
        self.memory_delta_bytes += rhs.memory_delta_bytes;
    }
}

/// One measured RPC call, as persisted in `*.result-details.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct CallRecord {
    /// The JSON-RPC method (`"unknown"` for unparseable lines).
    pub(crate) method: String,
    /// Server time: request dispatch to last response byte, nanoseconds.
    pub(crate) server_time_ns: u64,
    /// Full duration: request assembly to last response byte, nanoseconds.
    pub(crate) full_duration_ns: u64,
    /// Whether the call succeeded (transport and validation).
    pub(crate) succeeded: bool,
    /// The failure reason, when the call failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) error: Option<String>,
    /// Gas used by the payload, for successful `engine_newPayload*` calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) gas_used: Option<u64>,
    /// Millions of gas per second of server time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) mgas_per_sec: Option<f64>,
    /// The host-resource delta observed around the call.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) resources: Option<ResourceDelta>,
}

/// Integer (nanosecond) statistics over an ordered vector of observations.
///
/// With a single observation only `count` and `last` are emitted.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct DurationStats {
    /// The number of observations.
    pub(crate) count: u64,
    /// The minimum.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) min: Option<u64>,
    /// The maximum.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) max: Option<u64>,
    /// The arithmetic mean.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) mean: Option<u64>,
    /// The 50th percentile (nearest-rank).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) p50: Option<u64>,
    /// The 95th percentile (nearest-rank).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) p95: Option<u64>,
    /// The 99th percentile (nearest-rank).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) p99: Option<u64>,
    /// The last observation.
    pub(crate) last: u64,
}

impl DurationStats {
    /// Aggregates an ordered vector of observations.
    pub(crate) fn from_values(values: &[u64]) -> Option<Self> {
        let count = values.len() as u64;
        let last = *values.last()?;
        if count == 1 {
            return Some(Self {
                count,
                min: None,
                max: None,
                mean: None,
                p50: None,
                p95: None,
                p99: None,
                last,
            });
        }

        let mut sorted = values.to_vec();
        sorted.sort_unstable();
        let sum: u64 = sorted.iter().sum();
        Some(Self {
            count,
            min: sorted.first().copied(),
            max: sorted.last().copied(),
            mean: Some(sum / count),
            p50: Some(percentile(&sorted, 50)),
            p95: Some(percentile(&sorted, 95)),
            p99: Some(percentile(&sorted, 99)),
            last,
        })
    }
}

/// Float (MGas/s) statistics over an ordered vector of observations.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub(crate) struct FloatStats {
    /// The number of observations.
    pub(crate) count: u64,
    /// The minimum.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) min: Option<f64>,
    /// The maximum.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) max: Option<f64>,
    /// The arithmetic mean.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) mean: Option<f64>,
    /// The 50th percentile (nearest-rank).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) p50: Option<f64>,
    /// The 95th percentile (nearest-rank).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) p95: Option<f64>,
    /// The 99th percentile (nearest-rank).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) p99: Option<f64>,
    /// The last observation.
    pub(crate) last: f64,
}

impl FloatStats {
    /// Aggregates an ordered vector of observations.
    pub(crate) fn from_values(values: &[f64]) -> Option<Self> {
        let count = values.len() as u64;
        let last = *values.last()?;
        if count == 1 {
            return Some(Self {
                count,
                min: None,
                max: None,
                mean: None,
                p50: None,
                p95: None,
                p99: None,
                last,
            });
        }

        let mut sorted = values.to_vec();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let sum: f64 = sorted.iter().sum();
        Some(Self {
            count,
            min: sorted.first().copied(),
            max: sorted.last().copied(),
            mean: Some(sum / count as f64),
            p50: Some(percentile(&sorted, 50)),
            p95: Some(percentile(&sorted, 95)),
            p99: Some(percentile(&sorted, 99)),
            last,
        })
    }
}

/// Nearest-rank percentile over a sorted slice.
fn percentile<T: Copy>(sorted: &[T], p: usize) -> T {
    let n = sorted.len();
    let idx = (p * n / 100).min(n - 1);
    sorted[idx]
}

/// Per-method statistic breakdown.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct MethodStats {
    /// Server-time statistics per method.
    pub(crate) times: BTreeMap<String, DurationStats>,
    /// MGas/s statistics per method; only `engine_newPayload*` methods
    /// produce samples.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) mgas_s: BTreeMap<String, FloatStats>,
    /// Summed resource deltas per method.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub(crate) resources: BTreeMap<String, ResourceDelta>,
}

/// Aggregated statistics of one step, as persisted in
/// `*.result-aggregated.json`.
#[derive(Default, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct AggregatedStats {
    /// Total wall time of the step, nanoseconds.
    pub(crate) wall_time_ns: u64,
    /// Number of successful calls.
    pub(crate) succeeded: u64,
    /// Number of failed calls.
    pub(crate) failed: u64,
    /// Total gas across successful payloads.
    pub(crate) gas_used_total: u64,
    /// Total server time across calls with `gas_used > 0`, nanoseconds.
    pub(crate) gas_used_time_total_ns: u64,
    /// Summed resource deltas across all calls.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub(crate) resources: Option<ResourceDelta>,
    /// Per-method breakdown.
    pub(crate) method_stats: MethodStats,
}

/// Aggregates the call records of one step.
pub(crate) fn aggregate(calls: &[CallRecord], wall_time_ns: u64) -> AggregatedStats {
    let mut stats = AggregatedStats {
        wall_time_ns,
        ..Default::default()
    };

    let mut times: BTreeMap<&str, Vec<u64>> = BTreeMap::new();
    let mut mgas: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    let mut resources: BTreeMap<&str, ResourceDelta> = BTreeMap::new();
    let mut totals: Option<ResourceDelta> = None;

    for call in calls {
        if call.succeeded {
            stats.succeeded += 1;
        } else {
            stats.failed += 1;
        }
        if let Some(gas) = call.gas_used {
            if gas > 0 {
                stats.gas_used_total += gas;
                stats.gas_used_time_total_ns += call.server_time_ns;
            }
        }

        times.entry(&call.method).or_default().push(call.server_time_ns);
        if let Some(rate) = call.mgas_per_sec {
            mgas.entry(&call.method).or_default().push(rate);
        }
        if let Some(delta) = call.resources {
            *resources.entry(&call.method).or_default() += delta;
            *totals.get_or_insert_with(Default::default) += delta;
        }
    }

    stats.resources = totals;
    stats.method_stats.times = times
        .into_iter()
        .filter_map(|(method, values)| {
            DurationStats::from_values(&values).map(|s| (method.to_string(), s))
        })
        .collect();
    stats.method_stats.mgas_s = mgas
        .into_iter()
        .filter_map(|(method, values)| {
            FloatStats::from_values(&values).map(|s| (method.to_string(), s))
        })
        .collect();
    stats.method_stats.resources = resources
        .into_iter()
        .map(|(method, delta)| (method.to_string(), delta))
        .collect();

    stats
}

#[cfg(test)]
mod tests {
    use super::*;

    fn call(method: &str, server_time_ns: u64, succeeded: bool, gas: Option<u64>) -> CallRecord {
        CallRecord {
            method: method.into(),
            server_time_ns,
            full_duration_ns: server_time_ns + 1_000,
            succeeded,
            error: (!succeeded).then(|| "boom".into()),
            gas_used: gas,
            mgas_per_sec: gas
                .filter(|g| *g > 0 && server_time_ns > 0)
                .map(|g| g as f64 * 1_000.0 / server_time_ns as f64),
            resources: Some(ResourceDelta {
                disk_read_bytes: 10,
                cpu_usec: 5,
                memory_delta_bytes: -1,
                ..Default::default()
            }),
        }
    }

    #[test]
    fn percentiles_match_nearest_rank() {
        let stats = DurationStats::from_values(&[100, 200, 300, 400, 500]).unwrap();
        assert_eq!(stats.count, 5);
        assert_eq!(stats.min, Some(100));
        assert_eq!(stats.max, Some(500));
        assert_eq!(stats.mean, Some(300));
        assert_eq!(stats.p50, Some(300));
        assert_eq!(stats.p95, Some(500));
        assert_eq!(stats.p99, Some(500));
        assert_eq!(stats.last, 500);
    }

    #[test]
    fn percentiles_are_order_independent_but_last_is_not() {
        let stats = DurationStats::from_values(&[500, 100, 300, 200, 400]).unwrap();
        assert_eq!(stats.p50, Some(300));
        assert_eq!(stats.last, 400);
    }

    #[test]
    fn stats_are_monotonic() {
        let values: Vec<u64> = (0..97).map(|i| (i * 37) % 1000 + 1).collect();
        let stats = DurationStats::from_values(&values).unwrap();
        let (min, p50, p95, p99, max) = (
            stats.min.unwrap(),
            stats.p50.unwrap(),
            stats.p95.unwrap(),
            stats.p99.unwrap(),
            stats.max.unwrap(),
        );
        assert!(min <= p50 && p50 <= p95 && p95 <= p99 && p99 <= max);
        let mean = stats.mean.unwrap();
        assert!((min..=max).contains(&mean));
        assert_eq!(stats.count, 97);
    }

    #[test]
    fn single_observation_serialises_count_and_last_only() {
        let stats = DurationStats::from_values(&[42]).unwrap();
        let json = serde_json::to_value(stats).unwrap();
        assert_eq!(json, serde_json::json!({"count": 1, "last": 42}));

        let float = FloatStats::from_values(&[1.5]).unwrap();
        let json = serde_json::to_value(float).unwrap();
        assert_eq!(json, serde_json::json!({"count": 1, "last": 1.5}));
    }

    #[test]
    fn empty_vector_has_no_stats() {
        assert!(DurationStats::from_values(&[]).is_none());
        assert!(FloatStats::from_values(&[]).is_none());
    }

    #[test]
    fn aggregate_counts_and_gas_weighted_time() {
        let calls = vec![
            call("engine_newPayloadV3", 1_000_000, true, Some(10_000_000)),
            call("engine_newPayloadV3", 2_000_000, true, Some(0)),
            call("engine_forkchoiceUpdatedV3", 500_000, true, None),
            call("engine_newPayloadV3", 100, false, None),
        ];
        let stats = aggregate(&calls, 4_000_000);

        assert_eq!(stats.succeeded, 3);
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded + stats.failed, calls.len() as u64);
        assert_eq!(stats.gas_used_total, 10_000_000);
        // Only the gas-carrying call contributes weighted time.
        assert_eq!(stats.gas_used_time_total_ns, 1_000_000);

        let np_times = &stats.method_stats.times["engine_newPayloadV3"];
        assert_eq!(np_times.count, 3);
        let fcu_times = &stats.method_stats.times["engine_forkchoiceUpdatedV3"];
        assert_eq!(fcu_times.count, 1);
        assert_eq!(fcu_times.last, 500_000);

        // One MGas/s sample (the zero-gas call yields none).
        let np_mgas = &stats.method_stats.mgas_s["engine_newPayloadV3"];
        assert_eq!(np_mgas.count, 1);
        assert!((np_mgas.last - 10_000.0).abs() < 1e-9);

        let totals = stats.resources.unwrap();
        assert_eq!(totals.disk_read_bytes, 40);
        assert_eq!(totals.cpu_usec, 20);
        assert_eq!(totals.memory_delta_bytes, -4);
    }

    #[test]
    fn s1_single_payload_aggregation_shape() {
        let calls = vec![call("engine_newPayloadV3", 1_000_000, true, Some(10_000_000))];
        let stats = aggregate(&calls, 1_200_000);
        assert_eq!(stats.gas_used_total, 10_000_000);
        assert_eq!(stats.method_stats.times["engine_newPayloadV3"].count, 1);
        assert_eq!(stats.method_stats.mgas_s["engine_newPayloadV3"].count, 1);
    }
}
