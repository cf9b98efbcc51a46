//! Metric derivation from cumulative runtime counters
//!
//! Pure functions: the previous CPU totals come from the `precpu_stats`
//! section of the same frame, so no state is kept between samples.

use crate::models::ContainerStats;
use crate::runtime::{NetworkStats, RawStatSample};
use std::collections::HashMap;

/// CPU utilisation in percent of one core times the number of cores.
///
/// Yields exactly `0.0` unless both the container and the system deltas are
/// strictly positive.
pub fn cpu_percent(sample: &RawStatSample) -> f64 {
    let cpu_delta = sample
        .cpu_stats
        .cpu_usage
        .total_usage
        .saturating_sub(sample.precpu_stats.cpu_usage.total_usage);
    let system_delta = sample
        .cpu_stats
        .system_cpu_usage
        .saturating_sub(sample.precpu_stats.system_cpu_usage);

    if cpu_delta == 0 || system_delta == 0 {
        return 0.0;
    }

    (cpu_delta as f64 / system_delta as f64) * core_count(sample) as f64 * 100.0
}

/// Number of cores the CPU delta is spread over
pub fn core_count(sample: &RawStatSample) -> usize {
    match &sample.cpu_stats.cpu_usage.percpu_usage {
        Some(percpu) if !percpu.is_empty() => percpu.len(),
        // cgroup v2 hosts omit the per-core array
        _ => sample.cpu_stats.online_cpus.unwrap_or(0) as usize,
    }
}

/// Memory usage in percent of the limit, `0.0` when no limit is reported
pub fn memory_percent(usage: u64, limit: u64) -> f64 {
    if limit == 0 {
        return 0.0;
    }
    usage as f64 * 100.0 / limit as f64
}

/// `(tx, rx)` byte totals summed over every interface
pub fn network_totals(networks: Option<&HashMap<String, NetworkStats>>) -> (u64, u64) {
    networks
        .into_iter()
        .flat_map(|interfaces| interfaces.values())
        .fold((0u64, 0u64), |(tx, rx), iface| {
            (tx.saturating_add(iface.tx_bytes), rx.saturating_add(iface.rx_bytes))
        })
}

impl ContainerStats {
    /// Normalise one raw frame for `container_name`
    pub fn from_raw(container_name: &str, sample: &RawStatSample) -> Self {
        let (tx_bytes_total, rx_bytes_total) = network_totals(sample.networks.as_ref());

        Self {
            container_name: container_name.to_string(),
            timestamp: sample.read,
            cpu_percent: cpu_percent(sample),
            memory_percent: memory_percent(
                sample.memory_stats.usage,
                sample.memory_stats.limit,
            ),
            memory_usage_bytes: sample.memory_stats.usage,
            tx_bytes_total,
            rx_bytes_total,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(json: &str) -> RawStatSample {
        serde_json::from_str(json).unwrap()
    }

    fn cpu_sample(total: u64, pre_total: u64, system: u64, pre_system: u64, cores: usize) -> RawStatSample {
        let percpu = vec![0u64; cores];
        sample(&format!(
            r#"{{
                "read": "2024-01-02T03:04:05Z",
                "cpu_stats": {{"cpu_usage": {{"total_usage": {total}, "percpu_usage": {percpu:?}}}, "system_cpu_usage": {system}}},
                "precpu_stats": {{"cpu_usage": {{"total_usage": {pre_total}}}, "system_cpu_usage": {pre_system}}}
            }}"#
        ))
    }

    #[test]
    fn test_cpu_percent_example() {
        let s = cpu_sample(200, 100, 2000, 1000, 4);
        assert_eq!(cpu_percent(&s), 40.0);
    }

    #[test]
    fn test_cpu_percent_negative_delta_is_zero() {
        let s = cpu_sample(100, 150, 2000, 1000, 4);
        assert_eq!(cpu_percent(&s), 0.0);
    }

    #[test]
    fn test_cpu_percent_zero_system_delta_is_zero() {
        let s = cpu_sample(200, 100, 1000, 1000, 4);
        assert_eq!(cpu_percent(&s), 0.0);

        let s = cpu_sample(200, 100, 900, 1000, 4);
        assert_eq!(cpu_percent(&s), 0.0);
    }

    #[test]
    fn test_cpu_percent_matches_formula() {
        for (total, pre_total, system, pre_system, cores) in [
            (1_500u64, 500u64, 10_000u64, 2_000u64, 2usize),
            (7, 3, 11, 1, 8),
            (1_000_000, 999_999, 5_000_000, 0, 1),
        ] {
            let s = cpu_sample(total, pre_total, system, pre_system, cores);
            let expected = ((total - pre_total) as f64 / (system - pre_system) as f64)
                * cores as f64
                * 100.0;
            assert_eq!(cpu_percent(&s), expected);
            assert!(cpu_percent(&s).is_finite());
        }
    }

    #[test]
    fn test_core_count_falls_back_to_online_cpus() {
        let s = sample(
            r#"{
                "read": "2024-01-02T03:04:05Z",
                "cpu_stats": {"cpu_usage": {"total_usage": 300}, "system_cpu_usage": 2000, "online_cpus": 2},
                "precpu_stats": {"cpu_usage": {"total_usage": 100}, "system_cpu_usage": 1000}
            }"#,
        );
        assert_eq!(core_count(&s), 2);
        assert_eq!(cpu_percent(&s), 40.0);
    }

    #[test]
    fn test_memory_percent() {
        assert_eq!(memory_percent(512, 1024), 50.0);
        assert_eq!(memory_percent(0, 1024), 0.0);
    }

    #[test]
    fn test_memory_percent_zero_limit() {
        let percent = memory_percent(512, 0);
        assert_eq!(percent, 0.0);
        assert!(percent.is_finite());
    }

    #[test]
    fn test_network_totals() {
        let s = sample(
            r#"{
                "read": "2024-01-02T03:04:05Z",
                "networks": {
                    "eth0": {"tx_bytes": 100, "rx_bytes": 50, "tx_packets": 3},
                    "eth1": {"tx_bytes": 25, "rx_bytes": 10}
                }
            }"#,
        );
        assert_eq!(network_totals(s.networks.as_ref()), (125, 60));
    }

    #[test]
    fn test_network_totals_without_networks() {
        assert_eq!(network_totals(None), (0, 0));
    }

    #[test]
    fn test_from_raw() {
        let s = sample(
            r#"{
                "read": "2024-01-02T03:04:05Z",
                "cpu_stats": {"cpu_usage": {"total_usage": 200, "percpu_usage": [1, 1, 1, 1]}, "system_cpu_usage": 2000},
                "precpu_stats": {"cpu_usage": {"total_usage": 100}, "system_cpu_usage": 1000},
                "memory_stats": {"usage": 512, "limit": 1024},
                "networks": {"eth0": {"tx_bytes": 100, "rx_bytes": 50}, "eth1": {"tx_bytes": 25, "rx_bytes": 10}}
            }"#,
        );

        let stats = ContainerStats::from_raw("web", &s);
        assert_eq!(stats.container_name, "web");
        assert_eq!(stats.cpu_percent, 40.0);
        assert_eq!(stats.memory_percent, 50.0);
        assert_eq!(stats.memory_usage_bytes, 512);
        assert_eq!(stats.tx_bytes_total, 125);
        assert_eq!(stats.rx_bytes_total, 60);
        assert_eq!(stats.timestamp, s.read);
    }
}
