/// Prometheus 指标

use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, Opts, Registry, TextEncoder};
use tracing::warn;

static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

static PROVISION_REQUESTS: Lazy<Option<IntCounter>> = Lazy::new(|| {
    register(IntCounter::new("provision_requests_total", "受理的部署请求数"))
});

static PHASE_CALLBACKS: Lazy<Option<IntCounterVec>> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new("phase_callbacks_total", "阶段回调数，按处理结果"),
        &["outcome"],
    ))
});

static CLOUD_RETRIES: Lazy<Option<IntCounterVec>> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new("cloud_call_retries_total", "云 API 重试次数"),
        &["operation"],
    ))
});

static ALLOCATION_FAILURES: Lazy<Option<IntCounterVec>> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new("allocation_failures_total", "资源分配失败数，按错误类型"),
        &["kind"],
    ))
});

static CLEANUP_RUNS: Lazy<Option<IntCounterVec>> = Lazy::new(|| {
    register(IntCounterVec::new(
        Opts::new("cleanup_runs_total", "清理执行次数"),
        &["outcome"],
    ))
});

fn register<C>(metric: prometheus::Result<C>) -> Option<C>
where
    C: prometheus::core::Collector + Clone + 'static,
{
    let metric = match metric {
        Ok(metric) => metric,
        Err(e) => {
            warn!("构造指标失败: {}", e);
            return None;
        }
    };
    if let Err(e) = REGISTRY.register(Box::new(metric.clone())) {
        warn!("注册指标失败: {}", e);
    }
    Some(metric)
}

pub fn record_provision_request() {
    if let Some(counter) = PROVISION_REQUESTS.as_ref() {
        counter.inc();
    }
}

pub fn record_phase_callback(outcome: &str) {
    if let Some(counter) = PHASE_CALLBACKS.as_ref() {
        counter.with_label_values(&[outcome]).inc();
    }
}

pub fn record_cloud_retry(operation: &str) {
    if let Some(counter) = CLOUD_RETRIES.as_ref() {
        counter.with_label_values(&[operation]).inc();
    }
}

pub fn record_allocation_failure(kind: &str) {
    if let Some(counter) = ALLOCATION_FAILURES.as_ref() {
        counter.with_label_values(&[kind]).inc();
    }
}

pub fn record_cleanup(outcome: &str) {
    if let Some(counter) = CLEANUP_RUNS.as_ref() {
        counter.with_label_values(&[outcome]).inc();
    }
}

/// 以 Prometheus 文本格式导出
pub fn gather_text() -> String {
    // 确保所有指标在首次抓取前已注册
    Lazy::force(&PROVISION_REQUESTS);
    Lazy::force(&PHASE_CALLBACKS);
    Lazy::force(&CLOUD_RETRIES);
    Lazy::force(&ALLOCATION_FAILURES);
    Lazy::force(&CLEANUP_RUNS);

    let mut buffer = Vec::new();
    if let Err(e) = TextEncoder::new().encode(&REGISTRY.gather(), &mut buffer) {
        warn!("导出指标失败: {}", e);
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_show_up_in_export() {
        record_provision_request();
        record_phase_callback("advanced");
        record_cloud_retry("reserve_ip");

        let text = gather_text();
        assert!(text.contains("provision_requests_total"));
        assert!(text.contains("phase_callbacks_total{outcome=\"advanced\"}"));
        assert!(text.contains("cloud_call_retries_total{operation=\"reserve_ip\"}"));
    }

    #[test]
    fn test_invalid_definition_is_skipped() {
        assert!(register(IntCounter::new("bad metric name", "无效")).is_none());
        assert!(!gather_text().contains("bad metric name"));
    }
}
