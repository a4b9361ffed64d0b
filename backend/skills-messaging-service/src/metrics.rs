use actix_web::HttpResponse;
use once_cell::sync::Lazy;
use prometheus::{Encoder, IntCounter, IntCounterVec, IntGaugeVec, Opts, TextEncoder};

use crate::queue::QueueStats;

static MESSAGES_SENT_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("skills_messages_sent_total", "Messages accepted for delivery"),
        &["scope"],
    )
    .expect("failed to create skills_messages_sent_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register skills_messages_sent_total");
    counter
});

static LIVE_PUSH_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new(
            "skills_live_push_total",
            "Live delivery attempts by outcome",
        ),
        &["outcome"],
    )
    .expect("failed to create skills_live_push_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register skills_live_push_total");
    counter
});

static QUEUE_JOBS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    let counter = IntCounterVec::new(
        Opts::new("skills_queue_jobs_total", "Queue job attempts by outcome"),
        &["queue", "outcome"],
    )
    .expect("failed to create skills_queue_jobs_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register skills_queue_jobs_total");
    counter
});

static QUEUE_DEPTH: Lazy<IntGaugeVec> = Lazy::new(|| {
    let gauge = IntGaugeVec::new(
        Opts::new("skills_queue_depth", "Jobs per queue and state"),
        &["queue", "state"],
    )
    .expect("failed to create skills_queue_depth");
    prometheus::default_registry()
        .register(Box::new(gauge.clone()))
        .expect("failed to register skills_queue_depth");
    gauge
});

static SYNC_GAPS_TOTAL: Lazy<IntCounter> = Lazy::new(|| {
    let counter = IntCounter::new(
        "skills_sync_gaps_total",
        "Sync responses that reported missing sequence numbers",
    )
    .expect("failed to create skills_sync_gaps_total");
    prometheus::default_registry()
        .register(Box::new(counter.clone()))
        .expect("failed to register skills_sync_gaps_total");
    counter
});

pub fn record_message_sent(scope: &str) {
    MESSAGES_SENT_TOTAL.with_label_values(&[scope]).inc();
}

pub fn record_live_push(outcome: &str) {
    LIVE_PUSH_TOTAL.with_label_values(&[outcome]).inc();
}

pub fn record_queue_job(queue: &str, outcome: &str) {
    QUEUE_JOBS_TOTAL.with_label_values(&[queue, outcome]).inc();
}

pub fn set_queue_depth(queue: &str, stats: &QueueStats) {
    QUEUE_DEPTH
        .with_label_values(&[queue, "queued"])
        .set(stats.queued as i64);
    QUEUE_DEPTH
        .with_label_values(&[queue, "active"])
        .set(stats.active as i64);
    QUEUE_DEPTH
        .with_label_values(&[queue, "dead"])
        .set(stats.dead as i64);
}

pub fn record_sync_gap() {
    SYNC_GAPS_TOTAL.inc();
}

/// Prometheus text exposition of the default registry
pub async fn metrics_handler() -> HttpResponse {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(err) = encoder.encode(&prometheus::gather(), &mut buffer) {
        return HttpResponse::InternalServerError().body(err.to_string());
    }
    HttpResponse::Ok()
        .content_type(encoder.format_type())
        .body(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[actix_rt::test]
    async fn test_metrics_are_exposed() {
        record_message_sent("direct");
        record_queue_job("delivery", "completed");
        set_queue_depth("delivery", &QueueStats::default());

        let resp = metrics_handler().await;
        assert!(resp.status().is_success());
        let body = actix_web::body::to_bytes(resp.into_body()).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("skills_messages_sent_total"));
        assert!(text.contains("skills_queue_depth"));
    }
}
