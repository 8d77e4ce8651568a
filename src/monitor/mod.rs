//! Security event monitoring
//!
//! Records authentication failures, rate-limit hits, suspicious requests and
//! server errors into a bounded event store, raises alerts for HIGH and
//! CRITICAL events as they are recorded, and aggregates recent activity.

mod patterns;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::{AuthError, ErrorCode};

pub use patterns::{detect, Detection};

/// Kind of security event
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    AuthFailure,
    RateLimit,
    SuspiciousRequest,
    ApiError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::AuthFailure => "AUTH_FAILURE",
            EventKind::RateLimit => "RATE_LIMIT",
            EventKind::SuspiciousRequest => "SUSPICIOUS_REQUEST",
            EventKind::ApiError => "API_ERROR",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    pub fn needs_alert(&self) -> bool {
        *self >= Severity::High
    }
}

/// An immutable security event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub kind: EventKind,
    pub severity: Severity,
    pub ip: String,
    pub user_agent: Option<String>,
    pub endpoint: String,
    pub details: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SecurityEvent {
    pub fn new(
        kind: EventKind,
        severity: Severity,
        ip: impl Into<String>,
        endpoint: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            severity,
            ip: ip.into(),
            user_agent: None,
            endpoint: endpoint.into(),
            details: serde_json::Value::Null,
            timestamp,
        }
    }

    pub fn with_user_agent(mut self, user_agent: Option<String>) -> Self {
        self.user_agent = user_agent;
        self
    }

    pub fn with_details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }
}

#[derive(Error, Debug)]
pub enum EventStoreError {
    #[error("Lock poisoned: {0}")]
    LockPoisoned(String),
}

/// Storage for security events
#[async_trait]
pub trait EventStore: Send + Sync {
    async fn append(&self, event: SecurityEvent) -> Result<(), EventStoreError>;

    /// Events with `timestamp >= since`, oldest first
    async fn since(&self, since: DateTime<Utc>) -> Result<Vec<SecurityEvent>, EventStoreError>;

    /// The newest `limit` events, newest first
    async fn recent(&self, limit: usize) -> Result<Vec<SecurityEvent>, EventStoreError>;
}

/// Bounded in-memory ring buffer; the oldest event is dropped when full
#[derive(Clone)]
pub struct RingBufferStore {
    events: Arc<RwLock<VecDeque<SecurityEvent>>>,
    capacity: usize,
}

impl RingBufferStore {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            events: Arc::new(RwLock::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.events.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl EventStore for RingBufferStore {
    async fn append(&self, event: SecurityEvent) -> Result<(), EventStoreError> {
        let mut events = self
            .events
            .write()
            .map_err(|e| EventStoreError::LockPoisoned(e.to_string()))?;
        while events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
        Ok(())
    }

    async fn since(&self, since: DateTime<Utc>) -> Result<Vec<SecurityEvent>, EventStoreError> {
        let events = self
            .events
            .read()
            .map_err(|e| EventStoreError::LockPoisoned(e.to_string()))?;
        Ok(events
            .iter()
            .filter(|e| e.timestamp >= since)
            .cloned()
            .collect())
    }

    async fn recent(&self, limit: usize) -> Result<Vec<SecurityEvent>, EventStoreError> {
        let events = self
            .events
            .read()
            .map_err(|e| EventStoreError::LockPoisoned(e.to_string()))?;
        Ok(events.iter().rev().take(limit).cloned().collect())
    }
}

/// Receives HIGH and CRITICAL events synchronously as they are recorded
pub trait AlertSink: Send + Sync {
    fn alert(&self, event: &SecurityEvent);
}

/// Alerts through the log
pub struct TracingAlertSink;

impl AlertSink for TracingAlertSink {
    fn alert(&self, event: &SecurityEvent) {
        tracing::error!(
            kind = event.kind.as_str(),
            severity = event.severity.as_str(),
            ip = %event.ip,
            endpoint = %event.endpoint,
            details = %event.details,
            "Security alert"
        );
    }
}

/// Request context attached to events
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestContext {
    pub ip: String,
    pub user_agent: Option<String>,
    pub endpoint: String,
}

/// Aggregate of recent events
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityStats {
    pub window_start: DateTime<Utc>,
    pub total_events: usize,
    pub by_type: BTreeMap<EventKind, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
    pub top_ips: Vec<IpCount>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpCount {
    pub ip: String,
    pub count: usize,
}

const STATS_WINDOW_HOURS: i64 = 1;
const TOP_IPS: usize = 10;

/// Security monitor
pub struct SecurityMonitor {
    store: Arc<dyn EventStore>,
    sink: Arc<dyn AlertSink>,
}

impl SecurityMonitor {
    pub fn new(store: Arc<dyn EventStore>, sink: Arc<dyn AlertSink>) -> Self {
        Self { store, sink }
    }

    /// In-memory monitor that alerts through the log
    pub fn in_memory(capacity: usize) -> Self {
        Self::new(
            Arc::new(RingBufferStore::new(capacity)),
            Arc::new(TracingAlertSink),
        )
    }

    /// Record an event; HIGH and CRITICAL events reach the alert sink before
    /// this returns
    pub async fn record(&self, event: SecurityEvent) {
        if event.severity.needs_alert() {
            self.sink.alert(&event);
        }
        if let Err(e) = self.store.append(event).await {
            tracing::error!(error = %e, "Failed to store security event");
        }
    }

    pub async fn record_auth_failure(
        &self,
        ctx: &RequestContext,
        error: &AuthError,
        address: Option<&str>,
    ) {
        let severity = match error.code {
            ErrorCode::SignatureInvalid | ErrorCode::NonceInvalid => Severity::Medium,
            ErrorCode::WalletAddressInvalid
                if error.detail.as_deref().is_some_and(|d| d.contains("not allowed")) =>
            {
                Severity::Medium
            }
            _ => Severity::Low,
        };
        let event = SecurityEvent::new(
            EventKind::AuthFailure,
            severity,
            &ctx.ip,
            &ctx.endpoint,
            Utc::now(),
        )
        .with_user_agent(ctx.user_agent.clone())
        .with_details(serde_json::json!({
            "code": error.code.as_str(),
            "address": address,
            "detail": error.detail,
        }));
        self.record(event).await;
    }

    pub async fn record_rate_limit(
        &self,
        ctx: &RequestContext,
        block_until: DateTime<Utc>,
        newly_blocked: bool,
    ) {
        let severity = if newly_blocked {
            Severity::High
        } else {
            Severity::Medium
        };
        let event = SecurityEvent::new(
            EventKind::RateLimit,
            severity,
            &ctx.ip,
            &ctx.endpoint,
            Utc::now(),
        )
        .with_user_agent(ctx.user_agent.clone())
        .with_details(serde_json::json!({
            "blockUntil": block_until,
            "newlyBlocked": newly_blocked,
        }));
        self.record(event).await;
    }

    /// Run pattern detection over a request and record any hit
    pub async fn inspect_request(
        &self,
        ctx: &RequestContext,
        path_and_query: &str,
    ) -> Option<Severity> {
        let detection = detect(ctx.user_agent.as_deref(), path_and_query)?;
        let severity = detection.severity;
        let event = SecurityEvent::new(
            EventKind::SuspiciousRequest,
            severity,
            &ctx.ip,
            &ctx.endpoint,
            Utc::now(),
        )
        .with_user_agent(ctx.user_agent.clone())
        .with_details(serde_json::json!({
            "reasons": detection.reasons,
            "path": path_and_query,
        }));
        self.record(event).await;
        Some(severity)
    }

    pub async fn record_api_error(&self, ctx: &RequestContext, status: u16) {
        let event = SecurityEvent::new(
            EventKind::ApiError,
            Severity::Medium,
            &ctx.ip,
            &ctx.endpoint,
            Utc::now(),
        )
        .with_user_agent(ctx.user_agent.clone())
        .with_details(serde_json::json!({ "status": status }));
        self.record(event).await;
    }

    pub async fn recent(&self, limit: usize) -> Vec<SecurityEvent> {
        self.store.recent(limit).await.unwrap_or_default()
    }

    /// Counts by type and severity plus the busiest IPs over the last hour
    pub async fn stats_at(&self, now: DateTime<Utc>) -> SecurityStats {
        let window_start = now - Duration::hours(STATS_WINDOW_HOURS);
        let events = match self.store.since(window_start).await {
            Ok(events) => events,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read security events");
                Vec::new()
            }
        };

        let mut by_type = BTreeMap::new();
        let mut by_severity = BTreeMap::new();
        let mut per_ip: HashMap<&str, usize> = HashMap::new();
        for event in events.iter().filter(|e| e.timestamp <= now) {
            *by_type.entry(event.kind).or_insert(0) += 1;
            *by_severity.entry(event.severity).or_insert(0) += 1;
            *per_ip.entry(event.ip.as_str()).or_insert(0) += 1;
        }

        let mut top_ips: Vec<IpCount> = per_ip
            .into_iter()
            .map(|(ip, count)| IpCount {
                ip: ip.to_string(),
                count,
            })
            .collect();
        top_ips.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.ip.cmp(&b.ip)));
        top_ips.truncate(TOP_IPS);

        SecurityStats {
            window_start,
            total_events: by_type.values().sum(),
            by_type,
            by_severity,
            top_ips,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct CollectingSink {
        alerts: Mutex<Vec<Severity>>,
    }

    impl AlertSink for CollectingSink {
        fn alert(&self, event: &SecurityEvent) {
            self.alerts.lock().unwrap().push(event.severity);
        }
    }

    fn ctx(ip: &str) -> RequestContext {
        RequestContext {
            ip: ip.to_string(),
            user_agent: Some("Mozilla/5.0".to_string()),
            endpoint: "/auth/verify".to_string(),
        }
    }

    #[tokio::test]
    async fn test_ring_buffer_is_bounded() {
        let store = RingBufferStore::new(3);
        let now = Utc::now();
        for i in 0..5 {
            store
                .append(SecurityEvent::new(
                    EventKind::ApiError,
                    Severity::Low,
                    format!("10.0.0.{}", i),
                    "/",
                    now,
                ))
                .await
                .unwrap();
        }
        assert_eq!(store.len(), 3);
        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent[0].ip, "10.0.0.4");
        assert_eq!(recent[2].ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_high_severity_alerts_synchronously() {
        let sink = Arc::new(CollectingSink::default());
        let monitor = SecurityMonitor::new(Arc::new(RingBufferStore::new(10)), sink.clone());

        monitor
            .record_rate_limit(&ctx("1.2.3.4"), Utc::now(), false)
            .await;
        assert!(sink.alerts.lock().unwrap().is_empty());

        monitor
            .record_rate_limit(&ctx("1.2.3.4"), Utc::now(), true)
            .await;
        assert_eq!(*sink.alerts.lock().unwrap(), vec![Severity::High]);
    }

    #[tokio::test]
    async fn test_inspect_request_records_suspicious() {
        let monitor = SecurityMonitor::in_memory(10);
        let ctx = RequestContext {
            ip: "5.6.7.8".to_string(),
            user_agent: Some("curl/8.0".to_string()),
            endpoint: "/.env".to_string(),
        };
        assert_eq!(
            monitor.inspect_request(&ctx, "/.env").await,
            Some(Severity::Medium)
        );
        let events = monitor.recent(10).await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::SuspiciousRequest);
    }

    #[tokio::test]
    async fn test_stats_over_last_hour() {
        let store = Arc::new(RingBufferStore::new(100));
        let monitor = SecurityMonitor::new(store.clone(), Arc::new(TracingAlertSink));
        let now = Utc::now();

        let old = SecurityEvent::new(
            EventKind::AuthFailure,
            Severity::Low,
            "9.9.9.9",
            "/auth/verify",
            now - Duration::hours(2),
        );
        monitor.record(old).await;

        for _ in 0..3 {
            monitor
                .record_auth_failure(
                    &ctx("1.1.1.1"),
                    &AuthError::new(ErrorCode::SignatureInvalid),
                    Some("0xabc"),
                )
                .await;
        }
        monitor
            .record_rate_limit(&ctx("2.2.2.2"), now, false)
            .await;

        let stats = monitor.stats_at(Utc::now()).await;
        assert_eq!(stats.total_events, 4);
        assert_eq!(stats.by_type.get(&EventKind::AuthFailure), Some(&3));
        assert_eq!(stats.by_type.get(&EventKind::RateLimit), Some(&1));
        assert_eq!(stats.by_severity.get(&Severity::Medium), Some(&4));
        assert_eq!(
            stats.top_ips[0],
            IpCount {
                ip: "1.1.1.1".to_string(),
                count: 3
            }
        );
        assert!(stats.top_ips.iter().all(|c| c.ip != "9.9.9.9"));
    }

    #[test]
    fn test_stats_serialize_with_wire_names() {
        let mut by_type = BTreeMap::new();
        by_type.insert(EventKind::RateLimit, 2);
        let stats = SecurityStats {
            window_start: Utc::now(),
            total_events: 2,
            by_type,
            by_severity: BTreeMap::new(),
            top_ips: Vec::new(),
        };
        let json = serde_json::to_value(&stats).unwrap();
        assert_eq!(json["by_type"]["RATE_LIMIT"], 2);
    }
}
