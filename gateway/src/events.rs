//! Audit/event sink: append-only writes of security events and behavioral
//! log entries. Fire-and-forget — a failed insert is logged and dropped,
//! never allowed to block or fail the admission decision.

use sentra_core::events::{BehavioralLogEntry, SecurityEvent};

#[derive(Clone)]
pub struct EventSink {
    backend: SinkBackend,
}

#[derive(Clone)]
enum SinkBackend {
    Postgres(sqlx::PgPool),
    Disabled,
    #[cfg(test)]
    Recording(std::sync::Arc<RecordedEvents>),
}

/// In-memory capture of everything the sink was asked to persist.
#[cfg(test)]
#[derive(Default)]
pub struct RecordedEvents {
    pub security: std::sync::Mutex<Vec<SecurityEvent>>,
    pub behavioral: std::sync::Mutex<Vec<BehavioralLogEntry>>,
}

impl EventSink {
    pub fn postgres(pool: sqlx::PgPool) -> Self {
        Self {
            backend: SinkBackend::Postgres(pool),
        }
    }

    /// No durable sink (memory store mode); events still reach the logs.
    pub fn disabled() -> Self {
        Self {
            backend: SinkBackend::Disabled,
        }
    }

    #[cfg(test)]
    pub fn recording() -> (Self, std::sync::Arc<RecordedEvents>) {
        let recorded = std::sync::Arc::new(RecordedEvents::default());
        (
            Self {
                backend: SinkBackend::Recording(recorded.clone()),
            },
            recorded,
        )
    }

    pub fn record_security_event(&self, event: SecurityEvent) {
        tracing::warn!(
            event_type = event.event_type.as_str(),
            severity = %event.severity,
            identity = %event.identity,
            client_addr = %event.client_addr,
            "security event"
        );
        match &self.backend {
            SinkBackend::Disabled => {}
            #[cfg(test)]
            SinkBackend::Recording(recorded) => {
                recorded.security.lock().unwrap().push(event);
            }
            SinkBackend::Postgres(pool) => {
                let pool = pool.clone();
                tokio::spawn(async move {
                    if let Err(err) = sqlx::query(
                        "INSERT INTO security_events \
                         (event_type, severity, identity, client_addr, user_agent, detail, occurred_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    )
                    .bind(event.event_type.as_str())
                    .bind(&event.severity)
                    .bind(&event.identity)
                    .bind(&event.client_addr)
                    .bind(&event.user_agent)
                    .bind(&event.detail)
                    .bind(event.occurred_at)
                    .execute(&pool)
                    .await
                    {
                        tracing::warn!(error = %err, "failed to persist security event");
                    }
                });
            }
        }
    }

    pub fn record_behavioral_entry(&self, entry: BehavioralLogEntry) {
        tracing::info!(
            identity = %entry.identity,
            endpoint = %entry.endpoint,
            risk_score = entry.risk_score,
            allowed = entry.allowed,
            findings = entry.findings.len(),
            "behavioral log entry"
        );
        match &self.backend {
            SinkBackend::Disabled => {}
            #[cfg(test)]
            SinkBackend::Recording(recorded) => {
                recorded.behavioral.lock().unwrap().push(entry);
            }
            SinkBackend::Postgres(pool) => {
                let pool = pool.clone();
                tokio::spawn(async move {
                    let findings = serde_json::to_value(&entry.findings).unwrap_or_default();
                    if let Err(err) = sqlx::query(
                        "INSERT INTO behavioral_log \
                         (identity, endpoint, method, findings, risk_score, allowed, occurred_at) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7)",
                    )
                    .bind(&entry.identity)
                    .bind(&entry.endpoint)
                    .bind(&entry.method)
                    .bind(findings)
                    .bind(entry.risk_score)
                    .bind(entry.allowed)
                    .bind(entry.occurred_at)
                    .execute(&pool)
                    .await
                    {
                        tracing::warn!(error = %err, "failed to persist behavioral log entry");
                    }
                });
            }
        }
    }
}
