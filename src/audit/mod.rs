//! Asynchronous audit trail for capability invocations.
//!
//! [`AuditLogger`] is an interceptor with the highest default order, so it
//! observes the final outcome of every invocation. It never gates execution:
//! hooks only enqueue an [`AuditEvent`] onto an unbounded channel. A single
//! background task drains that channel in order and hands each event to the
//! configured [`AuditSink`]. [`AuditLogger::shutdown`] closes the channel and
//! waits until everything already queued has been written.

pub mod sanitize;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::capabilities::RiskLevel;
use crate::core::chain::Interceptor;
use crate::core::context::ExecutionContext;
use crate::error::CapabilityError;

pub use sanitize::{sanitize_request, sanitize_response};

/// Default interceptor order: after every gate.
pub const AUDIT_ORDER: i32 = 1000;

// ---------------------------------------------------------------------------
// Events
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditEventType {
    Invoke,
    Completed,
    Failed,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Invoke => "INVOKE",
            Self::Completed => "COMPLETED",
            Self::Failed => "FAILED",
        }
    }
}

/// One immutable audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEvent {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub event_type: AuditEventType,
    pub capability_id: String,
    pub caller_id: String,
    pub request: Value,
    pub response: Option<Value>,
    pub risk_level: RiskLevel,
    pub metadata: Map<String, Value>,
    pub success: bool,
    pub error: Option<String>,
}

impl AuditEvent {
    fn from_context(
        ctx: &ExecutionContext,
        event_type: AuditEventType,
        response: Option<Value>,
        error: Option<String>,
    ) -> Self {
        let now = Utc::now();
        let mut metadata = Map::new();
        metadata.insert("requestId".into(), Value::String(ctx.request_id.clone()));
        metadata.insert(
            "capabilityType".into(),
            Value::String(ctx.capability.capability_type.as_str().to_string()),
        );
        metadata.insert("timestamp".into(), Value::String(now.to_rfc3339()));

        Self {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: now,
            event_type,
            capability_id: ctx.capability.id.clone(),
            caller_id: ctx.caller_id().to_string(),
            request: sanitize_request(&ctx.parameters),
            response,
            risk_level: ctx.capability.risk_level,
            metadata,
            success: error.is_none(),
            error,
        }
    }

    /// The invocation this event belongs to.
    pub fn request_id(&self) -> Option<&str> {
        self.metadata.get("requestId").and_then(Value::as_str)
    }
}

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination for audit events. Persistence is up to the implementor.
#[async_trait]
pub trait AuditSink: Send + Sync + 'static {
    async fn write(&self, event: &AuditEvent);
}

/// Writes one `[AUDIT]` line per event through the `log` facade.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAuditSink;

#[async_trait]
impl AuditSink for LogAuditSink {
    async fn write(&self, event: &AuditEvent) {
        let line = format!(
            "[AUDIT] {} | {} | {} | {} | {} | {}",
            event.timestamp.to_rfc3339(),
            event.event_type.as_str(),
            event.capability_id,
            event.caller_id,
            if event.success { "SUCCESS" } else { "FAILED" },
            event.error.as_deref().unwrap_or(""),
        );
        if event.success {
            log::info!("{}", line);
        } else {
            log::warn!("{}", line);
        }
    }
}

// ---------------------------------------------------------------------------
// Logger
// ---------------------------------------------------------------------------

/// Queueing audit interceptor with a single background writer.
pub struct AuditLogger {
    sender: Mutex<Option<mpsc::UnboundedSender<AuditEvent>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    pending: Arc<AtomicUsize>,
}

impl AuditLogger {
    /// Spawn the writer task on the current tokio runtime.
    pub fn start(sink: Arc<dyn AuditSink>) -> Arc<Self> {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditEvent>();
        let pending = Arc::new(AtomicUsize::new(0));
        let worker_pending = pending.clone();

        let worker = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                sink.write(&event).await;
                worker_pending.fetch_sub(1, Ordering::SeqCst);
            }
            log::debug!("Audit writer drained and stopped");
        });

        Arc::new(Self {
            sender: Mutex::new(Some(tx)),
            worker: Mutex::new(Some(worker)),
            pending,
        })
    }

    /// Enqueue an event. Events logged after shutdown are dropped with a warning.
    pub fn log(&self, event: AuditEvent) {
        let sender = self.sender.lock();
        let Some(tx) = sender.as_ref() else {
            log::warn!("Audit logger stopped, dropping {} event", event.event_type.as_str());
            return;
        };
        self.pending.fetch_add(1, Ordering::SeqCst);
        if let Err(e) = tx.send(event) {
            self.pending.fetch_sub(1, Ordering::SeqCst);
            log::error!("Failed to queue audit event: {}", e);
        }
    }

    /// Number of events queued but not yet written.
    pub fn pending(&self) -> usize {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.sender.lock().is_some()
    }

    /// Stop accepting events and wait for the queue to drain.
    pub async fn shutdown(&self) {
        drop(self.sender.lock().take());
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                log::error!("Audit writer task failed: {}", e);
            }
        }
        log::info!("Audit logger stopped");
    }
}

impl Interceptor for AuditLogger {
    fn name(&self) -> &str {
        "audit"
    }

    fn order(&self) -> i32 {
        AUDIT_ORDER
    }

    fn pre_handle(&self, ctx: &mut ExecutionContext) -> Result<bool, CapabilityError> {
        self.log(AuditEvent::from_context(ctx, AuditEventType::Invoke, None, None));
        Ok(true)
    }

    fn post_handle(&self, ctx: &mut ExecutionContext, result: &Value) -> Result<(), CapabilityError> {
        self.log(AuditEvent::from_context(
            ctx,
            AuditEventType::Completed,
            Some(sanitize_response(result)),
            None,
        ));
        Ok(())
    }

    fn on_error(&self, ctx: &mut ExecutionContext, error: &CapabilityError) -> Result<(), CapabilityError> {
        self.log(AuditEvent::from_context(
            ctx,
            AuditEventType::Failed,
            None,
            Some(error.to_string()),
        ));
        Ok(())
    }

    /// An earlier gate rejected the invocation before `pre_handle` ran here.
    fn on_abort(&self, ctx: &mut ExecutionContext, error: &CapabilityError) {
        self.log(AuditEvent::from_context(
            ctx,
            AuditEventType::Failed,
            None,
            Some(error.to_string()),
        ));
    }
}

impl std::fmt::Debug for AuditLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuditLogger")
            .field("running", &self.is_running())
            .field("pending", &self.pending())
            .finish()
    }
}
