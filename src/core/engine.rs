//! Execution engine: resolve a capability, run it through the chain, and turn
//! the outcome into exactly one [`ExecutionResponse`].

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::FutureExt;
use tokio::task::JoinHandle;

use super::chain::{ExecutionChain, Interceptor};
use super::context::{CallerInfo, ExecutionContext, ExecutionRequest, ExecutionResponse};
use super::schema::{SchemaInterceptor, SchemaValidator};
use crate::audit::AuditLogger;
use crate::capabilities::{bind_arguments, CapabilityRegistry};
use crate::error::{CapabilityError, ErrorCode};
use crate::policy::PermissionChecker;

/// Drives capability invocations. Immutable after construction and shared
/// behind an `Arc` by every transport.
pub struct ExecutionEngine {
    registry: Arc<CapabilityRegistry>,
    chain: ExecutionChain,
}

impl ExecutionEngine {
    pub fn new(registry: Arc<CapabilityRegistry>, interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        let chain = ExecutionChain::new(interceptors);
        log::info!("Execution engine ready with interceptors {:?}", chain);
        Self { registry, chain }
    }

    /// Engine with the standard chain: permission, schema, audit.
    pub fn with_default_interceptors(registry: Arc<CapabilityRegistry>, audit: Arc<AuditLogger>) -> Self {
        Self::new(
            registry,
            vec![
                Arc::new(PermissionChecker::new()),
                Arc::new(SchemaInterceptor::new(Arc::new(SchemaValidator::new()))),
                audit,
            ],
        )
    }

    pub fn registry(&self) -> &Arc<CapabilityRegistry> {
        &self.registry
    }

    pub fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        self.chain.interceptors()
    }

    /// Run one request to completion. Never fails: every outcome, including a
    /// missing capability or a panicking handler, becomes a response.
    pub async fn execute(&self, request: ExecutionRequest, caller: Option<CallerInfo>) -> ExecutionResponse {
        let Some(capability) = self.registry.get_capability_descriptor(&request.capability_id) else {
            log::warn!("Capability not found: {}", request.capability_id);
            return ExecutionResponse::error(
                &request.id,
                ErrorCode::CapabilityNotFound,
                format!("Capability not found: {}", request.capability_id),
            );
        };

        let mut ctx = ExecutionContext::new(&request, capability, caller);
        let outcome = self
            .chain
            .proceed(&mut ctx, |ctx| {
                let capability = ctx.capability.clone();
                let parameters = ctx.parameters.clone();
                async move {
                    let args = bind_arguments(&capability.id, &capability.params, &parameters)?;
                    match AssertUnwindSafe(capability.handler.invoke(args)).catch_unwind().await {
                        Ok(result) => result,
                        Err(_) => Err(CapabilityError::Internal(anyhow::anyhow!(
                            "handler for {} panicked",
                            capability.id
                        ))),
                    }
                }
            })
            .await;

        match outcome {
            Ok(()) => {
                log::debug!("Capability executed: {}", ctx.capability_id());
                ctx.response
                    .take()
                    .unwrap_or_else(|| ExecutionResponse::success(&request.id, ctx.result.take()))
            }
            Err(error) => error_response(&request.id, &request.capability_id, error),
        }
    }

    /// Run `execute` as its own task on the current runtime.
    pub fn spawn_execute(
        self: &Arc<Self>,
        request: ExecutionRequest,
        caller: Option<CallerInfo>,
    ) -> JoinHandle<ExecutionResponse> {
        let engine = self.clone();
        tokio::spawn(async move { engine.execute(request, caller).await })
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("capabilities", &self.registry.capability_count())
            .field("chain", &self.chain)
            .finish()
    }
}

fn error_response(request_id: &str, capability_id: &str, error: CapabilityError) -> ExecutionResponse {
    match error {
        CapabilityError::Business { code, message } => ExecutionResponse::error(request_id, code, message),
        CapabilityError::Failed(reason) => {
            log::warn!("Capability {} failed: {}", capability_id, reason);
            ExecutionResponse::error(
                request_id,
                ErrorCode::OperationFailed,
                format!("Failed to execute capability: {}", capability_id),
            )
        }
        CapabilityError::Internal(e) => {
            log::error!("Unexpected error during capability execution of {}: {:#}", capability_id, e);
            ExecutionResponse::error(request_id, ErrorCode::InternalError, "Internal error during execution")
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::tests::MemorySink;
    use crate::audit::AuditEventType;
    use crate::capabilities::capability::{
        handler_fn, CapabilityBinding, CapabilityProvider, CapabilitySpec,
    };
    use crate::capabilities::{ParamBinding, ParamKind, RiskLevel};
    use serde_json::{json, Map, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct WorldProvider {
        calls: Arc<AtomicUsize>,
    }

    impl CapabilityProvider for WorldProvider {
        fn id(&self) -> &str {
            "world"
        }
        fn name(&self) -> &str {
            "World"
        }
        fn version(&self) -> &str {
            "1.0.0"
        }
        fn capabilities(&self) -> Vec<CapabilityBinding> {
            let calls = self.calls.clone();
            vec![
                CapabilityBinding::new(
                    CapabilitySpec::context("world.time.get", "Get world time")
                        .with_permission("world.read")
                        .with_param(ParamBinding::new("world", ParamKind::String).with_default("overworld")),
                    handler_fn(move |args| {
                        let calls = calls.clone();
                        async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            Ok(json!({"world": args.str("world"), "time": 6000}))
                        }
                    }),
                ),
                CapabilityBinding::new(
                    CapabilitySpec::action("world.weather.set", "Set weather")
                        .with_risk(RiskLevel::Medium)
                        .with_param(
                            ParamBinding::new(
                                "weather",
                                ParamKind::enumeration("Weather", ["CLEAR", "RAIN", "THUNDER"]),
                            )
                            .required(),
                        ),
                    handler_fn(|args| async move { Ok(json!({"weather": args.str("weather")})) }),
                ),
                CapabilityBinding::new(
                    CapabilitySpec::action("world.fail", "Fails"),
                    handler_fn(|_| async { Err(CapabilityError::failed("disk on fire")) }),
                ),
                CapabilityBinding::new(
                    CapabilitySpec::action("world.business", "Business error"),
                    handler_fn(|_| async {
                        Err(CapabilityError::from_code_name("PARAMETER_INVALID", "bad block"))
                    }),
                ),
                CapabilityBinding::new(
                    CapabilitySpec::action("world.internal", "Internal error"),
                    handler_fn(|_| async {
                        Err(CapabilityError::Internal(anyhow::anyhow!("db password=x leaked")))
                    }),
                ),
                CapabilityBinding::new(
                    CapabilitySpec::action("world.panic", "Panics"),
                    handler_fn(|args| async move {
                        if args.is_empty() {
                            panic!("handler blew up");
                        }
                        Ok(Value::Null)
                    }),
                ),
            ]
        }
    }

    struct Fixture {
        engine: Arc<ExecutionEngine>,
        audit: Arc<AuditLogger>,
        sink: Arc<MemorySink>,
        calls: Arc<AtomicUsize>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(CapabilityRegistry::new());
        let calls = Arc::new(AtomicUsize::new(0));
        registry
            .register(Arc::new(WorldProvider { calls: calls.clone() }), "test")
            .unwrap();
        let sink = Arc::new(MemorySink::default());
        let audit = AuditLogger::start(sink.clone());
        let engine = Arc::new(ExecutionEngine::with_default_interceptors(registry, audit.clone()));
        Fixture { engine, audit, sink, calls }
    }

    fn request(id: &str, capability: &str, params: Value) -> ExecutionRequest {
        let params: Map<String, Value> = params.as_object().cloned().unwrap_or_default();
        ExecutionRequest::new(id, capability, params)
    }

    fn operator() -> Option<CallerInfo> {
        Some(CallerInfo::new("gw-1", ["world.read"], ["operator"]))
    }

    #[tokio::test]
    async fn test_default_chain_order() {
        let f = fixture();
        let names: Vec<_> = f.engine.interceptors().iter().map(|i| i.name().to_string()).collect();
        assert_eq!(names, vec!["permission", "schema", "audit"]);
    }

    #[tokio::test]
    async fn test_success_binds_defaults() {
        let f = fixture();
        let resp = f
            .engine
            .execute(request("r1", "world.time.get", json!({})), operator())
            .await;
        assert!(resp.success);
        assert_eq!(resp.request_id, "r1");
        assert_eq!(resp.data, Some(json!({"world": "overworld", "time": 6000})));
    }

    #[tokio::test]
    async fn test_unknown_capability() {
        let f = fixture();
        let resp = f.engine.execute(request("r1", "nope", json!({})), operator()).await;
        assert!(!resp.success);
        assert_eq!(resp.error_code, Some(ErrorCode::CapabilityNotFound));
        assert_eq!(resp.error_message.as_deref(), Some("Capability not found: nope"));
    }

    #[tokio::test]
    async fn test_permission_denied_never_reaches_target_and_audits_one_failure() {
        let f = fixture();
        let caller = CallerInfo::new("gw-1", Vec::<String>::new(), Vec::<String>::new());
        let resp = f
            .engine
            .execute(request("r9", "world.time.get", json!({})), Some(caller))
            .await;
        assert_eq!(resp.error_code, Some(ErrorCode::PermissionDenied));
        assert_eq!(f.calls.load(Ordering::SeqCst), 0);

        f.audit.shutdown().await;
        let events = f.sink.events.lock();
        let for_request: Vec<_> = events.iter().filter(|e| e.request_id() == Some("r9")).collect();
        // Audit never reached pre_handle, so there is no Invoke event.
        assert_eq!(for_request.len(), 1);
        assert_eq!(for_request[0].event_type, AuditEventType::Failed);
    }

    #[tokio::test]
    async fn test_schema_rejection_audits_one_failure() {
        let f = fixture();
        let resp = f
            .engine
            .execute(request("r8", "world.weather.set", json!({})), operator())
            .await;
        assert_eq!(resp.error_code, Some(ErrorCode::ParameterRequired));

        f.audit.shutdown().await;
        let events = f.sink.events.lock();
        let kinds: Vec<_> = events
            .iter()
            .filter(|e| e.request_id() == Some("r8"))
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds, vec![AuditEventType::Failed]);
    }

    #[tokio::test]
    async fn test_enum_coercion_case_insensitive_and_invalid() {
        let f = fixture();
        let resp = f
            .engine
            .execute(request("r1", "world.weather.set", json!({"weather": "rain"})), operator())
            .await;
        assert_eq!(resp.data, Some(json!({"weather": "RAIN"})));

        let resp = f
            .engine
            .execute(request("r2", "world.weather.set", json!({"weather": "snow"})), operator())
            .await;
        assert_eq!(resp.error_code, Some(ErrorCode::InvalidEnumValue));
        assert_eq!(
            resp.error_message.as_deref(),
            Some("Invalid enum value 'snow' for type Weather. Valid values: CLEAR, RAIN, THUNDER")
        );

        let resp = f
            .engine
            .execute(request("r3", "world.weather.set", json!({})), operator())
            .await;
        assert_eq!(resp.error_code, Some(ErrorCode::ParameterRequired));
    }

    #[tokio::test]
    async fn test_error_mapping() {
        let f = fixture();
        let resp = f.engine.execute(request("r1", "world.fail", json!({})), operator()).await;
        assert_eq!(resp.error_code, Some(ErrorCode::OperationFailed));
        assert_eq!(
            resp.error_message.as_deref(),
            Some("Failed to execute capability: world.fail")
        );

        let resp = f.engine.execute(request("r2", "world.business", json!({})), operator()).await;
        assert_eq!(resp.error_code, Some(ErrorCode::ParameterInvalid));
        assert_eq!(resp.error_message.as_deref(), Some("bad block"));

        let resp = f.engine.execute(request("r3", "world.internal", json!({})), operator()).await;
        assert_eq!(resp.error_code, Some(ErrorCode::InternalError));
        assert_eq!(resp.error_message.as_deref(), Some("Internal error during execution"));

        let resp = f.engine.execute(request("r4", "world.panic", json!({})), operator()).await;
        assert_eq!(resp.error_code, Some(ErrorCode::InternalError));
    }

    #[tokio::test]
    async fn test_failing_invocation_audits_exactly_one_failed_event() {
        let f = fixture();
        f.engine.execute(request("r7", "world.fail", json!({})), operator()).await;
        f.audit.shutdown().await;
        let events = f.sink.events.lock();
        let kinds: Vec<_> = events
            .iter()
            .filter(|e| e.request_id() == Some("r7"))
            .map(|e| e.event_type)
            .collect();
        assert_eq!(kinds, vec![AuditEventType::Invoke, AuditEventType::Failed]);
    }

    #[tokio::test]
    async fn test_spawned_invocations_run_concurrently() {
        let f = fixture();
        let handles: Vec<_> = (0..20)
            .map(|i| {
                f.engine
                    .spawn_execute(request(&format!("r{}", i), "world.time.get", json!({})), operator())
            })
            .collect();
        for handle in handles {
            assert!(handle.await.unwrap().success);
        }
        assert_eq!(f.calls.load(Ordering::SeqCst), 20);
    }

    #[tokio::test]
    async fn test_interceptor_response_override_wins() {
        struct Override;
        impl Interceptor for Override {
            fn name(&self) -> &str {
                "override"
            }
            fn pre_handle(&self, ctx: &mut ExecutionContext) -> Result<bool, CapabilityError> {
                ctx.response = Some(ExecutionResponse::success(&ctx.request_id, Some(json!("cached"))));
                Ok(false)
            }
        }
        let registry = Arc::new(CapabilityRegistry::new());
        registry
            .register(Arc::new(WorldProvider { calls: Arc::new(AtomicUsize::new(0)) }), "t")
            .unwrap();
        let engine = ExecutionEngine::new(registry, vec![Arc::new(Override)]);
        let resp = engine.execute(request("r1", "world.time.get", json!({})), None).await;
        assert_eq!(resp.data, Some(json!("cached")));
    }
}
