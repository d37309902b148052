//! Interceptor trait and the ordered pipeline that wraps every invocation.
//!
//! # Ordering
//!
//! ```text
//! pre_handle   0 → 1 → … → n-1      (ascending `order()`)
//! target
//! post_handle  n-1 → … → 1 → 0      (descending)
//! on_error     failing index → … → 0
//! on_abort     failing index + 1 → … → n-1
//! ```
//!
//! A `pre_handle` returning `Ok(false)` marks the context skipped: the target
//! and every `post_handle` are bypassed. Errors raised inside `on_error` are
//! logged and swallowed so the original failure is what the caller sees.
//! Interceptors outside the unwind range get `on_abort` instead, so every
//! interceptor observes a failed invocation exactly once.
//!
//! The chain holds no per-invocation state. One chain is built per engine and
//! shared by every concurrent invocation.

use std::future::Future;
use std::sync::Arc;

use serde_json::Value;

use super::context::ExecutionContext;
use crate::error::CapabilityError;

/// A cross-cutting stage wrapped around every capability invocation.
///
/// All hooks have no-op defaults; implementors pick what they need.
pub trait Interceptor: Send + Sync + 'static {
    /// Name used in log lines.
    fn name(&self) -> &str;

    /// Lower runs earlier in `pre_handle`.
    fn order(&self) -> i32 {
        0
    }

    /// Called before the target. Return `Ok(false)` to skip the invocation.
    fn pre_handle(&self, _ctx: &mut ExecutionContext) -> Result<bool, CapabilityError> {
        Ok(true)
    }

    /// Called after a successful target, in reverse order.
    fn post_handle(&self, _ctx: &mut ExecutionContext, _result: &Value) -> Result<(), CapabilityError> {
        Ok(())
    }

    /// Called when any stage fails.
    fn on_error(&self, _ctx: &mut ExecutionContext, _error: &CapabilityError) -> Result<(), CapabilityError> {
        Ok(())
    }

    /// Called when the invocation failed outside this interceptor's unwind
    /// range: an earlier `pre_handle` failed before this one ran, or a later
    /// `post_handle` failed after this one returned.
    fn on_abort(&self, _ctx: &mut ExecutionContext, _error: &CapabilityError) {}
}

/// Immutable, order-sorted list of interceptors.
#[derive(Clone, Default)]
pub struct ExecutionChain {
    interceptors: Arc<[Arc<dyn Interceptor>]>,
}

impl ExecutionChain {
    /// Build a chain; interceptors are stably sorted by `order()`.
    pub fn new(mut interceptors: Vec<Arc<dyn Interceptor>>) -> Self {
        interceptors.sort_by_key(|i| i.order());
        Self {
            interceptors: interceptors.into(),
        }
    }

    pub fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
        &self.interceptors
    }

    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run the pipeline around `target`.
    ///
    /// `target` receives the context after every `pre_handle` has run and
    /// must return a future that owns its inputs. On success the result is
    /// stored in `ctx.result`.
    pub async fn proceed<F, Fut>(&self, ctx: &mut ExecutionContext, target: F) -> Result<(), CapabilityError>
    where
        F: FnOnce(&ExecutionContext) -> Fut,
        Fut: Future<Output = Result<Value, CapabilityError>>,
    {
        let last = self.interceptors.len().saturating_sub(1);

        for (index, interceptor) in self.interceptors.iter().enumerate() {
            match interceptor.pre_handle(ctx) {
                Ok(true) => {}
                Ok(false) => {
                    log::debug!(
                        "Interceptor {} skipped execution of {}",
                        interceptor.name(),
                        ctx.capability_id()
                    );
                    ctx.skipped = true;
                    return Ok(());
                }
                Err(error) => return Err(self.unwind(ctx, index, error)),
            }
        }

        let result = match target(ctx).await {
            Ok(result) => result,
            Err(error) => return Err(self.unwind(ctx, last, error)),
        };
        ctx.result = Some(result.clone());

        for (index, interceptor) in self.interceptors.iter().enumerate().rev() {
            if let Err(error) = interceptor.post_handle(ctx, &result) {
                return Err(self.unwind(ctx, index, error));
            }
        }
        Ok(())
    }

    /// Run `on_error` from `from` down to 0, `on_abort` on the rest, and hand
    /// back the original error.
    fn unwind(&self, ctx: &mut ExecutionContext, from: usize, error: CapabilityError) -> CapabilityError {
        if self.interceptors.is_empty() {
            return error;
        }
        let (unwound, aborted) = self.interceptors.split_at(from + 1);
        for interceptor in unwound.iter().rev() {
            if let Err(secondary) = interceptor.on_error(ctx, &error) {
                log::error!(
                    "Error in interceptor {} onError: {}",
                    interceptor.name(),
                    secondary
                );
            }
        }
        for interceptor in aborted {
            interceptor.on_abort(ctx, &error);
        }
        error
    }
}

impl std::fmt::Debug for ExecutionChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.interceptors.iter().map(|i| (i.name(), i.order())))
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::capabilities::capability::{handler_fn, CapabilityBinding, CapabilitySpec};
    use crate::capabilities::CapabilityDescriptor;
    use crate::core::context::ExecutionRequest;
    use crate::error::ErrorCode;
    use parking_lot::Mutex;
    use serde_json::json;

    /// Records every hook call as "name:stage".
    pub(crate) struct Recorder {
        pub name: String,
        pub order: i32,
        pub log: Arc<Mutex<Vec<String>>>,
        pub skip: bool,
        pub fail_pre: bool,
        pub fail_on_error: bool,
    }

    impl Recorder {
        pub(crate) fn new(name: &str, order: i32, log: &Arc<Mutex<Vec<String>>>) -> Self {
            Self {
                name: name.to_string(),
                order,
                log: log.clone(),
                skip: false,
                fail_pre: false,
                fail_on_error: false,
            }
        }
    }

    impl Interceptor for Recorder {
        fn name(&self) -> &str {
            &self.name
        }
        fn order(&self) -> i32 {
            self.order
        }
        fn pre_handle(&self, _ctx: &mut ExecutionContext) -> Result<bool, CapabilityError> {
            self.log.lock().push(format!("{}:pre", self.name));
            if self.fail_pre {
                return Err(CapabilityError::permission_denied("denied"));
            }
            Ok(!self.skip)
        }
        fn post_handle(&self, _ctx: &mut ExecutionContext, _result: &Value) -> Result<(), CapabilityError> {
            self.log.lock().push(format!("{}:post", self.name));
            Ok(())
        }
        fn on_error(&self, _ctx: &mut ExecutionContext, _error: &CapabilityError) -> Result<(), CapabilityError> {
            self.log.lock().push(format!("{}:error", self.name));
            if self.fail_on_error {
                return Err(CapabilityError::failed("secondary"));
            }
            Ok(())
        }
        fn on_abort(&self, _ctx: &mut ExecutionContext, _error: &CapabilityError) {
            self.log.lock().push(format!("{}:abort", self.name));
        }
    }

    pub(crate) fn context(id: &str) -> ExecutionContext {
        let desc = CapabilityDescriptor::from_binding(
            CapabilityBinding::new(
                CapabilitySpec::context(id, "test"),
                handler_fn(|_args| async { Ok(Value::Null) }),
            ),
            "test",
        );
        ExecutionContext::new(
            &ExecutionRequest::new("req-1", id, Default::default()),
            Arc::new(desc),
            None,
        )
    }

    #[tokio::test]
    async fn test_success_runs_pre_ascending_and_post_descending() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ExecutionChain::new(vec![
            Arc::new(Recorder::new("audit", 1000, &log)),
            Arc::new(Recorder::new("perm", 100, &log)),
        ]);
        let mut ctx = context("x");
        let target_log = log.clone();
        chain
            .proceed(&mut ctx, move |_| {
                target_log.lock().push("target".into());
                async { Ok(json!(42)) }
            })
            .await
            .unwrap();

        assert_eq!(
            *log.lock(),
            vec!["perm:pre", "audit:pre", "target", "audit:post", "perm:post"]
        );
        assert_eq!(ctx.result, Some(json!(42)));
        assert!(!ctx.skipped);
    }

    #[tokio::test]
    async fn test_skip_bypasses_target_and_post() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut gate = Recorder::new("gate", 1, &log);
        gate.skip = true;
        let chain = ExecutionChain::new(vec![
            Arc::new(gate),
            Arc::new(Recorder::new("later", 2, &log)),
        ]);
        let mut ctx = context("x");
        let target_log = log.clone();
        chain
            .proceed(&mut ctx, move |_| {
                target_log.lock().push("target".into());
                async { Ok(Value::Null) }
            })
            .await
            .unwrap();
        assert!(ctx.skipped);
        assert_eq!(*log.lock(), vec!["gate:pre"]);
    }

    #[tokio::test]
    async fn test_pre_failure_unwinds_from_failing_index() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut second = Recorder::new("second", 2, &log);
        second.fail_pre = true;
        let chain = ExecutionChain::new(vec![
            Arc::new(Recorder::new("first", 1, &log)),
            Arc::new(second),
            Arc::new(Recorder::new("third", 3, &log)),
        ]);
        let mut ctx = context("x");
        let err = chain
            .proceed(&mut ctx, |_| async { Ok(Value::Null) })
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some(ErrorCode::PermissionDenied));
        assert_eq!(
            *log.lock(),
            vec!["first:pre", "second:pre", "second:error", "first:error", "third:abort"]
        );
    }

    #[tokio::test]
    async fn test_post_failure_aborts_interceptors_that_already_finished() {
        struct FailingPost;
        impl Interceptor for FailingPost {
            fn name(&self) -> &str {
                "failing"
            }
            fn order(&self) -> i32 {
                2
            }
            fn post_handle(&self, _ctx: &mut ExecutionContext, _result: &Value) -> Result<(), CapabilityError> {
                Err(CapabilityError::failed("post"))
            }
        }
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ExecutionChain::new(vec![
            Arc::new(Recorder::new("first", 1, &log)),
            Arc::new(FailingPost),
            Arc::new(Recorder::new("last", 3, &log)),
        ]);
        let mut ctx = context("x");
        chain
            .proceed(&mut ctx, |_| async { Ok(Value::Null) })
            .await
            .unwrap_err();
        assert_eq!(
            *log.lock(),
            vec!["first:pre", "last:pre", "last:post", "first:error", "last:abort"]
        );
    }

    #[tokio::test]
    async fn test_target_failure_reaches_every_on_error_and_survives_secondary_errors() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut noisy = Recorder::new("noisy", 2, &log);
        noisy.fail_on_error = true;
        let chain = ExecutionChain::new(vec![
            Arc::new(Recorder::new("first", 1, &log)),
            Arc::new(noisy),
        ]);
        let mut ctx = context("x");
        let err = chain
            .proceed(&mut ctx, |_| async {
                Err(CapabilityError::new(ErrorCode::OperationFailed, "boom"))
            })
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "boom");
        assert_eq!(
            *log.lock(),
            vec!["first:pre", "noisy:pre", "noisy:error", "first:error"]
        );
        assert!(ctx.result.is_none());
    }

    #[tokio::test]
    async fn test_chain_is_reusable_across_invocations() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain = ExecutionChain::new(vec![Arc::new(Recorder::new("only", 1, &log))]);
        for i in 0..3 {
            let mut ctx = context("x");
            chain
                .proceed(&mut ctx, move |_| async move { Ok(json!(i)) })
                .await
                .unwrap();
            assert_eq!(ctx.result, Some(json!(i)));
        }
        assert_eq!(log.lock().len(), 6);
    }

    #[tokio::test]
    async fn test_empty_chain_runs_target() {
        let chain = ExecutionChain::default();
        let mut ctx = context("x");
        chain
            .proceed(&mut ctx, |_| async { Ok(json!("ok")) })
            .await
            .unwrap();
        assert_eq!(ctx.result, Some(json!("ok")));
        let err = chain
            .proceed(&mut ctx, |_| async { Err(CapabilityError::failed("x")) })
            .await
            .unwrap_err();
        assert!(matches!(err, CapabilityError::Failed(_)));
    }
}
