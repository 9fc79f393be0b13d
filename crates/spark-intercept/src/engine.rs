//! 拦截引擎：生成代理与已编译管线之间的桥梁。
//!
//! # 教案式说明
//! - **意图 (Why)**：代理方法本身不包含任何拦截逻辑，只把“哪个方法、什么参数、期望什么形状”交给引擎；
//!   引擎负责创建上下文、驱动链路，并把最终的结果槽/错误槽还原为调用方声明的返回类型；
//! - **契约 (What)**：
//!   - 引擎只能装配一次：装配前的调用返回 `NotConfigured`，二次装配返回 `AlreadyConfigured`；
//!   - 三种入口对应三种返回形状，类型还原只在引擎边缘发生；
//!   - 错误身份在边缘保持：目标返回的原始错误若恰为调用方声明的错误类型，则原值交还；
//! - **风险提示 (Trade-offs)**：
//!   - 同步入口以 `futures::executor::block_on` 阻塞调用线程。若链路中的中间件等待的事件需要由被阻塞的
//!     线程推进（例如由同一线程驱动的单线程运行时），调用将永远无法落定；在异步运行时上调用同步形状方法时
//!     应放入 `spawn_blocking`，或保证相关中间件不依赖运行时；
//!   - 异步入口返回惰性 future：装配与参数校验在创建时完成，失败在首次轮询时报告。

use std::{
    any::{Any, type_name},
    error::Error as StdError,
    fmt,
    sync::Arc,
};

use futures::{FutureExt, executor::block_on, future::BoxFuture};
use parking_lot::RwLock;
use tracing::{Instrument, Span, debug, debug_span, trace};

use crate::{
    config::EngineConfig,
    context::{Arguments, InvocationContext, Value},
    error::InterceptError,
    method::{MethodDescriptor, ReturnShape},
    pipeline::Pipeline,
    resolver::Resolver,
};

/// 单次调用的生命周期阶段。
///
/// 合法迁移：`Created → Dispatched → [BlockedOnChain →] {SettledOk | SettledError}`，
/// 每次调用恰好落定一次。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum CallPhase {
    /// 上下文已创建，链路尚未开始。
    Created,
    /// 链路已开始执行。
    Dispatched,
    /// 同步入口正阻塞调用线程等待链路落定。
    BlockedOnChain,
    /// 链路落定且错误槽为空。
    SettledOk,
    /// 链路落定且错误槽有值。
    SettledError,
}

impl CallPhase {
    /// 是否允许从当前阶段迁移到 `next`。
    pub const fn can_advance_to(self, next: CallPhase) -> bool {
        matches!(
            (self, next),
            (Self::Created, Self::Dispatched)
                | (Self::Dispatched, Self::BlockedOnChain)
                | (
                    Self::Dispatched | Self::BlockedOnChain,
                    Self::SettledOk | Self::SettledError
                )
        )
    }

    pub const fn is_settled(self) -> bool {
        matches!(self, Self::SettledOk | Self::SettledError)
    }
}

/// 装配完成后不可变的绑定关系。
struct Binding {
    target: Arc<dyn Any + Send + Sync>,
    target_name: &'static str,
    resolver: Arc<dyn Resolver>,
    pipeline: Pipeline,
}

/// 拦截引擎。
///
/// # 并发模型
/// 绑定关系存放在 `RwLock<Option<Arc<_>>>` 中，读锁只在克隆 `Arc` 时短暂持有；
/// 链路本身不可变，并发调用之间不共享任何可变状态。
pub struct InterceptionEngine {
    binding: RwLock<Option<Arc<Binding>>>,
    config: EngineConfig,
}

impl Default for InterceptionEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptionEngine {
    /// 创建尚未装配的引擎。
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            binding: RwLock::new(None),
            config,
        }
    }

    /// 创建并立即装配。
    pub fn configured<S>(
        target: Arc<S>,
        resolver: Arc<dyn Resolver>,
        pipeline: Pipeline,
        config: EngineConfig,
    ) -> Result<Self, InterceptError>
    where
        S: Send + Sync + 'static,
    {
        let engine = Self::with_config(config);
        engine.configure(target, resolver, pipeline)?;
        Ok(engine)
    }

    /// 绑定目标实例、解析句柄与已编译管线，只能成功一次。
    ///
    /// # 错误
    /// - 已装配：[`InterceptError::AlreadyConfigured`]；
    /// - 管线面向其他实现类型：[`InterceptError::TargetMismatch`]；
    /// - 管线的 panic 处置与引擎配置不一致：[`InterceptError::ConfigMismatch`]。
    pub fn configure<S>(
        &self,
        target: Arc<S>,
        resolver: Arc<dyn Resolver>,
        pipeline: Pipeline,
    ) -> Result<(), InterceptError>
    where
        S: Send + Sync + 'static,
    {
        let mut binding = self.binding.write();
        if binding.is_some() {
            return Err(InterceptError::AlreadyConfigured);
        }
        pipeline.check_target::<S>()?;
        pipeline.check_config(&self.config)?;

        debug!(
            implementation = type_name::<S>(),
            middleware = pipeline.len(),
            "interception engine configured"
        );
        *binding = Some(Arc::new(Binding {
            target,
            target_name: type_name::<S>(),
            resolver,
            pipeline,
        }));
        Ok(())
    }

    pub fn is_configured(&self) -> bool {
        self.binding.read().is_some()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 已绑定的管线。
    pub fn pipeline(&self) -> Option<Pipeline> {
        self.binding
            .read()
            .as_ref()
            .map(|binding| binding.pipeline.clone())
    }

    /// 同步形状入口：阻塞调用线程直至链路落定。
    pub fn invoke_value<T, E>(
        &self,
        method: Option<&'static MethodDescriptor>,
        arguments: Option<Arguments>,
    ) -> Result<T, E>
    where
        T: Any + Send,
        E: StdError + From<InterceptError> + 'static,
    {
        let mut call = self
            .begin(method, arguments, ReturnShape::Value)
            .map_err(InterceptError::into_caller::<E>)?;
        call.advance(CallPhase::Dispatched);
        call.advance(CallPhase::BlockedOnChain);
        let span = call.span.clone();
        let (method, outcome) = block_on(call.settle().instrument(span));
        outcome
            .and_then(|value| adapt::<T>(method, value))
            .map_err(InterceptError::into_caller::<E>)
    }

    /// 完成形状入口：链路落定后只交付成功或失败。
    pub fn invoke_completion<E>(
        &self,
        method: Option<&'static MethodDescriptor>,
        arguments: Option<Arguments>,
    ) -> BoxFuture<'static, Result<(), E>>
    where
        E: StdError + From<InterceptError> + Send + 'static,
    {
        let started = self.begin(method, arguments, ReturnShape::Completion);
        async move {
            let mut call = started.map_err(InterceptError::into_caller::<E>)?;
            call.advance(CallPhase::Dispatched);
            let span = call.span.clone();
            let (_, outcome) = call.settle().instrument(span).await;
            outcome.map(drop).map_err(InterceptError::into_caller::<E>)
        }
        .boxed()
    }

    /// 类型化结果入口：链路落定后把结果槽还原为 `T`。
    pub fn invoke_result<T, E>(
        &self,
        method: Option<&'static MethodDescriptor>,
        arguments: Option<Arguments>,
    ) -> BoxFuture<'static, Result<T, E>>
    where
        T: Any + Send,
        E: StdError + From<InterceptError> + Send + 'static,
    {
        let started = self.begin(method, arguments, ReturnShape::Result);
        async move {
            let mut call = started.map_err(InterceptError::into_caller::<E>)?;
            call.advance(CallPhase::Dispatched);
            let span = call.span.clone();
            let (method, outcome) = call.settle().instrument(span).await;
            outcome
                .and_then(|value| adapt::<T>(method, value))
                .map_err(InterceptError::into_caller::<E>)
        }
        .boxed()
    }

    /// 校验入口参数并创建调用。
    ///
    /// 检查顺序：是否已装配、方法描述是否缺失、形状是否一致；缺失的参数列表视为空列表。
    fn begin(
        &self,
        method: Option<&'static MethodDescriptor>,
        arguments: Option<Arguments>,
        entry: ReturnShape,
    ) -> Result<Call, InterceptError> {
        let binding = self
            .binding
            .read()
            .clone()
            .ok_or(InterceptError::NotConfigured)?;
        let method =
            method.ok_or_else(|| InterceptError::invalid_argument("method descriptor is missing"))?;
        if self.config.strict_shapes && method.shape() != entry {
            return Err(InterceptError::invalid_argument(format!(
                "`{method}` is declared as {} but was invoked as {entry}",
                method.shape()
            )));
        }

        let span = debug_span!(
            "spark_intercept.call",
            service = method.service(),
            method = method.name(),
            shape = entry.as_str(),
        );
        let ctx = InvocationContext::new(
            Arc::clone(&binding.target),
            method,
            arguments.unwrap_or_default(),
            Arc::clone(&binding.resolver),
        );
        Ok(Call {
            phase: CallPhase::Created,
            ctx,
            pipeline: binding.pipeline.clone(),
            span,
        })
    }
}

impl fmt::Debug for InterceptionEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let binding = self.binding.read();
        f.debug_struct("InterceptionEngine")
            .field("target", &binding.as_ref().map(|b| b.target_name))
            .field("pipeline", &binding.as_ref().map(|b| &b.pipeline))
            .field("config", &self.config)
            .finish()
    }
}

/// 单次调用：独占上下文，落定时被消费，因此同一上下文不会被链路二次进入。
struct Call {
    phase: CallPhase,
    ctx: InvocationContext,
    pipeline: Pipeline,
    span: Span,
}

impl Call {
    fn advance(&mut self, next: CallPhase) {
        debug_assert!(
            self.phase.can_advance_to(next),
            "illegal call phase transition {:?} -> {:?}",
            self.phase,
            next
        );
        trace!(from = ?self.phase, to = ?next, "call phase");
        self.phase = next;
    }

    async fn settle(
        mut self,
    ) -> (
        &'static MethodDescriptor,
        Result<Option<Value>, InterceptError>,
    ) {
        self.pipeline.run(&mut self.ctx).await;

        let settled = if self.ctx.is_failed() {
            CallPhase::SettledError
        } else {
            CallPhase::SettledOk
        };
        self.advance(settled);
        match self.ctx.error() {
            Some(error) => debug!(outcome = "error", code = error.code(), "call settled"),
            None => debug!(outcome = "ok", "call settled"),
        }

        let method = self.ctx.method();
        (method, self.ctx.into_outcome())
    }
}

/// 把结果槽还原为声明类型；空结果槽视为 `()`。
fn adapt<T: Any>(
    method: &'static MethodDescriptor,
    value: Option<Value>,
) -> Result<T, InterceptError> {
    let value = value.unwrap_or_else(|| Box::new(()));
    value
        .downcast::<T>()
        .map(|value| *value)
        .map_err(|_| InterceptError::Adaptation {
            service: method.service(),
            method: method.name(),
            expected: type_name::<T>(),
        })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use thiserror::Error;
    use tracing_test::traced_test;

    use super::*;
    use crate::{
        error::ErrorKind,
        interface::{Intercept, Interface},
        interceptable,
        middleware::{MiddlewareDescriptor, from_fn},
        pipeline::PipelineBuilder,
        resolver::NoopResolver,
    };

    #[derive(Debug, Error, PartialEq, Eq)]
    enum LedgerError {
        #[error("account {0} is frozen")]
        Frozen(u64),
        #[error("{0}")]
        Intercept(String),
    }

    impl From<InterceptError> for LedgerError {
        fn from(err: InterceptError) -> Self {
            Self::Intercept(err.code().to_owned())
        }
    }

    #[interceptable]
    trait Ledger: Send + Sync {
        fn balance(&self, account: u64) -> Result<i64, LedgerError>;
        async fn post(&self, account: u64, amount: i64) -> Result<(), LedgerError>;
        async fn history(&self, account: u64) -> Result<Vec<i64>, LedgerError>;
    }

    #[derive(Default)]
    struct MemoryLedger {
        posts: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Ledger for MemoryLedger {
        fn balance(&self, account: u64) -> Result<i64, LedgerError> {
            if account == 0 {
                return Err(LedgerError::Frozen(account));
            }
            Ok(100)
        }

        async fn post(&self, _account: u64, _amount: i64) -> Result<(), LedgerError> {
            self.posts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn history(&self, account: u64) -> Result<Vec<i64>, LedgerError> {
            Ok(vec![account as i64, -1])
        }
    }

    fn methods() -> &'static [MethodDescriptor] {
        <dyn Ledger as Interface>::METHODS
    }

    fn configured(builder: PipelineBuilder, config: EngineConfig) -> InterceptionEngine {
        InterceptionEngine::configured(
            Arc::new(MemoryLedger::default()),
            Arc::new(NoopResolver),
            builder.compile::<dyn Ledger, MemoryLedger>(),
            config,
        )
        .expect("fresh engine")
    }

    #[test]
    fn unconfigured_engine_rejects_calls() {
        let engine = InterceptionEngine::new();
        let err = engine
            .invoke_value::<i64, InterceptError>(Some(&methods()[0]), None)
            .expect_err("not configured");
        assert!(matches!(err, InterceptError::NotConfigured));

        let proxy = <dyn Ledger as Intercept>::from_engine(InterceptionEngine::new());
        assert_eq!(
            proxy.balance(1),
            Err(LedgerError::Intercept("intercept.not_configured".to_owned()))
        );
    }

    #[test]
    fn configuration_happens_once_and_checks_target() {
        let engine = configured(PipelineBuilder::new(), EngineConfig::default());
        assert!(engine.is_configured());
        let err = engine
            .configure(
                Arc::new(MemoryLedger::default()),
                Arc::new(NoopResolver),
                PipelineBuilder::new().compile::<dyn Ledger, MemoryLedger>(),
            )
            .expect_err("second configure");
        assert!(matches!(err, InterceptError::AlreadyConfigured));

        let err = InterceptionEngine::new()
            .configure(
                Arc::new(String::from("not a ledger")),
                Arc::new(NoopResolver),
                PipelineBuilder::new().compile::<dyn Ledger, MemoryLedger>(),
            )
            .expect_err("mismatched target");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert!(matches!(err, InterceptError::TargetMismatch { .. }));
    }

    #[test]
    fn missing_descriptor_and_arguments() {
        let engine = configured(PipelineBuilder::new(), EngineConfig::default());
        let err = engine
            .invoke_value::<i64, InterceptError>(None, None)
            .expect_err("missing descriptor");
        assert!(matches!(err, InterceptError::InvalidArgument(_)));

        // 缺失的参数列表被视为空列表，分发时才报告参数缺失。
        let err = engine
            .invoke_value::<i64, InterceptError>(Some(&methods()[0]), None)
            .expect_err("no argument at position 0");
        assert!(matches!(err, InterceptError::Argument { index: 0, .. }));
    }

    #[test]
    fn value_shape_returns_result_and_original_error() {
        let engine = configured(PipelineBuilder::new(), EngineConfig::default());
        let balance = engine.invoke_value::<i64, LedgerError>(
            Some(&methods()[0]),
            Some(Arguments::new().with(7_u64)),
        );
        assert_eq!(balance, Ok(100));

        let frozen = engine.invoke_value::<i64, LedgerError>(
            Some(&methods()[0]),
            Some(Arguments::new().with(0_u64)),
        );
        assert_eq!(frozen, Err(LedgerError::Frozen(0)));
    }

    #[test]
    fn async_shapes_settle_through_futures() {
        let engine = configured(PipelineBuilder::new(), EngineConfig::default());
        let posted = block_on(engine.invoke_completion::<LedgerError>(
            Some(&methods()[1]),
            Some(Arguments::new().with(1_u64).with(25_i64)),
        ));
        assert_eq!(posted, Ok(()));

        let history = block_on(engine.invoke_result::<Vec<i64>, LedgerError>(
            Some(&methods()[2]),
            Some(Arguments::new().with(3_u64)),
        ));
        assert_eq!(history, Ok(vec![3, -1]));
    }

    #[test]
    fn strict_shapes_reject_mismatched_entry_points() {
        let engine = configured(PipelineBuilder::new(), EngineConfig::default());
        let err = block_on(engine.invoke_result::<i64, InterceptError>(
            Some(&methods()[0]),
            Some(Arguments::new().with(7_u64)),
        ))
        .expect_err("value method through result entry");
        assert_eq!(err.kind(), ErrorKind::InvalidInput);

        let relaxed = configured(
            PipelineBuilder::new(),
            EngineConfig::default().with_strict_shapes(false),
        );
        let balance = block_on(relaxed.invoke_result::<i64, InterceptError>(
            Some(&methods()[0]),
            Some(Arguments::new().with(7_u64)),
        ));
        assert_eq!(balance.ok(), Some(100));
    }

    #[test]
    fn panic_policy_must_match_the_compiled_pipeline() {
        let err = InterceptionEngine::with_config(EngineConfig::default().with_capture_panics(false))
            .configure(
                Arc::new(MemoryLedger::default()),
                Arc::new(NoopResolver),
                PipelineBuilder::new().compile::<dyn Ledger, MemoryLedger>(),
            )
            .expect_err("engine disagrees with pipeline");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.code(), crate::error::codes::CONFIG_MISMATCH);
        assert!(matches!(
            err,
            InterceptError::ConfigMismatch {
                setting: "capture_panics",
                pipeline: true,
                engine: false,
            }
        ));

        let relaxed = EngineConfig::default().with_capture_panics(false);
        let engine = configured(PipelineBuilder::with_config(relaxed.clone()), relaxed);
        assert!(!engine.config().capture_panics);
        assert_eq!(engine.pipeline().and_then(|p| p.capture_panics()), Some(false));
    }

    #[test]
    fn mistyped_result_is_an_adaptation_failure() {
        let mut builder = PipelineBuilder::new();
        builder
            .register(from_fn("test.mistype", |ctx, _next| {
                Box::pin(async move { ctx.set_result("not a number") })
            }))
            .unwrap();
        let engine = configured(builder, EngineConfig::default());
        let err = engine
            .invoke_value::<i64, InterceptError>(
                Some(&methods()[0]),
                Some(Arguments::new().with(1_u64)),
            )
            .expect_err("wrong result type");
        assert!(matches!(err, InterceptError::Adaptation { method: "balance", .. }));
    }

    #[test]
    fn async_entry_reports_configuration_errors_when_polled() {
        let engine = InterceptionEngine::new();
        let pending = engine.invoke_completion::<InterceptError>(Some(&methods()[1]), None);
        let err = block_on(pending).expect_err("not configured");
        assert_eq!(err.code(), crate::error::codes::NOT_CONFIGURED);
    }

    #[test]
    fn call_phase_transitions() {
        use CallPhase::*;
        assert!(Created.can_advance_to(Dispatched));
        assert!(Dispatched.can_advance_to(BlockedOnChain));
        assert!(Dispatched.can_advance_to(SettledOk));
        assert!(BlockedOnChain.can_advance_to(SettledError));
        assert!(!Created.can_advance_to(SettledOk));
        assert!(!SettledOk.can_advance_to(Dispatched));
        assert!(!SettledError.can_advance_to(SettledOk));
        assert!(SettledError.is_settled());
        assert!(!BlockedOnChain.is_settled());
    }

    #[test]
    #[traced_test]
    fn calls_are_traced() {
        let engine = configured(PipelineBuilder::new(), EngineConfig::default());
        let _ = engine.invoke_value::<i64, LedgerError>(
            Some(&methods()[0]),
            Some(Arguments::new().with(0_u64)),
        );
        assert!(logs_contain("spark_intercept.call"));
        assert!(logs_contain("target failed"));
        assert!(logs_contain("call settled"));
    }

    #[test]
    #[traced_test]
    fn middleware_entry_is_traced_with_its_category() {
        let mut builder = PipelineBuilder::new();
        builder
            .register(
                from_fn("acme.guard", |ctx, next| {
                    Box::pin(async move { next.run(ctx).await })
                })
                .with_descriptor(MiddlewareDescriptor::new("acme.guard", "security")),
            )
            .unwrap();
        let engine = configured(builder, EngineConfig::default());
        let _ = engine.invoke_value::<i64, LedgerError>(
            Some(&methods()[0]),
            Some(Arguments::new().with(1_u64)),
        );
        assert!(logs_contain("entering middleware"));
        assert!(logs_contain("acme.guard"));
        assert!(logs_contain("security"));
    }
}
