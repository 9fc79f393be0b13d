use std::{
    any::{TypeId, type_name},
    fmt,
    marker::PhantomData,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};

use async_trait::async_trait;
use futures::FutureExt;
use tracing::{debug, trace, warn};

use crate::{
    config::EngineConfig,
    context::{InvocationContext, Value},
    error::InterceptError,
    interface::{Dispatch, Invocation},
    method::ReturnShape,
    middleware::{Middleware, MiddlewareDescriptor, Next, Step},
};

/// `PipelineBuilder` 收集按顺序排列的中间件，并把它们与终端步骤一次性编译为洋葱式链路。
///
/// # 教案级说明
/// - **意图（Why）**：
///   - 装配（注册中间件）与执行（驱动调用）分两个阶段进行，编译之后链路不可变，
///     并发调用之间无需任何同步；
///   - 以集中式构建器统一校验“空中间件”，避免非法组件在调用期才暴露。
/// - **执行逻辑（How）**：
///   1. `register*` 追加中间件，顺序即洋葱由外到内的顺序；
///   2. [`Self::compile`] 从最内层开始倒序折叠：终端步骤先被最后注册的中间件包裹，
///      依次向外，最先注册的中间件成为最外层；
///   3. 每层包装持有“剩余链路”的共享引用，中间件通过 [`Next`] 调用它零次、一次或多次。
/// - **契约（What）**：
///   - 注册名称为空白的中间件，或传入缺失的中间件，返回 [`InterceptError::InvalidArgument`]；
///   - 零个中间件时链路只包含终端步骤，调用语义与直接调用目标一致。
/// - **风险与权衡（Trade-offs & Gotchas）**：
///   - 编译会消费构建器，之后新增的中间件不会进入已编译的管线；
///   - 每层包装一次 `Arc` 间接与一次装箱 future，链路越深调用开销越大。
#[derive(Default)]
pub struct PipelineBuilder {
    middleware: Vec<Arc<dyn Middleware>>,
    config: EngineConfig,
}

impl PipelineBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// 以指定配置创建构建器，配置决定终端步骤是否捕获 panic。
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            middleware: Vec::new(),
            config,
        }
    }

    /// 追加中间件。
    pub fn register<M>(&mut self, middleware: M) -> Result<&mut Self, InterceptError>
    where
        M: Middleware,
    {
        self.register_shared(Arc::new(middleware))
    }

    /// 追加已共享的中间件实例，同一实例可出现在多条管线中。
    pub fn register_shared(
        &mut self,
        middleware: Arc<dyn Middleware>,
    ) -> Result<&mut Self, InterceptError> {
        validate(middleware.as_ref())?;
        self.middleware.push(middleware);
        Ok(self)
    }

    /// 追加可能缺失的中间件，缺失时返回 `InvalidArgument`。
    pub fn try_register(
        &mut self,
        middleware: Option<Arc<dyn Middleware>>,
    ) -> Result<&mut Self, InterceptError> {
        let middleware =
            middleware.ok_or_else(|| InterceptError::invalid_argument("middleware is missing"))?;
        self.register_shared(middleware)
    }

    pub fn len(&self) -> usize {
        self.middleware.len()
    }

    pub fn is_empty(&self) -> bool {
        self.middleware.is_empty()
    }

    /// 已注册中间件的描述，按注册顺序排列。
    pub fn descriptors(&self) -> Vec<MiddlewareDescriptor> {
        self.middleware.iter().map(|m| m.descriptor()).collect()
    }

    /// 以接口 `I` 面向实现 `S` 的分发作为终端步骤编译管线。
    pub fn compile<I, S>(self) -> Pipeline
    where
        I: ?Sized + Dispatch<S>,
        S: Send + Sync + 'static,
    {
        let capture_panics = self.config.capture_panics;
        let terminal = Arc::new(TargetInvoker::<I, S>::new(capture_panics));
        let mut pipeline = self.compile_with(terminal);
        pipeline.target = Some((TypeId::of::<S>(), type_name::<S>()));
        pipeline.capture_panics = Some(capture_panics);
        pipeline
    }

    /// 以自定义终端步骤编译管线。
    pub fn compile_with(self, terminal: Arc<dyn Step>) -> Pipeline {
        let descriptors: Arc<[MiddlewareDescriptor]> = self
            .middleware
            .iter()
            .map(|m| m.descriptor())
            .collect();

        let chain = self
            .middleware
            .into_iter()
            .zip(descriptors.iter().cloned())
            .rev()
            .fold(terminal, |rest, (middleware, descriptor)| {
                Arc::new(Layer {
                    middleware,
                    descriptor,
                    next: Next::new(rest),
                }) as Arc<dyn Step>
            });

        debug!(middleware = descriptors.len(), "pipeline compiled");
        Pipeline {
            chain,
            descriptors,
            target: None,
            capture_panics: None,
        }
    }
}

impl fmt::Debug for PipelineBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PipelineBuilder")
            .field("middleware", &self.descriptors())
            .field("config", &self.config)
            .finish()
    }
}

pub(crate) fn validate(middleware: &dyn Middleware) -> Result<(), InterceptError> {
    if middleware.descriptor().is_blank() {
        return Err(InterceptError::invalid_argument(
            "middleware descriptor name must not be empty",
        ));
    }
    Ok(())
}

/// 洋葱中的一层：把中间件与它的“剩余链路”绑定在一起。
struct Layer {
    middleware: Arc<dyn Middleware>,
    descriptor: MiddlewareDescriptor,
    next: Next,
}

#[async_trait]
impl Step for Layer {
    async fn call(&self, ctx: &mut InvocationContext) {
        trace!(
            middleware = self.descriptor.name(),
            category = self.descriptor.category(),
            method = %ctx.method(),
            "entering middleware"
        );
        self.middleware.handle(ctx, self.next.clone()).await;
    }
}

/// 已编译的不可变链路，可在任意多个并发调用之间共享。
#[derive(Clone)]
pub struct Pipeline {
    chain: Arc<dyn Step>,
    descriptors: Arc<[MiddlewareDescriptor]>,
    target: Option<(TypeId, &'static str)>,
    capture_panics: Option<bool>,
}

impl Pipeline {
    /// 链路中的中间件描述，由外到内排列。
    pub fn descriptors(&self) -> &[MiddlewareDescriptor] {
        &self.descriptors
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// 终端步骤面向的实现类型名，自定义终端时为 `None`。
    pub fn target_type_name(&self) -> Option<&'static str> {
        self.target.map(|(_, name)| name)
    }

    /// 默认终端是否捕获目标 panic，自定义终端时为 `None`。
    pub fn capture_panics(&self) -> Option<bool> {
        self.capture_panics
    }

    /// 驱动整条链路直至落定。
    pub async fn run(&self, ctx: &mut InvocationContext) {
        self.chain.call(ctx).await
    }

    /// 校验管线能否驱动实现类型 `S`。
    pub(crate) fn check_target<S: 'static>(&self) -> Result<(), InterceptError> {
        match self.target {
            Some((id, expected)) if id != TypeId::of::<S>() => Err(InterceptError::TargetMismatch {
                expected,
                actual: type_name::<S>(),
            }),
            _ => Ok(()),
        }
    }

    /// 校验默认终端的 panic 处置与引擎配置一致。
    pub(crate) fn check_config(&self, config: &EngineConfig) -> Result<(), InterceptError> {
        match self.capture_panics {
            Some(compiled) if compiled != config.capture_panics => {
                Err(InterceptError::ConfigMismatch {
                    setting: "capture_panics",
                    pipeline: compiled,
                    engine: config.capture_panics,
                })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pipeline")
            .field("middleware", &self.descriptors)
            .field("target", &self.target_type_name())
            .field("capture_panics", &self.capture_panics)
            .finish()
    }
}

/// 终端步骤：把调用分发到真实实现，并把结果或失败写入上下文。
///
/// # 契约说明（What）
/// - 每次进入都克隆一份当前参数再分发，因此外层中间件多次调用 `next` 时每次都看到最新的参数；
/// - 成功时清空错误槽并写入结果（完成形状不写结果），失败时清空结果槽并写入错误；
/// - `capture_panics` 开启时目标的 panic 被转为 [`InterceptError::Panicked`]，否则继续展开。
pub struct TargetInvoker<I: ?Sized, S> {
    capture_panics: bool,
    _marker: PhantomData<fn(&I, &S)>,
}

impl<I: ?Sized, S> TargetInvoker<I, S> {
    pub fn new(capture_panics: bool) -> Self {
        Self {
            capture_panics,
            _marker: PhantomData,
        }
    }
}

impl<I, S> TargetInvoker<I, S>
where
    I: ?Sized + Dispatch<S>,
    S: Send + Sync + 'static,
{
    /// 同步阶段：取出目标与参数副本并完成分发。上下文引用不跨越任何等待点。
    fn start(&self, ctx: &InvocationContext) -> Invocation {
        let target = match Arc::clone(ctx.target()).downcast::<S>() {
            Ok(target) => target,
            Err(_) => {
                return Invocation::failed(InterceptError::TargetMismatch {
                    expected: type_name::<S>(),
                    actual: "<unknown target>",
                });
            }
        };
        let method = ctx.method();
        let arguments = ctx.arguments().clone();

        if self.capture_panics {
            catch_unwind(AssertUnwindSafe(|| I::dispatch(target, method, arguments)))
                .unwrap_or_else(|payload| Invocation::failed(InterceptError::panicked(payload)))
        } else {
            I::dispatch(target, method, arguments)
        }
    }

    async fn settle(&self, invocation: Invocation) -> Result<Value, InterceptError> {
        match invocation {
            Invocation::Ready(outcome) => outcome,
            Invocation::Pending(future) if self.capture_panics => AssertUnwindSafe(future)
                .catch_unwind()
                .await
                .unwrap_or_else(|payload| Err(InterceptError::panicked(payload))),
            Invocation::Pending(future) => future.await,
        }
    }
}

#[async_trait]
impl<I, S> Step for TargetInvoker<I, S>
where
    I: ?Sized + Dispatch<S>,
    S: Send + Sync + 'static,
{
    async fn call(&self, ctx: &mut InvocationContext) {
        let invocation = self.start(ctx);
        match self.settle(invocation).await {
            Ok(value) => {
                ctx.clear_error();
                if ctx.method().shape() == ReturnShape::Completion {
                    ctx.clear_result();
                } else {
                    ctx.set_result_value(value);
                }
            }
            Err(error) => {
                warn!(method = %ctx.method(), code = error.code(), %error, "target failed");
                ctx.clear_result();
                ctx.set_error(error);
            }
        }
    }
}

impl<I: ?Sized, S> fmt::Debug for TargetInvoker<I, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TargetInvoker")
            .field("target", &type_name::<S>())
            .field("capture_panics", &self.capture_panics)
            .finish()
    }
}
