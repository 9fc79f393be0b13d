use std::{borrow::Cow, fmt, sync::Arc};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::context::InvocationContext;

/// 中间件的身份信息：注册校验、链路内省与日志都只认它。
///
/// - `name` 是稳定标识，约定 `vendor.component`；空白名称即“空中间件”，注册时被拒绝；
/// - `category` 是粗粒度分组（`security`、`resilience` 等），未指定时为 `unspecified`，
///   随 `trace` 日志一起输出，便于按类过滤。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MiddlewareDescriptor {
    name: Cow<'static, str>,
    category: Cow<'static, str>,
}

impl MiddlewareDescriptor {
    pub fn new(
        name: impl Into<Cow<'static, str>>,
        category: impl Into<Cow<'static, str>>,
    ) -> Self {
        Self {
            name: name.into(),
            category: category.into(),
        }
    }

    /// 只给名称，分类记为 `unspecified`。
    pub fn named(name: impl Into<Cow<'static, str>>) -> Self {
        Self::new(name, "unspecified")
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn category(&self) -> &str {
        &self.category
    }

    pub fn is_blank(&self) -> bool {
        self.name.trim().is_empty()
    }
}

impl fmt::Display for MiddlewareDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} [{}]", self.name, self.category)
    }
}

/// 链路中的一步：终端步骤与“链路剩余部分”共享此形状。
///
/// # 契约说明（What）
/// - 终端步骤负责执行真实调用，并把结果或失败写入上下文；它从不继续向后调用；
/// - 实现不得向外 panic 或返回错误：所有失败都以数据形式写入错误槽。
#[async_trait]
pub trait Step: Send + Sync + 'static {
    async fn call(&self, ctx: &mut InvocationContext);
}

/// 交给中间件的“剩余链路”。
///
/// 可被调用零次（短路）、一次或多次（重试）；每次调用都会从下一个中间件重新开始，
/// 直到终端步骤。
#[derive(Clone)]
pub struct Next {
    rest: Arc<dyn Step>,
}

impl Next {
    pub(crate) fn new(rest: Arc<dyn Step>) -> Self {
        Self { rest }
    }

    /// 驱动剩余链路直至落定。
    pub async fn run(&self, ctx: &mut InvocationContext) {
        self.rest.call(ctx).await
    }
}

impl fmt::Debug for Next {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Next").finish_non_exhaustive()
    }
}

/// Middleware 合约：包裹“剩余链路”的横切逻辑。
///
/// # 契约维度速览
/// - **语义**：`handle` 决定是否、何时、调用几次 `next`，并可在前后检查或修改上下文；
/// - **错误**：失败不以 panic 或返回值传播，而是写入上下文的错误槽，外层中间件在回卷时仍可观察与转换；
/// - **并发**：同一实例会被并发调用共享，内部状态必须自行同步或保持无状态；
/// - **取消/超时**：内核不提供默认超时；中间件可以不调用 `next`，或让 `next` 与自身计时器竞速并写入失败；
/// - **观测标签**：`descriptor` 返回的名称用于注册校验、链路内省与 `trace` 级日志。
///
/// # 风险提示（Trade-offs）
/// - 用于同步形状方法的中间件会在调用线程上被阻塞驱动；若其异步部分依赖该线程（如单线程运行时），
///   调用将永远无法落定。
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// 返回组件元数据。
    fn descriptor(&self) -> MiddlewareDescriptor;

    /// 处理一次调用。
    async fn handle(&self, ctx: &mut InvocationContext, next: Next);
}

/// 以闭包实现的中间件，见 [`from_fn`]。
pub struct FnMiddleware<F> {
    descriptor: MiddlewareDescriptor,
    handler: F,
}

/// 以闭包构造中间件。
///
/// ```rust
/// use spark_intercept::{from_fn, Middleware};
///
/// let audit = from_fn("acme.audit", |ctx, next| {
///     Box::pin(async move {
///         next.run(ctx).await;
///         if ctx.is_failed() {
///             // 在这里记录失败
///         }
///     })
/// });
/// assert_eq!(audit.descriptor().name(), "acme.audit");
/// ```
pub fn from_fn<F>(name: impl Into<Cow<'static, str>>, handler: F) -> FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut InvocationContext, Next) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    FnMiddleware {
        descriptor: MiddlewareDescriptor::named(name),
        handler,
    }
}

impl<F> FnMiddleware<F> {
    /// 替换默认描述。
    pub fn with_descriptor(mut self, descriptor: MiddlewareDescriptor) -> Self {
        self.descriptor = descriptor;
        self
    }
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: for<'a> Fn(&'a mut InvocationContext, Next) -> BoxFuture<'a, ()> + Send + Sync + 'static,
{
    fn descriptor(&self) -> MiddlewareDescriptor {
        self.descriptor.clone()
    }

    async fn handle(&self, ctx: &mut InvocationContext, next: Next) {
        (self.handler)(ctx, next).await
    }
}

impl<F> fmt::Debug for FnMiddleware<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnMiddleware")
            .field("descriptor", &self.descriptor)
            .finish_non_exhaustive()
    }
}
