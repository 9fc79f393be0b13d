//! 组合根：全局中间件列表与服务装配入口。
//!
//! # 教案式说明
//! - **意图（Why）**：横切中间件（审计、度量）通常在启动早期一次性登记，对所有被拦截服务生效；
//!   以显式对象而非进程级可变单例承载这份列表，测试与多租户场景可以各自持有独立的注册表；
//! - **契约（What）**：
//!   - [`InterceptRegistry::register_global`] 随时可调用，按调用顺序追加；
//!   - 编译管线时对全局列表取快照：全局中间件在前（登记顺序），服务专属中间件在后（回调中的注册顺序）；
//!   - 快照之后追加的全局中间件不会影响已编译的管线；
//! - **执行逻辑（How）**：全局列表存放在 `ArcSwap<Vec<_>>` 中，追加时以 `rcu` 复制并替换，
//!   快照读取为无锁的 `load_full`。

use std::{fmt, sync::Arc};

use arc_swap::ArcSwap;
use tracing::debug;

use crate::{
    config::EngineConfig,
    engine::InterceptionEngine,
    error::InterceptError,
    interface::{Dispatch, Intercept},
    middleware::{Middleware, MiddlewareDescriptor},
    pipeline::{Pipeline, PipelineBuilder, validate},
    resolver::Resolver,
};

/// 拦截组合根，持有全局中间件列表与统一的引擎配置。
pub struct InterceptRegistry {
    globals: ArcSwap<Vec<Arc<dyn Middleware>>>,
    config: EngineConfig,
}

impl Default for InterceptRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InterceptRegistry {
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    /// 以指定配置创建注册表，该配置应用于其构建的每条管线与每个引擎。
    pub fn with_config(config: EngineConfig) -> Self {
        Self {
            globals: ArcSwap::from_pointee(Vec::new()),
            config,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// 追加全局中间件。空中间件返回 `InvalidArgument`。
    pub fn register_global<M>(&self, middleware: M) -> Result<(), InterceptError>
    where
        M: Middleware,
    {
        self.register_global_shared(Arc::new(middleware))
    }

    /// 追加已共享的全局中间件。
    pub fn register_global_shared(
        &self,
        middleware: Arc<dyn Middleware>,
    ) -> Result<(), InterceptError> {
        validate(middleware.as_ref())?;
        let name = middleware.descriptor().name().to_owned();
        let previous = self.globals.rcu(|current| {
            let mut next = Vec::with_capacity(current.len() + 1);
            next.extend(current.iter().cloned());
            next.push(Arc::clone(&middleware));
            next
        });
        debug!(
            middleware = %name,
            position = previous.len(),
            "global middleware registered"
        );
        Ok(())
    }

    /// 追加可能缺失的全局中间件，缺失时返回 `InvalidArgument`。
    pub fn try_register_global(
        &self,
        middleware: Option<Arc<dyn Middleware>>,
    ) -> Result<(), InterceptError> {
        let middleware = middleware
            .ok_or_else(|| InterceptError::invalid_argument("global middleware is missing"))?;
        self.register_global_shared(middleware)
    }

    /// 当前全局中间件的描述，按登记顺序排列。
    pub fn global_descriptors(&self) -> Vec<MiddlewareDescriptor> {
        self.globals
            .load()
            .iter()
            .map(|middleware| middleware.descriptor())
            .collect()
    }

    /// 以全局列表快照为接口 `I` 的实现 `S` 编译管线。
    pub fn build_pipeline<I, S>(&self) -> Result<Pipeline, InterceptError>
    where
        I: ?Sized + Dispatch<S>,
        S: Send + Sync + 'static,
    {
        self.build_pipeline_with::<I, S, _>(|_| Ok(()))
    }

    /// 先取全局快照，再由 `configure` 追加服务专属中间件，最后编译一次。
    pub fn build_pipeline_with<I, S, F>(&self, configure: F) -> Result<Pipeline, InterceptError>
    where
        I: ?Sized + Dispatch<S>,
        S: Send + Sync + 'static,
        F: FnOnce(&mut PipelineBuilder) -> Result<(), InterceptError>,
    {
        let snapshot = self.globals.load_full();
        let mut builder = PipelineBuilder::with_config(self.config.clone());
        for middleware in snapshot.iter() {
            builder.register_shared(Arc::clone(middleware))?;
        }
        configure(&mut builder)?;

        let pipeline = builder.compile::<I, S>();
        debug!(
            service = I::NAME,
            middleware = ?pipeline
                .descriptors()
                .iter()
                .map(MiddlewareDescriptor::name)
                .collect::<Vec<_>>(),
            "pipeline built"
        );
        Ok(pipeline)
    }

    /// 以注册表的引擎配置生成接口 `I` 的代理。
    pub fn create_interceptor<I, S>(
        &self,
        target: Arc<S>,
        resolver: Arc<dyn Resolver>,
        pipeline: Pipeline,
    ) -> Result<I::Proxy, InterceptError>
    where
        I: ?Sized + Intercept,
        S: Send + Sync + 'static,
    {
        let engine =
            InterceptionEngine::configured(target, resolver, pipeline, self.config.clone())?;
        Ok(I::from_engine(engine))
    }

    /// 构建管线并生成代理的便捷组合。
    pub fn intercept<I, S, F>(
        &self,
        target: Arc<S>,
        resolver: Arc<dyn Resolver>,
        configure: F,
    ) -> Result<I::Proxy, InterceptError>
    where
        I: ?Sized + Dispatch<S> + Intercept,
        S: Send + Sync + 'static,
        F: FnOnce(&mut PipelineBuilder) -> Result<(), InterceptError>,
    {
        let pipeline = self.build_pipeline_with::<I, S, F>(configure)?;
        self.create_interceptor::<I, S>(target, resolver, pipeline)
    }
}

impl fmt::Debug for InterceptRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InterceptRegistry")
            .field("globals", &self.global_descriptors())
            .field("config", &self.config)
            .finish()
    }
}

/// 以默认配置生成接口 `I` 的代理；`capture_panics` 沿用管线编译时的取值。
pub fn create_interceptor<I, S>(
    target: Arc<S>,
    resolver: Arc<dyn Resolver>,
    pipeline: Pipeline,
) -> Result<I::Proxy, InterceptError>
where
    I: ?Sized + Intercept,
    S: Send + Sync + 'static,
{
    let mut config = EngineConfig::default();
    if let Some(capture_panics) = pipeline.capture_panics() {
        config = config.with_capture_panics(capture_panics);
    }
    let engine = InterceptionEngine::configured(target, resolver, pipeline, config)?;
    Ok(I::from_engine(engine))
}
