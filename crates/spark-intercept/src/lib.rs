#![deny(unsafe_code)]
#![allow(clippy::result_large_err)]

//! `spark-intercept`：方法调用拦截与可组合中间件管线。
//!
//! # 教案式说明
//! - **意图（Why）**：给定任意服务接口与其具体实现，生成一个“代理对象”，使每次方法调用在真实实现执行前后
//!   依次经过一条有序的横切处理链（鉴权、审计、重试等），而调用方与接口定义都无需感知拦截的存在；
//! - **逻辑（How）**：
//!   1. `#[interceptable]` 为 trait 生成方法描述表、终端分发函数与 `<Trait>Interceptor` 代理；
//!   2. [`PipelineBuilder`] 把有序中间件与终端步骤一次性编译为不可变的洋葱式链路 [`Pipeline`]；
//!   3. 代理把每次调用交给 [`InterceptionEngine`]，引擎创建 [`InvocationContext`]、驱动链路，
//!      并按方法声明的返回形状把结果还原给调用方；
//!   4. [`InterceptRegistry`] 作为组合根持有全局中间件列表，编译时取快照。
//! - **契约（What）**：同步、仅完成信号、类型化异步结果三种形状共用同一条链路实现；
//!   入站严格按注册顺序，出站严格逆序；目标失败在整条链路回卷后才以原始身份交给调用方。
//! - **风险与权衡（Trade-offs）**：同步形状方法会阻塞调用线程直至链路落定，详见 [`engine`] 模块说明。
//!
//! ```rust
//! use std::sync::Arc;
//! use spark_intercept::{InterceptError, InterceptRegistry, NoopResolver, from_fn, interceptable};
//!
//! #[interceptable]
//! pub trait Greeter: Send + Sync {
//!     fn greet(&self, name: String) -> Result<String, InterceptError>;
//! }
//!
//! struct English;
//!
//! impl Greeter for English {
//!     fn greet(&self, name: String) -> Result<String, InterceptError> {
//!         Ok(format!("hello, {name}"))
//!     }
//! }
//!
//! let registry = InterceptRegistry::new();
//! registry
//!     .register_global(from_fn("demo.shout", |ctx, next| {
//!         Box::pin(async move {
//!             next.run(ctx).await;
//!             if let Some(text) = ctx.result::<String>().cloned() {
//!                 ctx.set_result(text.to_uppercase());
//!             }
//!         })
//!     }))
//!     .unwrap();
//!
//! let greeter = registry
//!     .intercept::<dyn Greeter, English, _>(Arc::new(English), Arc::new(NoopResolver), |_| Ok(()))
//!     .unwrap();
//! assert_eq!(greeter.greet("ada".into()).unwrap(), "HELLO, ADA");
//! ```

extern crate self as spark_intercept;

pub use async_trait::async_trait;
pub use spark_intercept_macros::interceptable;

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod interface;
pub mod method;
pub mod middleware;
pub mod pipeline;
pub mod registry;
pub mod resolver;

pub use config::EngineConfig;
pub use context::{Arguments, InvocationContext, Value};
pub use engine::{CallPhase, InterceptionEngine};
pub use error::{ErrorKind, InterceptError};
pub use interface::{Dispatch, Intercept, Interface, Invocation};
pub use method::{MethodDescriptor, ParamDescriptor, ReturnShape};
pub use middleware::{FnMiddleware, Middleware, MiddlewareDescriptor, Next, Step, from_fn};
pub use pipeline::{Pipeline, PipelineBuilder, TargetInvoker};
pub use registry::{InterceptRegistry, create_interceptor};
pub use resolver::{NoopResolver, Resolver, ResolverMap};
