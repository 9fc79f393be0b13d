//! 接口元数据与分发契约。
//!
//! # 教案式说明
//! - **意图 (Why)**：引擎对具体接口一无所知，它只需要三件事：接口的方法描述表、
//!   “给定方法描述与参数如何调用真实实现”的分发函数，以及“如何从引擎构造代理”。
//!   这三件事由 `#[interceptable]` 为 `dyn Trait` 生成；
//! - **契约 (What)**：
//!   - [`Interface`]：方法描述表，描述对象的 `index` 与其在表中的位置一致；
//!   - [`Dispatch`]：面向实现类型 `S` 的分发，由终端步骤调用；
//!   - [`Intercept`]：代理类型及其构造方式；
//! - **风险提示 (Trade-offs)**：分发以方法索引路由，描述对象必须来自同一接口的描述表，
//!   否则返回 `InvalidArgument`。

use std::{any::Any, error::Error as StdError, fmt, future::Future, sync::Arc};

use futures::{FutureExt, future::BoxFuture};

use crate::{
    context::{Arguments, Value},
    engine::InterceptionEngine,
    error::InterceptError,
    method::MethodDescriptor,
};

/// 可拦截接口的静态元数据。
pub trait Interface: 'static {
    /// 接口名称。
    const NAME: &'static str;

    /// 按声明顺序排列的方法描述表。
    const METHODS: &'static [MethodDescriptor];

    /// 按索引查找方法描述。
    fn method(index: usize) -> Option<&'static MethodDescriptor> {
        Self::METHODS.get(index)
    }
}

/// 把一次调用分发到实现类型 `S` 上的对应方法。
pub trait Dispatch<S>: Interface
where
    S: Send + Sync + 'static,
{
    fn dispatch(
        target: Arc<S>,
        method: &'static MethodDescriptor,
        arguments: Arguments,
    ) -> Invocation;
}

/// 可以生成拦截代理的接口。
pub trait Intercept: Interface {
    /// 代理类型，实现接口本身并把每次调用转交引擎。
    type Proxy: Send + Sync + 'static;

    /// 以引擎构造代理，引擎可以尚未装配。
    fn from_engine(engine: InterceptionEngine) -> Self::Proxy;
}

/// 分发结果：同步方法立即完成，异步方法返回待驱动的 future。
pub enum Invocation {
    Ready(Result<Value, InterceptError>),
    Pending(BoxFuture<'static, Result<Value, InterceptError>>),
}

impl Invocation {
    /// 包装同步方法的返回值。
    pub fn ready<T, E>(outcome: Result<T, E>) -> Self
    where
        T: Any + Send,
        E: StdError + Send + Sync + 'static,
    {
        Self::Ready(erase(outcome))
    }

    /// 包装异步方法返回的 future。
    pub fn pending<F, T, E>(future: F) -> Self
    where
        F: Future<Output = Result<T, E>> + Send + 'static,
        T: Any + Send,
        E: StdError + Send + Sync + 'static,
    {
        Self::Pending(future.map(erase).boxed())
    }

    /// 分发前即已失败，例如参数无法取出。
    pub fn failed(error: InterceptError) -> Self {
        Self::Ready(Err(error))
    }
}

fn erase<T, E>(outcome: Result<T, E>) -> Result<Value, InterceptError>
where
    T: Any + Send,
    E: StdError + Send + Sync + 'static,
{
    match outcome {
        Ok(value) => Ok(Box::new(value)),
        Err(err) => Err(InterceptError::from_target(err)),
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(Ok(_)) => f.write_str("Invocation::Ready(Ok(..))"),
            Self::Ready(Err(err)) => write!(f, "Invocation::Ready(Err({err:?}))"),
            Self::Pending(_) => f.write_str("Invocation::Pending(..)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use thiserror::Error;

    #[derive(Debug, Error)]
    #[error("out of stock")]
    struct OutOfStock;

    #[test]
    fn ready_erases_value_and_wraps_error() {
        let Invocation::Ready(Ok(value)) = Invocation::ready::<_, OutOfStock>(Ok(5_u16)) else {
            panic!("expected ready value");
        };
        assert_eq!(value.downcast::<u16>().ok().map(|v| *v), Some(5));

        let Invocation::Ready(Err(err)) = Invocation::ready::<u16, _>(Err(OutOfStock)) else {
            panic!("expected ready error");
        };
        assert!(err.downcast_ref::<OutOfStock>().is_some());
    }

    #[test]
    fn pending_resolves_through_future() {
        let invocation = Invocation::pending(async { Ok::<_, OutOfStock>(String::from("ok")) });
        assert_eq!(format!("{invocation:?}"), "Invocation::Pending(..)");
        let Invocation::Pending(future) = invocation else {
            panic!("expected pending");
        };
        let value = futures::executor::block_on(future).expect("value");
        assert_eq!(value.downcast::<String>().ok().as_deref().map(String::as_str), Some("ok"));
    }

    #[test]
    fn pending_flattens_intercept_errors() {
        let invocation = Invocation::pending(async { Err::<(), _>(InterceptError::NotConfigured) });
        let Invocation::Pending(future) = invocation else {
            panic!("expected pending");
        };
        let err = futures::executor::block_on(future).expect_err("error");
        assert!(matches!(err, InterceptError::NotConfigured));
    }
}
