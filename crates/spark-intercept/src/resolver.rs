//! 依赖解析句柄。
//!
//! 拦截内核不关心依赖注入容器的实现，只把一个不透明的 [`Resolver`] 原样透传给每次调用的上下文，
//! 需要查找协作者的中间件（例如读取时钟、审计记录器）自行解析。

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    fmt,
    sync::Arc,
};

/// 依赖解析设施的最小契约。
///
/// # 契约说明（What）
/// - `resolve_any` 以 `TypeId` 查找共享实例，未注册时返回 `None`；
/// - 实现必须 `Send + Sync`：同一句柄会被并发调用的多个上下文共享。
pub trait Resolver: Send + Sync + 'static {
    fn resolve_any(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>>;
}

impl dyn Resolver {
    /// 按类型解析。
    pub fn resolve<T>(&self) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        self.resolve_any(TypeId::of::<T>())?.downcast::<T>().ok()
    }
}

/// 不提供任何协作者的解析器。
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopResolver;

impl Resolver for NoopResolver {
    fn resolve_any(&self, _type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        None
    }
}

/// 以 `TypeId` 为键的简单解析表，适合组合根与测试直接装配。
#[derive(Default)]
pub struct ResolverMap {
    entries: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl ResolverMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// 注册实例，同类型重复注册时后者覆盖前者。
    pub fn insert<T>(&mut self, value: T) -> &mut Self
    where
        T: Any + Send + Sync,
    {
        self.insert_shared(Arc::new(value))
    }

    /// 注册已共享的实例。
    pub fn insert_shared<T>(&mut self, value: Arc<T>) -> &mut Self
    where
        T: Any + Send + Sync,
    {
        self.entries.insert(TypeId::of::<T>(), value);
        self
    }

    /// 链式注册，便于一次性构造。
    pub fn with<T>(mut self, value: T) -> Self
    where
        T: Any + Send + Sync,
    {
        self.insert(value);
        self
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 转为共享句柄。
    pub fn into_shared(self) -> Arc<dyn Resolver> {
        Arc::new(self)
    }
}

impl Resolver for ResolverMap {
    fn resolve_any(&self, type_id: TypeId) -> Option<Arc<dyn Any + Send + Sync>> {
        self.entries.get(&type_id).cloned()
    }
}

impl fmt::Debug for ResolverMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolverMap")
            .field("entries", &self.entries.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq)]
    struct Clock(u64);

    #[test]
    fn map_resolves_registered_types_only() {
        let resolver = ResolverMap::new().with(Clock(42)).into_shared();
        assert_eq!(resolver.resolve::<Clock>().as_deref(), Some(&Clock(42)));
        assert!(resolver.resolve::<String>().is_none());
    }

    #[test]
    fn later_registration_overrides_earlier() {
        let mut map = ResolverMap::new();
        map.insert(Clock(1)).insert(Clock(2));
        assert_eq!(map.len(), 1);
        let resolver: Arc<dyn Resolver> = Arc::new(map);
        assert_eq!(resolver.resolve::<Clock>().map(|c| c.0), Some(2));
    }

    #[test]
    fn noop_resolver_is_empty() {
        let resolver: Arc<dyn Resolver> = Arc::new(NoopResolver);
        assert!(resolver.resolve::<Clock>().is_none());
    }
}
