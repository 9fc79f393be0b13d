//! 调用上下文：单次调用在链路中流转的全部数据。
//!
//! # 设计背景（Why）
//! - 上下文刻意保持“惰性”：除字段读写外不包含任何行为，链路上的每个副作用都能归因到某个中间件或终端步骤，
//!   便于测试与推理执行顺序；
//! - 结果槽是无类型的 `Box<dyn Any + Send>`，类型化还原只发生在引擎边缘。
//!
//! # 契约说明（What）
//! - 目标实例、方法描述、解析句柄在构造后只读；
//! - 参数列表定长，可就地修改或按位置替换为同类型的新值；
//! - 结果槽与错误槽可被任意步骤读写，最终读取时错误槽优先。

use std::{
    any::{Any, type_name},
    fmt,
    sync::Arc,
};

use crate::{error::InterceptError, method::MethodDescriptor, resolver::Resolver};

/// 无类型的结果值。
pub type Value = Box<dyn Any + Send>;

/// 参数槽中保存的值：可克隆，以便终端步骤在重试时重复使用同一份参数。
trait ArgumentValue: Any + Send + Sync {
    fn clone_value(&self) -> Box<dyn ArgumentValue>;
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any + Send>;
    fn type_name(&self) -> &'static str;
}

impl<T> ArgumentValue for T
where
    T: Any + Clone + Send + Sync,
{
    fn clone_value(&self) -> Box<dyn ArgumentValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any + Send> {
        self
    }

    fn type_name(&self) -> &'static str {
        type_name::<T>()
    }
}

/// 已被 [`Arguments::take`] 取走的位置。
#[derive(Clone, Copy)]
struct Moved;

/// 按位置排列的调用参数。
///
/// # 教案式说明
/// - **意图 (Why)**：中间件需要在不知道具体接口的前提下读取、改写参数；
/// - **契约 (What)**：
///   - 长度在构造完成后固定，只能通过 [`replace`](Self::replace) 以同类型的新值替换；
///   - 元素类型需满足 `Clone + Send + Sync + 'static`；
///   - 类型或位置不符时返回 [`InterceptError::Argument`]。
/// - **风险提示 (Trade-offs)**：每次进入终端步骤都会克隆整份参数，参数较大时应以 `Arc` 传递。
#[derive(Default)]
pub struct Arguments {
    values: Vec<Box<dyn ArgumentValue>>,
}

impl Arguments {
    pub fn new() -> Self {
        Self::default()
    }

    /// 追加一个参数，仅用于构造阶段。
    pub fn with<T>(mut self, value: T) -> Self
    where
        T: Any + Clone + Send + Sync,
    {
        self.values.push(Box::new(value));
        self
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// 指定位置的参数类型名。
    pub fn type_name(&self, index: usize) -> Option<&'static str> {
        self.values.get(index).map(|value| (**value).type_name())
    }

    pub fn get<T: Any>(&self, index: usize) -> Result<&T, InterceptError> {
        let slot = self.slot(index, type_name::<T>())?;
        let actual = slot.type_name();
        slot.as_any()
            .downcast_ref::<T>()
            .ok_or_else(|| mismatch::<T>(index, actual))
    }

    pub fn get_mut<T: Any>(&mut self, index: usize) -> Result<&mut T, InterceptError> {
        let slot = self.slot_mut(index, type_name::<T>())?;
        let actual = (**slot).type_name();
        (**slot)
            .as_any_mut()
            .downcast_mut::<T>()
            .ok_or_else(|| mismatch::<T>(index, actual))
    }

    /// 以同类型的新值替换指定位置，返回旧值。
    pub fn replace<T>(&mut self, index: usize, value: T) -> Result<T, InterceptError>
    where
        T: Any + Clone + Send + Sync,
    {
        let current = self.get_mut::<T>(index)?;
        Ok(std::mem::replace(current, value))
    }

    /// 取走指定位置的值，供分发表把参数交给目标方法；取走后该位置不再可读。
    pub fn take<T: Any>(&mut self, index: usize) -> Result<T, InterceptError> {
        // 先校验类型，避免类型不符时把原值换成占位。
        self.get::<T>(index)?;
        let slot = self.slot_mut(index, type_name::<T>())?;
        let value = std::mem::replace(slot, Box::new(Moved));
        value
            .into_any()
            .downcast::<T>()
            .map(|value| *value)
            .map_err(|_| mismatch::<T>(index, type_name::<Moved>()))
    }

    fn slot(
        &self,
        index: usize,
        expected: &'static str,
    ) -> Result<&dyn ArgumentValue, InterceptError> {
        self.values.get(index).map(|value| &**value).ok_or(InterceptError::Argument {
            index,
            expected,
            actual: "<out of range>",
        })
    }

    fn slot_mut(
        &mut self,
        index: usize,
        expected: &'static str,
    ) -> Result<&mut Box<dyn ArgumentValue>, InterceptError> {
        self.values.get_mut(index).ok_or(InterceptError::Argument {
            index,
            expected,
            actual: "<out of range>",
        })
    }
}

fn mismatch<T>(index: usize, actual: &'static str) -> InterceptError {
    InterceptError::Argument {
        index,
        expected: type_name::<T>(),
        actual,
    }
}

impl Clone for Arguments {
    fn clone(&self) -> Self {
        Self {
            values: self.values.iter().map(|value| (**value).clone_value()).collect(),
        }
    }
}

impl fmt::Debug for Arguments {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.values.iter().map(|value| (**value).type_name()))
            .finish()
    }
}

/// 单次调用的上下文。
///
/// # 教案式说明
/// - **意图 (Why)**：把“谁被调用、以什么参数、结果如何”集中在一个对象中，中间件之间只通过它交流；
/// - **契约 (What)**：
///   - 每次调用创建一份，归该调用独占，不跨调用复用、不跨线程共享；
///   - 目标实例以 `Arc` 引用持有，引擎不管理其生命周期；
///   - 链路结束后的最终读取遵循“错误槽优先”：错误槽有值即失败，否则结果槽即返回值（单元形状可为空）。
/// - **风险提示 (Trade-offs)**：中间件可在观察后覆写任一槽位（例如把错误转换为兜底结果），
///   因而“恰有一个结果”只在最终读取时成立，执行过程中不作保证。
pub struct InvocationContext {
    target: Arc<dyn Any + Send + Sync>,
    method: &'static MethodDescriptor,
    arguments: Arguments,
    result: Option<Value>,
    error: Option<InterceptError>,
    resolver: Arc<dyn Resolver>,
}

impl InvocationContext {
    pub fn new(
        target: Arc<dyn Any + Send + Sync>,
        method: &'static MethodDescriptor,
        arguments: Arguments,
        resolver: Arc<dyn Resolver>,
    ) -> Self {
        Self {
            target,
            method,
            arguments,
            result: None,
            error: None,
            resolver,
        }
    }

    pub fn target(&self) -> &Arc<dyn Any + Send + Sync> {
        &self.target
    }

    /// 以具体类型查看目标实例。
    pub fn target_as<T: Any>(&self) -> Option<&T> {
        self.target.downcast_ref::<T>()
    }

    pub fn method(&self) -> &'static MethodDescriptor {
        self.method
    }

    pub fn arguments(&self) -> &Arguments {
        &self.arguments
    }

    pub fn arguments_mut(&mut self) -> &mut Arguments {
        &mut self.arguments
    }

    pub fn resolver(&self) -> &Arc<dyn Resolver> {
        &self.resolver
    }

    /// 以具体类型查看结果槽。
    pub fn result<T: Any>(&self) -> Option<&T> {
        self.result.as_ref()?.downcast_ref::<T>()
    }

    pub fn has_result(&self) -> bool {
        self.result.is_some()
    }

    pub fn set_result<T>(&mut self, value: T)
    where
        T: Any + Send,
    {
        self.result = Some(Box::new(value));
    }

    /// 写入已装箱的结果值。
    pub fn set_result_value(&mut self, value: Value) {
        self.result = Some(value);
    }

    pub fn take_result(&mut self) -> Option<Value> {
        self.result.take()
    }

    pub fn clear_result(&mut self) {
        self.result = None;
    }

    pub fn error(&self) -> Option<&InterceptError> {
        self.error.as_ref()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }

    pub fn set_error(&mut self, error: impl Into<InterceptError>) {
        self.error = Some(error.into());
    }

    pub fn take_error(&mut self) -> Option<InterceptError> {
        self.error.take()
    }

    pub fn clear_error(&mut self) {
        self.error = None;
    }

    /// 最终读取：错误槽优先，否则交出结果槽。
    pub(crate) fn into_outcome(self) -> Result<Option<Value>, InterceptError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(self.result),
        }
    }
}

impl fmt::Debug for InvocationContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InvocationContext")
            .field("method", &format_args!("{}", self.method))
            .field("arguments", &self.arguments)
            .field("has_result", &self.result.is_some())
            .field("error", &self.error)
            .finish()
    }
}
