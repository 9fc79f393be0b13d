//! 方法描述：拦截链路中“调用的是哪个操作”的静态身份。
//!
//! 描述表由 `#[interceptable]` 在编译期生成为 `&'static [MethodDescriptor]`，
//! 因此所有构造函数均为 `const fn`，描述对象在上下文生命周期内不可变。

use std::fmt;

/// 方法声明的返回形状，决定引擎以何种方式驱动链路并交付结果。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ReturnShape {
    /// 同步方法 `fn m(&self, ..) -> Result<T, E>`：阻塞调用线程直至链路落定。
    Value,
    /// 异步方法 `async fn m(&self, ..) -> Result<(), E>`：仅交付完成信号。
    Completion,
    /// 异步方法 `async fn m(&self, ..) -> Result<T, E>`：交付类型化结果。
    Result,
}

impl ReturnShape {
    /// 是否为异步形状。
    pub const fn is_async(self) -> bool {
        !matches!(self, Self::Value)
    }

    /// 稳定的小写标签，用于日志字段。
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Value => "value",
            Self::Completion => "completion",
            Self::Result => "result",
        }
    }
}

impl fmt::Display for ReturnShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 单个参数的名称与类型名。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParamDescriptor {
    name: &'static str,
    type_name: &'static str,
}

impl ParamDescriptor {
    pub const fn new(name: &'static str, type_name: &'static str) -> Self {
        Self { name, type_name }
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn type_name(&self) -> &'static str {
        self.type_name
    }
}

/// 接口方法的静态描述。
///
/// # 教案式说明
/// - **意图 (Why)**：中间件需要在不了解具体接口的情况下识别“当前调用”，用于日志、鉴权或按方法分流；
/// - **契约 (What)**：
///   - `service`：接口（trait）名称；
///   - `name`：方法名；`index`：方法在接口声明中的位置，分发表据此路由；
///   - `params`：按位置排列的参数描述，与 [`Arguments`](crate::Arguments) 一一对应；
///   - `output`：声明的结果类型名（`Result<T, E>` 中的 `T`）；
///   - `shape`：返回形状，见 [`ReturnShape`]。
/// - **风险提示 (Trade-offs)**：类型名来自源码记号，仅用于诊断展示，不参与类型判定；
///   真正的类型判定在引擎边缘以 `TypeId` 完成。
#[derive(Debug, PartialEq, Eq)]
pub struct MethodDescriptor {
    service: &'static str,
    name: &'static str,
    index: usize,
    params: &'static [ParamDescriptor],
    output: &'static str,
    shape: ReturnShape,
}

impl MethodDescriptor {
    pub const fn new(
        service: &'static str,
        name: &'static str,
        index: usize,
        params: &'static [ParamDescriptor],
        output: &'static str,
        shape: ReturnShape,
    ) -> Self {
        Self {
            service,
            name,
            index,
            params,
            output,
            shape,
        }
    }

    pub const fn service(&self) -> &'static str {
        self.service
    }

    pub const fn name(&self) -> &'static str {
        self.name
    }

    pub const fn index(&self) -> usize {
        self.index
    }

    pub const fn params(&self) -> &'static [ParamDescriptor] {
        self.params
    }

    /// 参数个数。
    pub const fn arity(&self) -> usize {
        self.params.len()
    }

    pub const fn output(&self) -> &'static str {
        self.output
    }

    pub const fn shape(&self) -> ReturnShape {
        self.shape
    }
}

impl fmt::Display for MethodDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.service, self.name)
    }
}
