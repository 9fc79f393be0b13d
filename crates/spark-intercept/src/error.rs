//! # error 模块说明
//!
//! ## 角色定位（Why）
//! - 为拦截内核提供唯一的错误域 [`InterceptError`]，覆盖装配、输入校验、目标执行与结果适配四类故障；
//! - 错误在链路内部以“数据”形式存放于 [`InvocationContext`](crate::InvocationContext) 的错误槽，
//!   只有在引擎返回调用方的边缘才会变成真正的 `Err`。
//!
//! ## 设计要求（What）
//! - 目标实现返回的原始错误必须可被中间件识别（[`InterceptError::downcast_ref`]），并在边缘被还原为
//!   调用方声明的错误类型（[`InterceptError::into_caller`]）；
//! - 已经是 `InterceptError` 的错误不得再被包一层信封（[`InterceptError::from_target`] 负责展平）。

use std::{any::Any, borrow::Cow, error::Error as StdError, fmt};

use thiserror::Error;

use crate::method::MethodDescriptor;

/// 稳定错误码，遵循 `<域>.<语义>` 命名约定，供日志与告警做精确匹配。
pub mod codes {
    pub const NOT_CONFIGURED: &str = "intercept.not_configured";
    pub const ALREADY_CONFIGURED: &str = "intercept.already_configured";
    pub const TARGET_MISMATCH: &str = "intercept.target_mismatch";
    pub const CONFIG_INVALID: &str = "intercept.config_invalid";
    pub const CONFIG_MISMATCH: &str = "intercept.config_mismatch";
    pub const INVALID_ARGUMENT: &str = "intercept.invalid_argument";
    pub const TARGET_FAILED: &str = "intercept.target_failed";
    pub const TARGET_PANICKED: &str = "intercept.target_panicked";
    pub const ADAPTATION_FAILED: &str = "intercept.adaptation_failed";
    pub const ARGUMENT_MISMATCH: &str = "intercept.argument_mismatch";
}

/// 错误分类，对应装配、输入、执行、适配四个处置层级。
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// 引擎或管线装配不完整/不一致，调用立即失败且不可重试。
    Configuration,
    /// 调用点或注册点传入了缺失/非法的参数。
    InvalidInput,
    /// 目标实现失败（返回错误或发生 panic），经链路回卷后交给调用方。
    Execution,
    /// 结果槽或参数槽的类型与声明不符。
    Adaptation,
}

/// 拦截内核的统一错误类型。
///
/// # 教案式说明
/// - **意图 (Why)**：调用方、中间件与终端步骤共享同一错误语言，避免每层各自定义信封类型；
/// - **契约 (What)**：
///   - 所有变体均为 `Send + Sync + 'static`，可安全写入上下文并跨线程移动；
///   - `Target` 持有目标实现产出的原始错误，`Display` 与原始错误保持一致；
///   - 通过 [`kind`](Self::kind) 与 [`code`](Self::code) 读取机读分类。
/// - **设计权衡 (Trade-offs)**：原始错误以 `Box<dyn Error>` 形式保存，换取跨类型擦除的统一槽位，
///   代价是读取时需要一次 `downcast`。
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum InterceptError {
    /// 引擎尚未绑定目标、解析器与管线。
    #[error("interception engine is not configured")]
    NotConfigured,

    /// 引擎已绑定，不允许二次装配。
    #[error("interception engine is already configured")]
    AlreadyConfigured,

    /// 管线的终端步骤面向另一种实现类型。
    #[error("pipeline compiled for `{expected}` cannot drive target `{actual}`")]
    TargetMismatch {
        expected: &'static str,
        actual: &'static str,
    },

    /// 引擎配置无法解析。
    #[error("invalid engine configuration: {0}")]
    Config(#[from] toml::de::Error),

    /// 管线编译时采用的开关与引擎配置不一致。
    #[error("pipeline was compiled with `{setting} = {pipeline}` but the engine is configured with `{setting} = {engine}`")]
    ConfigMismatch {
        setting: &'static str,
        pipeline: bool,
        engine: bool,
    },

    /// 缺失或非法的输入，例如缺少方法描述或注册了空中间件。
    #[error("invalid argument: {0}")]
    InvalidArgument(Cow<'static, str>),

    /// 目标实现返回的原始错误。
    #[error("{0}")]
    Target(Box<dyn StdError + Send + Sync + 'static>),

    /// 目标实现在执行期间 panic。
    #[error("target panicked: {0}")]
    Panicked(Cow<'static, str>),

    /// 结果槽无法还原为方法声明的结果类型。
    #[error("result of `{service}::{method}` cannot be adapted to `{expected}`")]
    Adaptation {
        service: &'static str,
        method: &'static str,
        expected: &'static str,
    },

    /// 参数槽的类型或位置与请求不符。
    #[error("argument #{index} holds `{actual}`, expected `{expected}`")]
    Argument {
        index: usize,
        expected: &'static str,
        actual: &'static str,
    },
}

impl InterceptError {
    /// 构造 `InvalidArgument`。
    pub fn invalid_argument(detail: impl Into<Cow<'static, str>>) -> Self {
        Self::InvalidArgument(detail.into())
    }

    /// 方法描述不属于当前接口，或索引越界。
    pub fn unknown_method(method: &MethodDescriptor) -> Self {
        Self::InvalidArgument(Cow::Owned(format!(
            "`{method}` is not part of the dispatched interface"
        )))
    }

    /// 将目标实现的错误收进错误槽。
    ///
    /// # 契约说明（What）
    /// - 若 `err` 本身就是 `InterceptError`，原样返回，不产生嵌套信封；
    /// - 否则装箱为 [`InterceptError::Target`]，保留原始类型以便后续 `downcast`。
    pub fn from_target<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        let boxed: Box<dyn StdError + Send + Sync + 'static> = Box::new(err);
        match boxed.downcast::<InterceptError>() {
            Ok(inner) => *inner,
            Err(source) => Self::Target(source),
        }
    }

    /// 从 panic 载荷构造 `Panicked`。
    pub fn panicked(payload: Box<dyn Any + Send>) -> Self {
        let message = match payload.downcast::<&'static str>() {
            Ok(text) => Cow::Borrowed(*text),
            Err(payload) => match payload.downcast::<String>() {
                Ok(text) => Cow::Owned(*text),
                Err(_) => Cow::Borrowed("non-string panic payload"),
            },
        };
        Self::Panicked(message)
    }

    /// 错误分类。
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotConfigured
            | Self::AlreadyConfigured
            | Self::TargetMismatch { .. }
            | Self::Config(_)
            | Self::ConfigMismatch { .. } => ErrorKind::Configuration,
            Self::InvalidArgument(_) => ErrorKind::InvalidInput,
            Self::Target(_) | Self::Panicked(_) => ErrorKind::Execution,
            Self::Adaptation { .. } | Self::Argument { .. } => ErrorKind::Adaptation,
        }
    }

    /// 稳定错误码，见 [`codes`]。
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotConfigured => codes::NOT_CONFIGURED,
            Self::AlreadyConfigured => codes::ALREADY_CONFIGURED,
            Self::TargetMismatch { .. } => codes::TARGET_MISMATCH,
            Self::Config(_) => codes::CONFIG_INVALID,
            Self::ConfigMismatch { .. } => codes::CONFIG_MISMATCH,
            Self::InvalidArgument(_) => codes::INVALID_ARGUMENT,
            Self::Target(_) => codes::TARGET_FAILED,
            Self::Panicked(_) => codes::TARGET_PANICKED,
            Self::Adaptation { .. } => codes::ADAPTATION_FAILED,
            Self::Argument { .. } => codes::ARGUMENT_MISMATCH,
        }
    }

    /// 是否承载目标实现产出的原始错误。
    pub fn is_target(&self) -> bool {
        matches!(self, Self::Target(_))
    }

    /// 以具体类型查看原始错误；`E = InterceptError` 时返回自身。
    pub fn downcast_ref<E>(&self) -> Option<&E>
    where
        E: StdError + 'static,
    {
        if let Self::Target(source) = self {
            if let Some(original) = source.downcast_ref::<E>() {
                return Some(original);
            }
        }
        (self as &dyn Any).downcast_ref::<E>()
    }

    /// 在引擎边缘把错误还原为调用方声明的错误类型。
    ///
    /// # 执行逻辑（How）
    /// 1. `Target` 中的原始错误若恰为 `E`，直接交还，保持身份不变；
    /// 2. 其余情况经 `E: From<InterceptError>` 转换；当 `E` 就是 `InterceptError` 时该转换为恒等。
    pub fn into_caller<E>(self) -> E
    where
        E: StdError + From<InterceptError> + 'static,
    {
        match self {
            Self::Target(source) => match source.downcast::<E>() {
                Ok(original) => *original,
                Err(source) => E::from(Self::Target(source)),
            },
            other => E::from(other),
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Configuration => "configuration",
            Self::InvalidInput => "invalid-input",
            Self::Execution => "execution",
            Self::Adaptation => "adaptation",
        };
        f.write_str(label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error, PartialEq, Eq)]
    enum LedgerError {
        #[error("quota exhausted for {0}")]
        Quota(u32),
        #[error("intercept: {0}")]
        Intercept(String),
    }

    impl From<InterceptError> for LedgerError {
        fn from(err: InterceptError) -> Self {
            Self::Intercept(err.to_string())
        }
    }

    #[derive(Debug, Error)]
    #[error("disk offline")]
    struct DiskOffline;

    #[test]
    fn from_target_flattens_nested_intercept_errors() {
        let err = InterceptError::from_target(InterceptError::NotConfigured);
        assert!(matches!(err, InterceptError::NotConfigured));
    }

    #[test]
    fn from_target_keeps_original_for_downcast() {
        let err = InterceptError::from_target(LedgerError::Quota(7));
        assert!(err.is_target());
        assert_eq!(err.kind(), ErrorKind::Execution);
        assert_eq!(err.code(), codes::TARGET_FAILED);
        assert_eq!(err.to_string(), "quota exhausted for 7");
        assert_eq!(err.downcast_ref::<LedgerError>(), Some(&LedgerError::Quota(7)));
        assert!(err.downcast_ref::<DiskOffline>().is_none());
    }

    #[test]
    fn into_caller_returns_original_error_value() {
        let err = InterceptError::from_target(LedgerError::Quota(3));
        assert_eq!(err.into_caller::<LedgerError>(), LedgerError::Quota(3));
    }

    #[test]
    fn into_caller_converts_foreign_failures_through_from() {
        let err = InterceptError::from_target(DiskOffline);
        assert_eq!(
            err.into_caller::<LedgerError>(),
            LedgerError::Intercept("disk offline".to_owned())
        );
        assert_eq!(
            InterceptError::NotConfigured.into_caller::<LedgerError>(),
            LedgerError::Intercept("interception engine is not configured".to_owned())
        );
    }

    #[test]
    fn into_caller_is_identity_for_intercept_error() {
        let err: InterceptError = InterceptError::NotConfigured.into_caller();
        assert!(matches!(err, InterceptError::NotConfigured));
        let err: InterceptError = InterceptError::from_target(DiskOffline).into_caller();
        assert!(err.downcast_ref::<DiskOffline>().is_some());
    }

    #[test]
    fn panic_payloads_are_rendered() {
        let err = InterceptError::panicked(Box::new("boom"));
        assert_eq!(err.to_string(), "target panicked: boom");
        let err = InterceptError::panicked(Box::new(String::from("owned boom")));
        assert_eq!(err.code(), codes::TARGET_PANICKED);
        assert_eq!(err.to_string(), "target panicked: owned boom");
        let err = InterceptError::panicked(Box::new(42_u8));
        assert_eq!(err.to_string(), "target panicked: non-string panic payload");
    }

    #[test]
    fn kinds_follow_taxonomy() {
        assert_eq!(InterceptError::NotConfigured.kind(), ErrorKind::Configuration);
        assert_eq!(
            InterceptError::invalid_argument("missing").kind(),
            ErrorKind::InvalidInput
        );
        let adaptation = InterceptError::Adaptation {
            service: "Greeter",
            method: "greet",
            expected: "alloc::string::String",
        };
        assert_eq!(adaptation.kind(), ErrorKind::Adaptation);
        assert_eq!(
            adaptation.to_string(),
            "result of `Greeter::greet` cannot be adapted to `alloc::string::String`"
        );
        assert_eq!(ErrorKind::InvalidInput.to_string(), "invalid-input");
    }
}
