//! 引擎配置。
//!
//! # 教案式说明
//! - **意图 (Why)**：拦截行为中少数需要按部署调整的开关（是否捕获目标 panic、是否严格校验返回形状）
//!   外部化为配置，使组合根可以从 TOML 文件统一下发；
//! - **契约 (What)**：所有字段都有默认值，未知字段视为配置错误，避免拼写错误被静默忽略；
//! - **风险提示 (Trade-offs)**：关闭 `capture_panics` 后目标 panic 会穿透整条链路，
//!   外层中间件将无法观测到失败。

use serde::{Deserialize, Serialize};

use crate::error::InterceptError;

/// 拦截引擎与终端步骤共享的配置。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct EngineConfig {
    /// 终端步骤是否把目标实现的 panic 转为 [`InterceptError::Panicked`] 写入错误槽。
    pub capture_panics: bool,
    /// 引擎入口是否拒绝与方法描述声明形状不一致的调用。
    pub strict_shapes: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            capture_panics: true,
            strict_shapes: true,
        }
    }
}

impl EngineConfig {
    /// 从 TOML 文本解析配置。
    ///
    /// ```rust
    /// use spark_intercept::EngineConfig;
    ///
    /// let config = EngineConfig::from_toml_str("capture_panics = false").unwrap();
    /// assert!(!config.capture_panics);
    /// assert!(config.strict_shapes);
    /// ```
    pub fn from_toml_str(source: &str) -> Result<Self, InterceptError> {
        Ok(toml::from_str(source)?)
    }

    pub fn with_capture_panics(mut self, enabled: bool) -> Self {
        self.capture_panics = enabled;
        self
    }

    pub fn with_strict_shapes(mut self, enabled: bool) -> Self {
        self.strict_shapes = enabled;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::from_toml_str("").expect("empty toml");
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn fields_override_defaults() {
        let config = EngineConfig::from_toml_str("capture_panics = false\nstrict_shapes = false\n")
            .expect("valid toml");
        assert_eq!(
            config,
            EngineConfig::default()
                .with_capture_panics(false)
                .with_strict_shapes(false)
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let err = EngineConfig::from_toml_str("capture_panic = true").expect_err("typo");
        assert_eq!(err.kind(), ErrorKind::Configuration);
        assert_eq!(err.code(), crate::error::codes::CONFIG_INVALID);
    }
}
