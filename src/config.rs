//! 骨骼运行时配置
//!
//! 所有参数扁平化，直接在代码中修改默认值即可。
//! 运行时在构建时取一份快照，之后修改全局配置不影响已构建的运行时。

use once_cell::sync::Lazy;
use std::sync::RwLock;

/// IK 迭代次数上限（PMX 规范值）
pub const MAX_IK_ITERATION: u32 = 256;

/// 运行时配置（扁平化，不嵌套）
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    // ========== 物理 ==========
    /// 是否启用物理，默认 false
    /// 启用时，链接全部受物理驱动的 IK 求解器会被跳过
    pub physics_enabled: bool,

    // ========== IK ==========
    /// IK 迭代次数上限，默认 256
    /// 模型数据中的迭代次数会被钳制到此值（且不超过 256）
    pub max_ik_iteration: u32,

    // ========== Morph ==========
    /// 骨骼初始是否叠加 Morph 偏移，默认 true
    pub morph_enabled: bool,

    // ========== 调试 ==========
    /// 是否输出逐帧调试日志，默认 false
    pub debug_log: bool,
}

impl RuntimeConfig {
    /// 实际生效的 IK 迭代上限
    #[inline]
    pub fn ik_iteration_limit(&self) -> u32 {
        self.max_ik_iteration.min(MAX_IK_ITERATION)
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            // ====== 物理 ======
            // 默认关闭，由物理桥接层在创建刚体后打开
            physics_enabled: false,

            // ====== IK ======
            // 256 为 MMD 的迭代上限，想要限制每帧耗时可调小
            max_ik_iteration: MAX_IK_ITERATION,

            // ====== Morph ======
            morph_enabled: true,

            // ====== 调试 ======
            debug_log: false,
        }
    }
}

/// 全局配置实例
static RUNTIME_CONFIG: Lazy<RwLock<RuntimeConfig>> = Lazy::new(|| {
    RwLock::new(RuntimeConfig::default())
});

/// 获取当前配置（只读）
pub fn get_config() -> RuntimeConfig {
    RUNTIME_CONFIG.read().unwrap_or_else(|e| e.into_inner()).clone()
}

/// 手动设置配置（用于运行时调试）
pub fn set_config(config: RuntimeConfig) {
    *RUNTIME_CONFIG.write().unwrap_or_else(|e| e.into_inner()) = config;
}

/// 重置为默认配置
pub fn reset_config() {
    *RUNTIME_CONFIG.write().unwrap_or_else(|e| e.into_inner()) = RuntimeConfig::default();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_limit_never_exceeds_format_cap() {
        let config = RuntimeConfig {
            max_ik_iteration: 10_000,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.ik_iteration_limit(), MAX_IK_ITERATION);

        let config = RuntimeConfig {
            max_ik_iteration: 8,
            ..RuntimeConfig::default()
        };
        assert_eq!(config.ik_iteration_limit(), 8);
    }

    #[test]
    fn test_defaults() {
        let config = RuntimeConfig::default();
        assert!(!config.physics_enabled);
        assert!(config.morph_enabled);
        assert_eq!(config.max_ik_iteration, 256);
    }
}
