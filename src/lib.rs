//! MMD 骨骼运行时
//!
//! 每帧两阶段更新骨骼层级：
//! - 物理前：动画/Morph 输入 -> 本地矩阵 -> 世界矩阵 -> 付与 / IK -> 再次传播
//! - 物理后：物理结果写回 -> 物理后变形骨骼重复付与 / IK
//!
//! 模型解析、动画采样、物理模拟都在外部，通过 PoseStage / PhysicsStage 接入。

pub mod config;
pub mod runtime;
pub mod skeleton;

pub use config::{get_config, reset_config, set_config, RuntimeConfig, MAX_IK_ITERATION};
pub use runtime::{BoneGraphRuntime, PhysicsStage, PoseStage, PoseWriter};
pub use skeleton::{
    BoneFlags, BoneMetadata, BoneNode, BoneTransform, BuildDiagnostics, IkMetadata, LinkedBone,
    LogDiagnostics,
};

/// 骨骼运行时错误
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SkeletonError {
    #[error("骨骼索引 {index} 越界（骨骼数 {count}）")]
    BoneIndexOutOfRange { index: usize, count: usize },

    #[error("骨骼 {index} 的物理写回不在 before_physics 与 after_physics 之间")]
    PhysicsSyncOutOfPhase { index: usize },

    #[error("找不到骨骼: {0}")]
    UnknownBoneName(String),
}

pub type Result<T> = std::result::Result<T, SkeletonError>;
