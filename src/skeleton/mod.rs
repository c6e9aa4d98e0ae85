//! 骨骼系统
//!
//! 核心设计思想：
//! - BoneNode: 单个骨骼节点，父子关系用索引表示
//! - BoneGraph: 节点数组 + 世界矩阵缓冲区，负责层级传播
//! - AppendTransformSolver: 附加变换（付与）
//! - IkSolver: CCD IK 求解器

mod append_solver;
mod bone_graph;
mod bone_node;
mod diagnostics;
mod ik_solver;
mod metadata;

pub use append_solver::{AppendTransformConfig, AppendTransformSolver};
pub use bone_graph::{BoneGraph, UpdatePhase};
pub use bone_node::{BoneFlags, BoneNode, LinkedBone, LocalPose};
pub use diagnostics::{BuildDiagnostic, BuildDiagnostics, CollectDiagnostics, LogDiagnostics};
pub use ik_solver::{
    IkAngleLimit, IkChainLink, IkSolver, RotationOrder, SolveAxis, IK_DISTANCE_EPSILON,
};
pub use metadata::{AppendTransformMetadata, BoneMetadata, IkLinkMetadata, IkMetadata};

use glam::{Mat4, Quat, Vec3};

// ============================================================================
// 公共类型定义
// ============================================================================

/// 骨骼变换数据（静止姿态、物理结果）
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BoneTransform {
    pub translation: Vec3,
    pub rotation: Quat,
    pub scale: Vec3,
}

impl Default for BoneTransform {
    fn default() -> Self {
        Self {
            translation: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            scale: Vec3::ONE,
        }
    }
}

impl BoneTransform {
    pub fn new(translation: Vec3, rotation: Quat, scale: Vec3) -> Self {
        Self { translation, rotation, scale }
    }

    /// 转换为 4x4 矩阵
    #[inline]
    pub fn to_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.scale, self.rotation, self.translation)
    }

    /// 从矩阵分解
    #[inline]
    pub fn from_matrix(m: Mat4) -> Self {
        let (scale, rotation, translation) = m.to_scale_rotation_translation();
        Self { translation, rotation, scale }
    }
}
