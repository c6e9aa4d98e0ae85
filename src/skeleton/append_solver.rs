//! 附加变换（付与）求解器
//!
//! 从另一骨骼复制旋转/平移，按比率缩放：
//! - 旋转：从单位四元数 slerp 到目标旋转，t = ratio
//! - 平移：线性缩放
//!
//! 目标骨骼必须在本骨骼之前求值（按 transform_order 排序保证），运行时不再校验。

use glam::{Quat, Vec3};

use super::bone_node::BoneNode;

/// 附加变换配置（构建后不变）
#[derive(Clone, Copy, Debug)]
pub struct AppendTransformConfig {
    /// 付与目标骨骼索引
    pub target_bone: usize,
    /// 付与比率
    pub ratio: f32,
    /// 使用目标骨骼的本地（动画）值，不沿付与链级联
    pub is_local: bool,
    /// 付与旋转
    pub affect_rotation: bool,
    /// 付与平移
    pub affect_position: bool,
}

/// 附加变换求解器
#[derive(Clone, Debug)]
pub struct AppendTransformSolver {
    pub config: AppendTransformConfig,
    /// 旋转偏移（计算结果）
    pub rotation_offset: Quat,
    /// 平移偏移（计算结果）
    pub position_offset: Vec3,
}

impl AppendTransformSolver {
    pub fn new(config: AppendTransformConfig) -> Self {
        Self {
            config,
            rotation_offset: Quat::IDENTITY,
            position_offset: Vec3::ZERO,
        }
    }

    #[inline]
    pub fn reset(&mut self) {
        self.rotation_offset = Quat::IDENTITY;
        self.position_offset = Vec3::ZERO;
    }

    /// 根据目标骨骼当前状态计算偏移
    ///
    /// 只读取目标骨骼，结果通过返回值交给调用方写回，避免同时借用两个节点。
    pub fn compute(config: &AppendTransformConfig, target: &BoneNode) -> (Quat, Vec3) {
        let target_append = if config.is_local {
            None
        } else {
            target.append_solver.as_ref()
        };

        let mut rotation = Quat::IDENTITY;
        if config.affect_rotation {
            let mut append_rotation = match target_append {
                Some(append) if append.config.affect_rotation => append.rotation_offset,
                _ => target.animated_rotation(),
            };

            // 非本地模式下，目标骨骼是 IK 链接时叠加其 IK 旋转
            if !config.is_local {
                if let Some(ik) = target.ik_rotation_offset {
                    append_rotation = ik * append_rotation;
                }
            }

            rotation = Quat::IDENTITY.slerp(append_rotation, config.ratio);
        }

        let mut position = Vec3::ZERO;
        if config.affect_position {
            let append_position = match target_append {
                Some(append) if append.config.affect_position => append.position_offset,
                _ => target.animated_position() - target.pose.rest_position,
            };
            position = append_position * config.ratio;
        }

        (rotation, position)
    }

    /// 更新 bones[index] 的附加变换偏移
    ///
    /// 只写入偏移，本地矩阵由调用方重新计算。
    pub fn update(bones: &mut [BoneNode], index: usize) {
        let Some(config) = bones[index].append_solver.as_ref().map(|s| s.config) else {
            return;
        };

        let (rotation, position) = Self::compute(&config, &bones[config.target_bone]);

        if let Some(solver) = bones[index].append_solver.as_mut() {
            solver.rotation_offset = rotation;
            solver.position_offset = position;
        }
    }
}
