//! 帧阶段接口
//!
//! 动画采样、Morph 计算和物理模拟都在运行时之外，
//! 通过这里的 trait 在固定时机接入每帧更新。

use glam::{Quat, Vec3};

use super::BoneGraphRuntime;
use crate::skeleton::BoneGraph;
use crate::{Result, SkeletonError};

/// 姿态写入器
///
/// 只开放每帧输入（动画姿态、Morph 偏移），不能修改骨骼结构。
pub struct PoseWriter<'a> {
    graph: &'a mut BoneGraph,
}

impl<'a> PoseWriter<'a> {
    pub(crate) fn new(graph: &'a mut BoneGraph) -> Self {
        Self { graph }
    }

    #[inline]
    pub fn bone_count(&self) -> usize {
        self.graph.len()
    }

    pub fn find_bone_by_name(&self, name: &str) -> Option<usize> {
        self.graph.find_bone_by_name(name)
    }

    /// 写入动画本地姿态（position 包含静止位置）
    pub fn set_animated_local_pose(&mut self, index: usize, position: Vec3, rotation: Quat) -> Result<()> {
        let count = self.graph.len();
        let node = self
            .graph
            .node_mut(index)
            .ok_or(SkeletonError::BoneIndexOutOfRange { index, count })?;
        node.pose.position = position;
        node.pose.rotation = rotation;
        Ok(())
    }

    /// 写入动画平移（相对静止位置）与旋转，VMD 关键帧即此形式
    pub fn set_animated_translation(&mut self, index: usize, translation: Vec3, rotation: Quat) -> Result<()> {
        let count = self.graph.len();
        let node = self
            .graph
            .node_mut(index)
            .ok_or(SkeletonError::BoneIndexOutOfRange { index, count })?;
        node.pose.position = node.pose.rest_position + translation;
        node.pose.rotation = rotation;
        Ok(())
    }

    /// 写入 Morph 偏移（骨骼关闭 Morph 时保存但不生效）
    pub fn set_morph_offset(&mut self, index: usize, position_offset: Vec3, rotation_offset: Quat) -> Result<()> {
        let count = self.graph.len();
        let node = self
            .graph
            .node_mut(index)
            .ok_or(SkeletonError::BoneIndexOutOfRange { index, count })?;
        node.morph_position_offset = position_offset;
        node.morph_rotation_offset = rotation_offset;
        Ok(())
    }
}

/// 动画 / Morph 阶段
pub trait PoseStage {
    /// 采样动画，写入每个骨骼的本地姿态
    ///
    /// 调用前所有骨骼已回到静止姿态。
    fn sample_animation(&mut self, frame_time: f32, writer: &mut PoseWriter<'_>);

    /// 计算骨骼 Morph 偏移（调用前偏移已清零）
    fn evaluate_morphs(&mut self, _writer: &mut PoseWriter<'_>) {}
}

/// 物理阶段
///
/// 在 before_physics 与 after_physics 之间调用：
/// 用 world_translation / world_matrix 读取运动学目标，
/// 用 set_physics_world_transform 写回动态刚体结果。
pub trait PhysicsStage {
    fn step(&mut self, runtime: &mut BoneGraphRuntime);
}
