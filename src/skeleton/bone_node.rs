//! 骨骼节点
//!
//! BoneNode 是骨骼图的基本单元。节点之间通过索引互相引用（arena + index），
//! 父子关系不持有所有权；世界矩阵存放在 BoneGraph 的连续缓冲区中，
//! 节点自身只保存本地矩阵和每帧输入。

use bitflags::bitflags;
use glam::{Mat4, Quat, Vec3};

use super::append_solver::AppendTransformSolver;

// ============================================================================
// 骨骼标志
// ============================================================================

bitflags! {
    /// 骨骼标志位（位值与 PMX 骨骼标志一致，解析器可直接转换）
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct BoneFlags: u32 {
        /// 可旋转
        const ROTATABLE = 0x0002;
        /// 可移动
        const MOVABLE = 0x0004;
        /// 可见
        const VISIBLE = 0x0008;
        /// IK 骨骼（挂载 IK 求解器）
        const IK = 0x0020;
        /// 附加变换使用本地坐标
        const LOCAL_APPEND_TRANSFORM = 0x0080;
        /// 附加旋转
        const APPEND_ROTATE = 0x0100;
        /// 附加平移
        const APPEND_MOVE = 0x0200;
        /// 物理后变形
        const TRANSFORM_AFTER_PHYSICS = 0x1000;
    }
}

// ============================================================================
// 链接骨骼接口
// ============================================================================

/// 外部骨骼的最小访问接口
///
/// 求解器只通过这三个方法读取动画姿态，不依赖具体的外部骨骼类型。
/// 外部骨骼约定静止旋转为单位四元数。
pub trait LinkedBone {
    /// 动画后的本地位置（包含静止位置）
    fn local_position(&self) -> Vec3;
    /// 动画后的本地旋转
    fn local_rotation(&self) -> Quat;
    /// 静止姿态本地矩阵
    fn rest_matrix(&self) -> Mat4;
}

/// 骨骼的本地姿态
///
/// 运行时自身的 LinkedBone 实现：动画采样器每帧写入 position/rotation，
/// 静止位置和缩放在构建后不变。
#[derive(Clone, Copy, Debug)]
pub struct LocalPose {
    /// 静止本地位置（相对父骨骼）
    pub rest_position: Vec3,
    /// 静止缩放
    pub rest_scale: Vec3,
    /// 动画本地位置
    pub position: Vec3,
    /// 动画本地旋转
    pub rotation: Quat,
}

impl LocalPose {
    pub fn new(rest_position: Vec3, rest_scale: Vec3) -> Self {
        Self {
            rest_position,
            rest_scale,
            position: rest_position,
            rotation: Quat::IDENTITY,
        }
    }

    /// 回到静止姿态
    #[inline]
    pub fn return_to_rest(&mut self) {
        self.position = self.rest_position;
        self.rotation = Quat::IDENTITY;
    }
}

impl Default for LocalPose {
    fn default() -> Self {
        Self::new(Vec3::ZERO, Vec3::ONE)
    }
}

impl LinkedBone for LocalPose {
    #[inline]
    fn local_position(&self) -> Vec3 {
        self.position
    }

    #[inline]
    fn local_rotation(&self) -> Quat {
        self.rotation
    }

    #[inline]
    fn rest_matrix(&self) -> Mat4 {
        Mat4::from_scale_rotation_translation(self.rest_scale, Quat::IDENTITY, self.rest_position)
    }
}

// ============================================================================
// 骨骼节点
// ============================================================================

/// 骨骼节点
///
/// - 静态数据：名称、父子关系、变换顺序、标志（构建后不变）
/// - 每帧输入：动画姿态、Morph 偏移（由外部阶段写入）
/// - 求解结果：IK 旋转偏移、附加变换偏移、本地矩阵
#[derive(Clone, Debug)]
pub struct BoneNode {
    // ========================================
    // 静态数据
    // ========================================

    /// 骨骼索引（0..N，稠密且稳定）
    pub index: usize,

    /// 骨骼名称
    pub name: String,

    /// 父骨骼索引（被环检测切断后为 None）
    pub parent: Option<usize>,

    /// 子骨骼索引（按原始索引升序）
    pub children: Vec<usize>,

    /// 变换顺序（排序键）
    pub transform_order: i32,

    /// 骨骼标志
    pub flags: BoneFlags,

    /// 逆绑定矩阵（静止姿态世界矩阵的逆，用于蒙皮）
    pub inverse_bind: Mat4,

    // ========================================
    // 每帧输入
    // ========================================

    /// 动画姿态
    pub pose: LocalPose,

    /// Morph 平移偏移
    pub morph_position_offset: Vec3,

    /// Morph 旋转偏移
    pub morph_rotation_offset: Quat,

    /// 是否叠加 Morph 偏移
    pub(crate) morph_enabled: bool,

    // ========================================
    // 求解状态
    // ========================================

    /// IK 旋转偏移（仅 IK 链接骨骼为 Some）
    pub ik_rotation_offset: Option<Quat>,

    /// 附加变换求解器
    pub append_solver: Option<AppendTransformSolver>,

    /// 以本骨骼为效应器的 IK 求解器（BoneGraphRuntime 中的索引）
    pub ik_solver: Option<usize>,

    /// 本地变换矩阵
    pub local_matrix: Mat4,

    /// 本帧世界矩阵是否由物理直接写入
    pub(crate) physics_override: bool,
}

impl BoneNode {
    /// 创建新骨骼
    pub fn new(index: usize, name: String) -> Self {
        Self {
            index,
            name,
            parent: None,
            children: Vec::new(),
            transform_order: 0,
            flags: BoneFlags::ROTATABLE,
            inverse_bind: Mat4::IDENTITY,
            pose: LocalPose::default(),
            morph_position_offset: Vec3::ZERO,
            morph_rotation_offset: Quat::IDENTITY,
            morph_enabled: true,
            ik_rotation_offset: None,
            append_solver: None,
            ik_solver: None,
            local_matrix: Mat4::IDENTITY,
            physics_override: false,
        }
    }

    // ========================================
    // 访问器
    // ========================================

    /// 是否为根骨骼
    #[inline]
    pub fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    /// 是否在物理之后变形
    #[inline]
    pub fn transform_after_physics(&self) -> bool {
        self.flags.contains(BoneFlags::TRANSFORM_AFTER_PHYSICS)
    }

    /// 是否为 IK 链接骨骼
    #[inline]
    pub fn is_ik_link(&self) -> bool {
        self.ik_rotation_offset.is_some()
    }

    #[inline]
    pub fn is_morph_enabled(&self) -> bool {
        self.morph_enabled
    }

    /// 动画位置（Morph 模式下叠加 Morph 偏移）
    #[inline]
    pub fn animated_position(&self) -> Vec3 {
        let position = self.pose.local_position();
        if self.morph_enabled {
            position + self.morph_position_offset
        } else {
            position
        }
    }

    /// 动画旋转（Morph 模式下叠加 Morph 旋转）
    #[inline]
    pub fn animated_rotation(&self) -> Quat {
        let rotation = self.pose.local_rotation();
        if self.morph_enabled {
            rotation * self.morph_rotation_offset
        } else {
            rotation
        }
    }

    /// 静止缩放
    #[inline]
    pub fn rest_scale(&self) -> Vec3 {
        self.pose.rest_scale
    }

    // ========================================
    // 变换计算
    // ========================================

    /// 重置每帧输入与求解结果
    pub fn reset_pose(&mut self) {
        self.pose.return_to_rest();
        self.morph_position_offset = Vec3::ZERO;
        self.morph_rotation_offset = Quat::IDENTITY;
        if let Some(ik) = self.ik_rotation_offset.as_mut() {
            *ik = Quat::IDENTITY;
        }
        if let Some(append) = self.append_solver.as_mut() {
            append.reset();
        }
    }

    /// 计算本地变换
    ///
    /// 变换顺序：
    /// 1. 旋转 = ik_rotation * animated_rotation * append_rotation
    /// 2. 平移 = animated_position + append_position
    pub fn update_local_matrix(&mut self) {
        let mut rotation = self.animated_rotation();
        if let Some(ik) = self.ik_rotation_offset {
            rotation = ik * rotation;
        }

        let mut position = self.animated_position();

        if let Some(append) = &self.append_solver {
            if append.config.affect_rotation {
                rotation = rotation * append.rotation_offset;
            }
            if append.config.affect_position {
                position += append.position_offset;
            }
        }

        self.local_matrix = Mat4::from_scale_rotation_translation(self.rest_scale(), rotation, position);
    }
}

impl Default for BoneNode {
    fn default() -> Self {
        Self::new(0, String::new())
    }
}
