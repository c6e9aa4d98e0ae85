//! IK 求解器 - CCD（循环坐标下降）
//!
//! 设计原则：
//! - 每次迭代从末端到根逐个旋转链接骨骼，使目标骨骼靠近 IK 骨骼
//! - 单次旋转角度随链接到末端的距离增长
//! - 角度限制按欧拉角钳制，旋转顺序在构建时选定以避开万向节锁
//! - 迭代前半段对单轴关节（膝盖等）使用轴吸附，并允许反射钳制
//!
//! 求解器不可重入：一次 solve 返回前不能再次调用（由 &mut BoneGraph 保证）。

use std::f32::consts::FRAC_PI_2;

use glam::{Mat3, Quat, Vec3};

use super::bone_graph::BoneGraph;
use super::diagnostics::BuildDiagnostics;
use super::metadata::IkMetadata;

/// 距离平方阈值，低于此值视为已到达
pub const IK_DISTANCE_EPSILON: f32 = 1.0e-8;

/// 欧拉分解中 asin 分量的钳制范围（±88°）
const SINGULARITY_CLAMP: f32 = 88.0 * std::f32::consts::PI / 180.0;

// ============================================================================
// 链接分类
// ============================================================================

/// 求解轴
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SolveAxis {
    /// 三轴自由
    None,
    /// 限制全为零，不参与求解
    Fixed,
    X,
    Y,
    Z,
}

/// 欧拉分解的旋转顺序（中间轴范围受限于 ±90°）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RotationOrder {
    YXZ,
    ZYX,
    XZY,
}

impl RotationOrder {
    /// 把旋转矩阵分解为 (x, y, z) 欧拉角
    ///
    /// asin 求得的中间轴角度钳制到 ±88°。
    pub fn decompose(self, m: Mat3) -> Vec3 {
        let middle = |sin: f32| sin.clamp(-1.0, 1.0).asin().clamp(-SINGULARITY_CLAMP, SINGULARITY_CLAMP);

        match self {
            RotationOrder::YXZ => {
                let x = middle(-m.z_axis.y);
                let y = m.z_axis.x.atan2(m.z_axis.z);
                let z = m.x_axis.y.atan2(m.y_axis.y);
                Vec3::new(x, y, z)
            }
            RotationOrder::ZYX => {
                let y = middle(-m.x_axis.z);
                let x = m.y_axis.z.atan2(m.z_axis.z);
                let z = m.x_axis.y.atan2(m.x_axis.x);
                Vec3::new(x, y, z)
            }
            RotationOrder::XZY => {
                let z = middle(-m.y_axis.x);
                let x = m.y_axis.z.atan2(m.y_axis.y);
                let y = m.z_axis.x.atan2(m.x_axis.x);
                Vec3::new(x, y, z)
            }
        }
    }

    /// 按同一顺序把 (x, y, z) 欧拉角组合回四元数
    pub fn compose(self, angles: Vec3) -> Quat {
        let x = Quat::from_rotation_x(angles.x);
        let y = Quat::from_rotation_y(angles.y);
        let z = Quat::from_rotation_z(angles.z);

        match self {
            RotationOrder::YXZ => y * x * z,
            RotationOrder::ZYX => z * y * x,
            RotationOrder::XZY => x * z * y,
        }
    }
}

/// 角度限制（弧度）
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct IkAngleLimit {
    pub min: Vec3,
    pub max: Vec3,
}

impl IkAngleLimit {
    /// 创建角度限制，逐分量整理为 min <= max（模型数据中存在上下限颠倒的情况）
    pub fn new(min: Vec3, max: Vec3) -> Self {
        Self {
            min: min.min(max),
            max: min.max(max),
        }
    }

    /// 选择旋转顺序：优先让 X，其次 Y 作为受限的中间轴
    pub fn rotation_order(&self) -> RotationOrder {
        let fits = |min: f32, max: f32| -FRAC_PI_2 < min && max < FRAC_PI_2;
        if fits(self.min.x, self.max.x) {
            RotationOrder::YXZ
        } else if fits(self.min.y, self.max.y) {
            RotationOrder::ZYX
        } else {
            RotationOrder::XZY
        }
    }

    /// 选择求解轴
    pub fn solve_axis(&self) -> SolveAxis {
        let pinned = |min: f32, max: f32| min == 0.0 && max == 0.0;
        let x = pinned(self.min.x, self.max.x);
        let y = pinned(self.min.y, self.max.y);
        let z = pinned(self.min.z, self.max.z);

        match (x, y, z) {
            (true, true, true) => SolveAxis::Fixed,
            (false, true, true) => SolveAxis::X,
            (true, false, true) => SolveAxis::Y,
            (true, true, false) => SolveAxis::Z,
            _ => SolveAxis::None,
        }
    }

    /// 把欧拉角钳制到限制范围
    ///
    /// 越界时先尝试以边界为镜面反射，反射值仍在范围内且允许反射时采用，否则钳到边界。
    pub fn clamp(&self, angles: Vec3, allow_reflection: bool) -> Vec3 {
        Vec3::new(
            clamp_reflected(angles.x, self.min.x, self.max.x, allow_reflection),
            clamp_reflected(angles.y, self.min.y, self.max.y, allow_reflection),
            clamp_reflected(angles.z, self.min.z, self.max.z, allow_reflection),
        )
    }
}

fn clamp_reflected(angle: f32, min: f32, max: f32, allow_reflection: bool) -> f32 {
    if angle < min {
        let reflected = 2.0 * min - angle;
        if allow_reflection && reflected <= max {
            reflected
        } else {
            min
        }
    } else if angle > max {
        let reflected = 2.0 * max - angle;
        if allow_reflection && reflected >= min {
            reflected
        } else {
            max
        }
    } else {
        angle
    }
}

// ============================================================================
// IK 链
// ============================================================================

/// IK 链接
#[derive(Clone, Debug)]
pub struct IkChainLink {
    /// 链接骨骼索引
    pub bone: usize,
    /// 是否受物理驱动
    pub is_affected_by_physics: bool,
    /// 角度限制
    pub limit: Option<IkAngleLimit>,
    /// 求解轴（构建时确定）
    pub solve_axis: SolveAxis,
    /// 欧拉分解顺序（构建时确定）
    pub rotation_order: RotationOrder,
}

impl IkChainLink {
    pub fn new(bone: usize, limit: Option<IkAngleLimit>) -> Self {
        let (solve_axis, rotation_order) = match &limit {
            Some(limit) => (limit.solve_axis(), limit.rotation_order()),
            None => (SolveAxis::None, RotationOrder::YXZ),
        };
        Self {
            bone,
            is_affected_by_physics: false,
            limit,
            solve_axis,
            rotation_order,
        }
    }
}

// ============================================================================
// IK 求解器
// ============================================================================

/// IK 求解器
#[derive(Clone, Debug)]
pub struct IkSolver {
    /// IK 骨骼（挂载求解器的骨骼，其位置是目标点）
    pub effector_bone: usize,
    /// 目标骨骼（链末端，被带向 IK 骨骼）
    pub target_bone: usize,
    /// 迭代次数
    pub iteration: u32,
    /// 单次迭代角度限制
    pub limit_angle: f32,
    /// 是否启用
    pub enabled: bool,
    chain: Vec<IkChainLink>,
    can_skip_when_physics_enabled: bool,
}

impl IkSolver {
    /// 创建新的 IK 求解器
    pub fn new(effector_bone: usize, target_bone: usize, iteration: u32, limit_angle: f32) -> Self {
        Self {
            effector_bone,
            target_bone,
            iteration,
            limit_angle,
            enabled: true,
            chain: Vec::new(),
            can_skip_when_physics_enabled: false,
        }
    }

    /// 从元数据构建；目标越界返回 None，越界链接被丢弃
    pub fn from_metadata(
        effector_bone: usize,
        effector_name: &str,
        metadata: &IkMetadata,
        bone_count: usize,
        iteration_limit: u32,
        diagnostics: &mut dyn BuildDiagnostics,
    ) -> Option<Self> {
        let target = metadata.target_index;
        if target < 0 || target as usize >= bone_count {
            diagnostics.on_invalid_ik_target(effector_bone, effector_name, target);
            return None;
        }

        let mut solver = Self::new(
            effector_bone,
            target as usize,
            metadata.iteration.min(iteration_limit),
            metadata.limit_angle,
        );

        for link in &metadata.links {
            if link.bone_index < 0 || link.bone_index as usize >= bone_count {
                diagnostics.on_invalid_ik_link(effector_bone, effector_name, link.bone_index);
                continue;
            }
            let limit = link.limits.map(|(min, max)| IkAngleLimit::new(min, max));
            solver.add_link(IkChainLink::new(link.bone_index as usize, limit));
        }

        Some(solver)
    }

    /// 追加链接（从末端向根）
    pub fn add_link(&mut self, link: IkChainLink) {
        self.chain.push(link);
        self.update_can_skip();
    }

    #[inline]
    pub fn chain(&self) -> &[IkChainLink] {
        &self.chain
    }

    /// 链接是否全部受物理驱动（此时启用物理可跳过求解）
    #[inline]
    pub fn can_skip_when_physics_enabled(&self) -> bool {
        self.can_skip_when_physics_enabled
    }

    /// 标记受物理驱动的链接
    pub fn mark_physics_bones(&mut self, is_physics_bone: impl Fn(usize) -> bool) {
        for link in &mut self.chain {
            link.is_affected_by_physics = is_physics_bone(link.bone);
        }
        self.update_can_skip();
    }

    fn update_can_skip(&mut self) {
        self.can_skip_when_physics_enabled =
            !self.chain.is_empty() && self.chain.iter().all(|link| link.is_affected_by_physics);
    }

    /// 把链上所有 IK 旋转偏移重置为单位四元数
    pub fn reset_chain(&self, graph: &mut BoneGraph) {
        for link in &self.chain {
            if let Some(node) = graph.node_mut(link.bone) {
                node.ik_rotation_offset = Some(Quat::IDENTITY);
                node.update_local_matrix();
            }
        }
    }

    /// 求解 IK
    ///
    /// 只修改链接骨骼的 ik_rotation_offset 及其矩阵；
    /// 调用方负责之后重新传播世界矩阵。
    pub fn solve(&self, graph: &mut BoneGraph) {
        if !self.enabled || self.chain.is_empty() {
            return;
        }

        let effector_position = graph.world_translation(self.effector_bone);

        // 每次求解都从单位偏移开始，重置后刷新世界矩阵（从根到末端）
        self.reset_chain(graph);
        for link in self.chain.iter().rev() {
            graph.update_world_matrix_single(link.bone);
        }
        graph.update_world_matrix_path(self.target_bone);

        if self.reached(graph, effector_position) {
            return;
        }

        let axis_window = self.iteration >> 1;
        for iteration in 0..self.iteration {
            let use_axis = iteration < axis_window;
            if self.solve_core(graph, effector_position, use_axis) {
                break;
            }
        }
    }

    #[inline]
    fn reached(&self, graph: &BoneGraph, effector_position: Vec3) -> bool {
        graph.world_translation(self.target_bone).distance_squared(effector_position) < IK_DISTANCE_EPSILON
    }

    /// 单次迭代，到达目标返回 true
    fn solve_core(&self, graph: &mut BoneGraph, effector_position: Vec3, use_axis: bool) -> bool {
        for (chain_index, link) in self.chain.iter().enumerate() {
            if link.solve_axis == SolveAxis::Fixed || link.bone == self.target_bone {
                continue;
            }

            let link_position = graph.world_translation(link.bone);
            let target_position = graph.world_translation(self.target_bone);

            let target_vector = (link_position - target_position).normalize_or_zero();
            let effector_vector = (link_position - effector_position).normalize_or_zero();

            // 向量接近平行时叉积退化，本链接不旋转
            let cross = target_vector.cross(effector_vector);
            if cross.length_squared() < IK_DISTANCE_EPSILON {
                continue;
            }
            let world_axis = cross.normalize();

            // 父骨骼旋转的逆（去除缩放后转置）
            let parent_world = match graph.nodes()[link.bone].parent {
                Some(parent) => Mat3::from_mat4(graph.world_matrix(parent)),
                None => Mat3::IDENTITY,
            };
            let parent_rotation = Mat3::from_cols(
                parent_world.x_axis.normalize_or_zero(),
                parent_world.y_axis.normalize_or_zero(),
                parent_world.z_axis.normalize_or_zero(),
            );
            let local_axis = (parent_rotation.transpose() * world_axis).normalize_or_zero();
            if local_axis == Vec3::ZERO {
                continue;
            }

            let rotation_axis = if link.limit.is_some() && use_axis {
                match link.solve_axis {
                    SolveAxis::X => snap_to_axis(local_axis, Vec3::X),
                    SolveAxis::Y => snap_to_axis(local_axis, Vec3::Y),
                    SolveAxis::Z => snap_to_axis(local_axis, Vec3::Z),
                    SolveAxis::None | SolveAxis::Fixed => local_axis,
                }
            } else {
                local_axis
            };

            let dot = target_vector.dot(effector_vector).clamp(-1.0, 1.0);
            let angle = (self.limit_angle * (chain_index + 1) as f32).min(dot.acos());

            let node = &mut graph.nodes_mut()[link.bone];
            let previous = node.ik_rotation_offset.unwrap_or(Quat::IDENTITY);
            let mut ik_rotation = (Quat::from_axis_angle(rotation_axis, angle) * previous).normalize();

            if let Some(limit) = &link.limit {
                let local_rotation = node.animated_rotation();
                let chain_rotation = ik_rotation * local_rotation;
                let angles = link.rotation_order.decompose(Mat3::from_quat(chain_rotation));
                let clamped = limit.clamp(angles, use_axis);
                ik_rotation = (link.rotation_order.compose(clamped) * local_rotation.inverse()).normalize();
            }

            node.ik_rotation_offset = Some(ik_rotation);
            node.update_local_matrix();

            // 从当前链接向末端刷新世界矩阵，目标骨骼可能隔着非链接骨骼，沿父链刷新
            for j in (0..=chain_index).rev() {
                graph.update_world_matrix_single(self.chain[j].bone);
            }
            graph.update_world_matrix_path(self.target_bone);

            if self.reached(graph, effector_position) {
                return true;
            }
        }
        false
    }
}

/// 吸附到基向量，符号取与原轴点积的符号
#[inline]
fn snap_to_axis(axis: Vec3, basis: Vec3) -> Vec3 {
    if axis.dot(basis) >= 0.0 {
        basis
    } else {
        -basis
    }
}
