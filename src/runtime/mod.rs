//! 骨骼运行时 - 两阶段帧更新
//!
//! 每帧调用顺序固定：before_physics -> [外部物理步进] -> after_physics。
//! 每个阶段只处理属于本阶段的骨骼：
//! 1. 按 transform_order 更新本地矩阵
//! 2. 从阶段根骨骼传播世界矩阵
//! 3. 按 transform_order 求解付与与 IK
//! 4. 再次从阶段根骨骼传播世界矩阵

mod stage;

pub use stage::{PhysicsStage, PoseStage, PoseWriter};

use glam::{Mat4, Quat, Vec3};

use crate::config::{get_config, RuntimeConfig};
use crate::skeleton::{
    BoneGraph, BoneMetadata, BoneNode, BoneTransform, BuildDiagnostics, IkSolver, LinkedBone,
    LogDiagnostics, UpdatePhase,
};
use crate::{Result, SkeletonError};

/// 骨骼运行时
pub struct BoneGraphRuntime {
    graph: BoneGraph,
    ik_solvers: Vec<IkSolver>,
    /// 按 transform_order 稳定排序后的骨骼索引
    sorted: Vec<usize>,
    /// 物理前阶段的根骨骼
    before_roots: Vec<usize>,
    /// 物理后阶段的根骨骼
    after_roots: Vec<usize>,
    /// 蒙皮矩阵缓冲区
    skinning: Vec<Mat4>,
    config: RuntimeConfig,
    /// 是否处于 before_physics 与 after_physics 之间
    physics_window: bool,
}

impl BoneGraphRuntime {
    /// 使用全局配置构建
    pub fn new(metadata: &[BoneMetadata]) -> Self {
        Self::with_config(metadata, get_config())
    }

    /// 使用指定配置构建，诊断写日志
    pub fn with_config(metadata: &[BoneMetadata], config: RuntimeConfig) -> Self {
        Self::build(metadata, config, &mut LogDiagnostics)
    }

    /// 构建运行时
    ///
    /// 结构错误在本地恢复并通过 diagnostics 上报，构建本身不会失败。
    pub fn build(
        metadata: &[BoneMetadata],
        config: RuntimeConfig,
        diagnostics: &mut dyn BuildDiagnostics,
    ) -> Self {
        let mut graph = BoneGraph::build(metadata, diagnostics);
        let bone_count = graph.len();

        for node in graph.nodes_mut() {
            node.morph_enabled = config.morph_enabled;
        }

        // IK 求解器
        let mut ik_solvers = Vec::new();
        for (index, meta) in metadata.iter().enumerate() {
            let Some(ik) = meta.ik.as_ref() else {
                continue;
            };
            let Some(solver) = IkSolver::from_metadata(
                index,
                &meta.name,
                ik,
                bone_count,
                config.ik_iteration_limit(),
                diagnostics,
            ) else {
                continue;
            };

            let nodes = graph.nodes_mut();
            for link in solver.chain() {
                nodes[link.bone].ik_rotation_offset = Some(Quat::IDENTITY);
            }
            nodes[index].ik_solver = Some(ik_solvers.len());
            ik_solvers.push(solver);
        }

        // 稳定排序：transform_order 相同时保持原始索引顺序
        let mut sorted: Vec<usize> = (0..bone_count).collect();
        sorted.sort_by_key(|&index| graph.nodes()[index].transform_order);

        let before_roots = phase_roots(&graph, UpdatePhase::BeforePhysics);
        let after_roots = phase_roots(&graph, UpdatePhase::AfterPhysics);

        graph.initialize_rest_pose();

        let append_count = graph.nodes().iter().filter(|n| n.append_solver.is_some()).count();
        log::info!(
            "[骨骼] 骨骼图构建完成: 骨骼={}, 根={}, IK={}, 付与={}, 物理后变形={}",
            bone_count,
            graph.roots().len(),
            ik_solvers.len(),
            append_count,
            graph.nodes().iter().filter(|n| n.transform_after_physics()).count()
        );

        Self {
            graph,
            ik_solvers,
            sorted,
            before_roots,
            after_roots,
            skinning: vec![Mat4::IDENTITY; bone_count],
            config,
            physics_window: false,
        }
    }

    // ========================================
    // 帧更新
    // ========================================

    /// 完整一帧：before_physics -> physics.step -> after_physics
    pub fn tick(
        &mut self,
        frame_time: f32,
        pose: &mut dyn PoseStage,
        physics: Option<&mut dyn PhysicsStage>,
    ) {
        self.before_physics(Some(frame_time), Some(pose));
        if let Some(physics) = physics {
            physics.step(self);
        }
        self.after_physics();
    }

    /// 物理前更新
    ///
    /// frame_time 为 None 表示本帧没有新姿态：保留现有动画姿态，不调用采样器。
    pub fn before_physics(&mut self, frame_time: Option<f32>, stage: Option<&mut dyn PoseStage>) {
        self.graph.clear_physics_overrides();

        if frame_time.is_some() {
            for node in self.graph.nodes_mut() {
                node.pose.return_to_rest();
            }
        }

        if let Some(stage) = stage {
            for node in self.graph.nodes_mut() {
                node.morph_position_offset = Vec3::ZERO;
                node.morph_rotation_offset = Quat::IDENTITY;
            }

            let mut writer = PoseWriter::new(&mut self.graph);
            if let Some(frame_time) = frame_time {
                stage.sample_animation(frame_time, &mut writer);
            }
            stage.evaluate_morphs(&mut writer);
        }

        self.update_phase(UpdatePhase::BeforePhysics);
        self.physics_window = true;
    }

    /// 物理后更新
    pub fn after_physics(&mut self) {
        // 物理写入的骨骼自身矩阵不变，把结果带给后代
        for index in 0..self.graph.len() {
            if self.graph.nodes()[index].physics_override {
                self.graph.update_children_world_matrix(index, None);
            }
        }

        self.update_phase(UpdatePhase::AfterPhysics);
        self.physics_window = false;
    }

    fn update_phase(&mut self, phase: UpdatePhase) {
        if self.config.debug_log {
            log::debug!("[骨骼] 阶段更新 {:?}", phase);
        }

        for &index in &self.sorted {
            if phase.contains(&self.graph.nodes()[index]) {
                self.graph.update_local_matrix(index);
            }
        }

        self.propagate_phase(phase);

        for &index in &self.sorted {
            let node = &self.graph.nodes()[index];
            if !phase.contains(node) {
                continue;
            }
            let has_append = node.append_solver.is_some();
            let ik_solver = node.ik_solver;

            if has_append {
                self.graph.update_append_transform(index);
                self.graph.update_world_matrix(index, Some(phase));
            }

            let Some(solver) = ik_solver.map(|s| &self.ik_solvers[s]) else {
                continue;
            };
            if !solver.enabled {
                continue;
            }
            if self.config.physics_enabled && solver.can_skip_when_physics_enabled() {
                if self.config.debug_log {
                    log::debug!("[骨骼] IK '{}' 链接全部受物理驱动，跳过", self.graph.nodes()[index].name);
                }
                continue;
            }

            solver.solve(&mut self.graph);
            self.graph.update_world_matrix(index, Some(phase));
            // 链上非目标的后代（脚尖等）也要跟随，后续 IK 会读取它们的位置
            if let Some(head) = solver.chain().last() {
                self.graph.update_world_matrix(head.bone, Some(phase));
            }
        }

        self.propagate_phase(phase);
    }

    fn propagate_phase(&mut self, phase: UpdatePhase) {
        let roots = match phase {
            UpdatePhase::BeforePhysics => &self.before_roots,
            UpdatePhase::AfterPhysics => &self.after_roots,
        };
        for &root in roots {
            self.graph.update_world_matrix(root, Some(phase));
        }
    }

    /// 所有骨骼回到静止姿态并重新计算矩阵
    pub fn reset_pose(&mut self) {
        self.graph.reset_pose();
        self.physics_window = false;
    }

    /// 从外部骨骼复制动画姿态（按索引对应）
    pub fn pull_pose<S: LinkedBone>(&mut self, bones: &[S]) {
        if bones.len() != self.graph.len() {
            log::warn!(
                "[骨骼] 外部骨骼数 {} 与骨骼图 {} 不一致，只复制前 {} 个",
                bones.len(),
                self.graph.len(),
                bones.len().min(self.graph.len())
            );
        }
        for (node, bone) in self.graph.nodes_mut().iter_mut().zip(bones) {
            node.pose.position = bone.local_position();
            node.pose.rotation = bone.local_rotation();
        }
    }

    /// 姿态写入器（在帧更新之外直接写入输入）
    pub fn pose_writer(&mut self) -> PoseWriter<'_> {
        PoseWriter::new(&mut self.graph)
    }

    // ========================================
    // 物理写回
    // ========================================

    /// 物理桥接层写回骨骼世界变换
    ///
    /// 只能在 before_physics 与 after_physics 之间调用。
    pub fn set_physics_world_transform(&mut self, index: usize, position: Vec3, rotation: Quat) -> Result<()> {
        let scale = self.checked_node(index)?.rest_scale();
        if !self.physics_window {
            return Err(SkeletonError::PhysicsSyncOutOfPhase { index });
        }
        let matrix = BoneTransform::new(position, rotation, scale).to_matrix();
        self.graph.set_physics_world_matrix(index, matrix);
        Ok(())
    }

    /// 设置受动态刚体驱动的骨骼，重新计算 IK 链接的物理标记
    pub fn set_physics_bones(&mut self, bones: &[usize]) -> Result<()> {
        let count = self.graph.len();
        let mut mask = vec![false; count];
        for &index in bones {
            if index >= count {
                return Err(SkeletonError::BoneIndexOutOfRange { index, count });
            }
            mask[index] = true;
        }

        for solver in &mut self.ik_solvers {
            solver.mark_physics_bones(|bone| mask[bone]);
        }
        log::debug!(
            "[骨骼] 物理骨骼 {} 个，可跳过的 IK {} 个",
            bones.len(),
            self.ik_solvers.iter().filter(|s| s.can_skip_when_physics_enabled()).count()
        );
        Ok(())
    }

    pub fn set_physics_enabled(&mut self, enabled: bool) {
        self.config.physics_enabled = enabled;
    }

    // ========================================
    // 运行时控制
    // ========================================

    /// 启用/禁用 bone 上的 IK，返回该骨骼是否挂有求解器
    ///
    /// 禁用时链上的 IK 偏移归零，链回到动画姿态。
    pub fn set_ik_enabled(&mut self, bone: usize, enabled: bool) -> Result<bool> {
        let Some(solver_index) = self.checked_node(bone)?.ik_solver else {
            return Ok(false);
        };
        let solver = &mut self.ik_solvers[solver_index];
        solver.enabled = enabled;
        if !enabled {
            solver.reset_chain(&mut self.graph);
        }
        Ok(true)
    }

    /// 设置 IK 迭代次数（钳制到配置上限）
    pub fn set_ik_iteration(&mut self, bone: usize, iteration: u32) -> Result<bool> {
        let Some(solver_index) = self.checked_node(bone)?.ik_solver else {
            return Ok(false);
        };
        self.ik_solvers[solver_index].iteration = iteration.min(self.config.ik_iteration_limit());
        Ok(true)
    }

    pub fn enable_morph(&mut self, index: usize) -> Result<()> {
        self.checked_node_mut(index)?.morph_enabled = true;
        Ok(())
    }

    pub fn disable_morph(&mut self, index: usize) -> Result<()> {
        self.checked_node_mut(index)?.morph_enabled = false;
        Ok(())
    }

    // ========================================
    // 输出
    // ========================================

    pub fn world_matrix(&self, index: usize) -> Result<Mat4> {
        self.checked_node(index)?;
        Ok(self.graph.world_matrix(index))
    }

    pub fn world_translation(&self, index: usize) -> Result<Vec3> {
        self.checked_node(index)?;
        Ok(self.graph.world_translation(index))
    }

    pub fn world_matrix_by_name(&self, name: &str) -> Result<Mat4> {
        let index = self.bone_index(name)?;
        Ok(self.graph.world_matrix(index))
    }

    #[inline]
    pub fn world_matrices(&self) -> &[Mat4] {
        self.graph.world_matrices()
    }

    /// 世界矩阵平坦化（每骨骼 16 个 float，列主序）
    #[inline]
    pub fn world_matrix_floats(&self) -> &[f32] {
        bytemuck::cast_slice(self.graph.world_matrices())
    }

    /// 计算蒙皮矩阵：world * inverse_bind
    pub fn update_skinning_matrices(&mut self) {
        self.skinning.clear();
        self.skinning.extend(
            self.graph
                .nodes()
                .iter()
                .zip(self.graph.world_matrices())
                .map(|(node, world)| *world * node.inverse_bind),
        );
    }

    #[inline]
    pub fn skinning_matrices(&self) -> &[Mat4] {
        &self.skinning
    }

    // ========================================
    // 查询
    // ========================================

    #[inline]
    pub fn bone_count(&self) -> usize {
        self.graph.len()
    }

    #[inline]
    pub fn bone(&self, index: usize) -> Option<&BoneNode> {
        self.graph.node(index)
    }

    pub fn find_bone_by_name(&self, name: &str) -> Option<usize> {
        self.graph.find_bone_by_name(name)
    }

    pub fn bone_index(&self, name: &str) -> Result<usize> {
        self.graph
            .find_bone_by_name(name)
            .ok_or_else(|| SkeletonError::UnknownBoneName(name.to_string()))
    }

    #[inline]
    pub fn roots(&self) -> &[usize] {
        self.graph.roots()
    }

    /// 求值顺序
    #[inline]
    pub fn sorted_indices(&self) -> &[usize] {
        &self.sorted
    }

    #[inline]
    pub fn ik_solvers(&self) -> &[IkSolver] {
        &self.ik_solvers
    }

    #[inline]
    pub fn graph(&self) -> &BoneGraph {
        &self.graph
    }

    #[inline]
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    fn checked_node(&self, index: usize) -> Result<&BoneNode> {
        let count = self.graph.len();
        self.graph
            .node(index)
            .ok_or(SkeletonError::BoneIndexOutOfRange { index, count })
    }

    fn checked_node_mut(&mut self, index: usize) -> Result<&mut BoneNode> {
        let count = self.graph.len();
        self.graph
            .node_mut(index)
            .ok_or(SkeletonError::BoneIndexOutOfRange { index, count })
    }
}

/// 阶段根骨骼：属于本阶段，且没有父骨骼或父骨骼属于另一阶段
fn phase_roots(graph: &BoneGraph, phase: UpdatePhase) -> Vec<usize> {
    let nodes = graph.nodes();
    nodes
        .iter()
        .filter(|node| phase.contains(node))
        .filter(|node| match node.parent {
            Some(parent) => !phase.contains(&nodes[parent]),
            None => true,
        })
        .map(|node| node.index)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::{
        BoneFlags, BuildDiagnostic, CollectDiagnostics, IkLinkMetadata, IkMetadata, LocalPose,
    };

    fn init_logger() {
        let _ = env_logger::builder().is_test(true).try_init();
    }

    /// 按脚本写入动画与 Morph
    #[derive(Default)]
    struct ScriptedPose {
        poses: Vec<(usize, Vec3, Quat)>,
        morphs: Vec<(usize, Vec3, Quat)>,
    }

    impl PoseStage for ScriptedPose {
        fn sample_animation(&mut self, _frame_time: f32, writer: &mut PoseWriter<'_>) {
            for &(index, translation, rotation) in &self.poses {
                writer.set_animated_translation(index, translation, rotation).unwrap();
            }
        }

        fn evaluate_morphs(&mut self, writer: &mut PoseWriter<'_>) {
            for &(index, position, rotation) in &self.morphs {
                writer.set_morph_offset(index, position, rotation).unwrap();
            }
        }
    }

    /// 把一个骨骼固定到指定世界位置
    struct PinBone {
        bone: usize,
        position: Vec3,
    }

    impl PhysicsStage for PinBone {
        fn step(&mut self, runtime: &mut BoneGraphRuntime) {
            runtime
                .set_physics_world_transform(self.bone, self.position, Quat::IDENTITY)
                .unwrap();
        }
    }

    fn root_and_child() -> Vec<BoneMetadata> {
        vec![
            BoneMetadata::new("全ての親", -1, Vec3::ZERO),
            BoneMetadata::new("センター", 0, Vec3::new(0.0, 1.0, 0.0)),
        ]
    }

    /// 根 -> 大腿 -> 膝 -> 足首，足IK 挂在根下
    fn leg_with_ik(effector: Vec3) -> Vec<BoneMetadata> {
        vec![
            BoneMetadata::new("全ての親", -1, Vec3::ZERO),
            BoneMetadata::new("左足", 0, Vec3::ZERO),
            BoneMetadata::new("左ひざ", 1, Vec3::Y),
            BoneMetadata::new("左足首", 2, Vec3::Y),
            BoneMetadata::new("左足ＩＫ", 0, effector).with_ik(IkMetadata {
                target_index: 3,
                iteration: 16,
                limit_angle: 2.0,
                links: vec![
                    IkLinkMetadata { bone_index: 2, limits: None },
                    IkLinkMetadata { bone_index: 1, limits: None },
                ],
            }),
        ]
    }

    fn run_frame(runtime: &mut BoneGraphRuntime) {
        runtime.before_physics(Some(0.0), None);
        runtime.after_physics();
    }

    #[test]
    fn test_child_translation_after_frame() {
        init_logger();
        let mut runtime = BoneGraphRuntime::with_config(&root_and_child(), RuntimeConfig::default());
        run_frame(&mut runtime);
        assert_eq!(runtime.world_translation(1).unwrap(), Vec3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn test_equal_transform_order_keeps_index_order() {
        init_logger();
        let metadata = [
            BoneMetadata::new("a", -1, Vec3::ZERO).with_transform_order(1),
            BoneMetadata::new("b", -1, Vec3::ZERO),
            BoneMetadata::new("c", -1, Vec3::ZERO).with_transform_order(1),
            BoneMetadata::new("d", -1, Vec3::ZERO),
        ];
        let runtime = BoneGraphRuntime::with_config(&metadata, RuntimeConfig::default());
        assert_eq!(runtime.sorted_indices(), &[1, 3, 0, 2]);
    }

    #[test]
    fn test_append_cascade_follows_index_order() {
        init_logger();
        let metadata = [
            BoneMetadata::new("腕", -1, Vec3::ZERO),
            BoneMetadata::new("腕捩", -1, Vec3::ZERO).with_append(0, 1.0, BoneFlags::APPEND_ROTATE),
            BoneMetadata::new("手捩", -1, Vec3::ZERO).with_append(1, 0.5, BoneFlags::APPEND_ROTATE),
        ];
        let mut runtime = BoneGraphRuntime::with_config(&metadata, RuntimeConfig::default());
        let mut pose = ScriptedPose {
            poses: vec![(0, Vec3::ZERO, Quat::from_rotation_z(0.8))],
            ..Default::default()
        };
        runtime.tick(0.0, &mut pose, None);

        let (_, rotation, _) = runtime.world_matrix(2).unwrap().to_scale_rotation_translation();
        assert!(rotation.abs_diff_eq(Quat::from_rotation_z(0.4), 1e-5));
    }

    #[test]
    fn test_after_physics_bone_untouched_before_physics() {
        init_logger();
        let metadata = [
            BoneMetadata::new("root", -1, Vec3::ZERO),
            BoneMetadata::new("arm", 0, Vec3::Y),
            BoneMetadata::new("sleeve", 1, Vec3::Y).with_flags(BoneFlags::TRANSFORM_AFTER_PHYSICS),
        ];
        let mut runtime = BoneGraphRuntime::with_config(&metadata, RuntimeConfig::default());
        let mut pose = ScriptedPose {
            poses: vec![(1, Vec3::ZERO, Quat::from_rotation_z(0.5))],
            ..Default::default()
        };

        let before = runtime.world_matrix(2).unwrap();
        runtime.before_physics(Some(0.0), Some(&mut pose));
        assert_eq!(runtime.world_matrix(2).unwrap(), before);

        runtime.after_physics();
        let expected = Vec3::new(-(0.5f32).sin(), 1.0 + (0.5f32).cos(), 0.0);
        assert!(runtime.world_translation(2).unwrap().abs_diff_eq(expected, 1e-5));
    }

    #[test]
    fn test_ik_reaches_effector() {
        init_logger();
        let effector = Vec3::new(1.0, 0.2, -0.6);
        let mut runtime = BoneGraphRuntime::with_config(&leg_with_ik(effector), RuntimeConfig::default());
        assert_eq!(runtime.ik_solvers().len(), 1);
        assert!(runtime.bone(2).unwrap().is_ik_link());

        run_frame(&mut runtime);

        let tip = runtime.world_translation(3).unwrap();
        assert!(tip.distance_squared(effector) < 1e-6, "tip {tip:?}");
        // 大腿长度不变
        assert!((runtime.world_translation(2).unwrap().length() - 1.0).abs() < 1e-4);
    }

    #[test]
    fn test_disabled_ik_returns_to_animation() {
        init_logger();
        let mut runtime =
            BoneGraphRuntime::with_config(&leg_with_ik(Vec3::new(1.0, 0.2, -0.6)), RuntimeConfig::default());
        run_frame(&mut runtime);

        assert_eq!(runtime.set_ik_enabled(4, false), Ok(true));
        assert_eq!(runtime.set_ik_enabled(0, false), Ok(false));
        run_frame(&mut runtime);

        assert!(runtime.world_translation(3).unwrap().abs_diff_eq(Vec3::new(0.0, 2.0, 0.0), 1e-5));
    }

    #[test]
    fn test_physics_driven_chain_skips_ik() {
        init_logger();
        let config = RuntimeConfig {
            physics_enabled: true,
            ..RuntimeConfig::default()
        };
        let mut runtime = BoneGraphRuntime::with_config(&leg_with_ik(Vec3::new(1.0, 0.2, -0.6)), config);

        runtime.set_physics_bones(&[2]).unwrap();
        assert!(!runtime.ik_solvers()[0].can_skip_when_physics_enabled());

        runtime.set_physics_bones(&[1, 2]).unwrap();
        assert!(runtime.ik_solvers()[0].can_skip_when_physics_enabled());
        run_frame(&mut runtime);
        assert!(runtime.world_translation(3).unwrap().abs_diff_eq(Vec3::new(0.0, 2.0, 0.0), 1e-5));

        assert_eq!(
            runtime.set_physics_bones(&[9]),
            Err(SkeletonError::BoneIndexOutOfRange { index: 9, count: 5 })
        );
    }

    #[test]
    fn test_ik_iteration_is_clamped() {
        init_logger();
        let config = RuntimeConfig {
            max_ik_iteration: 8,
            ..RuntimeConfig::default()
        };
        let mut runtime = BoneGraphRuntime::with_config(&leg_with_ik(Vec3::X), config);
        assert_eq!(runtime.ik_solvers()[0].iteration, 8);

        assert_eq!(runtime.set_ik_iteration(4, 100), Ok(true));
        assert_eq!(runtime.ik_solvers()[0].iteration, 8);
        assert_eq!(runtime.set_ik_iteration(4, 3), Ok(true));
        assert_eq!(runtime.ik_solvers()[0].iteration, 3);
    }

    #[test]
    fn test_physics_write_back_moves_children() {
        init_logger();
        let metadata = [
            BoneMetadata::new("root", -1, Vec3::ZERO),
            BoneMetadata::new("hair", 0, Vec3::Y),
            BoneMetadata::new("hair_tip", 1, Vec3::Y),
        ];
        let mut runtime = BoneGraphRuntime::with_config(&metadata, RuntimeConfig::default());

        assert_eq!(
            runtime.set_physics_world_transform(1, Vec3::ZERO, Quat::IDENTITY),
            Err(SkeletonError::PhysicsSyncOutOfPhase { index: 1 })
        );

        let mut physics = PinBone {
            bone: 1,
            position: Vec3::new(5.0, 0.0, 0.0),
        };
        runtime.tick(0.0, &mut ScriptedPose::default(), Some(&mut physics));

        assert!(runtime.world_translation(1).unwrap().abs_diff_eq(Vec3::new(5.0, 0.0, 0.0), 1e-6));
        assert!(runtime.world_translation(2).unwrap().abs_diff_eq(Vec3::new(5.0, 1.0, 0.0), 1e-6));
        assert!(runtime
            .set_physics_world_transform(1, Vec3::ZERO, Quat::IDENTITY)
            .is_err());

        // 下一帧清除物理覆盖
        run_frame(&mut runtime);
        assert!(runtime.world_translation(2).unwrap().abs_diff_eq(Vec3::new(0.0, 2.0, 0.0), 1e-6));
    }

    #[test]
    fn test_morph_offset_respects_bone_mode() {
        init_logger();
        let mut runtime = BoneGraphRuntime::with_config(&root_and_child(), RuntimeConfig::default());
        let mut pose = ScriptedPose {
            morphs: vec![(1, Vec3::new(0.0, 0.0, 1.0), Quat::IDENTITY)],
            ..Default::default()
        };

        runtime.tick(0.0, &mut pose, None);
        assert!(runtime.world_translation(1).unwrap().abs_diff_eq(Vec3::new(0.0, 1.0, 1.0), 1e-6));

        runtime.disable_morph(1).unwrap();
        runtime.tick(0.0, &mut pose, None);
        assert!(runtime.world_translation(1).unwrap().abs_diff_eq(Vec3::new(0.0, 1.0, 0.0), 1e-6));

        runtime.enable_morph(1).unwrap();
        runtime.tick(0.0, &mut pose, None);
        assert!(runtime.world_translation(1).unwrap().abs_diff_eq(Vec3::new(0.0, 1.0, 1.0), 1e-6));
    }

    #[test]
    fn test_pull_pose_without_new_frame() {
        init_logger();
        let mut runtime = BoneGraphRuntime::with_config(&root_and_child(), RuntimeConfig::default());

        let mut external = vec![
            LocalPose::new(Vec3::ZERO, Vec3::ONE),
            LocalPose::new(Vec3::new(0.0, 1.0, 0.0), Vec3::ONE),
        ];
        external[0].rotation = Quat::from_rotation_z(std::f32::consts::FRAC_PI_2);
        runtime.pull_pose(&external);

        // 没有新帧，保留拉取的姿态
        runtime.before_physics(None, None);
        runtime.after_physics();
        assert!(runtime.world_translation(1).unwrap().abs_diff_eq(Vec3::new(-1.0, 0.0, 0.0), 1e-5));

        // 新帧回到静止姿态
        run_frame(&mut runtime);
        assert!(runtime.world_translation(1).unwrap().abs_diff_eq(Vec3::new(0.0, 1.0, 0.0), 1e-6));
    }

    #[test]
    fn test_flat_buffer_and_skinning() {
        init_logger();
        let mut runtime = BoneGraphRuntime::with_config(&root_and_child(), RuntimeConfig::default());
        run_frame(&mut runtime);

        let floats = runtime.world_matrix_floats();
        assert_eq!(floats.len(), 32);
        assert_eq!(&floats[28..31], &[0.0, 1.0, 0.0]);

        runtime.update_skinning_matrices();
        for skinning in runtime.skinning_matrices() {
            assert!(skinning.abs_diff_eq(Mat4::IDENTITY, 1e-6));
        }
    }

    #[test]
    fn test_reset_pose_clears_animation() {
        init_logger();
        let mut runtime = BoneGraphRuntime::with_config(&root_and_child(), RuntimeConfig::default());
        let mut pose = ScriptedPose {
            poses: vec![(0, Vec3::new(3.0, 0.0, 0.0), Quat::IDENTITY)],
            ..Default::default()
        };
        runtime.tick(0.0, &mut pose, None);
        assert!(runtime.world_translation(1).unwrap().abs_diff_eq(Vec3::new(3.0, 1.0, 0.0), 1e-6));

        runtime.reset_pose();
        assert!(runtime.world_translation(1).unwrap().abs_diff_eq(Vec3::new(0.0, 1.0, 0.0), 1e-6));
    }

    #[test]
    fn test_lookup_errors() {
        init_logger();
        let runtime = BoneGraphRuntime::with_config(&root_and_child(), RuntimeConfig::default());
        assert_eq!(runtime.bone_index("センター"), Ok(1));
        assert_eq!(
            runtime.world_matrix(7),
            Err(SkeletonError::BoneIndexOutOfRange { index: 7, count: 2 })
        );
        assert_eq!(
            runtime.world_matrix_by_name("missing"),
            Err(SkeletonError::UnknownBoneName("missing".to_string()))
        );
    }

    #[test]
    fn test_invalid_ik_target_drops_solver() {
        init_logger();
        let mut metadata = leg_with_ik(Vec3::X);
        if let Some(ik) = metadata[4].ik.as_mut() {
            ik.target_index = 40;
        }
        let mut diagnostics = CollectDiagnostics::new();
        let runtime = BoneGraphRuntime::build(&metadata, RuntimeConfig::default(), &mut diagnostics);

        assert!(runtime.ik_solvers().is_empty());
        assert!(runtime.bone(4).unwrap().ik_solver.is_none());
        assert!(!runtime.bone(2).unwrap().is_ik_link());
        assert_eq!(
            diagnostics.events,
            vec![BuildDiagnostic::InvalidIkTarget { bone: 4, target: 40 }]
        );
    }
}
