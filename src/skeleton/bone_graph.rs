//! 骨骼图
//!
//! 核心设计：
//! - 节点存放在连续数组中，父子关系用索引表示（arena + index）
//! - 世界矩阵存放在独立的连续缓冲区，供蒙皮阶段一次性读取
//! - 世界矩阵传播使用显式栈的深度优先遍历，栈在多次调用间复用

use std::collections::HashMap;

use glam::{Mat4, Vec3};

use super::append_solver::{AppendTransformConfig, AppendTransformSolver};
use super::bone_node::{BoneFlags, BoneNode, LocalPose};
use super::diagnostics::BuildDiagnostics;
use super::metadata::BoneMetadata;

// ============================================================================
// 更新阶段
// ============================================================================

/// 每帧两阶段更新中的阶段
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UpdatePhase {
    /// 物理步进之前（不含物理后变形骨骼）
    BeforePhysics,
    /// 物理步进之后（仅物理后变形骨骼）
    AfterPhysics,
}

impl UpdatePhase {
    #[inline]
    pub fn is_after_physics(self) -> bool {
        matches!(self, UpdatePhase::AfterPhysics)
    }

    /// 骨骼是否属于本阶段
    #[inline]
    pub fn contains(self, bone: &BoneNode) -> bool {
        bone.transform_after_physics() == self.is_after_physics()
    }

    /// 世界矩阵传播是否进入该子骨骼
    ///
    /// 物理前阶段不触碰物理后变形骨骼；物理后阶段需要把结果带给所有后代。
    #[inline]
    fn descends_into(self, child: &BoneNode) -> bool {
        match self {
            UpdatePhase::BeforePhysics => !child.transform_after_physics(),
            UpdatePhase::AfterPhysics => true,
        }
    }
}

// ============================================================================
// 骨骼图
// ============================================================================

/// 骨骼图
#[derive(Clone, Debug, Default)]
pub struct BoneGraph {
    nodes: Vec<BoneNode>,
    /// 世界矩阵缓冲区，与 nodes 一一对应
    world_matrices: Vec<Mat4>,
    roots: Vec<usize>,
    name_to_index: HashMap<String, usize>,
    /// 深度优先遍历的复用栈
    stack: Vec<usize>,
}

impl BoneGraph {
    /// 从扁平骨骼记录构建骨骼图
    ///
    /// 构建永不失败：越界索引、父子环、无效付与目标都在本地丢弃并上报诊断。
    pub fn build(metadata: &[BoneMetadata], diagnostics: &mut dyn BuildDiagnostics) -> Self {
        let bone_count = metadata.len();

        let mut nodes: Vec<BoneNode> = metadata
            .iter()
            .enumerate()
            .map(|(i, meta)| {
                let mut node = BoneNode::new(i, meta.name.clone());
                node.transform_order = meta.transform_order;
                node.flags = meta.flags;
                node.pose = LocalPose::new(meta.rest_position, meta.rest_scale);
                node
            })
            .collect();

        // 1. 校验父骨骼索引
        let mut parents: Vec<Option<usize>> = Vec::with_capacity(bone_count);
        for (i, meta) in metadata.iter().enumerate() {
            let parent = meta.parent_index;
            if parent < 0 {
                if parent != -1 {
                    diagnostics.on_invalid_parent_index(i, &meta.name, parent);
                }
                parents.push(None);
            } else if parent as usize >= bone_count {
                diagnostics.on_invalid_parent_index(i, &meta.name, parent);
                parents.push(None);
            } else {
                if parent as usize >= i {
                    diagnostics.on_parent_index_not_ordered(i, &meta.name, parent as usize);
                }
                parents.push(Some(parent as usize));
            }
        }

        // 2. 环检测：沿父链回溯，回到自身则切断自身的父链接
        //    已确认能到达根骨骼的节点记为 settled，回溯遇到即停止
        let mut settled = vec![false; bone_count];
        let mut path = Vec::new();
        for i in 0..bone_count {
            if settled[i] {
                continue;
            }
            path.clear();
            let mut reaches_root = true;
            let mut current = parents[i];
            while let Some(p) = current {
                if p == i {
                    diagnostics.on_bone_loop_detected(i, &metadata[i].name);
                    parents[i] = None;
                    break;
                }
                if settled[p] {
                    break;
                }
                path.push(p);
                if path.len() > bone_count {
                    // 环不经过 i，由环上骨骼自己处理
                    reaches_root = false;
                    break;
                }
                current = parents[p];
            }
            if reaches_root {
                settled[i] = true;
                for &p in &path {
                    settled[p] = true;
                }
            }
        }

        // 3. 建立父子链接
        for (i, parent) in parents.iter().enumerate() {
            if let Some(p) = *parent {
                nodes[i].parent = Some(p);
                nodes[p].children.push(i);
            }
        }
        let roots: Vec<usize> = (0..bone_count).filter(|&i| nodes[i].parent.is_none()).collect();

        // 4. 附加变换
        for (i, meta) in metadata.iter().enumerate() {
            let affect_rotation = meta.flags.contains(BoneFlags::APPEND_ROTATE);
            let affect_position = meta.flags.contains(BoneFlags::APPEND_MOVE);
            if !affect_rotation && !affect_position {
                continue;
            }
            let Some(append) = meta.append_transform else {
                continue;
            };

            let target = append.parent_index;
            if target < 0 || target as usize >= bone_count || target as usize == i {
                diagnostics.on_invalid_append_target(i, &meta.name, target);
                continue;
            }

            nodes[i].append_solver = Some(AppendTransformSolver::new(AppendTransformConfig {
                target_bone: target as usize,
                ratio: append.ratio,
                is_local: meta.flags.contains(BoneFlags::LOCAL_APPEND_TRANSFORM),
                affect_rotation,
                affect_position,
            }));
        }

        let mut name_to_index = HashMap::with_capacity(bone_count);
        for node in &nodes {
            name_to_index.entry(node.name.clone()).or_insert(node.index);
        }

        Self {
            world_matrices: vec![Mat4::IDENTITY; bone_count],
            nodes,
            roots,
            name_to_index,
            stack: Vec::with_capacity(bone_count),
        }
    }

    // ========================================
    // 访问器
    // ========================================

    #[inline]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    #[inline]
    pub fn nodes(&self) -> &[BoneNode] {
        &self.nodes
    }

    #[inline]
    pub fn nodes_mut(&mut self) -> &mut [BoneNode] {
        &mut self.nodes
    }

    #[inline]
    pub fn node(&self, index: usize) -> Option<&BoneNode> {
        self.nodes.get(index)
    }

    #[inline]
    pub fn node_mut(&mut self, index: usize) -> Option<&mut BoneNode> {
        self.nodes.get_mut(index)
    }

    /// 根骨骼（父链接为空）
    #[inline]
    pub fn roots(&self) -> &[usize] {
        &self.roots
    }

    pub fn find_bone_by_name(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    #[inline]
    pub fn world_matrices(&self) -> &[Mat4] {
        &self.world_matrices
    }

    #[inline]
    pub fn world_matrix(&self, index: usize) -> Mat4 {
        self.world_matrices[index]
    }

    /// 世界位置
    #[inline]
    pub fn world_translation(&self, index: usize) -> Vec3 {
        self.world_matrices[index].w_axis.truncate()
    }

    // ========================================
    // 变换计算
    // ========================================

    /// 更新单个骨骼的本地矩阵
    #[inline]
    pub fn update_local_matrix(&mut self, index: usize) {
        self.nodes[index].update_local_matrix();
    }

    /// 更新附加变换偏移并重新计算本地矩阵
    pub fn update_append_transform(&mut self, index: usize) {
        AppendTransformSolver::update(&mut self.nodes, index);
        self.nodes[index].update_local_matrix();
    }

    /// 只更新单个骨骼的世界矩阵（父骨骼世界矩阵视为已更新）
    ///
    /// 物理写入的骨骼保持物理结果。
    #[inline]
    pub fn update_world_matrix_single(&mut self, index: usize) {
        let node = &self.nodes[index];
        if node.physics_override {
            return;
        }
        self.world_matrices[index] = match node.parent {
            Some(parent) => self.world_matrices[parent] * node.local_matrix,
            None => node.local_matrix,
        };
    }

    /// 从 root 开始向下传播世界矩阵（显式栈，非递归）
    ///
    /// phase 为 None 时遍历整个子树。
    pub fn update_world_matrix(&mut self, root: usize, phase: Option<UpdatePhase>) {
        let mut stack = std::mem::take(&mut self.stack);
        stack.clear();
        stack.push(root);

        while let Some(index) = stack.pop() {
            self.update_world_matrix_single(index);

            for &child in self.nodes[index].children.iter().rev() {
                if phase.map_or(true, |p| p.descends_into(&self.nodes[child])) {
                    stack.push(child);
                }
            }
        }

        self.stack = stack;
    }

    /// 沿父链自上而下刷新 index 及其全部祖先
    pub fn update_world_matrix_path(&mut self, index: usize) {
        let mut stack = std::mem::take(&mut self.stack);
        stack.clear();

        let mut current = Some(index);
        while let Some(i) = current {
            stack.push(i);
            current = self.nodes[i].parent;
        }
        while let Some(i) = stack.pop() {
            self.update_world_matrix_single(i);
        }

        self.stack = stack;
    }

    /// 只传播 index 的后代（自身矩阵保持不变）
    pub fn update_children_world_matrix(&mut self, index: usize, phase: Option<UpdatePhase>) {
        let mut stack = std::mem::take(&mut self.stack);
        stack.clear();
        stack.extend(self.nodes[index].children.iter().rev().copied());

        while let Some(current) = stack.pop() {
            if !phase.map_or(true, |p| p.descends_into(&self.nodes[current])) {
                continue;
            }
            self.update_world_matrix_single(current);
            stack.extend(self.nodes[current].children.iter().rev().copied());
        }

        self.stack = stack;
    }

    // ========================================
    // 物理写回
    // ========================================

    /// 直接写入世界矩阵并标记为物理驱动
    pub fn set_physics_world_matrix(&mut self, index: usize, matrix: Mat4) {
        self.world_matrices[index] = matrix;
        self.nodes[index].physics_override = true;
    }

    pub fn clear_physics_overrides(&mut self) {
        for node in &mut self.nodes {
            node.physics_override = false;
        }
    }

    // ========================================
    // 静止姿态
    // ========================================

    /// 回到静止姿态并重新计算全部矩阵
    pub fn reset_pose(&mut self) {
        for node in &mut self.nodes {
            node.reset_pose();
            node.physics_override = false;
            node.update_local_matrix();
        }
        for i in 0..self.roots.len() {
            let root = self.roots[i];
            self.update_world_matrix(root, None);
        }
    }

    /// 计算静止姿态并据此生成逆绑定矩阵
    pub fn initialize_rest_pose(&mut self) {
        self.reset_pose();
        for (node, world) in self.nodes.iter_mut().zip(&self.world_matrices) {
            node.inverse_bind = world.inverse();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::skeleton::diagnostics::{BuildDiagnostic, CollectDiagnostics};

    fn build(metadata: &[BoneMetadata]) -> (BoneGraph, CollectDiagnostics) {
        let mut diagnostics = CollectDiagnostics::new();
        let mut graph = BoneGraph::build(metadata, &mut diagnostics);
        graph.initialize_rest_pose();
        (graph, diagnostics)
    }

    #[test]
    fn test_child_world_translation() {
        let (graph, diagnostics) = build(&[
            BoneMetadata::new("全ての親", -1, Vec3::ZERO),
            BoneMetadata::new("センター", 0, Vec3::new(0.0, 1.0, 0.0)),
        ]);
        assert!(diagnostics.is_empty());
        assert_eq!(graph.roots(), &[0]);
        assert_eq!(graph.world_translation(1), Vec3::new(0.0, 1.0, 0.0));
    }

    #[test]
    fn test_parent_cycle_is_severed() {
        let (graph, diagnostics) = build(&[
            BoneMetadata::new("a", 2, Vec3::X),
            BoneMetadata::new("b", 0, Vec3::X),
            BoneMetadata::new("c", 1, Vec3::X),
            BoneMetadata::new("d", 3, Vec3::X),
        ]);

        assert!(diagnostics.events.contains(&BuildDiagnostic::BoneLoop { bone: 0 }));
        assert!(diagnostics.events.contains(&BuildDiagnostic::BoneLoop { bone: 3 }));
        assert_eq!(graph.roots(), &[0, 3]);
        assert_eq!(graph.node(1).unwrap().parent, Some(0));
        assert_eq!(graph.node(2).unwrap().parent, Some(1));

        // 切断后沿父链必然到达根骨骼
        for start in 0..graph.len() {
            let mut current = Some(start);
            let mut steps = 0;
            while let Some(i) = current {
                current = graph.node(i).unwrap().parent;
                steps += 1;
                assert!(steps <= graph.len());
            }
        }
        assert!(graph.world_translation(2).abs_diff_eq(Vec3::new(3.0, 0.0, 0.0), 1e-6));
    }

    #[test]
    fn test_invalid_parent_becomes_root() {
        let (graph, diagnostics) = build(&[
            BoneMetadata::new("root", -1, Vec3::ZERO),
            BoneMetadata::new("lost", 7, Vec3::Y),
            BoneMetadata::new("negative", -3, Vec3::Y),
        ]);
        assert_eq!(graph.roots(), &[0, 1, 2]);
        assert!(diagnostics
            .events
            .contains(&BuildDiagnostic::InvalidParentIndex { bone: 1, parent: 7 }));
        assert!(diagnostics
            .events
            .contains(&BuildDiagnostic::InvalidParentIndex { bone: 2, parent: -3 }));
    }

    #[test]
    fn test_forward_parent_reference_warns_but_links() {
        let (graph, diagnostics) = build(&[
            BoneMetadata::new("child", 1, Vec3::Y),
            BoneMetadata::new("parent", -1, Vec3::X),
        ]);
        assert_eq!(
            diagnostics.events,
            vec![BuildDiagnostic::ParentIndexNotOrdered { bone: 0, parent: 1 }]
        );
        assert_eq!(graph.node(0).unwrap().parent, Some(1));
        assert!(graph.world_translation(0).abs_diff_eq(Vec3::new(1.0, 1.0, 0.0), 1e-6));
    }

    #[test]
    fn test_invalid_append_target_is_dropped() {
        let (graph, diagnostics) = build(&[
            BoneMetadata::new("a", -1, Vec3::ZERO).with_append(5, 1.0, BoneFlags::APPEND_ROTATE),
            BoneMetadata::new("b", 0, Vec3::ZERO).with_append(1, 1.0, BoneFlags::APPEND_MOVE),
            BoneMetadata::new("c", 0, Vec3::ZERO).with_append(0, 0.5, BoneFlags::APPEND_ROTATE),
        ]);
        assert!(graph.node(0).unwrap().append_solver.is_none());
        assert!(graph.node(1).unwrap().append_solver.is_none());
        assert!(graph.node(2).unwrap().append_solver.is_some());
        assert_eq!(diagnostics.events.len(), 2);
    }

    #[test]
    fn test_deep_chain_does_not_recurse() {
        let depth = 50_000;
        let metadata: Vec<BoneMetadata> = (0..depth)
            .map(|i| BoneMetadata::new(format!("bone{i}"), i as i32 - 1, Vec3::Y))
            .collect();
        let (graph, _) = build(&metadata);
        let tip = graph.world_translation(depth - 1);
        assert!((tip.y - depth as f32).abs() < 1.0);
    }

    #[test]
    fn test_inverse_bind_cancels_rest_pose() {
        let (graph, _) = build(&[
            BoneMetadata::new("root", -1, Vec3::new(0.0, 10.0, 0.0)),
            BoneMetadata::new("arm", 0, Vec3::new(2.0, 0.0, 0.0)),
        ]);
        for (node, world) in graph.nodes().iter().zip(graph.world_matrices()) {
            assert!((*world * node.inverse_bind).abs_diff_eq(Mat4::IDENTITY, 1e-5));
        }
    }
}
