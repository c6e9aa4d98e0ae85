//! 骨骼图构建诊断
//!
//! 构建阶段遇到的结构错误都在本地恢复（丢弃出错的链接或功能），
//! 并通过 BuildDiagnostics 回调通知调用方。默认实现写日志。

/// 构建诊断回调
pub trait BuildDiagnostics {
    /// 父子关系成环，bone 的父链接已被切断
    fn on_bone_loop_detected(&mut self, bone: usize, name: &str) {
        log::warn!("骨骼 '{}'({}) 的父链接构成环，已切断为根骨骼", name, bone);
    }

    /// 父骨骼索引不小于自身索引（违反建模约定，仍然生效）
    fn on_parent_index_not_ordered(&mut self, bone: usize, name: &str, parent: usize) {
        log::warn!("骨骼 '{}'({}) 的父骨骼索引 {} 不小于自身索引", name, bone, parent);
    }

    /// 父骨骼索引越界，视为根骨骼
    fn on_invalid_parent_index(&mut self, bone: usize, name: &str, parent: i32) {
        log::error!("骨骼 '{}'({}) 的父骨骼索引 {} 越界，视为根骨骼", name, bone, parent);
    }

    /// 付与目标越界或指向自身，附加变换被丢弃
    fn on_invalid_append_target(&mut self, bone: usize, name: &str, target: i32) {
        log::error!("骨骼 '{}'({}) 的付与目标 {} 无效，已忽略附加变换", name, bone, target);
    }

    /// IK 目标骨骼越界，IK 求解器被丢弃
    fn on_invalid_ik_target(&mut self, bone: usize, name: &str, target: i32) {
        log::error!("骨骼 '{}'({}) 的 IK 目标 {} 越界，已忽略 IK", name, bone, target);
    }

    /// IK 链接骨骼越界，该链接被丢弃
    fn on_invalid_ik_link(&mut self, bone: usize, name: &str, link: i32) {
        log::error!("骨骼 '{}'({}) 的 IK 链接 {} 越界，已忽略该链接", name, bone, link);
    }
}

/// 只写日志的诊断实现
#[derive(Clone, Copy, Debug, Default)]
pub struct LogDiagnostics;

impl BuildDiagnostics for LogDiagnostics {}

/// 诊断事件
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BuildDiagnostic {
    BoneLoop { bone: usize },
    ParentIndexNotOrdered { bone: usize, parent: usize },
    InvalidParentIndex { bone: usize, parent: i32 },
    InvalidAppendTarget { bone: usize, target: i32 },
    InvalidIkTarget { bone: usize, target: i32 },
    InvalidIkLink { bone: usize, link: i32 },
}

/// 收集诊断事件（同时写日志）
#[derive(Clone, Debug, Default)]
pub struct CollectDiagnostics {
    pub events: Vec<BuildDiagnostic>,
}

impl CollectDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

impl BuildDiagnostics for CollectDiagnostics {
    fn on_bone_loop_detected(&mut self, bone: usize, name: &str) {
        LogDiagnostics.on_bone_loop_detected(bone, name);
        self.events.push(BuildDiagnostic::BoneLoop { bone });
    }

    fn on_parent_index_not_ordered(&mut self, bone: usize, name: &str, parent: usize) {
        LogDiagnostics.on_parent_index_not_ordered(bone, name, parent);
        self.events.push(BuildDiagnostic::ParentIndexNotOrdered { bone, parent });
    }

    fn on_invalid_parent_index(&mut self, bone: usize, name: &str, parent: i32) {
        LogDiagnostics.on_invalid_parent_index(bone, name, parent);
        self.events.push(BuildDiagnostic::InvalidParentIndex { bone, parent });
    }

    fn on_invalid_append_target(&mut self, bone: usize, name: &str, target: i32) {
        LogDiagnostics.on_invalid_append_target(bone, name, target);
        self.events.push(BuildDiagnostic::InvalidAppendTarget { bone, target });
    }

    fn on_invalid_ik_target(&mut self, bone: usize, name: &str, target: i32) {
        LogDiagnostics.on_invalid_ik_target(bone, name, target);
        self.events.push(BuildDiagnostic::InvalidIkTarget { bone, target });
    }

    fn on_invalid_ik_link(&mut self, bone: usize, name: &str, link: i32) {
        LogDiagnostics.on_invalid_ik_link(bone, name, link);
        self.events.push(BuildDiagnostic::InvalidIkLink { bone, link });
    }
}
