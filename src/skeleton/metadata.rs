//! 骨骼构建元数据
//!
//! 模型解析器产出的扁平骨骼记录。索引使用 i32，-1 表示“无”，
//! 与 PMX 的约定保持一致；越界值在构建时诊断并丢弃。

use glam::Vec3;

use super::bone_node::BoneFlags;

/// 附加变换元数据
#[derive(Clone, Copy, Debug)]
pub struct AppendTransformMetadata {
    /// 付与目标骨骼索引
    pub parent_index: i32,
    /// 付与比率
    pub ratio: f32,
}

/// IK 链接元数据
#[derive(Clone, Copy, Debug)]
pub struct IkLinkMetadata {
    /// 链接骨骼索引
    pub bone_index: i32,
    /// 角度限制 (min, max)，弧度
    pub limits: Option<(Vec3, Vec3)>,
}

/// IK 元数据
#[derive(Clone, Debug)]
pub struct IkMetadata {
    /// 目标骨骼索引（链末端，被带向 IK 骨骼位置）
    pub target_index: i32,
    /// 迭代次数
    pub iteration: u32,
    /// 单次迭代角度限制（弧度）
    pub limit_angle: f32,
    /// 链接列表（从末端向根）
    pub links: Vec<IkLinkMetadata>,
}

/// 骨骼元数据
#[derive(Clone, Debug)]
pub struct BoneMetadata {
    pub name: String,
    /// 父骨骼索引 (-1 表示根骨骼)
    pub parent_index: i32,
    /// 变换顺序
    pub transform_order: i32,
    pub flags: BoneFlags,
    /// 静止本地位置（相对父骨骼）
    pub rest_position: Vec3,
    /// 静止缩放
    pub rest_scale: Vec3,
    pub append_transform: Option<AppendTransformMetadata>,
    pub ik: Option<IkMetadata>,
}

impl BoneMetadata {
    /// 创建无附加变换、无 IK 的骨骼记录
    pub fn new(name: impl Into<String>, parent_index: i32, rest_position: Vec3) -> Self {
        Self {
            name: name.into(),
            parent_index,
            transform_order: 0,
            flags: BoneFlags::ROTATABLE | BoneFlags::VISIBLE,
            rest_position,
            rest_scale: Vec3::ONE,
            append_transform: None,
            ik: None,
        }
    }

    pub fn with_transform_order(mut self, transform_order: i32) -> Self {
        self.transform_order = transform_order;
        self
    }

    pub fn with_flags(mut self, flags: BoneFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// 附加变换，标志位决定影响旋转/平移/本地
    pub fn with_append(mut self, parent_index: i32, ratio: f32, flags: BoneFlags) -> Self {
        self.flags |= flags;
        self.append_transform = Some(AppendTransformMetadata { parent_index, ratio });
        self
    }

    pub fn with_ik(mut self, ik: IkMetadata) -> Self {
        self.flags |= BoneFlags::IK;
        self.ik = Some(ik);
        self
    }
}
