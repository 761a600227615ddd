//! 通用常量.

/// 默认允许的最大重采样畸变. 超过该值时拒绝缩放.
///
/// 畸变定义为 `(max(scale) - min(scale)) / min(scale)`.
pub const DEFAULT_MAX_DISTORTION: f64 = 0.3;

/// 导出时单个器官掩码的最少体素数. 少于该值的掩码被视为噪声.
pub const MIN_EXPORT_VOXELS: usize = 5;

/// DICOM RTSTRUCT ROI 名称的最大长度.
pub const DICOM_NAME_MAX_LEN: usize = 32;

/// 手动构建体积时, 至少需要的有效切片数.
pub const MIN_MANUAL_SLICES: usize = 10;

/// 无法从切片几何信息推导层间距时使用的默认值, 单位为毫米.
pub const FALLBACK_SLICE_SPACING_MM: f64 = 5.0;

/// 高斯平滑后的二值化阈值.
pub const SMOOTH_THRESHOLD: f64 = 0.5;

/// 高斯核截断半径 (以 sigma 为单位).
pub const GAUSSIAN_TRUNCATE: f64 = 4.0;

/// 器官名称.
pub mod organ {
    /// 派生结构: 全身.
    pub const BODY: &str = "body";

    /// 皮肤 (body 的薄壳).
    pub const SKIN: &str = "skin";

    /// 躯干部分.
    pub const BODY_TRUNC: &str = "body_trunc";

    /// 四肢部分.
    pub const BODY_EXTREMITIES: &str = "body_extremities";

    /// body 家族的全部名称 (含别名).
    pub const BODY_FAMILY: [&str; 4] = [BODY, BODY_TRUNC, BODY_EXTREMITIES, SKIN];

    /// 融合后的左肺.
    pub const LUNG_LEFT: &str = "lung_left";

    /// 融合后的右肺.
    pub const LUNG_RIGHT: &str = "lung_right";

    /// 左肺叶.
    pub const LEFT_LOBES: [&str; 2] = ["lung_upper_lobe_left", "lung_lower_lobe_left"];

    /// 右肺叶.
    pub const RIGHT_LOBES: [&str; 3] = [
        "lung_upper_lobe_right",
        "lung_middle_lobe_right",
        "lung_lower_lobe_right",
    ];

    /// 融合结构对应的肺叶.
    pub fn lobes_of(name: &str) -> Option<&'static [&'static str]> {
        match name {
            LUNG_LEFT => Some(&LEFT_LOBES),
            LUNG_RIGHT => Some(&RIGHT_LOBES),
            _ => None,
        }
    }

    /// `name` 是否属于 body 家族?
    #[inline]
    pub fn is_body_family(name: &str) -> bool {
        BODY_FAMILY.contains(&name)
    }
}

/// ICRU 推荐显示颜色. 匹配方式为 "名称包含关键字" (忽略大小写).
pub const ICRU_COLORS: [(&str, [u8; 3]); 13] = [
    ("spleen", [255, 0, 0]),
    ("kidney_right", [0, 255, 0]),
    ("kidney_left", [0, 200, 0]),
    ("gallbladder", [255, 255, 0]),
    ("esophagus", [255, 0, 255]),
    ("liver", [0, 255, 255]),
    ("stomach", [255, 128, 0]),
    ("aorta", [255, 0, 128]),
    ("inferior_vena_cava", [128, 0, 255]),
    ("portal_vein_and_splenic_vein", [0, 128, 255]),
    ("pancreas", [128, 255, 0]),
    ("adrenal_gland_right", [255, 0, 64]),
    ("adrenal_gland_left", [255, 0, 192]),
];
