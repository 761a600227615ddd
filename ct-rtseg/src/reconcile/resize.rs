//! 有界最近邻重采样.

use std::fmt;

use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma};
use ndarray::{Array2, Array3, Axis, Zip};

use crate::error::ReconciliationError;
use crate::Shape3d;

/// 可被重采样的标签元素.
pub trait Label: Copy + Default + PartialEq + Send + Sync + 'static {
    /// 转换为 `u16` 标签.
    fn to_u16(self) -> u16;

    /// 从 `u16` 标签转换. 超出范围的值被截断.
    fn from_u16(v: u16) -> Self;

    /// 是否为背景.
    #[inline]
    fn is_background(self) -> bool {
        self == Self::default()
    }
}

impl Label for bool {
    #[inline]
    fn to_u16(self) -> u16 {
        u16::from(self)
    }

    #[inline]
    fn from_u16(v: u16) -> Self {
        v != 0
    }
}

impl Label for u8 {
    #[inline]
    fn to_u16(self) -> u16 {
        u16::from(self)
    }

    #[inline]
    fn from_u16(v: u16) -> Self {
        v.min(u16::from(u8::MAX)) as u8
    }
}

impl Label for u16 {
    #[inline]
    fn to_u16(self) -> u16 {
        self
    }

    #[inline]
    fn from_u16(v: u16) -> Self {
        v
    }
}

/// 重采样后端. 按声明顺序尝试, 第一个得到精确目标形状的胜出.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ResizeBackend {
    /// 零阶缩放 (端点对齐, 四舍五入取最近索引).
    Zoom,

    /// 先沿层方向取最近层, 再用 `image` 对每个横断面做最近邻缩放.
    ImageResize,

    /// 等距索引表直接取值.
    Gather,
}

impl ResizeBackend {
    /// 所有后端, 按尝试顺序排列.
    pub const ORDER: [ResizeBackend; 3] = [
        ResizeBackend::Zoom,
        ResizeBackend::ImageResize,
        ResizeBackend::Gather,
    ];

    /// 后端名称.
    pub const fn name(&self) -> &'static str {
        match self {
            ResizeBackend::Zoom => "zoom",
            ResizeBackend::ImageResize => "image_resize",
            ResizeBackend::Gather => "gather",
        }
    }

    /// 用该后端重采样.
    pub fn resize<T: Label>(&self, data: &Array3<T>, to: Shape3d) -> Result<Array3<T>, String> {
        match self {
            ResizeBackend::Zoom => Ok(zoom(data, to)),
            ResizeBackend::ImageResize => image_resize(data, to),
            ResizeBackend::Gather => Ok(gather(data, to)),
        }
    }
}

impl fmt::Display for ResizeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// 缩放畸变: `(max(scale) - min(scale)) / min(scale)`, 其中 `scale[i] = to[i] / from[i]`.
///
/// 有长度为 0 的轴时返回 `Err(Degenerate)`.
pub fn distortion(from: Shape3d, to: Shape3d) -> Result<f64, ReconciliationError> {
    let f = [from.0, from.1, from.2];
    let t = [to.0, to.1, to.2];
    if f.contains(&0) {
        return Err(ReconciliationError::Degenerate(from));
    }
    if t.contains(&0) {
        return Err(ReconciliationError::Degenerate(to));
    }
    let scales: Vec<f64> = f.iter().zip(t).map(|(a, b)| b as f64 / *a as f64).collect();
    let min = scales.iter().copied().fold(f64::INFINITY, f64::min);
    let max = scales.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Ok((max - min).abs() / min)
}

/// 有界缩放: 畸变超过 `ceiling` 时拒绝, 否则依次尝试各后端.
///
/// 拒绝或失败时不会产生任何输出, 调用方的数组保持原样.
pub fn smart_resize<T: Label>(
    data: &Array3<T>,
    to: Shape3d,
    ceiling: f64,
) -> Result<(Array3<T>, ResizeBackend), ReconciliationError> {
    let from = data.dim();
    let d = distortion(from, to)?;
    if d > ceiling {
        return Err(ReconciliationError::ExcessiveDistortion {
            from,
            to,
            distortion: d,
            ceiling,
        });
    }

    let mut reasons = vec![];
    for backend in ResizeBackend::ORDER {
        match backend.resize(data, to) {
            Ok(out) if out.dim() == to => {
                tracing::debug!(%backend, ?from, ?to, "resize succeeded");
                return Ok((out, backend));
            }
            Ok(out) => reasons.push(format!("{backend}: produced {:?}", out.dim())),
            Err(e) => reasons.push(format!("{backend}: {e}")),
        }
        tracing::debug!(%backend, reason = reasons.last().map(String::as_str), "resize backend failed");
    }
    Err(ReconciliationError::Exhausted { from, to, reasons })
}

/// 端点对齐的零阶映射: 输出索引 `o` 取输入 `floor(o * (n - 1) / (m - 1) + 0.5)`.
fn zoom_index(n_in: usize, n_out: usize) -> Vec<usize> {
    if n_out <= 1 {
        return vec![0; n_out];
    }
    let step = (n_in - 1) as f64 / (n_out - 1) as f64;
    (0..n_out)
        .map(|o| ((o as f64 * step + 0.5).floor() as usize).min(n_in - 1))
        .collect()
}

/// `linspace(0, n - 1, m)` 并按 "四舍六入五成双" 取整.
fn linspace_index(n_in: usize, n_out: usize) -> Vec<usize> {
    if n_out <= 1 {
        return vec![0; n_out];
    }
    let step = (n_in - 1) as f64 / (n_out - 1) as f64;
    (0..n_out)
        .map(|o| (round_half_even(o as f64 * step) as usize).min(n_in - 1))
        .collect()
}

#[inline]
fn round_half_even(v: f64) -> f64 {
    let r = v.round();
    if (v - v.trunc()).abs() == 0.5 && r % 2.0 != 0.0 {
        r - v.signum()
    } else {
        r
    }
}

/// 按三个轴的索引表取值.
fn take<T: Label>(data: &Array3<T>, iz: &[usize], iy: &[usize], ix: &[usize]) -> Array3<T> {
    Array3::from_shape_fn((iz.len(), iy.len(), ix.len()), |(z, y, x)| {
        data[(iz[z], iy[y], ix[x])]
    })
}

/// 零阶缩放. 各标签互不重叠, 每个输出体素直接取最近输入体素的标签.
fn zoom<T: Label>(data: &Array3<T>, to: Shape3d) -> Array3<T> {
    let (d, h, w) = data.dim();
    let (iz, iy, ix) = (zoom_index(d, to.0), zoom_index(h, to.1), zoom_index(w, to.2));
    let mut out = Array3::<T>::default(to);
    let zip = Zip::indexed(&mut out);

    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            zip.par_for_each(|(z, y, x), o| *o = data[(iz[z], iy[y], ix[x])]);
        } else {
            zip.for_each(|(z, y, x), o| *o = data[(iz[z], iy[y], ix[x])]);
        }
    }
    out
}

/// 沿层方向最近邻取层, 再用 `image` 的最近邻滤波缩放每个横断面.
fn image_resize<T: Label>(data: &Array3<T>, to: Shape3d) -> Result<Array3<T>, String> {
    let (d, h, w) = data.dim();
    let (nh, nw) = (
        u32::try_from(to.1).map_err(|e| e.to_string())?,
        u32::try_from(to.2).map_err(|e| e.to_string())?,
    );
    let (sh, sw) = (
        u32::try_from(h).map_err(|e| e.to_string())?,
        u32::try_from(w).map_err(|e| e.to_string())?,
    );
    let iz = zoom_index(d, to.0);

    let mut out = Array3::<T>::default(to);
    for (z_out, z_in) in iz.into_iter().enumerate() {
        let sli = data.index_axis(Axis(0), z_in);
        let raw: Vec<u16> = sli.iter().map(|v| v.to_u16()).collect();
        let img: ImageBuffer<Luma<u16>, Vec<u16>> = ImageBuffer::from_raw(sw, sh, raw)
            .ok_or_else(|| format!("slice buffer does not match {w}x{h}"))?;
        let resized = imageops::resize(&img, nw, nh, FilterType::Nearest);
        let plane = Array2::from_shape_vec((to.1, to.2), resized.into_raw())
            .map_err(|e| e.to_string())?;
        out.index_axis_mut(Axis(0), z_out)
            .assign(&plane.mapv(T::from_u16));
    }
    Ok(out)
}

/// 等距索引表取值.
fn gather<T: Label>(data: &Array3<T>, to: Shape3d) -> Array3<T> {
    let (d, h, w) = data.dim();
    take(
        data,
        &linspace_index(d, to.0),
        &linspace_index(h, to.1),
        &linspace_index(w, to.2),
    )
}
