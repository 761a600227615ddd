//! 掩码平滑.

use ndarray::{Array3, ArrayView1, ArrayViewMut1, Axis, Zip};
use serde::{Deserialize, Serialize};

use super::{closing, opening, Connectivity};
use crate::consts::{GAUSSIAN_TRUNCATE, SMOOTH_THRESHOLD};
use crate::provider::Spacing;

/// 平滑方法.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SmoothMethod {
    /// 考虑体素间距的高斯滤波, 之后以 0.5 为阈值二值化.
    #[default]
    Gaussian,

    /// 先闭运算后开运算.
    Morphological,
}

/// 平滑参数.
#[derive(Copy, Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SmoothOptions {
    /// 方法.
    pub method: SmoothMethod,

    /// 平滑尺度, 单位为毫米.
    pub sigma_mm: f64,
}

impl Default for SmoothOptions {
    fn default() -> Self {
        Self {
            method: SmoothMethod::Gaussian,
            sigma_mm: 1.0,
        }
    }
}

/// 按 `opts` 平滑掩码.
///
/// 参数无效 (sigma 非正或间距非法) 时返回原掩码的副本.
pub fn smooth_mask(mask: &Array3<bool>, spacing: &Spacing, opts: &SmoothOptions) -> Array3<bool> {
    if !(opts.sigma_mm > 0.0) || !spacing.is_valid() {
        tracing::debug!(sigma_mm = opts.sigma_mm, ?spacing, "smoothing skipped, invalid parameters");
        return mask.clone();
    }
    match opts.method {
        SmoothMethod::Gaussian => gaussian_smooth(mask, spacing, opts.sigma_mm),
        SmoothMethod::Morphological => morph_smooth(mask, spacing, opts.sigma_mm),
    }
}

/// 形态学平滑: 闭运算后开运算, 迭代次数为 `round(sigma_mm / min(spacing))`, 至少为 1.
pub fn morph_smooth(mask: &Array3<bool>, spacing: &Spacing, sigma_mm: f64) -> Array3<bool> {
    let iterations = ((sigma_mm / spacing.min()).round() as usize).max(1);
    let closed = closing(mask, Connectivity::Face6, iterations);
    opening(&closed, Connectivity::Face6, iterations)
}

/// 高斯平滑. 每个轴的 sigma 为 `sigma_mm / spacing[axis]` (体素),
/// 边界按镜像反射处理, 结果大于 0.5 的体素为前景.
pub fn gaussian_smooth(mask: &Array3<bool>, spacing: &Spacing, sigma_mm: f64) -> Array3<bool> {
    let mut field = mask.mapv(|p| if p { 1.0f32 } else { 0.0 });
    for (axis, mm) in spacing.as_array().into_iter().enumerate() {
        let kernel = gaussian_kernel(sigma_mm / mm);
        if kernel.len() <= 1 {
            continue;
        }
        field = convolve_axis(&field, Axis(axis), &kernel);
    }
    field.mapv(|v| f64::from(v) > SMOOTH_THRESHOLD)
}

/// 归一化的一维高斯核, 半径为 `int(truncate * sigma + 0.5)`.
fn gaussian_kernel(sigma: f64) -> Vec<f32> {
    if !(sigma > 0.0) || !sigma.is_finite() {
        return vec![1.0];
    }
    let radius = (GAUSSIAN_TRUNCATE * sigma + 0.5) as isize;
    let weights: Vec<f64> = (-radius..=radius)
        .map(|i| (-0.5 * (i as f64 / sigma).powi(2)).exp())
        .collect();
    let sum: f64 = weights.iter().sum();
    weights.into_iter().map(|w| (w / sum) as f32).collect()
}

/// 反射边界下的索引: `d c b a | a b c d | d c b a`.
#[inline]
fn reflect(i: isize, n: usize) -> usize {
    let n = n as isize;
    let period = 2 * n;
    let mut i = i.rem_euclid(period);
    if i >= n {
        i = period - 1 - i;
    }
    i as usize
}

fn convolve_lane(src: ArrayView1<f32>, mut dst: ArrayViewMut1<f32>, kernel: &[f32]) {
    let n = src.len();
    let radius = (kernel.len() / 2) as isize;
    for (i, out) in dst.iter_mut().enumerate() {
        *out = kernel
            .iter()
            .enumerate()
            .map(|(k, w)| w * src[reflect(i as isize + k as isize - radius, n)])
            .sum();
    }
}

/// 沿 `axis` 做一维卷积.
fn convolve_axis(field: &Array3<f32>, axis: Axis, kernel: &[f32]) -> Array3<f32> {
    let mut out = Array3::<f32>::zeros(field.dim());
    let zip = Zip::from(out.lanes_mut(axis)).and(field.lanes(axis));
    cfg_if::cfg_if! {
        if #[cfg(feature = "rayon")] {
            zip.par_for_each(|dst, src| convolve_lane(src, dst, kernel));
        } else {
            zip.for_each(|dst, src| convolve_lane(src, dst, kernel));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn count(a: &Array3<bool>) -> usize {
        a.iter().filter(|&&p| p).count()
    }

    fn cube(n: usize, lo: usize, hi: usize) -> Array3<bool> {
        Array3::from_shape_fn((n, n, n), |(z, y, x)| {
            (lo..hi).contains(&z) && (lo..hi).contains(&y) && (lo..hi).contains(&x)
        })
    }

    #[test]
    fn test_reflect() {
        assert_eq!(reflect(-1, 4), 0);
        assert_eq!(reflect(-2, 4), 1);
        assert_eq!(reflect(4, 4), 3);
        assert_eq!(reflect(5, 4), 2);
        assert_eq!(reflect(2, 4), 2);
    }

    #[test]
    fn test_kernel_normalized() {
        let k = gaussian_kernel(1.0);
        assert_eq!(k.len(), 9);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(k[4] > k[3] && k[3] > k[2]);
        assert_eq!(gaussian_kernel(0.0), vec![1.0]);
    }

    #[test]
    fn test_gaussian_removes_speck_keeps_block() {
        let mut m = cube(16, 4, 12);
        m[(1, 1, 1)] = true;
        let s = gaussian_smooth(&m, &Spacing::isotropic(1.0), 1.0);
        assert!(!s[(1, 1, 1)]);
        assert!(s[(8, 8, 8)]);
        // 棱角被削去, 总体积不会增加太多.
        assert!(!s[(4, 4, 4)]);
        assert!(count(&s) <= count(&m));
    }

    #[test]
    fn test_morph_smooth_iterations() {
        let mut m = cube(12, 3, 9);
        m[(0, 0, 0)] = true;
        let s = morph_smooth(&m, &Spacing::new(2.0, 0.5, 0.5), 0.2);
        // 至少迭代一次: 孤立体素被开运算去除.
        assert!(!s[(0, 0, 0)]);
        assert!(s[(6, 6, 6)]);
    }

    #[test]
    fn test_invalid_params_unchanged() {
        let m = cube(6, 1, 5);
        let opts = SmoothOptions {
            method: SmoothMethod::Gaussian,
            sigma_mm: -1.0,
        };
        assert_eq!(smooth_mask(&m, &Spacing::default(), &opts), m);
        let opts = SmoothOptions::default();
        assert_eq!(smooth_mask(&m, &Spacing::new(0.0, 1.0, 1.0), &opts), m);
    }
}
