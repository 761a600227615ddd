//! 手动体积构建.
//!
//! 标准 DICOM 读取器无法处理某个序列时, 直接从逐层像素和几何标签拼出体积,
//! 并重建体素到患者坐标的仿射矩阵. 构建结果可以写成 nifti 交给基于文件的推理服务,
//! 推理输出再通过 [`ManualVolume::conform`] 对齐回本体积.

use std::path::Path;

use ndarray::{Array2, Array3, Axis};
use nifti::writer::WriterOptions;
use nifti::NiftiHeader;

use crate::consts::{DEFAULT_MAX_DISTORTION, FALLBACK_SLICE_SPACING_MM, MIN_MANUAL_SLICES};
use crate::error::{ReconciliationError, VolumeError};
use crate::provider::Spacing;
use crate::reconcile::{Label, Reconciler};
use crate::Shape3d;

/// 单层切片的像素与几何标签. 由 DICOM 协作方填充.
#[derive(Clone, Debug, Default)]
pub struct SliceRecord {
    /// 原始像素, `(rows, cols)`. 缺失时该层被跳过.
    pub pixels: Option<Array2<i16>>,

    /// RescaleSlope, 默认 1.
    pub rescale_slope: Option<f64>,

    /// RescaleIntercept, 默认 0.
    pub rescale_intercept: Option<f64>,

    /// PixelSpacing `[行间距, 列间距]`, 毫米.
    pub pixel_spacing: Option<[f64; 2]>,

    /// SliceThickness, 毫米.
    pub slice_thickness: Option<f64>,

    /// ImagePositionPatient.
    pub image_position: Option<[f64; 3]>,

    /// ImageOrientationPatient, 前三个分量为行方向, 后三个为列方向.
    pub image_orientation: Option<[f64; 6]>,
}

/// 手动构建的 CT 体积.
#[derive(Clone, Debug)]
pub struct ManualVolume {
    /// HU 值, 按 `(z, y, x)` 组织.
    hu: Array3<f32>,

    /// 体素索引 `(x, y, z, 1)` 到患者坐标 (DICOM LPS) 的仿射矩阵.
    affine: [[f64; 4]; 4],

    spacing: Spacing,
}

#[inline]
fn cross(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

#[inline]
fn distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    a.iter()
        .zip(b)
        .map(|(p, q)| (p - q).powi(2))
        .sum::<f64>()
        .sqrt()
}

/// 层间距: SliceThickness, 否则首末层位置距离除以 `(n - 1)`, 否则默认值.
fn slice_spacing(first: &SliceRecord, last: &SliceRecord, n: usize) -> f64 {
    if let Some(t) = first.slice_thickness.filter(|t| t.is_finite() && *t > 0.0) {
        return t;
    }
    if let (Some(a), Some(b)) = (first.image_position, last.image_position) {
        let d = distance(a, b) / n.saturating_sub(1).max(1) as f64;
        if d.is_finite() && d > 0.0 {
            tracing::debug!(spacing = d, "slice spacing derived from image positions");
            return d;
        }
    }
    tracing::warn!(
        spacing = FALLBACK_SLICE_SPACING_MM,
        "slice spacing unavailable, using default"
    );
    FALLBACK_SLICE_SPACING_MM
}

impl ManualVolume {
    /// 从有序切片构建体积.
    ///
    /// 没有像素数据的切片被跳过; 剩余切片少于 10 层时返回 `Err`.
    /// 几何信息取自第一个有效切片, 层间距见 [`slice_spacing`].
    pub fn build(slices: &[SliceRecord]) -> Result<Self, VolumeError> {
        tracing::info!(slices = slices.len(), "building volume manually");
        let good: Vec<(&SliceRecord, &Array2<i16>)> = slices
            .iter()
            .enumerate()
            .filter_map(|(i, s)| match &s.pixels {
                Some(p) => Some((s, p)),
                None => {
                    tracing::warn!(slice = i + 1, total = slices.len(), "slice has no pixel data, skipping");
                    None
                }
            })
            .collect();
        if good.len() < MIN_MANUAL_SLICES {
            return Err(VolumeError::TooFewSlices {
                good: good.len(),
                required: MIN_MANUAL_SLICES,
            });
        }

        let (first, first_px) = good[0];
        let (last, _) = good[good.len() - 1];
        let (rows, cols) = first_px.dim();

        let mut hu = Array3::<f32>::zeros((good.len(), rows, cols));
        for (i, ((rec, px), mut plane)) in good.iter().zip(hu.axis_iter_mut(Axis(0))).enumerate() {
            if px.dim() != (rows, cols) {
                return Err(VolumeError::InconsistentSlice {
                    index: i,
                    found: px.dim(),
                    expected: (rows, cols),
                });
            }
            let slope = rec.rescale_slope.unwrap_or(1.0);
            let intercept = rec.rescale_intercept.unwrap_or(0.0);
            plane.zip_mut_with(*px, |h, &p| *h = (f64::from(p) * slope + intercept) as f32);
        }

        let [ps_row, ps_col] = first
            .pixel_spacing
            .ok_or(VolumeError::MissingTag("PixelSpacing"))?;
        let orient = first
            .image_orientation
            .ok_or(VolumeError::MissingTag("ImageOrientationPatient"))?;
        let origin = first
            .image_position
            .ok_or(VolumeError::MissingTag("ImagePositionPatient"))?;
        let thickness = slice_spacing(first, last, good.len());

        let row_vec = [orient[0], orient[1], orient[2]];
        let col_vec = [orient[3], orient[4], orient[5]];
        let slice_vec = cross(row_vec, col_vec);

        // 列依次为体素 x, y, z 方向, 最后一列为原点.
        let mut affine = [[0.0; 4]; 4];
        for r in 0..3 {
            affine[r][0] = row_vec[r] * ps_col;
            affine[r][1] = col_vec[r] * ps_row;
            affine[r][2] = slice_vec[r] * thickness;
            affine[r][3] = origin[r];
        }
        affine[3][3] = 1.0;

        let spacing = Spacing::new(thickness, ps_row, ps_col);
        tracing::info!(shape = ?hu.dim(), ?spacing, "manual volume built");
        Ok(Self {
            hu,
            affine,
            spacing,
        })
    }

    /// 形状 `(z, y, x)`.
    #[inline]
    pub fn shape(&self) -> Shape3d {
        self.hu.dim()
    }

    /// HU 数据.
    #[inline]
    pub fn hu(&self) -> &Array3<f32> {
        &self.hu
    }

    /// 仿射矩阵.
    #[inline]
    pub fn affine(&self) -> &[[f64; 4]; 4] {
        &self.affine
    }

    /// 体素间距 `(z, y, x)`.
    #[inline]
    pub fn spacing(&self) -> Spacing {
        self.spacing
    }

    /// 写出为 nifti 文件. 仿射矩阵转换到 nifti 使用的 RAS 坐标.
    pub fn write_nifti<P: AsRef<Path>>(&self, path: P) -> Result<(), VolumeError> {
        let mut header = NiftiHeader::default();
        header.pixdim = [
            1.0,
            self.spacing.x as f32,
            self.spacing.y as f32,
            self.spacing.z as f32,
            1.0,
            1.0,
            1.0,
            1.0,
        ];
        header.sform_code = 1;
        header.qform_code = 0;
        // LPS -> RAS: 前两行取负.
        let row = |r: usize, sign: f64| -> [f32; 4] {
            [0, 1, 2, 3].map(|c| (sign * self.affine[r][c]) as f32)
        };
        header.srow_x = row(0, -1.0);
        header.srow_y = row(1, -1.0);
        header.srow_z = row(2, 1.0);

        // (z, y, x) -> (x, y, z)
        let data = self.hu.view().permuted_axes([2, 1, 0]);
        WriterOptions::new(path.as_ref())
            .reference_header(&header)
            .write_nifti(&data)?;
        tracing::debug!(path = %path.as_ref().display(), "manual volume written");
        Ok(())
    }

    /// 将推理输出对齐到本体积的 `(z, y, x)` 形状.
    pub fn conform<T: Label>(&self, labels: &Array3<T>) -> Result<Array3<T>, ReconciliationError> {
        Reconciler::same_space(DEFAULT_MAX_DISTORTION)
            .reconcile(labels, self.shape())
            .map(|(out, _)| out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn slice(z: f64, value: i16) -> SliceRecord {
        SliceRecord {
            pixels: Some(Array2::from_elem((4, 6), value)),
            rescale_slope: Some(2.0),
            rescale_intercept: Some(-1024.0),
            pixel_spacing: Some([0.8, 0.7]),
            slice_thickness: None,
            image_position: Some([-100.0, -120.0, z]),
            image_orientation: Some([1.0, 0.0, 0.0, 0.0, 1.0, 0.0]),
        }
    }

    fn series(n: usize) -> Vec<SliceRecord> {
        (0..n).map(|i| slice(2.5 * i as f64, 100)).collect()
    }

    #[test]
    fn test_build_affine_from_positions() {
        let v = ManualVolume::build(&series(12)).unwrap();
        assert_eq!(v.shape(), (12, 4, 6));
        assert_eq!(v.hu()[(0, 0, 0)], 100.0 * 2.0 - 1024.0);

        let a = v.affine();
        assert_eq!(a[0][0], 0.7);
        assert_eq!(a[1][1], 0.8);
        assert!((a[2][2] - 2.5).abs() < 1e-9);
        assert_eq!([a[0][3], a[1][3], a[2][3]], [-100.0, -120.0, 0.0]);
        assert_eq!(a[3], [0.0, 0.0, 0.0, 1.0]);
        assert!((v.spacing().z - 2.5).abs() < 1e-9);
    }

    #[test]
    fn test_thickness_preferred_and_default() {
        let mut s = series(10);
        s[0].slice_thickness = Some(3.0);
        assert_eq!(ManualVolume::build(&s).unwrap().spacing().z, 3.0);

        let mut s = series(10);
        s.iter_mut().for_each(|r| r.image_position = Some([0.0; 3]));
        assert_eq!(ManualVolume::build(&s).unwrap().spacing().z, FALLBACK_SLICE_SPACING_MM);
    }

    #[test]
    fn test_too_few_good_slices() {
        let mut s = series(11);
        s[3].pixels = None;
        s[7].pixels = None;
        assert!(matches!(
            ManualVolume::build(&s),
            Err(VolumeError::TooFewSlices { good: 9, required: 10 })
        ));
    }

    #[test]
    fn test_missing_orientation() {
        let mut s = series(10);
        s[0].image_orientation = None;
        assert!(matches!(
            ManualVolume::build(&s),
            Err(VolumeError::MissingTag("ImageOrientationPatient"))
        ));
    }

    #[test]
    fn test_conform() {
        let v = ManualVolume::build(&series(10)).unwrap();
        let labels = Array3::<u16>::ones((10, 4, 6));
        assert_eq!(v.conform(&labels).unwrap().dim(), (10, 4, 6));
        let labels = Array3::<u16>::ones((10, 6, 4));
        assert_eq!(v.conform(&labels).unwrap().dim(), (10, 4, 6));
        let labels = Array3::<u16>::ones((5, 4, 6));
        assert!(v.conform(&labels).is_err());
    }

    #[test]
    fn test_write_nifti() {
        let v = ManualVolume::build(&series(10)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("manual.nii.gz");
        v.write_nifti(&path).unwrap();
        assert!(path.exists());
    }
}
