use std::ops::Index;
use std::path::Path;

use log::debug;
use ndarray::{Array3, ArrayD, ArrayView3, Axis, Ix3};
use nifti::writer::WriterOptions;
use nifti::{IntoNdArray, NiftiHeader, NiftiObject, ReaderOptions};
use tempfile::NamedTempFile;

use crate::consts::{NII, NII_GZ};
use crate::error::{BoneError, Result};
use crate::Idx3d;

pub mod orientation;

use orientation::{Affine, Orientation, Reorientation};

/// `NiftiHeader` 是栈上大对象, 移动该对象的开销很可观.
/// 因此我们将其分配到堆上.
type BoxedHeader = Box<NiftiHeader>;

/// 3D 标签体数据 header 的共用属性和部分通用操作.
///
/// 所有形状与分辨率均按照规范 (RAS) 方向下的 `(z, h, w)` 顺序给出,
/// 即 `(S, A, R)`.
pub trait NiftiHeaderAttr {
    /// 获取原始 header 部分. 该 header 描述的是 **原始方向** 下的数据.
    fn header(&self) -> &NiftiHeader;

    /// 获取原始数据的方向码.
    fn native_orientation(&self) -> Orientation;

    /// 获取规范方向下的数据形状大小.
    fn shape(&self) -> Idx3d;

    /// 获取原始仿射变换.
    #[inline]
    fn native_affine(&self) -> Affine {
        Affine::from_header(self.header())
    }

    /// 获取单个体素分辨率. 该分辨率以毫米为单位, 按规范方向下的 `(z, h, w)` 排列.
    fn pix_dim(&self) -> [f64; 3] {
        let native = self.native_affine().spacing();
        let reo = Reorientation::between(self.native_orientation(), Orientation::RAS);
        // `(x, y, z)` -> `(z, y, x)`
        let [x, y, z] = reo.apply_shape([0, 1, 2]).map(|s| native[s]);
        [z, y, x]
    }

    /// 获取体素的实际体积值, 以立方毫米为单位.
    #[inline]
    fn voxel(&self) -> f64 {
        self.pix_dim().iter().product()
    }

    /// 获取原始 `(0, 0, 0)` 体素中心的世界坐标 (RAS+, 毫米).
    #[inline]
    fn origin(&self) -> [f64; 3] {
        self.native_affine().origin()
    }
}

/// nii 格式的 3D 标签体数据, 包括原始 header 和规范方向下的标签. 标签值以 `u8` 保存.
///
/// 内部数据总是 RAS 方向, 按 `(z, h, w)` (即 `(S, A, R)`) 标准布局存储;
/// header 保持原样, 写出时再将数据恢复为原始方向, 因此几何信息可以逐位往返.
#[derive(Debug, Clone)]
pub struct LabeledVolume {
    header: BoxedHeader,
    native: Orientation,
    data: Array3<u8>,
}

impl NiftiHeaderAttr for LabeledVolume {
    #[inline]
    fn header(&self) -> &NiftiHeader {
        &self.header
    }

    #[inline]
    fn native_orientation(&self) -> Orientation {
        self.native
    }

    #[inline]
    fn shape(&self) -> Idx3d {
        self.data.dim()
    }
}

impl Index<Idx3d> for LabeledVolume {
    type Output = u8;

    #[inline]
    fn index(&self, index: Idx3d) -> &Self::Output {
        &self.data[index]
    }
}

impl LabeledVolume {
    /// 打开 nii 文件格式的 3D 标签. `path` 为 nii (或 nii.gz) 文件的本地路径.
    /// 如果打开成功, 则返回 `Ok(Self)`, 否则返回 `Err`.
    ///
    /// 第四维为 1 的 4D 文件会被当作 3D 处理.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let obj = ReaderOptions::new().read_file(path.as_ref())?;
        let header = obj.header().clone();
        let data = obj.into_volume().into_ndarray::<u8>()?;
        let data = squeeze_to_3d(data)?;
        let volume = Self::from_native(header, data)?;
        debug!(
            "Opened {} ({} {:?})",
            path.as_ref().display(),
            volume.native,
            volume.shape()
        );
        Ok(volume)
    }

    /// 根据原始 header 和原始方向下按 \[x, y, z\] 组织的标签数据直接创建实体.
    ///
    /// 方向码由 `header` 的仿射变换推断, 无法推断时返回 `Err`.
    pub fn from_native(header: NiftiHeader, data: Array3<u8>) -> Result<Self> {
        let native = Orientation::from_affine(&Affine::from_header(&header))?;
        let reo = Reorientation::between(native, Orientation::RAS);

        // [x, y, z] -> [R, A, S] -> [S, A, R].
        let data = reo
            .apply(data)
            .permuted_axes([2, 1, 0])
            .as_standard_layout()
            .into_owned();
        debug_assert!(data.is_standard_layout());

        Ok(Self {
            header: Box::new(header),
            native,
            data,
        })
    }

    /// 仅根据体素分辨率创建 RAS 方向的实体, 数据按 \[z, h, w\] 组织.
    ///
    /// `pix_dim` 同样按照 \[z, h, w\] 顺序给出. 该方法主要用于实验和测试.
    ///
    /// nifti-1 header 以 `u16` 记录各轴长度, 任一轴超过 `u16::MAX` 时返回
    /// `Err(BoneError::TooLarge)`.
    pub fn fake(data: Array3<u8>, pix_dim: [f32; 3]) -> Result<Self> {
        let (z, h, w) = data.dim();
        let axis = |n: usize| u16::try_from(n).map_err(|_| BoneError::TooLarge((z, h, w)));
        let [pz, ph, pw] = pix_dim;
        let mut header = NiftiHeader::default();
        header.dim = [3, axis(w)?, axis(h)?, axis(z)?, 1, 1, 1, 1];
        header.pixdim = [1.0, pw, ph, pz, 0.0, 0.0, 0.0, 0.0];
        header.sform_code = 1;
        header.srow_x = [pw, 0.0, 0.0, 0.0];
        header.srow_y = [0.0, ph, 0.0, 0.0];
        header.srow_z = [0.0, 0.0, pz, 0.0];
        header.intent_name[..4].copy_from_slice(b"fake");

        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Ok(Self {
            header: Box::new(header),
            native: Orientation::RAS,
            data,
        })
    }

    /// 判断该结构是否是由 `fake` 方法手动拼接的.
    pub fn is_faked(&self) -> bool {
        self.header.intent_name.starts_with(b"fake")
    }

    /// 以相同的几何信息 (分辨率, 原点, 方向) 包装一份新的标签数组.
    ///
    /// `data` 必须与 `self` 形状相同 (规范方向, \[z, h, w\]), 否则返回
    /// `Err(BoneError::ShapeMismatch)`. 该操作不会修改 `self`.
    pub fn derive(&self, data: Array3<u8>) -> Result<Self> {
        if data.dim() != self.shape() {
            return Err(BoneError::ShapeMismatch {
                expected: self.shape(),
                found: data.dim(),
            });
        }
        let data = if data.is_standard_layout() {
            data
        } else {
            data.as_standard_layout().into_owned()
        };
        Ok(Self {
            header: self.header.clone(),
            native: self.native,
            data,
        })
    }

    /// 按原始方向写出到 `path`. header (分辨率, 原点, 方向, qform/sform) 保持原样.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.save_as(path, self.native)
    }

    /// 按 `target` 方向写出到 `path`.
    ///
    /// 当 `target` 与原始方向相同时, header 几何信息逐位保持原样;
    /// 否则仿射变换会被相应地置换/翻转, 并作为 sform 写出 (qform 被停用).
    pub fn save_as<P: AsRef<Path>>(&self, path: P, target: Orientation) -> Result<()> {
        let mut header = self.header.as_ref().clone();
        // 标签以原值写出, 不允许再被缩放.
        header.scl_slope = 1.0;
        header.scl_inter = 0.0;

        if target != self.native {
            let native_shape = self.native_shape();
            let reo = Reorientation::between(self.native, target);
            self.native_affine()
                .reoriented(&reo, native_shape)
                .write_sform(&mut header);
        }

        let data = self.to_orientation(target);
        let path = path.as_ref();
        // 先写入同目录下的临时文件, 成功后再改名, 失败时不会留下不完整的文件.
        let tmp = temp_sibling(path)?;
        WriterOptions::new(tmp.path())
            .reference_header(&header)
            .write_nifti(&data)?;
        tmp.persist(path).map_err(|e| e.error)?;
        debug!("Saved {} ({target})", path.display());
        Ok(())
    }

    /// 将规范方向下的数据转换为 `target` 方向下按 \[x, y, z\] 组织的数组.
    pub fn to_orientation(&self, target: Orientation) -> Array3<u8> {
        let reo = Reorientation::between(Orientation::RAS, target);
        reo.apply(self.data.view().permuted_axes([2, 1, 0]))
            .as_standard_layout()
            .into_owned()
    }

    /// 原始方向下 \[x, y, z\] 形状.
    fn native_shape(&self) -> [usize; 3] {
        let (z, h, w) = self.shape();
        Reorientation::between(Orientation::RAS, self.native).apply_shape([w, h, z])
    }

    /// 获得数据的一份不可变 shallow copy.
    #[inline]
    pub fn data(&self) -> ArrayView3<'_, u8> {
        self.data.view()
    }

    /// 消费自我, 获得底层数据.
    #[inline]
    pub fn into_data(self) -> Array3<u8> {
        self.data
    }

    /// 获取 3D 标签中值为 `label` 的体素个数.
    #[inline]
    pub fn count(&self, label: u8) -> usize {
        self.data.iter().filter(|p| **p == label).count()
    }

    /// 获取 3D 标签中出现过的所有非零标签值, 按升序排列.
    pub fn labels(&self) -> Vec<u8> {
        let mut seen = [false; 256];
        self.data.iter().for_each(|p| seen[*p as usize] = true);
        (1..=u8::MAX).filter(|l| seen[*l as usize]).collect()
    }
}

/// 在 `path` 所在目录创建临时文件. 扩展名与 `path` 一致, 使写出时按同样的方式压缩.
fn temp_sibling(path: &Path) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let suffix = if path.to_string_lossy().ends_with(".gz") {
        NII_GZ
    } else {
        NII
    };
    let tmp = tempfile::Builder::new()
        .prefix(".bone-berry-")
        .suffix(suffix)
        .tempfile_in(dir)?;
    Ok(tmp)
}

/// 将 nifti 读出的动态维数组转为 3D. 允许末尾存在长度为 1 的多余维度.
fn squeeze_to_3d(mut data: ArrayD<u8>) -> Result<Array3<u8>> {
    while data.ndim() > 3 && data.shape()[data.ndim() - 1] == 1 {
        let last = data.ndim() - 1;
        data = data.index_axis_move(Axis(last), 0);
    }
    let ndim = data.ndim();
    data.into_dimensionality::<Ix3>()
        .map_err(|_| BoneError::NotAVolume(ndim))
}
