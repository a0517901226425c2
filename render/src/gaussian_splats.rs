use ball_tree::BallTree;
use burn::prelude::{Backend, Bool, Int, Tensor, TensorData};
use burn::tensor::{activation::sigmoid, backend::AutodiffBackend};
use glam::{Quat, Vec3};

use crate::sh::{rgb_to_sh, sh_coeffs_for_degree, sh_degree_from_coeffs};
use crate::{Attribute, AttributeSet, SplatError};

/// The point cloud being trained.
///
/// Every column is `[N, width]` and all columns always share `N`. Structural edits build
/// every new column before any of them is swapped in, so a failed edit leaves the splats
/// untouched.
#[derive(Debug, Clone)]
pub struct Splats<B: Backend> {
    /// `[N, 3]`
    means: Tensor<B, 2>,
    /// `[N, 4]`, (w, x, y, z). Not normalized.
    rotations: Tensor<B, 2>,
    /// `[N, 3]`
    log_scales: Tensor<B, 2>,
    /// `[N, 1]`, pre sigmoid.
    raw_opacities: Tensor<B, 2>,
    /// `[N, 3 * coeffs]`, laid out as `[coeff][channel]`.
    sh_coeffs: Tensor<B, 2>,
}

/// How the rows of the splats were rearranged by a structural edit. Anything that keeps
/// per splat state applies the same change to stay aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StructuralChange {
    Appended { count: usize },
    Pruned { kept: Vec<usize>, before: usize },
}

impl StructuralChange {
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Appended { count } => *count == 0,
            Self::Pruned { kept, before } => kept.len() == *before,
        }
    }

    /// Rearrange a per splat tensor the same way. Appended rows are zero.
    pub fn apply_rows<B: Backend, const D: usize>(&self, rows: Tensor<B, D>) -> Tensor<B, D> {
        if self.is_noop() {
            return rows;
        }
        let device = rows.device();
        match self {
            Self::Appended { count } => {
                let mut dims = rows.dims();
                dims[0] = *count;
                Tensor::cat(vec![rows, Tensor::zeros(dims, &device)], 0)
            }
            Self::Pruned { kept, .. } => rows.select(0, index_tensor(kept, &device)),
        }
    }
}

pub fn index_tensor<B: Backend>(indices: &[usize], device: &B::Device) -> Tensor<B, 1, Int> {
    let indices: Vec<i32> = indices.iter().map(|&i| i as i32).collect();
    let count = indices.len();
    Tensor::from_data(TensorData::new(indices, [count]), device)
}

pub fn read_mask<B: Backend>(mask: Tensor<B, 1, Bool>) -> Result<Vec<bool>, SplatError> {
    mask.into_data()
        .to_vec::<bool>()
        .map_err(|e| SplatError::Data(format!("{e:?}")))
}

pub fn read_floats<B: Backend, const D: usize>(tensor: Tensor<B, D>) -> Result<Vec<f32>, SplatError> {
    tensor
        .into_data()
        .convert::<f32>()
        .to_vec::<f32>()
        .map_err(|e| SplatError::Data(format!("{e:?}")))
}

// Closest color width below `width` that holds a whole SH degree.
fn nearest_sh_width(width: usize) -> usize {
    let coeffs = (width / 3).max(1) as u32;
    let degree = (coeffs as f32).sqrt() as u32 - 1;
    3 * sh_coeffs_for_degree(degree.min(4)) as usize
}

fn norm_vec<B: Backend>(vec: Tensor<B, 2>) -> Tensor<B, 2> {
    let magnitudes =
        Tensor::clamp_min(Tensor::sum_dim(vec.clone().powi_scalar(2), 1).sqrt(), 1e-32);
    vec / magnitudes
}

pub fn inverse_sigmoid(x: f32) -> f32 {
    (x / (1.0 - x)).ln()
}

impl<B: Backend> Splats<B> {
    pub fn from_columns(
        means: Tensor<B, 2>,
        rotations: Tensor<B, 2>,
        log_scales: Tensor<B, 2>,
        raw_opacities: Tensor<B, 2>,
        sh_coeffs: Tensor<B, 2>,
    ) -> Result<Self, SplatError> {
        let n = means.dims()[0];
        let columns = [
            (Attribute::Position, &means, Some(3)),
            (Attribute::Rotation, &rotations, Some(4)),
            (Attribute::Scale, &log_scales, Some(3)),
            (Attribute::Opacity, &raw_opacities, Some(1)),
            (Attribute::Color, &sh_coeffs, None),
        ];
        for (attribute, tensor, width) in columns {
            let found = tensor.dims();
            let expected = width.unwrap_or_else(|| {
                let valid = found[1] % 3 == 0 && sh_degree_from_coeffs(found[1] as u32 / 3).is_some();
                if valid { found[1] } else { nearest_sh_width(found[1]) }
            });
            if found[0] != n || found[1] != expected {
                return Err(SplatError::ShapeMismatch {
                    attribute,
                    expected: [n, expected],
                    found,
                });
            }
        }

        Ok(Self {
            means,
            rotations,
            log_scales,
            raw_opacities,
            sh_coeffs,
        })
    }

    pub fn from_raw(
        means: &[Vec3],
        rotations: Option<&[Quat]>,
        log_scales: Option<&[Vec3]>,
        sh_coeffs: Option<&[f32]>,
        raw_opacities: Option<&[f32]>,
        sh_degree: u32,
        device: &B::Device,
    ) -> Result<Self, SplatError> {
        let n_splats = means.len();
        let n_coeffs = sh_coeffs_for_degree(sh_degree) as usize;

        let means_tensor: Vec<f32> = means.iter().flat_map(|v| [v.x, v.y, v.z]).collect();
        let means_tensor = Tensor::from_data(TensorData::new(means_tensor, [n_splats, 3]), device);

        let rotations = if let Some(rotations) = rotations {
            // Stored in scalar first form.
            let rotations: Vec<f32> = rotations
                .iter()
                .flat_map(|v| [v.w, v.x, v.y, v.z])
                .collect();
            let len = rotations.len() / 4;
            Tensor::from_data(TensorData::new(rotations, [len, 4]), device)
        } else {
            Tensor::<B, 1>::from_floats([1.0, 0.0, 0.0, 0.0], device)
                .reshape([1, 4])
                .repeat_dim(0, n_splats)
        };

        let log_scales = if let Some(log_scales) = log_scales {
            let log_scales: Vec<f32> = log_scales.iter().flat_map(|v| [v.x, v.y, v.z]).collect();
            let len = log_scales.len() / 3;
            Tensor::from_data(TensorData::new(log_scales, [len, 3]), device)
        } else {
            let extents = nearest_neighbour_log_scales(means);
            Tensor::<B, 1>::from_floats(extents.as_slice(), device)
                .reshape([n_splats, 1])
                .repeat_dim(1, 3)
        };

        let sh_coeffs = if let Some(sh_coeffs) = sh_coeffs {
            let len = sh_coeffs.len();
            let width = len.checked_div(n_splats).unwrap_or(n_coeffs * 3);
            if n_splats * width != len {
                return Err(SplatError::ShapeMismatch {
                    attribute: Attribute::Color,
                    expected: [n_splats, n_coeffs * 3],
                    found: [len.div_ceil(width.max(1)), width],
                });
            }
            Tensor::from_data(TensorData::new(sh_coeffs.to_vec(), [n_splats, width]), device)
        } else {
            Tensor::zeros([n_splats, n_coeffs * 3], device)
        };

        let raw_opacities = if let Some(raw_opacities) = raw_opacities {
            let len = raw_opacities.len();
            Tensor::from_data(TensorData::new(raw_opacities.to_vec(), [len, 1]), device)
        } else {
            Tensor::ones([n_splats, 1], device) * inverse_sigmoid(0.1)
        };

        Self::from_columns(means_tensor, rotations, log_scales, raw_opacities, sh_coeffs)
    }

    /// Initialize from a colored (SfM) point cloud.
    pub fn from_points(
        positions: &[Vec3],
        colors: &[Vec3],
        sh_degree: u32,
        device: &B::Device,
    ) -> Result<Self, SplatError> {
        let n_coeffs = sh_coeffs_for_degree(sh_degree) as usize;
        let sh_coeffs: Vec<f32> = colors
            .iter()
            .flat_map(|rgb| {
                let dc = rgb_to_sh(*rgb);
                let mut coeffs = vec![0.0; n_coeffs * 3];
                coeffs[0..3].copy_from_slice(&[dc.x, dc.y, dc.z]);
                coeffs
            })
            .collect();
        if colors.len() != positions.len() {
            return Err(SplatError::ShapeMismatch {
                attribute: Attribute::Color,
                expected: [positions.len(), n_coeffs * 3],
                found: [colors.len(), n_coeffs * 3],
            });
        }
        Self::from_raw(positions, None, None, Some(&sh_coeffs), None, sh_degree, device)
    }

    pub fn num_points(&self) -> usize {
        self.means.dims()[0]
    }

    pub fn device(&self) -> B::Device {
        self.means.device()
    }

    pub fn column(&self, attribute: Attribute) -> &Tensor<B, 2> {
        match attribute {
            Attribute::Position => &self.means,
            Attribute::Rotation => &self.rotations,
            Attribute::Scale => &self.log_scales,
            Attribute::Opacity => &self.raw_opacities,
            Attribute::Color => &self.sh_coeffs,
        }
    }

    fn column_mut(&mut self, attribute: Attribute) -> &mut Tensor<B, 2> {
        match attribute {
            Attribute::Position => &mut self.means,
            Attribute::Rotation => &mut self.rotations,
            Attribute::Scale => &mut self.log_scales,
            Attribute::Opacity => &mut self.raw_opacities,
            Attribute::Color => &mut self.sh_coeffs,
        }
    }

    pub fn width(&self, attribute: Attribute) -> usize {
        self.column(attribute).dims()[1]
    }

    pub fn means(&self) -> Tensor<B, 2> {
        self.means.clone()
    }

    pub fn rotations(&self) -> Tensor<B, 2> {
        self.rotations.clone()
    }

    pub fn log_scales(&self) -> Tensor<B, 2> {
        self.log_scales.clone()
    }

    pub fn raw_opacities(&self) -> Tensor<B, 2> {
        self.raw_opacities.clone()
    }

    pub fn sh_coeffs(&self) -> Tensor<B, 2> {
        self.sh_coeffs.clone()
    }

    pub fn scales(&self) -> Tensor<B, 2> {
        self.log_scales.clone().exp()
    }

    /// `[N]`
    pub fn opacities(&self) -> Tensor<B, 1> {
        sigmoid(self.raw_opacities.clone()).squeeze(1)
    }

    pub fn rotations_normed(&self) -> Tensor<B, 2> {
        norm_vec(self.rotations.clone())
    }

    pub fn sh_degree(&self) -> u32 {
        sh_degree_from_coeffs(self.width(Attribute::Color) as u32 / 3).unwrap_or(0)
    }

    /// All columns, cloned.
    pub fn columns(&self) -> AttributeSet<B> {
        Attribute::ALL
            .into_iter()
            .fold(AttributeSet::new(), |set, attr| {
                set.with(attr, self.column(attr).clone())
            })
    }

    /// Copy the rows at `indices` out of every column.
    pub fn select(&self, indices: Tensor<B, 1, Int>) -> AttributeSet<B> {
        Attribute::ALL
            .into_iter()
            .fold(AttributeSet::new(), |set, attr| {
                set.with(attr, self.column(attr).clone().select(0, indices.clone()))
            })
    }

    /// Add `M` new splats after the existing ones. Every attribute must be present with `M` rows.
    pub fn append(&mut self, new: &AttributeSet<B>) -> Result<StructuralChange, SplatError> {
        let count = new.num_rows()?;
        for attribute in Attribute::ALL {
            let rows = new
                .get(attribute)
                .ok_or(SplatError::MissingAttribute(attribute))?;
            let expected = [count, self.width(attribute)];
            if rows.dims() != expected {
                return Err(SplatError::ShapeMismatch {
                    attribute,
                    expected,
                    found: rows.dims(),
                });
            }
        }

        if count > 0 {
            for (attribute, rows) in new.iter() {
                let column = self.column_mut(attribute);
                *column = Tensor::cat(vec![column.clone(), rows.clone()], 0);
            }
        }
        Ok(StructuralChange::Appended { count })
    }

    /// Remove every splat where `keep` is false. Relative order is preserved.
    pub fn prune(&mut self, keep: Tensor<B, 1, Bool>) -> Result<StructuralChange, SplatError> {
        let before = self.num_points();
        let [len] = keep.dims();
        if len != before {
            return Err(SplatError::SizeMismatch {
                expected: before,
                found: len,
            });
        }

        let kept: Vec<usize> = read_mask(keep)?
            .into_iter()
            .enumerate()
            .filter_map(|(i, keep)| keep.then_some(i))
            .collect();
        let change = StructuralChange::Pruned { kept, before };

        if !change.is_noop() {
            if let StructuralChange::Pruned { kept, .. } = &change {
                if kept.is_empty() {
                    log::warn!("Pruning removed all {before} splats");
                }
            }
            for attribute in Attribute::ALL {
                let column = self.column_mut(attribute);
                *column = change.apply_rows(column.clone());
            }
        }
        Ok(change)
    }

    /// Swap out one column. The number of splats can not change this way.
    pub fn replace(&mut self, attribute: Attribute, rows: Tensor<B, 2>) -> Result<(), SplatError> {
        let expected = [self.num_points(), self.width(attribute)];
        if rows.dims() != expected {
            return Err(SplatError::ShapeMismatch {
                attribute,
                expected,
                found: rows.dims(),
            });
        }
        *self.column_mut(attribute) = rows;
        Ok(())
    }

    /// Lift the columns into an autodiff backend as fresh leaves that track gradients.
    pub fn into_autodiff<BDiff: AutodiffBackend<InnerBackend = B>>(self) -> Splats<BDiff> {
        let lift = |t: Tensor<B, 2>| Tensor::<BDiff, 2>::from_inner(t).require_grad();
        Splats::<BDiff> {
            means: lift(self.means),
            rotations: lift(self.rotations),
            log_scales: lift(self.log_scales),
            raw_opacities: lift(self.raw_opacities),
            sh_coeffs: lift(self.sh_coeffs),
        }
    }
}

// Log of the mean distance to the three nearest neighbours.
fn nearest_neighbour_log_scales(means: &[Vec3]) -> Vec<f32> {
    let tree_pos: Vec<[f64; 3]> = means
        .iter()
        .map(|v| [v.x as f64, v.y as f64, v.z as f64])
        .collect();

    let empty = vec![(); tree_pos.len()];
    let tree = BallTree::new(tree_pos.clone(), empty);

    tree_pos
        .iter()
        .map(|p| {
            let dists: Vec<f64> = tree.query().nn(p).skip(1).take(3).map(|x| x.1).collect();
            if dists.is_empty() {
                0.01
            } else {
                dists.iter().sum::<f64>() / dists.len() as f64
            }
        })
        .map(|p| p.max(1e-7))
        .map(|p| p.ln() as f32)
        .collect()
}

#[cfg(test)]
mod tests {
    use burn::backend::NdArray;
    use burn::prelude::{Bool, Tensor, TensorData};
    use glam::Vec3;

    use super::*;

    type Backend = NdArray;

    pub(crate) fn test_splats(n: usize) -> Splats<Backend> {
        let device = Default::default();
        let means: Vec<Vec3> = (0..n).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect();
        let log_scales = vec![Vec3::splat(-2.0); n];
        let opac: Vec<f32> = (0..n).map(|i| i as f32 * 0.1).collect();
        Splats::from_raw(&means, None, Some(&log_scales), None, Some(&opac), 1, &device)
            .expect("Valid splats")
    }

    fn new_rows(m: usize, value: f32) -> AttributeSet<Backend> {
        let device = Default::default();
        AttributeSet::new()
            .with(Attribute::Position, Tensor::ones([m, 3], &device) * value)
            .with(Attribute::Rotation, Tensor::ones([m, 4], &device))
            .with(Attribute::Scale, Tensor::zeros([m, 3], &device))
            .with(Attribute::Opacity, Tensor::zeros([m, 1], &device))
            .with(Attribute::Color, Tensor::zeros([m, 12], &device))
    }

    fn mask(values: Vec<bool>) -> Tensor<Backend, 1, Bool> {
        let len = values.len();
        Tensor::from_data(TensorData::new(values, [len]), &Default::default())
    }

    fn assert_columns_aligned(splats: &Splats<Backend>) {
        let n = splats.num_points();
        for attr in Attribute::ALL {
            assert_eq!(splats.column(attr).dims()[0], n, "{attr} out of sync");
        }
    }

    #[test]
    fn append_keeps_old_rows_first() {
        let mut splats = test_splats(4);
        let change = splats.append(&new_rows(2, 7.0)).expect("Valid rows");

        assert_eq!(change, StructuralChange::Appended { count: 2 });
        assert_eq!(splats.num_points(), 6);
        assert_columns_aligned(&splats);

        let xs = read_floats(splats.means()).expect("Readable");
        assert_eq!(&xs[0..3], &[0.0, 0.0, 0.0]);
        assert_eq!(&xs[9..12], &[3.0, 0.0, 0.0]);
        assert_eq!(&xs[12..15], &[7.0, 7.0, 7.0]);
    }

    #[test]
    fn append_rejects_mismatched_rows() {
        let device = Default::default();
        let mut splats = test_splats(4);
        let mut rows = new_rows(2, 1.0);
        rows.insert(Attribute::Opacity, Tensor::zeros([3, 1], &device));

        assert!(matches!(
            splats.append(&rows),
            Err(SplatError::ShapeMismatch { .. })
        ));
        // Nothing was swapped in.
        assert_eq!(splats.num_points(), 4);
        assert_columns_aligned(&splats);
    }

    #[test]
    fn append_rejects_wrong_width_and_missing_columns() {
        let device = Default::default();
        let mut splats = test_splats(4);

        let mut rows = new_rows(2, 1.0);
        rows.insert(Attribute::Color, Tensor::zeros([2, 3], &device));
        assert!(matches!(
            splats.append(&rows),
            Err(SplatError::ShapeMismatch {
                attribute: Attribute::Color,
                ..
            })
        ));

        let mut rows = new_rows(2, 1.0);
        rows.remove(Attribute::Rotation);
        assert!(matches!(
            splats.append(&rows),
            Err(SplatError::MissingAttribute(Attribute::Rotation))
        ));
        assert_eq!(splats.num_points(), 4);
    }

    #[test]
    fn prune_compacts_in_order() {
        let mut splats = test_splats(5);
        splats
            .prune(mask(vec![true, false, true, false, true]))
            .expect("Mask matches");

        assert_eq!(splats.num_points(), 3);
        assert_columns_aligned(&splats);
        let xs: Vec<f32> = read_floats(splats.means())
            .expect("Readable")
            .chunks(3)
            .map(|c| c[0])
            .collect();
        assert_eq!(xs, vec![0.0, 2.0, 4.0]);
    }

    #[test]
    fn prune_rejects_wrong_mask_length() {
        let mut splats = test_splats(5);
        assert!(matches!(
            splats.prune(mask(vec![true; 4])),
            Err(SplatError::SizeMismatch {
                expected: 5,
                found: 4
            })
        ));
    }

    #[test]
    fn append_then_prune_appended_restores() {
        let mut splats = test_splats(4);
        let before = splats.columns();

        splats.append(&new_rows(3, 5.0)).expect("Valid rows");
        let mut keep = vec![true; 4];
        keep.extend([false; 3]);
        splats.prune(mask(keep)).expect("Mask matches");

        assert_eq!(splats.num_points(), 4);
        for attr in Attribute::ALL {
            let expected = read_floats(before.get(attr).expect("Present").clone()).expect("Readable");
            let found = read_floats(splats.column(attr).clone()).expect("Readable");
            assert_eq!(expected, found, "{attr} changed");
        }
    }

    #[test]
    fn replace_checks_rows() {
        let device = Default::default();
        let mut splats = test_splats(4);
        assert!(splats
            .replace(Attribute::Opacity, Tensor::zeros([3, 1], &device))
            .is_err());
        splats
            .replace(Attribute::Opacity, Tensor::ones([4, 1], &device))
            .expect("Matching shape");
        let opac = read_floats(splats.raw_opacities()).expect("Readable");
        assert_eq!(opac, vec![1.0; 4]);
    }

    #[test]
    fn change_applies_zero_rows_and_selection() {
        let device = Default::default();
        let rows = Tensor::<Backend, 2>::ones([3, 2], &device);

        let grown = StructuralChange::Appended { count: 2 }.apply_rows(rows.clone());
        assert_eq!(
            read_floats(grown).expect("Readable"),
            vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0, 0.0, 0.0, 0.0, 0.0]
        );

        let pruned = StructuralChange::Pruned {
            kept: vec![2],
            before: 3,
        }
        .apply_rows(rows);
        assert_eq!(pruned.dims(), [1, 2]);
    }

    #[test]
    fn ragged_color_data_is_rejected() {
        let device = Default::default();
        let means = vec![Vec3::ZERO, Vec3::X];
        let log_scales = vec![Vec3::ZERO; 2];
        let result = Splats::<Backend>::from_raw(
            &means,
            None,
            Some(&log_scales),
            Some(&[0.0; 7][..]),
            None,
            0,
            &device,
        );
        assert!(matches!(
            result,
            Err(SplatError::ShapeMismatch {
                attribute: Attribute::Color,
                expected: [2, 3],
                ..
            })
        ));

        let no_points =
            Splats::<Backend>::from_raw(&[], None, Some(&[]), Some(&[0.0; 3][..]), None, 0, &device);
        assert!(matches!(
            no_points,
            Err(SplatError::ShapeMismatch {
                attribute: Attribute::Color,
                ..
            })
        ));
    }

    #[test]
    fn color_width_error_reports_sh_width() {
        let device = Default::default();
        let column = |width: usize| Tensor::<Backend, 2>::zeros([2, width], &device);
        let result = Splats::from_columns(column(3), column(4), column(3), column(1), column(15));
        assert!(matches!(
            result,
            Err(SplatError::ShapeMismatch {
                attribute: Attribute::Color,
                expected: [2, 12],
                found: [2, 15],
            })
        ));

        let too_few = Splats::from_columns(column(3), column(4), column(3), column(1), column(2));
        assert!(matches!(
            too_few,
            Err(SplatError::ShapeMismatch {
                expected: [2, 3],
                ..
            })
        ));
    }

    #[test]
    fn from_points_uses_neighbour_scales() {
        let device = Default::default();
        let positions = vec![
            Vec3::ZERO,
            Vec3::X,
            Vec3::Y,
            Vec3::Z,
            Vec3::new(1.0, 1.0, 1.0),
        ];
        let colors = vec![Vec3::splat(0.5); positions.len()];
        let splats = Splats::<Backend>::from_points(&positions, &colors, 2, &device)
            .expect("Valid points");

        assert_eq!(splats.sh_degree(), 2);
        assert_eq!(splats.width(Attribute::Color), 27);
        let scales = read_floats(splats.scales()).expect("Readable");
        assert!(scales.iter().all(|s| *s > 0.5 && *s < 2.0));
        let opac = read_floats(splats.opacities()).expect("Readable");
        assert!(opac.iter().all(|o| (o - 0.1).abs() < 1e-5));
    }
}
