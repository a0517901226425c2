use std::collections::BTreeMap;

use burn::LearningRate;
use burn::prelude::{Backend, Bool, Int, Tensor};
use glam::UVec2;
use render::gaussian_splats::{Splats, StructuralChange};
use render::{Attribute, AttributeSet};
use tracing::trace_span;

use crate::config::{GroupConfig, RefineConfig};
use crate::error::{ConfigError, TrainError};
use crate::stats::{GradStatistic, RefineRecord};
use crate::update_rule::{RuleState, UpdateRule};

struct ParamGroup<B: Backend> {
    rule: UpdateRule,
    lr: LearningRate,
    state: RuleState<B>,
}

/// Owns the optimizer state of every parameter group and the densification statistics.
///
/// All per splat state is kept at exactly as many rows as the splats it was created for.
/// Structural edits made through this type apply the same [`StructuralChange`] to the
/// splats and to the state, which is what keeps the two in lockstep.
pub struct SplatOptimizer<B: Backend> {
    groups: BTreeMap<Attribute, ParamGroup<B>>,
    pub(crate) record: RefineRecord<B>,
    statistic: GradStatistic,
    reset_stats_on_refine: bool,
}

impl<B: Backend> SplatOptimizer<B> {
    pub fn new(
        groups: &[GroupConfig],
        refine: &RefineConfig,
        splats: &Splats<B>,
    ) -> Result<Self, ConfigError> {
        let device = splats.device();
        let n = splats.num_points();

        let mut resolved = BTreeMap::new();
        for group in groups {
            let attribute = Attribute::from_name(&group.name)
                .ok_or_else(|| ConfigError::UnknownGroup(group.name.clone()))?;
            let rule = UpdateRule::from_config(&group.optimizer)?;
            let state = rule.init_state([n, splats.width(attribute)], &device);
            let group_state = ParamGroup {
                rule,
                lr: group.lr.lr_init,
                state,
            };
            if resolved.insert(attribute, group_state).is_some() {
                return Err(ConfigError::DuplicateGroup(group.name.clone()));
            }
        }

        Ok(Self {
            groups: resolved,
            record: RefineRecord::new(n, &device),
            statistic: GradStatistic::from_config(refine)?,
            reset_stats_on_refine: refine.reset_stats_on_refine,
        })
    }

    /// Nr. of splats the state was sized for.
    pub fn num_rows(&self) -> usize {
        self.record.rows()
    }

    pub fn state_rows(&self, attribute: Attribute) -> Option<usize> {
        self.groups.get(&attribute).map(|g| g.state.rows())
    }

    pub fn groups(&self) -> impl Iterator<Item = Attribute> + '_ {
        self.groups.keys().copied()
    }

    pub fn learning_rate(&self, attribute: Attribute) -> Option<LearningRate> {
        self.groups.get(&attribute).map(|g| g.lr)
    }

    pub fn set_learning_rate(&mut self, attribute: Attribute, lr: LearningRate) {
        if let Some(group) = self.groups.get_mut(&attribute) {
            group.lr = lr;
        }
    }

    pub fn statistic(&self) -> GradStatistic {
        self.statistic
    }

    pub(crate) fn check_rows(&self, splats: &Splats<B>) -> Result<usize, TrainError> {
        let expected = splats.num_points();
        let tracked = self.num_rows();
        if tracked != expected {
            return Err(TrainError::StateOutOfSync { expected, tracked });
        }
        Ok(expected)
    }

    /// One update for every group that received a gradient. Groups without a gradient and
    /// attributes without a group are left alone.
    pub fn step(&mut self, splats: &mut Splats<B>, grads: &AttributeSet<B>) -> Result<(), TrainError> {
        let n = self.check_rows(splats)?;
        for (attribute, grad) in grads.iter() {
            let found = grad.dims()[0];
            if found != n {
                return Err(TrainError::GradientShape {
                    attribute,
                    expected: n,
                    found,
                });
            }
        }

        for (attribute, grad) in grads.iter() {
            let Some(group) = self.groups.get_mut(&attribute) else {
                continue;
            };
            let _span = trace_span!("Group step", attribute = attribute.name()).entered();
            let param = splats.column(attribute).clone();
            let (param, state) = group
                .rule
                .step(group.lr, param, grad.clone(), group.state.clone());
            splats.replace(attribute, param)?;
            group.state = state;
        }
        Ok(())
    }

    /// Fold the screen space gradients of one rendered view into the refine statistics.
    pub fn accumulate_stats(
        &mut self,
        viewspace_grad: Tensor<B, 2>,
        visibility: Tensor<B, 1, Bool>,
        radii: Tensor<B, 1, Int>,
        img_size: UVec2,
    ) -> Result<(), TrainError> {
        let expected = self.num_rows();
        let found = viewspace_grad.dims()[0];
        if found != expected || visibility.dims()[0] != expected || radii.dims()[0] != expected {
            return Err(TrainError::GradientShape {
                attribute: Attribute::Position,
                expected,
                found,
            });
        }
        self.record
            .gather_stats(self.statistic, viewspace_grad, visibility, radii, img_size);
        Ok(())
    }

    pub fn reset_stats(&mut self) {
        let device = self.record.max_radii().device();
        self.record = RefineRecord::new(self.num_rows(), &device);
    }

    #[cfg(test)]
    pub(crate) fn rule_state(&self, attribute: Attribute) -> Option<&RuleState<B>> {
        self.groups.get(&attribute).map(|g| &g.state)
    }

    pub(crate) fn reset_stats_on_refine(&self) -> bool {
        self.reset_stats_on_refine
    }

    /// Zero the optimizer state of one group, as if it was just created.
    pub fn reset_state(&mut self, attribute: Attribute) {
        if let Some(group) = self.groups.get_mut(&attribute) {
            group.state = group.state.clone().map_rows(|t| t.zeros_like());
            if let RuleState::Adam(state) = &mut group.state {
                state.time = 0;
            }
        }
    }

    pub(crate) fn apply_change(&mut self, change: &StructuralChange) {
        if change.is_noop() {
            return;
        }
        for group in self.groups.values_mut() {
            group.state = group.state.clone().map_rows(|t| change.apply_rows(t));
        }
        self.record = self.record.apply(change);
    }

    /// Append splats, growing all state with zero rows.
    pub fn append(
        &mut self,
        splats: &mut Splats<B>,
        new: &AttributeSet<B>,
    ) -> Result<StructuralChange, TrainError> {
        self.check_rows(splats)?;
        let change = splats.append(new)?;
        self.apply_change(&change);
        Ok(change)
    }

    /// Remove splats where `keep` is false, dropping the same rows of all state.
    pub fn prune(
        &mut self,
        splats: &mut Splats<B>,
        keep: Tensor<B, 1, Bool>,
    ) -> Result<StructuralChange, TrainError> {
        self.check_rows(splats)?;
        let change = splats.prune(keep)?;
        self.apply_change(&change);
        Ok(change)
    }

    /// Swap out one attribute and forget the optimizer state that belonged to the old values.
    pub fn replace(
        &mut self,
        splats: &mut Splats<B>,
        attribute: Attribute,
        rows: Tensor<B, 2>,
    ) -> Result<(), TrainError> {
        splats.replace(attribute, rows)?;
        self.reset_state(attribute);
        Ok(())
    }

    /// Lower every opacity to at most `floor`.
    pub fn reset_opacity(&mut self, splats: &mut Splats<B>, floor: f32) -> Result<(), TrainError> {
        let floor = floor.clamp(1e-6, 1.0 - 1e-6);
        let opacities = splats.opacities().clamp(1e-6, floor);
        let raw = (opacities.clone() / (opacities.neg() + 1.0)).log();
        self.replace(splats, Attribute::Opacity, raw.unsqueeze_dim(1))
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use burn::backend::NdArray;
    use burn::prelude::{Bool, Tensor, TensorData};
    use glam::Vec3;
    use render::gaussian_splats::{Splats, read_floats};
    use render::{Attribute, AttributeSet};

    use super::SplatOptimizer;
    use crate::config::{GroupConfig, LrScheduleConfig, OptimizerConfig, RefineConfig, default_groups};
    use crate::error::{ConfigError, TrainError};

    pub(crate) type Backend = NdArray;

    pub(crate) fn line_splats(n: usize) -> Splats<Backend> {
        let means: Vec<Vec3> = (0..n).map(|i| Vec3::new(i as f32, 0.0, 0.0)).collect();
        let log_scales = vec![Vec3::splat(-3.0); n];
        Splats::from_raw(&means, None, Some(&log_scales), None, None, 0, &Default::default())
            .expect("Valid splats")
    }

    pub(crate) fn assert_lockstep(optimizer: &SplatOptimizer<Backend>, splats: &Splats<Backend>) {
        let n = splats.num_points();
        for attr in Attribute::ALL {
            assert_eq!(splats.column(attr).dims()[0], n);
            if let Some(rows) = optimizer.state_rows(attr) {
                assert_eq!(rows, n, "{attr} state out of sync");
            }
        }
        assert_eq!(optimizer.num_rows(), n);
    }

    fn ones_grads(n: usize) -> AttributeSet<Backend> {
        let device = Default::default();
        let splats = line_splats(n);
        Attribute::ALL.into_iter().fold(AttributeSet::new(), |set, attr| {
            set.with(attr, Tensor::ones([n, splats.width(attr)], &device))
        })
    }

    #[test]
    fn step_updates_every_group() {
        let mut splats = line_splats(4);
        let mut optimizer =
            SplatOptimizer::new(&default_groups(), &RefineConfig::new(), &splats).expect("Valid config");

        let before = read_floats(splats.means()).expect("Readable");
        optimizer.step(&mut splats, &ones_grads(4)).expect("Matching grads");
        let after = read_floats(splats.means()).expect("Readable");

        for (b, a) in before.iter().zip(after) {
            assert!((b - a - 1.6e-4).abs() < 1e-6);
        }
    }

    #[test]
    fn wrong_gradient_rows_fail() {
        let mut splats = line_splats(4);
        let mut optimizer =
            SplatOptimizer::new(&default_groups(), &RefineConfig::new(), &splats).expect("Valid config");

        let result = optimizer.step(&mut splats, &ones_grads(3));
        assert!(matches!(
            result,
            Err(TrainError::GradientShape {
                expected: 4,
                found: 3,
                ..
            })
        ));
    }

    #[test]
    fn structural_edits_keep_state_in_lockstep() {
        let device = Default::default();
        let mut splats = line_splats(6);
        let mut optimizer =
            SplatOptimizer::new(&default_groups(), &RefineConfig::new(), &splats).expect("Valid config");
        optimizer.step(&mut splats, &ones_grads(6)).expect("Matching grads");

        let new = line_splats(3).columns();
        optimizer.append(&mut splats, &new).expect("Valid rows");
        assert_lockstep(&optimizer, &splats);

        let keep = vec![true, false, true, true, false, false, true, true, false];
        let keep = Tensor::<Backend, 1, Bool>::from_data(TensorData::new(keep, [9]), &device);
        optimizer.prune(&mut splats, keep).expect("Matching mask");
        assert_eq!(splats.num_points(), 5);
        assert_lockstep(&optimizer, &splats);

        optimizer
            .replace(&mut splats, Attribute::Scale, Tensor::zeros([5, 3], &device))
            .expect("Matching rows");
        assert_lockstep(&optimizer, &splats);

        // Stepping after the edits still works with the resized state.
        optimizer.step(&mut splats, &ones_grads(5)).expect("Matching grads");
    }

    #[test]
    fn reset_opacity_caps_values() {
        let mut splats = line_splats(3);
        let mut optimizer =
            SplatOptimizer::new(&default_groups(), &RefineConfig::new(), &splats).expect("Valid config");
        optimizer.reset_opacity(&mut splats, 0.01).expect("Valid opacity");

        let opacities = read_floats(splats.opacities()).expect("Readable");
        assert!(opacities.iter().all(|o| (o - 0.01).abs() < 1e-5));
    }

    #[test]
    fn config_errors_are_raised_at_setup() {
        let splats = line_splats(2);
        let refine = RefineConfig::new();

        let unknown = vec![GroupConfig::new(
            "point_cloud.features".to_owned(),
            LrScheduleConfig::new(1e-3),
        )];
        assert!(matches!(
            SplatOptimizer::new(&unknown, &refine, &splats),
            Err(ConfigError::UnknownGroup(_))
        ));

        let bad_rule = vec![
            GroupConfig::new("opacity".to_owned(), LrScheduleConfig::new(1e-3))
                .with_optimizer(OptimizerConfig::new().with_name("adagrad".to_owned())),
        ];
        assert!(matches!(
            SplatOptimizer::new(&bad_rule, &refine, &splats),
            Err(ConfigError::UnknownOptimizer(_))
        ));

        let twice = vec![
            GroupConfig::new("opacity".to_owned(), LrScheduleConfig::new(1e-3)),
            GroupConfig::new("opacity".to_owned(), LrScheduleConfig::new(1e-2)),
        ];
        assert!(matches!(
            SplatOptimizer::new(&twice, &refine, &splats),
            Err(ConfigError::DuplicateGroup(_))
        ));

        let bad_stat = refine.with_grad_statistic("median".to_owned());
        assert!(matches!(
            SplatOptimizer::new(&default_groups(), &bad_stat, &splats),
            Err(ConfigError::UnknownStatistic(_))
        ));
    }
}
