use std::collections::BTreeMap;
use std::fmt;

use burn::prelude::{Backend, Tensor};
use serde::{Deserialize, Serialize};

use crate::SplatError;

/// The per splat columns. Each one is also an optimizer parameter group.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
    Position,
    Rotation,
    Scale,
    Opacity,
    Color,
}

impl Attribute {
    pub const ALL: [Attribute; 5] = [
        Attribute::Position,
        Attribute::Rotation,
        Attribute::Scale,
        Attribute::Opacity,
        Attribute::Color,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::Position => "position",
            Self::Rotation => "rotation",
            Self::Scale => "scale",
            Self::Opacity => "opacity",
            Self::Color => "color",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|attr| attr.name() == name)
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of `[M, width]` rows keyed by attribute.
///
/// Used both for new splats (where every attribute must be present) and for
/// per attribute gradients (where some may be missing).
#[derive(Clone, Debug)]
pub struct AttributeSet<B: Backend> {
    columns: BTreeMap<Attribute, Tensor<B, 2>>,
}

impl<B: Backend> Default for AttributeSet<B> {
    fn default() -> Self {
        Self {
            columns: BTreeMap::new(),
        }
    }
}

impl<B: Backend> AttributeSet<B> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, attribute: Attribute, rows: Tensor<B, 2>) -> Self {
        self.insert(attribute, rows);
        self
    }

    pub fn insert(&mut self, attribute: Attribute, rows: Tensor<B, 2>) {
        self.columns.insert(attribute, rows);
    }

    pub fn get(&self, attribute: Attribute) -> Option<&Tensor<B, 2>> {
        self.columns.get(&attribute)
    }

    pub fn remove(&mut self, attribute: Attribute) -> Option<Tensor<B, 2>> {
        self.columns.remove(&attribute)
    }

    pub fn contains(&self, attribute: Attribute) -> bool {
        self.columns.contains_key(&attribute)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Attribute, &Tensor<B, 2>)> {
        self.columns.iter().map(|(attr, rows)| (*attr, rows))
    }

    /// Number of rows shared by every column. Fails if the columns disagree.
    pub fn num_rows(&self) -> Result<usize, SplatError> {
        let mut rows = None;
        for (attribute, tensor) in self.iter() {
            let [m, width] = tensor.dims();
            match rows {
                None => rows = Some((m, attribute)),
                Some((expected, first)) if expected != m => {
                    let first_width = self.columns[&first].dims()[1];
                    return Err(SplatError::ShapeMismatch {
                        attribute,
                        expected: [expected, first_width],
                        found: [m, width],
                    });
                }
                Some(_) => {}
            }
        }
        Ok(rows.map(|(m, _)| m).unwrap_or(0))
    }

    /// Stack several sets row wise. Every set must hold the same attributes.
    pub fn cat(sets: Vec<Self>) -> Result<Option<Self>, SplatError> {
        let Some(first) = sets.first() else {
            return Ok(None);
        };
        let attributes: Vec<_> = first.columns.keys().copied().collect();

        let mut merged = Self::new();
        for attribute in attributes {
            let mut parts = Vec::with_capacity(sets.len());
            for set in &sets {
                let rows = set
                    .get(attribute)
                    .ok_or(SplatError::MissingAttribute(attribute))?;
                parts.push(rows.clone());
            }
            merged.insert(attribute, Tensor::cat(parts, 0));
        }
        Ok(Some(merged))
    }
}
