//! Named contiguous ranges of the flat feature vector.

use crate::config::GroupLength;
use crate::error::CascadeError;
use itertools::Itertools;
use ndarray::{Array2, ArrayView1, ArrayView2, Axis, concatenate, s};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureGroup {
    pub name: String,
    pub start: usize,
    pub end: usize,
}

impl FeatureGroup {
    pub fn len(&self) -> usize {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }
}

/// Group order of the flat vector for each supported data version.
pub fn default_group_order(data_version: u32) -> &'static [&'static str] {
    match data_version {
        1 => &[
            "luke",
            "phys",
            "bio",
            "onehot",
            "onset",
            "angio",
            "time_trop",
            "time_fake_trop",
        ],
        _ => &[
            "luke",
            "phys",
            "bio",
            "onehot",
            "angio",
            "time_trop",
            "time_fake_trop",
        ],
    }
}

/// Partition of `[0, total_width)` into named groups, in declared order.
#[derive(Debug, Clone)]
pub struct FeatureLayout {
    groups: Vec<FeatureGroup>,
    index: HashMap<String, usize>,
}

impl FeatureLayout {
    pub fn new(lengths: &[GroupLength]) -> Result<Self, CascadeError> {
        let mut groups = Vec::with_capacity(lengths.len());
        let mut index = HashMap::with_capacity(lengths.len());
        let mut start = 0;
        for entry in lengths {
            if index.insert(entry.name.clone(), groups.len()).is_some() {
                return Err(CascadeError::Configuration(format!(
                    "feature group '{}' is declared more than once",
                    entry.name
                )));
            }
            groups.push(FeatureGroup {
                name: entry.name.clone(),
                start,
                end: start + entry.length,
            });
            start += entry.length;
        }
        Ok(Self { groups, index })
    }

    /// Builds the default layout of `data_version` from per-group lengths.
    ///
    /// Every group of the version's order must have a length in `lengths`.
    pub fn for_version(
        data_version: u32,
        lengths: &HashMap<String, usize>,
    ) -> Result<Self, CascadeError> {
        let ordered = default_group_order(data_version)
            .iter()
            .map(|&name| {
                lengths
                    .get(name)
                    .map(|&length| GroupLength {
                        name: name.to_string(),
                        length,
                    })
                    .ok_or_else(|| {
                        CascadeError::Configuration(format!(
                            "no length given for feature group '{name}' (data version {data_version})"
                        ))
                    })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Self::new(&ordered)
    }

    pub fn groups(&self) -> &[FeatureGroup] {
        &self.groups
    }

    pub fn total_width(&self) -> usize {
        self.groups.last().map_or(0, |g| g.end)
    }

    pub fn group(&self, name: &str) -> Result<&FeatureGroup, CascadeError> {
        self.index
            .get(name)
            .map(|&i| &self.groups[i])
            .ok_or_else(|| {
                CascadeError::Configuration(format!(
                    "feature group '{name}' is not defined (layout has: {})",
                    self.groups.iter().map(|g| g.name.as_str()).join(", ")
                ))
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    fn check_width(&self, width: usize) -> Result<(), CascadeError> {
        if self.total_width() > width {
            return Err(CascadeError::Configuration(format!(
                "feature groups span {} columns but the input has only {}",
                self.total_width(),
                width
            )));
        }
        Ok(())
    }

    /// Splits one flat vector into its groups, in declared order.
    pub fn route<'a>(
        &self,
        flat: ArrayView1<'a, f64>,
    ) -> Result<Vec<(&str, ArrayView1<'a, f64>)>, CascadeError> {
        self.check_width(flat.len())?;
        Ok(self
            .groups
            .iter()
            .map(|g| (g.name.as_str(), flat.slice_move(s![g.start..g.end])))
            .collect())
    }

    /// Width of the matrix [`assemble`](Self::assemble) would produce for `names`.
    pub fn assembled_width<S: AsRef<str>>(&self, names: &[S]) -> Result<usize, CascadeError> {
        names
            .iter()
            .map(|name| self.group(name.as_ref()).map(FeatureGroup::len))
            .sum()
    }

    /// Concatenates the columns of the named groups of `batch`, in the given order.
    ///
    /// A name may be repeated; its columns are then repeated too.
    pub fn assemble<S: AsRef<str>>(
        &self,
        batch: ArrayView2<f64>,
        names: &[S],
    ) -> Result<Array2<f64>, CascadeError> {
        self.check_width(batch.ncols())?;
        let mut parts = Vec::with_capacity(names.len());
        for name in names {
            let group = self.group(name.as_ref())?;
            parts.push(batch.slice(s![.., group.start..group.end]));
        }
        if parts.is_empty() {
            return Ok(Array2::zeros((batch.nrows(), 0)));
        }
        concatenate(Axis(1), &parts).map_err(|e| {
            CascadeError::Configuration(format!("cannot concatenate feature groups: {e}"))
        })
    }
}
