// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Row space to imageset space index mapping.

use crate::Error;
use std::collections::HashMap;

/// Bidirectional index mapping for one (collection, source) pair.
///
/// The join table holds, for each row, the imageset index of its image or
/// `None` when the row has no image. Imageset indices are expected to be
/// unique; when one repeats, reverse lookup resolves to the first row that
/// carries it.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexLookup {
    Table {
        forward: Vec<Option<usize>>,
        reverse: HashMap<usize, usize>,
    },
    /// Row n is image n. Used by sources without a join table.
    Identity,
}

impl IndexLookup {
    pub fn from_table(forward: Vec<Option<usize>>) -> Self {
        let mut reverse = HashMap::with_capacity(forward.len());
        for (row, image) in forward.iter().enumerate() {
            if let Some(image) = image {
                reverse.entry(*image).or_insert(row);
            }
        }
        IndexLookup::Table { forward, reverse }
    }

    /// Parses the `imageset_indices` of a join dataset.
    ///
    /// A missing list yields [`IndexLookup::Identity`]; negative values are
    /// treated as unmapped rows.
    pub(crate) fn from_dataset(dataset: &serde_json::Value) -> Result<Self, Error> {
        let Some(indices) = dataset.get("imageset_indices") else {
            return Ok(IndexLookup::Identity);
        };
        let indices = indices.as_array().ok_or_else(|| {
            Error::MalformedRecord("imageset_indices is not a list".to_string())
        })?;

        let forward = indices
            .iter()
            .map(|value| match value {
                serde_json::Value::Null => Ok(None),
                value => value
                    .as_i64()
                    .map(|i| usize::try_from(i).ok())
                    .ok_or_else(|| {
                        Error::MalformedRecord(format!("invalid imageset index {}", value))
                    }),
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self::from_table(forward))
    }

    /// Number of rows covered, `None` for the unbounded identity mapping.
    pub fn len(&self) -> Option<usize> {
        match self {
            IndexLookup::Table { forward, .. } => Some(forward.len()),
            IndexLookup::Identity => None,
        }
    }

    /// Imageset index of `row`, `None` when the row has no image.
    pub fn row_to_imageset(&self, row: usize) -> Result<Option<usize>, Error> {
        match self {
            IndexLookup::Table { forward, .. } => forward.get(row).copied().ok_or_else(|| {
                Error::OutOfRange(format!(
                    "row index {} for a lookup of {} rows",
                    row,
                    forward.len()
                ))
            }),
            IndexLookup::Identity => Ok(Some(row)),
        }
    }

    /// First row whose image is `image`.
    pub fn imageset_to_row(&self, image: usize) -> Result<usize, Error> {
        match self {
            IndexLookup::Table { reverse, .. } => reverse
                .get(&image)
                .copied()
                .ok_or_else(|| Error::NotFound(format!("imageset index {} has no row", image))),
            IndexLookup::Identity => Ok(image),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_round_trip_for_mapped_rows() {
        let lookup = IndexLookup::from_table(vec![Some(3), None, Some(0), Some(7), None, Some(1)]);

        for row in 0..6 {
            if let Some(image) = lookup.row_to_imageset(row).unwrap() {
                assert_eq!(lookup.imageset_to_row(image).unwrap(), row);
            }
        }
        assert_eq!(lookup.len(), Some(6));
    }

    #[test]
    fn test_out_of_range_and_missing() {
        let lookup = IndexLookup::from_table(vec![Some(0), None]);
        assert_eq!(lookup.row_to_imageset(1).unwrap(), None);
        assert!(matches!(lookup.row_to_imageset(2), Err(Error::OutOfRange(_))));
        assert!(matches!(lookup.imageset_to_row(9), Err(Error::NotFound(_))));
    }

    #[test]
    fn test_duplicate_image_resolves_to_first_row() {
        let lookup = IndexLookup::from_table(vec![None, Some(4), Some(2), Some(4)]);
        assert_eq!(lookup.imageset_to_row(4).unwrap(), 1);
    }

    #[test]
    fn test_identity_without_join_table() {
        let lookup = IndexLookup::from_dataset(&json!({"name": "plain"})).unwrap();
        assert_eq!(lookup, IndexLookup::Identity);
        assert_eq!(lookup.row_to_imageset(123_456).unwrap(), Some(123_456));
        assert_eq!(lookup.imageset_to_row(42).unwrap(), 42);
        assert_eq!(lookup.len(), None);
    }

    #[test]
    fn test_from_dataset_parses_nulls() {
        let lookup =
            IndexLookup::from_dataset(&json!({"imageset_indices": [2, null, 0, -1]})).unwrap();
        assert_eq!(lookup.row_to_imageset(0).unwrap(), Some(2));
        assert_eq!(lookup.row_to_imageset(1).unwrap(), None);
        assert_eq!(lookup.row_to_imageset(3).unwrap(), None);

        assert!(IndexLookup::from_dataset(&json!({"imageset_indices": ["x"]})).is_err());
    }
}
