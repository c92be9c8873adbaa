// SPDX-License-Identifier: Apache-2.0
// Copyright © 2025 Au-Zone Technologies. All Rights Reserved.

//! Image sources of a collection.
//!
//! A version 1 collection carries its image fields at the root of the
//! collection record and always resolves to a single unnamed pseudo-source.
//! Version 2 and later declare an explicit `image_sources` list, each entry
//! with its own imageset and join table.

use crate::Error;
use log::warn;
use serde::Deserialize;
use std::collections::HashSet;

/// One image sequence within a collection.
///
/// Sources are immutable snapshots of the collection record; refreshing the
/// collection replaces them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Source {
    collection_id: String,
    index: usize,
    source_id: Option<String>,
    imageset_id: String,
    join_id: Option<String>,
    name: Option<String>,
}

impl Source {
    /// Id of the collection this source belongs to.
    pub fn collection_id(&self) -> &str {
        &self.collection_id
    }

    /// Position of the source in the collection's source list.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Server id, absent for the pseudo-source of a version 1 collection.
    pub fn id(&self) -> Option<&str> {
        self.source_id.as_deref()
    }

    pub fn imageset_id(&self) -> &str {
        &self.imageset_id
    }

    /// Dataset mapping row index to imageset index, when the collection has
    /// tabular data joined to its images.
    pub fn join_id(&self) -> Option<&str> {
        self.join_id.as_deref()
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// True for the implicit source of a version 1 collection.
    pub fn is_pseudo(&self) -> bool {
        self.source_id.is_none()
    }
}

impl std::fmt::Display for Source {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.name {
            Some(name) => write!(f, "{} ({})", name, self.imageset_id),
            None => write!(f, "{}", self.imageset_id),
        }
    }
}

/// Argument accepted wherever an operation targets a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceRef {
    Index(usize),
    Name(String),
    Source(Source),
}

impl Default for SourceRef {
    fn default() -> Self {
        SourceRef::Index(0)
    }
}

impl From<usize> for SourceRef {
    fn from(index: usize) -> Self {
        SourceRef::Index(index)
    }
}

impl From<&str> for SourceRef {
    fn from(name: &str) -> Self {
        SourceRef::Name(name.to_string())
    }
}

impl From<String> for SourceRef {
    fn from(name: String) -> Self {
        SourceRef::Name(name)
    }
}

impl From<Source> for SourceRef {
    fn from(source: Source) -> Self {
        SourceRef::Source(source)
    }
}

impl From<&Source> for SourceRef {
    fn from(source: &Source) -> Self {
        SourceRef::Source(source.clone())
    }
}

#[derive(Deserialize)]
struct SourceRecord {
    source_id: Option<String>,
    name: Option<String>,
    imageset_id: Option<String>,
    imageset_dataset_join_id: Option<String>,
}

/// The ordered, validated source list of one collection.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    collection_id: String,
    sources: Vec<Source>,
}

impl SourceRegistry {
    /// Builds the pseudo-source of a version 1 collection from the root
    /// record fields.
    pub(crate) fn from_v1(collection_id: &str, record: &serde_json::Value) -> Result<Self, Error> {
        let imageset_id = record
            .get("imageset_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                Error::MalformedRecord(format!("collection {} has no imageset_id", collection_id))
            })?;
        let join_id = record
            .get("imageset_dataset_join_id")
            .and_then(|v| v.as_str())
            .map(str::to_string);

        Ok(SourceRegistry {
            collection_id: collection_id.to_string(),
            sources: vec![Source {
                collection_id: collection_id.to_string(),
                index: 0,
                source_id: None,
                imageset_id: imageset_id.to_string(),
                join_id,
                name: None,
            }],
        })
    }

    /// Builds the explicit source list of a version 2 collection.
    ///
    /// The list must be non-empty, every entry needs a source id, a name and
    /// an imageset id, and ids and names are unique within the collection.
    pub(crate) fn from_v2(collection_id: &str, record: &serde_json::Value) -> Result<Self, Error> {
        let records: Vec<SourceRecord> = match record.get("image_sources") {
            Some(value) => serde_json::from_value(value.clone())?,
            None => Vec::new(),
        };

        if records.is_empty() {
            return Err(Error::MalformedRecord(format!(
                "collection {} declares no image sources",
                collection_id
            )));
        }

        let mut ids = HashSet::new();
        let mut names = HashSet::new();
        let mut sources = Vec::with_capacity(records.len());

        for (index, rec) in records.into_iter().enumerate() {
            let missing = |field: &str| {
                Error::MalformedRecord(format!(
                    "source #{} of collection {} has no {}",
                    index, collection_id, field
                ))
            };
            let source_id = rec.source_id.ok_or_else(|| missing("source_id"))?;
            let name = rec.name.ok_or_else(|| missing("name"))?;
            let imageset_id = rec.imageset_id.ok_or_else(|| missing("imageset_id"))?;

            if !ids.insert(source_id.clone()) {
                return Err(Error::MalformedRecord(format!(
                    "duplicate source id {} in collection {}",
                    source_id, collection_id
                )));
            }
            if !names.insert(name.clone()) {
                return Err(Error::MalformedRecord(format!(
                    "duplicate source name {} in collection {}",
                    name, collection_id
                )));
            }

            sources.push(Source {
                collection_id: collection_id.to_string(),
                index,
                source_id: Some(source_id),
                imageset_id,
                join_id: rec.imageset_dataset_join_id,
                name: Some(name),
            });
        }

        Ok(SourceRegistry {
            collection_id: collection_id.to_string(),
            sources,
        })
    }

    pub fn sources(&self) -> &[Source] {
        &self.sources
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    fn is_pseudo(&self) -> bool {
        self.sources.len() == 1 && self.sources[0].is_pseudo()
    }

    fn names(&self) -> String {
        self.sources
            .iter()
            .filter_map(|s| s.name())
            .collect::<Vec<_>>()
            .join(", ")
    }

    /// Normalizes a source argument into this collection's [`Source`].
    ///
    /// A version 1 collection ignores the argument and returns its
    /// pseudo-source.
    pub fn resolve(&self, source: impl Into<SourceRef>) -> Result<Source, Error> {
        let source = source.into();

        if self.is_pseudo() {
            if source != SourceRef::Index(0) {
                warn!(
                    "Collection {} has a single image source, ignoring source argument {:?}",
                    self.collection_id, source
                );
            }
            return Ok(self.sources[0].clone());
        }

        match source {
            SourceRef::Index(index) => self.sources.get(index).cloned().ok_or_else(|| {
                Error::OutOfRange(format!(
                    "source index {} for {} source(s)",
                    index,
                    self.sources.len()
                ))
            }),
            SourceRef::Name(name) => self
                .sources
                .iter()
                .find(|s| s.name() == Some(name.as_str()))
                .cloned()
                .ok_or_else(|| {
                    Error::NotFound(format!("source '{}', available: [{}]", name, self.names()))
                }),
            SourceRef::Source(handle) => {
                let belongs = handle.collection_id == self.collection_id;
                self.sources
                    .iter()
                    .find(|s| {
                        belongs
                            && (s.imageset_id == handle.imageset_id
                                || (s.source_id.is_some() && s.source_id == handle.source_id))
                    })
                    .cloned()
                    .ok_or_else(|| {
                        Error::ForeignSource(format!(
                            "source {} is not part of collection {}",
                            handle, self.collection_id
                        ))
                    })
            }
        }
    }
}
