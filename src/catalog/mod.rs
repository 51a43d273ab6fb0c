//! Schema catalog: resource descriptors keyed by name.
//!
//! The catalog contents are supplied externally (a YAML file of
//! descriptors); this module only loads and indexes them. Multiple
//! versions of the same resource name may coexist.

pub mod descriptor;

pub use descriptor::{DeclaredType, FieldDef, ResourceDescriptor, ScalarKind, SubTableDef};

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use snafu::ResultExt;

use crate::error::{CatalogParseSnafu, CatalogReadSnafu, CatalogError};

/// Index of resource descriptors by name.
#[derive(Debug, Default)]
pub struct Catalog {
    resources: HashMap<String, Vec<Arc<ResourceDescriptor>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a catalog from a YAML file containing a list of descriptors.
    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let display = path.display().to_string();
        let contents = std::fs::read_to_string(path).context(CatalogReadSnafu {
            path: display.clone(),
        })?;
        let descriptors: Vec<ResourceDescriptor> =
            serde_yaml::from_str(&contents).context(CatalogParseSnafu { path: display })?;

        let mut catalog = Self::new();
        for descriptor in descriptors {
            catalog.insert(descriptor);
        }
        Ok(catalog)
    }

    pub fn insert(&mut self, descriptor: ResourceDescriptor) {
        self.resources
            .entry(descriptor.name.clone())
            .or_default()
            .push(Arc::new(descriptor));
    }

    /// Look up a descriptor by name, optionally pinning the version.
    ///
    /// Without a version the newest (last inserted) descriptor wins.
    pub fn get(&self, name: &str, version: Option<&str>) -> Option<Arc<ResourceDescriptor>> {
        let versions = self.resources.get(name)?;
        match version {
            Some(v) => versions.iter().find(|d| d.version == v).cloned(),
            None => versions.last().cloned(),
        }
    }

    /// All descriptors, in arbitrary order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<ResourceDescriptor>> {
        self.resources.values().flatten()
    }

    pub fn len(&self) -> usize {
        self.resources.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.resources.is_empty()
    }
}
