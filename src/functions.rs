//! # Named Filters and Transforms
//!
//! A subscriber group may carry a filter (which elements it sees) and a
//! transform (what value it sees). Subscriptions are persisted, so they
//! store the *name* of the function, and the topic resolves names through a
//! [`FunctionRegistry`] shared by every partition.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};
use crate::model::Element;

/// Decides whether a group sees an element.
pub type ElementFilter = Arc<dyn Fn(&Element) -> bool + Send + Sync>;

/// Maps a value before delivery. `None` drops the element.
pub type ValueTransform = Arc<dyn Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync>;

/// Filters and transforms by name.
#[derive(Clone, Default)]
pub struct FunctionRegistry {
    filters: HashMap<String, ElementFilter>,
    transforms: HashMap<String, ValueTransform>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_filter<F>(&mut self, name: impl Into<String>, filter: F) -> &mut Self
    where
        F: Fn(&Element) -> bool + Send + Sync + 'static,
    {
        self.filters.insert(name.into(), Arc::new(filter));
        self
    }

    pub fn register_transform<F>(&mut self, name: impl Into<String>, transform: F) -> &mut Self
    where
        F: Fn(&[u8]) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.transforms.insert(name.into(), Arc::new(transform));
        self
    }

    pub fn filter(&self, name: Option<&str>) -> Result<Option<ElementFilter>> {
        match name {
            None => Ok(None),
            Some(name) => self
                .filters
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| Error::UnknownFunction(name.to_string())),
        }
    }

    pub fn transform(&self, name: Option<&str>) -> Result<Option<ValueTransform>> {
        match name {
            None => Ok(None),
            Some(name) => self
                .transforms
                .get(name)
                .cloned()
                .map(Some)
                .ok_or_else(|| Error::UnknownFunction(name.to_string())),
        }
    }

    /// Fails if either name is given but unregistered.
    pub fn check(&self, filter: Option<&str>, transform: Option<&str>) -> Result<()> {
        self.filter(filter)?;
        self.transform(transform)?;
        Ok(())
    }
}

impl fmt::Debug for FunctionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut filters: Vec<_> = self.filters.keys().collect();
        let mut transforms: Vec<_> = self.transforms.keys().collect();
        filters.sort();
        transforms.sort();
        f.debug_struct("FunctionRegistry")
            .field("filters", &filters)
            .field("transforms", &transforms)
            .finish()
    }
}
