//! Decides whether a worker acts on an asset at all.

use crate::asset::Asset;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Accept,
    /// No candidate address to connect to.
    Unroutable,
    /// Location tag outside the managed set.
    UnmanagedLocation(String),
}

#[derive(Debug, Clone, Default)]
pub struct LocationFilter {
    locations: Vec<String>,
    ignore_location: bool,
}

impl LocationFilter {
    #[must_use]
    pub fn new(locations: Vec<String>, ignore_location: bool) -> Self {
        Self {
            locations,
            ignore_location,
        }
    }

    /// Assets without a location tag are always managed.
    #[must_use]
    pub fn evaluate(&self, asset: &Asset) -> FilterDecision {
        if !asset.is_routable() {
            return FilterDecision::Unroutable;
        }
        if self.ignore_location || asset.location.is_empty() {
            return FilterDecision::Accept;
        }
        if self.locations.iter().any(|l| l == &asset.location) {
            FilterDecision::Accept
        } else {
            FilterDecision::UnmanagedLocation(asset.location.clone())
        }
    }
}
