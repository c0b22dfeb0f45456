//! Route table: URL path to function or asset.
//!
//! [`RouteTable`] indexes the project's [`Resources`] by public path. Lookups
//! are exact-match; there are no patterns because every resource owns exactly
//! one path.
//!
//! The table is replaced wholesale by [`RouteTable::set_routes`]: a new map is
//! built off to the side and swapped in only once it is known to be valid, so
//! a reader sees either the old table or the new one, never a mix. Readers
//! hold on to the [`Arc`] snapshot they took, which keeps an in-flight request
//! on the table it started with even if a reload lands meanwhile.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, PoisonError, RwLock};

use thiserror::Error;
use tracing::debug;

use crate::resources::{ResourceDescriptor, Resources};

/// Whether a route serves a function or a static asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteKind {
    Function,
    Asset,
}

impl fmt::Display for RouteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Function => "function",
            Self::Asset => "asset",
        })
    }
}

/// A [`ResourceDescriptor`] tagged with its [`RouteKind`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteEntry {
    pub kind: RouteKind,
    pub resource: ResourceDescriptor,
}

impl RouteEntry {
    pub fn path(&self) -> &str {
        &self.resource.path
    }
}

/// Errors produced while building the route table.
#[derive(Debug, Error)]
pub enum RouteError {
    #[error("duplicate route {path}: {first} and {second} both claim it")]
    DuplicatePath {
        path: String,
        first: RouteKind,
        second: RouteKind,
    },
}

/// Immutable route map shared with readers.
pub type RouteMap = HashMap<String, RouteEntry>;

/// The in-memory index of every routable resource.
///
/// # Examples
///
/// ```
/// use twilio_run::resources::{ResourceDescriptor, Resources};
/// use twilio_run::router::{RouteKind, RouteTable};
///
/// let table = RouteTable::new();
/// table
///     .set_routes(Resources::new(
///         vec![ResourceDescriptor::new("/hello", "/project/functions/hello.sh")],
///         vec![ResourceDescriptor::new("/style.css", "/project/assets/style.css")],
///     ))
///     .unwrap();
///
/// assert_eq!(table.lookup("/hello").unwrap().kind, RouteKind::Function);
/// assert_eq!(table.get_routes().len(), 2);
/// ```
#[derive(Debug, Default)]
pub struct RouteTable {
    routes: RwLock<Arc<RouteMap>>,
    resources: RwLock<Arc<Resources>>,
}

impl RouteTable {
    /// Creates an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the table with one built from `resources`.
    ///
    /// # Errors
    ///
    /// Returns [`RouteError::DuplicatePath`] if two descriptors claim the same
    /// path. The previous table stays in place in that case.
    pub fn set_routes(&self, resources: Resources) -> Result<(), RouteError> {
        let routes = build_route_map(&resources)?;
        debug!(routes = routes.len(), "route table rebuilt");

        let routes = Arc::new(routes);
        let resources = Arc::new(resources);
        // Both locks are held for the swap so readers of either view agree.
        let mut routes_slot = self.routes.write().unwrap_or_else(PoisonError::into_inner);
        let mut resources_slot = self
            .resources
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *routes_slot = routes;
        *resources_slot = resources;
        Ok(())
    }

    /// Returns a point-in-time snapshot of the table.
    pub fn get_routes(&self) -> Arc<RouteMap> {
        Arc::clone(&self.routes.read().unwrap_or_else(PoisonError::into_inner))
    }

    /// Looks up the route registered for `path`.
    pub fn lookup(&self, path: &str) -> Option<RouteEntry> {
        self.get_routes().get(path).cloned()
    }

    /// Returns the raw descriptor lists of the last successful
    /// [`set_routes`](Self::set_routes).
    pub fn get_cached_resources(&self) -> Arc<Resources> {
        Arc::clone(&self.resources.read().unwrap_or_else(PoisonError::into_inner))
    }
}

fn build_route_map(resources: &Resources) -> Result<RouteMap, RouteError> {
    let tagged = resources
        .functions
        .iter()
        .map(|resource| (RouteKind::Function, resource))
        .chain(resources.assets.iter().map(|resource| (RouteKind::Asset, resource)));

    let mut routes = RouteMap::with_capacity(resources.functions.len() + resources.assets.len());
    for (kind, resource) in tagged {
        if let Some(existing) = routes.get(&resource.path) {
            return Err(RouteError::DuplicatePath {
                path: resource.path.clone(),
                first: existing.kind,
                second: kind,
            });
        }
        routes.insert(
            resource.path.clone(),
            RouteEntry {
                kind,
                resource: resource.clone(),
            },
        );
    }
    Ok(routes)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn function(path: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(path, format!("/project/functions{path}.sh"))
    }

    fn asset(path: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(path, format!("/project/assets{path}"))
    }

    #[test]
    fn starts_empty() {
        let table = RouteTable::new();
        assert!(table.get_routes().is_empty());
        assert!(table.get_cached_resources().is_empty());
        assert!(table.lookup("/").is_none());
    }

    #[test]
    fn registers_functions_and_assets() {
        let table = RouteTable::new();
        table
            .set_routes(Resources::new(vec![function("/sms")], vec![asset("/a.txt")]))
            .unwrap();

        assert_eq!(table.lookup("/sms").unwrap().kind, RouteKind::Function);
        assert_eq!(table.lookup("/a.txt").unwrap().kind, RouteKind::Asset);
        assert_eq!(table.lookup("/a.txt").unwrap().path(), "/a.txt");
    }

    #[test]
    fn duplicate_between_function_and_asset_fails() {
        let table = RouteTable::new();
        let err = table
            .set_routes(Resources::new(vec![function("/x")], vec![asset("/x")]))
            .unwrap_err();
        assert!(matches!(
            err,
            RouteError::DuplicatePath { ref path, first: RouteKind::Function, second: RouteKind::Asset }
                if path == "/x"
        ));
    }

    #[test]
    fn duplicate_within_functions_fails() {
        let table = RouteTable::new();
        let result = table.set_routes(Resources::new(vec![function("/x"), function("/x")], vec![]));
        assert!(result.is_err());
    }

    #[test]
    fn failed_rebuild_keeps_previous_table() {
        let table = RouteTable::new();
        table
            .set_routes(Resources::new(vec![function("/keep")], vec![]))
            .unwrap();
        let _ = table.set_routes(Resources::new(vec![function("/x")], vec![asset("/x")]));

        assert!(table.lookup("/keep").is_some());
        assert_eq!(table.get_cached_resources().functions[0].path, "/keep");
    }

    #[test]
    fn rebuild_replaces_rather_than_merges() {
        let table = RouteTable::new();
        table
            .set_routes(Resources::new(vec![function("/old")], vec![]))
            .unwrap();
        table
            .set_routes(Resources::new(vec![function("/new")], vec![]))
            .unwrap();

        assert!(table.lookup("/old").is_none());
        assert!(table.lookup("/new").is_some());
    }

    #[test]
    fn snapshot_survives_reload() {
        let table = RouteTable::new();
        table
            .set_routes(Resources::new(vec![function("/first")], vec![]))
            .unwrap();
        let snapshot = table.get_routes();

        table
            .set_routes(Resources::new(vec![function("/second")], vec![]))
            .unwrap();

        assert!(snapshot.contains_key("/first"));
        assert!(!snapshot.contains_key("/second"));
        assert!(table.get_routes().contains_key("/second"));
    }
}
