//! Routing map files
//!
//! Host/path routes and SNI passthrough routes are expressed as key/value map
//! files the proxy looks up at request time. Maps are rebuilt every pass and
//! only pushed when their content changed.

use crate::proxy::api::{ApiError, ConfigApi};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Known map files
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum MapId {
    /// Hosts with at least one route
    Host,
    PathExact,
    PathPrefix,
    /// SNI hostname to backend, for SSL passthrough
    Sni,
}

impl MapId {
    pub const ALL: [MapId; 4] = [MapId::Host, MapId::PathExact, MapId::PathPrefix, MapId::Sni];

    pub const fn name(&self) -> &'static str {
        match self {
            MapId::Host => "host",
            MapId::PathExact => "path-exact",
            MapId::PathPrefix => "path-prefix",
            MapId::Sni => "sni",
        }
    }
}

type Entries = BTreeMap<String, String>;

/// Map file contents for the current pass and as last pushed
#[derive(Debug)]
pub struct MapFiles {
    dir: PathBuf,
    current: BTreeMap<MapId, Entries>,
    applied: BTreeMap<MapId, Entries>,
}

impl MapFiles {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            current: BTreeMap::new(),
            applied: BTreeMap::new(),
        }
    }

    /// Path of a map file as referenced from proxy expressions
    pub fn path(&self, map: MapId) -> PathBuf {
        self.dir.join(format!("{}.map", map.name()))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Start a new pass: forget current contents
    pub fn clean(&mut self) {
        self.current.clear();
    }

    pub fn insert(&mut self, map: MapId, key: impl Into<String>, value: impl Into<String>) {
        self.current
            .entry(map)
            .or_default()
            .insert(key.into(), value.into());
    }

    pub fn get(&self, map: MapId, key: &str) -> Option<&str> {
        self.current.get(&map)?.get(key).map(String::as_str)
    }

    /// Push every map whose content differs from the last push
    pub async fn refresh(&mut self, api: &dyn ConfigApi) -> Result<bool, ApiError> {
        let mut reload = false;
        for map in MapId::ALL {
            let current = self.current.get(&map).cloned().unwrap_or_default();
            let applied = self.applied.get(&map);
            let unchanged = match applied {
                Some(applied) => applied == &current,
                None => current.is_empty(),
            };
            if unchanged {
                continue;
            }
            let entries: Vec<(String, String)> = current
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            api.map_replace(map.name(), &entries).await?;
            debug!(map = map.name(), entries = entries.len(), "Map file updated");
            self.applied.insert(map, current);
            reload = true;
        }
        Ok(reload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::memory::MemoryConfigApi;

    #[test]
    fn test_map_path() {
        let maps = MapFiles::new("/etc/tollgate/maps");
        assert_eq!(
            maps.path(MapId::Sni),
            PathBuf::from("/etc/tollgate/maps/sni.map")
        );
    }

    #[tokio::test]
    async fn test_refresh_pushes_only_changes() {
        let api = MemoryConfigApi::new();
        let mut maps = MapFiles::new("/maps");

        maps.insert(MapId::Host, "example.com", "example.com");
        assert!(maps.refresh(&api).await.unwrap());
        assert_eq!(api.mutations(), 1);

        maps.clean();
        maps.insert(MapId::Host, "example.com", "example.com");
        assert!(!maps.refresh(&api).await.unwrap(), "same content must not reload");
        assert_eq!(api.mutations(), 1);

        maps.clean();
        assert!(maps.refresh(&api).await.unwrap(), "emptied map must be pushed");
        assert!(api.snapshot().maps["host"].is_empty());
    }
}
