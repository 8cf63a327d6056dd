//! Optional local Steam app-list cache (`steam_apps_pretty.json`). When the
//! file is present, adapters can resolve appid -> display name without a
//! network round-trip. The blob is read streamingly off disk; absence is
//! not an error.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use tracing::info;

#[derive(Debug, Deserialize)]
struct AppEntry {
    appid: u64,
    name: String,
}

#[derive(Debug, Deserialize)]
struct AppList {
    apps: Vec<AppEntry>,
}

#[derive(Debug, Deserialize)]
struct SteamAppsDoc {
    applist: AppList,
}

#[derive(Debug, Default)]
pub struct SteamAppIndex {
    by_id: HashMap<u64, String>,
}

impl SteamAppIndex {
    /// Load the cache file. Missing file yields an empty index.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
        let doc: SteamAppsDoc = serde_json::from_reader(BufReader::new(file))
            .with_context(|| format!("parsing {}", path.display()))?;
        let by_id: HashMap<u64, String> = doc
            .applist
            .apps
            .into_iter()
            .filter(|a| !a.name.trim().is_empty())
            .map(|a| (a.appid, a.name))
            .collect();
        info!(apps = by_id.len(), "loaded steam app index");
        Ok(Self { by_id })
    }

    pub fn name_for(&self, appid: u64) -> Option<&str> {
        self.by_id.get(&appid).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_applist_shape() {
        let doc: SteamAppsDoc = serde_json::from_str(
            r#"{"applist":{"apps":[{"appid":620,"name":"Portal 2"},{"appid":1,"name":" "}]}}"#,
        )
        .unwrap();
        let idx = SteamAppIndex {
            by_id: doc
                .applist
                .apps
                .into_iter()
                .filter(|a| !a.name.trim().is_empty())
                .map(|a| (a.appid, a.name))
                .collect(),
        };
        assert_eq!(idx.name_for(620), Some("Portal 2"));
        assert_eq!(idx.name_for(1), None);
        assert_eq!(idx.len(), 1);
    }

    #[test]
    fn missing_file_is_an_empty_index() {
        let idx = SteamAppIndex::load(Path::new("/nonexistent/steam_apps_pretty.json")).unwrap();
        assert!(idx.is_empty());
    }
}
