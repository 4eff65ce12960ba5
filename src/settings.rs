//! Pipeline settings file.
//!
//! Settings live in a JSON file at `$HOME/.starmerge.json`, or wherever the
//! `STARMERGE_CONFIG` environment variable points. Every section is optional
//! and missing fields take their defaults:
//!
//! ```json
//! {
//!     "store_path": "data/survey.rkyv",
//!     "distance_units": "geography_meters",
//!     "accrete": { "r_tol_arcsec": 0.5 },
//!     "analyze": { "n_bootstrap": 500, "seed": 7 },
//!     "solve": { "basin_hopping": { "niter": 50 } }
//! }
//! ```

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;
use tracing::{info, warn};

use crate::compile::AccreteConfig;
use crate::geometry::{DistanceUnits, SkyGeometry};
use crate::intercal::{AnalyzeConfig, SolveConfig};
use crate::store::MemoryStore;

/// Environment variable overriding the settings file location.
pub const CONFIG_ENV: &str = "STARMERGE_CONFIG";

const DEFAULT_FILE_NAME: &str = ".starmerge.json";

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Store snapshot to open; `None` starts from an empty store.
    pub store_path: Option<PathBuf>,
    pub distance_units: DistanceUnits,
    pub accrete: AccreteConfig,
    pub analyze: AnalyzeConfig,
    pub solve: SolveConfig,
}

impl Settings {
    /// `$STARMERGE_CONFIG`, else `$HOME/.starmerge.json`.
    pub fn default_path() -> Option<PathBuf> {
        if let Ok(path) = std::env::var(CONFIG_ENV) {
            return Some(PathBuf::from(path));
        }
        std::env::var("HOME")
            .ok()
            .map(|home| Path::new(&home).join(DEFAULT_FILE_NAME))
    }

    /// Read settings from the default location.
    pub fn load() -> anyhow::Result<Self> {
        match Self::default_path() {
            Some(path) => Self::read(path),
            None => {
                warn!("No settings location ({} and HOME unset), using defaults", CONFIG_ENV);
                Ok(Self::default())
            }
        }
    }

    /// Read settings from `path`. A missing file yields the defaults.
    pub fn read<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                warn!("{} config file not found, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(e) => {
                return Err(e).with_context(|| format!("reading {}", path.display()));
            }
        };
        let settings: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing settings file {}", path.display()))?;
        info!("Loaded settings from {}", path.display());
        Ok(settings)
    }

    pub fn geometry(&self) -> SkyGeometry {
        SkyGeometry::new(self.distance_units)
    }

    /// Load the configured store snapshot, or start an empty store when no
    /// snapshot is configured or the file does not exist yet.
    pub fn open_store(&self) -> anyhow::Result<MemoryStore> {
        match &self.store_path {
            Some(path) if path.exists() => MemoryStore::load_from_file(path),
            Some(path) => {
                info!("{} does not exist yet, starting an empty store", path.display());
                Ok(MemoryStore::new())
            }
            None => Ok(MemoryStore::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_file(name: &str, contents: &str) -> PathBuf {
        let path = std::env::temp_dir().join(format!("starmerge-{}-{}", std::process::id(), name));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn partial_file_fills_defaults() {
        let path = temp_file(
            "partial.json",
            r#"{
                "distance_units": "geography_meters",
                "accrete": {"r_tol_arcsec": 0.5, "no_new": true},
                "analyze": {"seed": 7},
                "solve": {"basin_hopping": {"niter": 20}}
            }"#,
        );
        let settings = Settings::read(&path).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(settings.distance_units, DistanceUnits::GeographyMeters);
        assert_eq!(settings.accrete.r_tol_arcsec, 0.5);
        assert!(settings.accrete.no_new);
        assert_eq!(settings.accrete.commit_every, AccreteConfig::default().commit_every);
        assert_eq!(settings.analyze.seed, Some(7));
        assert_eq!(settings.analyze.n_bootstrap, 1000);
        assert_eq!(settings.solve.basin_hopping.niter, 20);
        assert_eq!(settings.solve.basin_hopping.stepsize, 0.1);
        assert_eq!(settings.solve.z0_sigma, 0.2);
        assert!(settings.store_path.is_none());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let path = std::env::temp_dir().join("starmerge-does-not-exist.json");
        let settings = Settings::read(&path).unwrap();
        assert_eq!(settings, Settings::default());
        assert!(settings.open_store().unwrap().catalog_count() == 0);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let path = temp_file("bad.json", "{ not json");
        let err = Settings::read(&path).unwrap_err();
        std::fs::remove_file(&path).unwrap();
        assert!(format!("{err:#}").contains("parsing settings file"));
    }
}
