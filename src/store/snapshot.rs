//! On-disk snapshots of a committed [`MemoryStore`], encoded with rkyv.

use std::path::Path;

use anyhow::Context;
use rkyv::{Archive, Deserialize, Serialize};
use tracing::info;

use super::memory::IdCounters;
use super::{
    Bandpass, BandpassId, Catalog, CatalogId, CatalogStar, CatalogStarId, CatalogStore, EdgeId,
    IntercalEdge, MemoryStore, Observation, Star, StarId,
};
use crate::error::Error;
use crate::geometry::{Footprint, SkyPoint};
use crate::meta::Metadata;

const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
struct CatalogRow {
    id: u64,
    name: String,
    instrument: String,
    /// Closed polygon rings, `[ra, dec]` vertices.
    footprint: Vec<Vec<[f64; 2]>>,
    /// Metadata as JSON text.
    meta: String,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
struct BandpassRow {
    id: u64,
    name: String,
    system: String,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
struct CatalogStarRow {
    id: u64,
    catalog: u64,
    x: f64,
    y: f64,
    ra: f64,
    dec: f64,
    cfrac: f64,
    star: Option<u64>,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
struct ObservationRow {
    catalog_star: u64,
    bandpass: u64,
    mag: f64,
    mag_err: f64,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
struct StarRow {
    id: u64,
    ra: f64,
    dec: f64,
    origin: u64,
}

#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
struct EdgeRow {
    id: u64,
    from: u64,
    to: u64,
    bandpass: u64,
    delta: Option<f64>,
    delta_err: Option<f64>,
}

/// Flat, serializable image of every table plus the ID counters.
#[derive(Debug, Clone, Archive, Serialize, Deserialize)]
struct StoreSnapshot {
    version: u32,
    /// catalog, catalog star, star, bandpass, edge.
    next_ids: [u64; 5],
    catalogs: Vec<CatalogRow>,
    bandpasses: Vec<BandpassRow>,
    catalog_stars: Vec<CatalogStarRow>,
    observations: Vec<ObservationRow>,
    stars: Vec<StarRow>,
    edges: Vec<EdgeRow>,
}

impl StoreSnapshot {
    fn capture(store: &MemoryStore) -> Self {
        let n = store.next_ids;
        Self {
            version: SNAPSHOT_VERSION,
            next_ids: [n.catalog, n.catalog_star, n.star, n.bandpass, n.edge],
            catalogs: store
                .catalogs
                .values()
                .map(|c| CatalogRow {
                    id: c.id.0,
                    name: c.name.clone(),
                    instrument: c.instrument.clone(),
                    footprint: c
                        .footprint
                        .vertex_lists()
                        .into_iter()
                        .map(|ring| ring.into_iter().map(|(ra, dec)| [ra, dec]).collect())
                        .collect(),
                    meta: c.meta.to_json(),
                })
                .collect(),
            bandpasses: store
                .bandpasses
                .values()
                .map(|b| BandpassRow {
                    id: b.id.0,
                    name: b.name.clone(),
                    system: b.system.clone(),
                })
                .collect(),
            catalog_stars: store
                .catalog_stars
                .values()
                .map(|cs| CatalogStarRow {
                    id: cs.id.0,
                    catalog: cs.catalog.0,
                    x: cs.x,
                    y: cs.y,
                    ra: cs.coord.ra,
                    dec: cs.coord.dec,
                    cfrac: cs.cfrac,
                    star: cs.star.map(|s| s.0),
                })
                .collect(),
            observations: store
                .observations
                .values()
                .map(|o| ObservationRow {
                    catalog_star: o.catalog_star.0,
                    bandpass: o.bandpass.0,
                    mag: o.mag,
                    mag_err: o.mag_err,
                })
                .collect(),
            stars: store
                .stars
                .values()
                .map(|s| StarRow {
                    id: s.id.0,
                    ra: s.coord.ra,
                    dec: s.coord.dec,
                    origin: s.origin.0,
                })
                .collect(),
            edges: store
                .edges
                .values()
                .map(|e| EdgeRow {
                    id: e.id.0,
                    from: e.from.0,
                    to: e.to.0,
                    bandpass: e.bandpass.0,
                    delta: e.delta,
                    delta_err: e.delta_err,
                })
                .collect(),
        }
    }

    fn restore(self) -> crate::error::Result<MemoryStore> {
        let mut store = MemoryStore::new();
        let [catalog, catalog_star, star, bandpass, edge] = self.next_ids;
        store.next_ids = IdCounters {
            catalog,
            catalog_star,
            star,
            bandpass,
            edge,
        };

        for row in self.catalogs {
            let rings: Vec<Vec<(f64, f64)>> = row
                .footprint
                .into_iter()
                .map(|ring| ring.into_iter().map(|[ra, dec]| (ra, dec)).collect())
                .collect();
            store.raw_put_catalog(Catalog {
                id: CatalogId(row.id),
                name: row.name,
                instrument: row.instrument,
                footprint: Footprint::from_vertex_lists(&rings)?,
                meta: Metadata::from_json(&row.meta)?,
            });
        }
        for row in self.bandpasses {
            store.raw_put_bandpass(Bandpass {
                id: BandpassId(row.id),
                name: row.name,
                system: row.system,
            });
        }
        // Stars go in before catalog stars so links resolve.
        for row in self.stars {
            store.raw_put_star(Star {
                id: StarId(row.id),
                coord: SkyPoint::new(row.ra, row.dec),
                origin: CatalogStarId(row.origin),
            });
        }
        for row in self.catalog_stars {
            store.raw_put_catalog_star(CatalogStar {
                id: CatalogStarId(row.id),
                catalog: CatalogId(row.catalog),
                x: row.x,
                y: row.y,
                coord: SkyPoint::checked(row.ra, row.dec)?,
                cfrac: row.cfrac,
                star: row.star.map(StarId),
            });
        }
        for row in self.observations {
            let obs = Observation {
                catalog_star: CatalogStarId(row.catalog_star),
                bandpass: BandpassId(row.bandpass),
                mag: row.mag,
                mag_err: row.mag_err,
            };
            store
                .observations
                .insert((obs.catalog_star, obs.bandpass), obs);
        }
        for row in self.edges {
            store.raw_put_edge(IntercalEdge {
                id: EdgeId(row.id),
                from: CatalogId(row.from),
                to: CatalogId(row.to),
                bandpass: BandpassId(row.bandpass),
                delta: row.delta,
                delta_err: row.delta_err,
            });
        }
        Ok(store)
    }
}

// ── Serialization ───────────────────────────────────────────────────────────

impl MemoryStore {
    /// Serialize the committed store to bytes using rkyv.
    pub fn to_rkyv_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let pending = self.pending_changes();
        if pending > 0 {
            return Err(Error::UncommittedChanges(pending).into());
        }
        let bytes = rkyv::to_bytes::<rkyv::rancor::Error>(&StoreSnapshot::capture(self))
            .map_err(|e| anyhow::anyhow!("rkyv serialization failed: {}", e))?;
        Ok(bytes.to_vec())
    }

    /// Rebuild a store from bytes produced by [`MemoryStore::to_rkyv_bytes`].
    pub fn from_rkyv_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let snapshot = rkyv::from_bytes::<StoreSnapshot, rkyv::rancor::Error>(bytes)
            .map_err(|e| anyhow::anyhow!("rkyv deserialization failed: {}", e))?;
        if snapshot.version != SNAPSHOT_VERSION {
            anyhow::bail!(
                "unsupported snapshot version {} (expected {})",
                snapshot.version,
                SNAPSHOT_VERSION
            );
        }
        Ok(snapshot.restore()?)
    }

    /// Save the store to a file. Fails if there are uncommitted changes.
    pub fn save_to_file(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let path = path.as_ref();
        let bytes = self.to_rkyv_bytes()?;
        std::fs::write(path, &bytes)
            .with_context(|| format!("writing snapshot {}", path.display()))?;
        info!("Saved store to {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Load a store from an rkyv snapshot file.
    pub fn load_from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let bytes =
            std::fs::read(path).with_context(|| format!("reading snapshot {}", path.display()))?;
        let store = Self::from_rkyv_bytes(&bytes)?;
        info!(
            "Loaded store: {} catalogs, {} catalog stars, {} stars, {} edges",
            store.catalog_count(),
            store.catalog_star_count(),
            store.star_count(),
            store.edge_count()
        );
        Ok(store)
    }
}
