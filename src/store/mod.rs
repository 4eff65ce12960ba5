//! Catalog storage: entity records, the [`CatalogStore`] seam, and the
//! bundled [`MemoryStore`].
//!
//! Entities are plain tagged records with newtype IDs:
//!
//! - [`Catalog`]: a named observational catalog with a sky footprint and metadata
//! - [`CatalogStar`]: one detection in a catalog, optionally linked to a master [`Star`]
//! - [`Observation`]: one magnitude of a catalog star in one [`Bandpass`]
//! - [`Star`]: a catalog-independent source created by accretion
//! - [`IntercalEdge`]: a pairwise zero-point comparison between two catalogs
//!
//! Catalog and bandpass rows are get-or-create by their natural key (see
//! [`Unique`]). Writes are buffered until [`CatalogStore::commit`]; a
//! [`CatalogStore::rollback`] discards everything since the last commit.

mod memory;
mod snapshot;

use std::fmt;

use crate::error::Result;
use crate::geometry::{Footprint, SkyPoint};
use crate::meta::Metadata;

pub use memory::MemoryStore;

macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name(pub u64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "#{}", self.0)
            }
        }
    };
}

entity_id!(
    /// Identifier of a [`Catalog`].
    CatalogId
);
entity_id!(
    /// Identifier of a [`CatalogStar`].
    CatalogStarId
);
entity_id!(
    /// Identifier of a master [`Star`].
    StarId
);
entity_id!(BandpassId);
entity_id!(EdgeId);

/// An entity with a natural key used for get-or-create semantics.
pub trait Unique {
    type Key: Eq + std::hash::Hash + Clone + fmt::Debug;

    fn natural_key(&self) -> Self::Key;
}

/// An observational source catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct Catalog {
    pub id: CatalogId,
    pub name: String,
    pub instrument: String,
    pub footprint: Footprint,
    pub meta: Metadata,
}

impl Unique for Catalog {
    type Key = (String, String);

    fn natural_key(&self) -> Self::Key {
        (self.name.clone(), self.instrument.clone())
    }
}

impl fmt::Display for Catalog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}/{}", self.id, self.name, self.instrument)
    }
}

/// Fields of a catalog to create.
#[derive(Debug, Clone)]
pub struct NewCatalog {
    pub name: String,
    pub instrument: String,
    pub footprint: Footprint,
    pub meta: Metadata,
}

/// A photometric bandpass in a named system (e.g. `V` in `Vega`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Bandpass {
    pub id: BandpassId,
    pub name: String,
    pub system: String,
}

impl Unique for Bandpass {
    type Key = (String, String);

    fn natural_key(&self) -> Self::Key {
        (self.name.clone(), self.system.clone())
    }
}

/// A detection in one catalog.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogStar {
    pub id: CatalogStarId,
    pub catalog: CatalogId,
    pub x: f64,
    pub y: f64,
    pub coord: SkyPoint,
    /// Completeness fraction of the detection in this catalog.
    pub cfrac: f64,
    pub star: Option<StarId>,
}

/// Fields of a catalog star to insert. Coordinates are validated on construction.
#[derive(Debug, Clone, PartialEq)]
pub struct NewCatalogStar {
    x: f64,
    y: f64,
    coord: SkyPoint,
    cfrac: f64,
}

impl NewCatalogStar {
    /// Fails with [`crate::Error::InvalidCoordinate`] unless ra ∈ [0, 360]
    /// and dec ∈ [-90, 90].
    pub fn new(x: f64, y: f64, ra: f64, dec: f64, cfrac: f64) -> Result<Self> {
        Ok(Self {
            x,
            y,
            coord: SkyPoint::checked(ra, dec)?,
            cfrac,
        })
    }

    pub fn coord(&self) -> SkyPoint {
        self.coord
    }
}

/// One magnitude measurement of a catalog star in one bandpass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Observation {
    pub catalog_star: CatalogStarId,
    pub bandpass: BandpassId,
    pub mag: f64,
    pub mag_err: f64,
}

/// A master star. Position is copied from the catalog star that created it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Star {
    pub id: StarId,
    pub coord: SkyPoint,
    pub origin: CatalogStarId,
}

/// A directed zero-point comparison between two overlapping catalogs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IntercalEdge {
    pub id: EdgeId,
    pub from: CatalogId,
    pub to: CatalogId,
    pub bandpass: BandpassId,
    pub delta: Option<f64>,
    pub delta_err: Option<f64>,
}

impl IntercalEdge {
    /// `true` until the edge analyzer has stored an offset.
    pub fn is_pending(&self) -> bool {
        self.delta.is_none() || self.delta_err.is_none()
    }

    /// `true` if an edge `from → to` or its reverse exists in this bandpass.
    pub fn edge_exists<S: CatalogStore + ?Sized>(
        store: &S,
        from: CatalogId,
        to: CatalogId,
        bandpass: BandpassId,
    ) -> bool {
        store.find_edge(from, to, bandpass).is_some()
            || store.find_edge(to, from, bandpass).is_some()
    }
}

/// Storage capabilities consumed by accretion and inter-calibration.
///
/// All writes go to a pending batch that becomes durable on [`commit`].
///
/// [`commit`]: CatalogStore::commit
pub trait CatalogStore {
    // ── Catalogs ────────────────────────────────────────────────────────

    /// Return the catalog with this (name, instrument), creating it from
    /// `new` if absent. The boolean is `true` when a row was created.
    fn find_or_create_catalog(&mut self, new: NewCatalog) -> Result<(CatalogId, bool)>;

    fn find_catalog(&self, name: &str, instrument: &str) -> Option<CatalogId>;

    fn catalog(&self, id: CatalogId) -> Result<&Catalog>;

    /// All catalog IDs, ascending.
    fn catalog_ids(&self) -> Vec<CatalogId>;

    fn set_catalog_meta(&mut self, id: CatalogId, meta: Metadata) -> Result<()>;

    fn set_catalog_footprint(&mut self, id: CatalogId, footprint: Footprint) -> Result<()>;

    /// Delete a catalog with its catalog stars, their observations and every
    /// intercal edge naming it. Stars that referenced its catalog stars are
    /// unlinked from them but kept.
    fn delete_catalog(&mut self, id: CatalogId) -> Result<()>;

    // ── Bandpasses ──────────────────────────────────────────────────────

    fn find_or_create_bandpass(&mut self, name: &str, system: &str) -> Result<BandpassId>;

    fn find_bandpass(&self, name: &str, system: &str) -> Option<BandpassId>;

    fn bandpass(&self, id: BandpassId) -> Result<&Bandpass>;

    // ── Catalog stars and observations ──────────────────────────────────

    /// Bulk-insert catalog stars; returns their IDs in input order.
    fn insert_catalog_stars(
        &mut self,
        catalog: CatalogId,
        stars: Vec<NewCatalogStar>,
    ) -> Result<Vec<CatalogStarId>>;

    /// Bulk-insert observations. A second observation of the same star in
    /// the same bandpass replaces the first.
    fn insert_observations(&mut self, observations: Vec<Observation>) -> Result<()>;

    fn catalog_star(&self, id: CatalogStarId) -> Result<&CatalogStar>;

    /// Catalog star IDs of a catalog, ascending.
    fn catalog_star_ids(&self, catalog: CatalogId) -> Result<Vec<CatalogStarId>>;

    fn observation(&self, star: CatalogStarId, bandpass: BandpassId) -> Option<&Observation>;

    /// Catalogs with at least one observation in `bandpass`, ascending.
    fn catalogs_observed_in(&self, bandpass: BandpassId) -> Vec<CatalogId>;

    // ── Master stars ────────────────────────────────────────────────────

    /// Create a star positioned at `origin`'s coordinates and link `origin` to it.
    fn create_star_from(&mut self, origin: CatalogStarId) -> Result<StarId>;

    fn star(&self, id: StarId) -> Result<&Star>;

    fn star_count(&self) -> usize;

    /// Candidate stars within `radius_deg` of `center`, nearest first.
    fn stars_near(&self, center: SkyPoint, radius_deg: f64) -> Vec<StarId>;

    /// Link a catalog star to a master star.
    fn link_catalog_star(&mut self, catalog_star: CatalogStarId, star: StarId) -> Result<()>;

    /// Catalog stars linked to a master star.
    fn star_members(&self, star: StarId) -> Result<&[CatalogStarId]>;

    /// Catalogs with at least one catalog star linked to a master star, ascending.
    fn compiled_catalog_ids(&self) -> Vec<CatalogId>;

    /// Delete these stars and clear every link to them.
    fn delete_stars(&mut self, stars: &[StarId]) -> Result<()>;

    /// Delete every star and clear every link.
    fn clear_stars(&mut self) -> Result<()>;

    // ── Intercal edges ──────────────────────────────────────────────────

    /// Insert a pending edge. Fails if it (or its reverse) already exists.
    fn insert_edge(&mut self, from: CatalogId, to: CatalogId, bandpass: BandpassId)
        -> Result<EdgeId>;

    /// The directed edge `from → to` in `bandpass`, if stored.
    fn find_edge(&self, from: CatalogId, to: CatalogId, bandpass: BandpassId) -> Option<EdgeId>;

    fn edge(&self, id: EdgeId) -> Result<&IntercalEdge>;

    /// Edges of a bandpass, ascending by ID.
    fn edges(&self, bandpass: BandpassId) -> Vec<IntercalEdge>;

    fn set_edge_delta(&mut self, id: EdgeId, delta: f64, delta_err: f64) -> Result<()>;

    fn delete_edge(&mut self, id: EdgeId) -> Result<()>;

    // ── Transactions ────────────────────────────────────────────────────

    /// Make all pending writes durable.
    fn commit(&mut self) -> Result<()>;

    /// Discard all writes since the last commit.
    fn rollback(&mut self) -> Result<()>;

    /// Number of pending (uncommitted) write operations.
    fn pending_changes(&self) -> usize;
}
