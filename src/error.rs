use thiserror::Error;

use crate::store::{BandpassId, CatalogId, CatalogStarId, EdgeId, StarId};

/// Errors produced by catalog storage, accretion and inter-calibration.
#[derive(Error, Debug)]
pub enum Error {
    /// Sky coordinates outside ra ∈ [0, 360], dec ∈ [-90, 90] (or non-finite).
    #[error("invalid sky coordinate: ra={ra}, dec={dec}")]
    InvalidCoordinate {
        /// Right ascension, degrees.
        ra: f64,
        /// Declination, degrees.
        dec: f64,
    },

    /// A footprint polygon could not be built.
    #[error("invalid footprint: {0}")]
    InvalidFootprint(String),

    #[error("catalog {0} not found")]
    CatalogNotFound(CatalogId),

    #[error("catalog {name}/{instrument} not found")]
    CatalogNameNotFound { name: String, instrument: String },

    #[error("catalog star {0} not found")]
    CatalogStarNotFound(CatalogStarId),

    #[error("star {0} not found")]
    StarNotFound(StarId),

    #[error("bandpass {0} not found")]
    BandpassNotFound(BandpassId),

    #[error("bandpass {name}/{system} not found")]
    BandpassNameNotFound { name: String, system: String },

    #[error("intercal edge {0} not found")]
    EdgeNotFound(EdgeId),

    /// An edge (or its reverse) already links these catalogs in this bandpass.
    #[error("intercal edge {from} -> {to} already exists for bandpass {bandpass}")]
    DuplicateEdge {
        from: CatalogId,
        to: CatalogId,
        bandpass: BandpassId,
    },

    /// Accretion needs at least one catalog already compiled into the star table.
    #[error("star table is empty; seed it with a catalog before accreting")]
    NotSeeded,

    /// No edge of the bandpass carries a computed zero-point offset.
    #[error("no analyzed intercal edges for bandpass {0}")]
    EmptyNetwork(BandpassId),

    /// A measured edge carries an offset or uncertainty the solver cannot
    /// weight: non-finite, or an uncertainty that is not positive.
    #[error("intercal edge {edge} has an unusable offset {delta} ± {delta_err}")]
    InvalidEdgeOffset {
        edge: EdgeId,
        delta: f64,
        delta_err: f64,
    },

    /// Solved zero-points cannot be normalized without a trusted reference.
    #[error("no zero-point reference catalogs in the network for bandpass {0}")]
    NoReferenceCatalogs(BandpassId),

    /// Input arrays handed to ingest disagree in shape.
    #[error("ingest shape mismatch: {0}")]
    ShapeMismatch(String),

    /// Operation requires a store with no pending (uncommitted) writes.
    #[error("store has {0} uncommitted changes")]
    UncommittedChanges(usize),

    #[error("optimizer failure: {0}")]
    Optimizer(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
