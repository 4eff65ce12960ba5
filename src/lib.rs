//! # starmerge
//!
//! Merge overlapping observed star catalogs into a master star table and
//! bring their photometry onto a common zero-point.
//!
//! Each observed catalog covers a footprint on the sky (one or more polygons
//! in RA/Dec degrees) and holds detections with magnitudes in one or more
//! bandpasses. `starmerge` cross-identifies the detections of all catalogs
//! into master stars, then measures magnitude offsets wherever catalogs
//! overlap and solves the resulting network for per-catalog zero-points.
//!
//! ## Features
//!
//! - **Greedy spatial accretion** — catalogs are joined in order of largest
//!   overlap with everything compiled so far, brightest stars first
//! - **Pluggable storage and geometry** — pipelines run against the
//!   [`CatalogStore`] and [`GeometryEngine`] traits; an in-memory store and a
//!   spherical-coordinate geometry engine are bundled
//! - **Robust offsets** — MAD-based sigma clipping, inverse-variance weighted
//!   means and bootstrap uncertainties per overlap
//! - **Network solve** — basin-hopping over Nelder–Mead, anchored to
//!   reference catalogs, with propagated zero-point uncertainties
//! - **Snapshots** — stores serialize with [rkyv](https://docs.rs/rkyv)
//!
//! ## Example
//!
//! ```no_run
//! use starmerge::{
//!     add_observations, calibrate, init_catalog, read_star_rows_csv,
//!     set_zeropoint_reference, CatalogStore, Footprint, Metadata, Settings, SpatialJoiner,
//! };
//!
//! let settings = Settings::load().unwrap();
//! let geometry = settings.geometry();
//! let mut store = settings.open_store().unwrap();
//!
//! // Ingest two overlapping fields
//! for (name, ra0) in [("field1", 10.0), ("field2", 10.5)] {
//!     let footprint = Footprint::rectangle(ra0, ra0 + 1.0, -1.0, 0.0).unwrap();
//!     init_catalog(&mut store, name, "wircam", &["J", "Ks"], "Vega", footprint, Metadata::new())
//!         .unwrap();
//!     let rows = read_star_rows_csv(format!("data/{name}.csv"), &["J", "Ks"]).unwrap();
//!     add_observations(&mut store, name, "wircam", &["J", "Ks"], "Vega", &rows).unwrap();
//! }
//! let ks = store.find_bandpass("Ks", "Vega").unwrap();
//!
//! // Cross-identify stars
//! let seed = store.find_catalog("field1", "wircam").unwrap();
//! let mut joiner = SpatialJoiner::new(&mut store, &geometry);
//! joiner.seed_catalog(seed, false).unwrap();
//! let summary = joiner.accrete_catalogs(&settings.accrete, ks).unwrap();
//! println!("Joined {} catalogs", summary.joined.len());
//!
//! // Inter-calibrate Ks zero-points against field1
//! set_zeropoint_reference(&mut store, "field1", "wircam").unwrap();
//! let report = calibrate(&mut store, &geometry, ks, &settings.analyze, &settings.solve).unwrap();
//! for zp in &report.solution.zeropoints {
//!     println!("{}: {:.3} ± {:.3}", zp.catalog, zp.zp, zp.err);
//! }
//!
//! store.save_to_file("data/survey.rkyv").unwrap();
//! ```
//!
//! ## Pipeline overview
//!
//! 1. **Ingest** — catalogs and bandpasses are get-or-created; detections and
//!    magnitudes are bulk inserted in committed chunks
//! 2. **Seed** — every detection of one catalog becomes a master star
//! 3. **Accrete** — repeatedly join the uncompiled catalog with the largest
//!    overlap against the compiled footprint, matching each detection to the
//!    nearest master star within tolerance
//! 4. **Network** — one edge per overlapping pair of catalogs in a bandpass
//! 5. **Edge analysis** — cross-match inside each overlap and measure the
//!    clipped mean magnitude offset
//! 6. **Solve** — zero-points that best reproduce all offsets, shifted so the
//!    reference catalogs keep their prior zero-points

pub mod compile;
mod error;
pub mod geometry;
pub mod ingest;
pub mod intercal;
pub mod meta;
pub mod optimize;
pub mod overlap;
pub mod settings;
pub mod skyindex;
pub mod store;

pub use compile::{AccreteConfig, AccreteSummary, JoinStats, SpatialJoiner};
pub use error::{Error, Result};
pub use geometry::{DistanceUnits, Footprint, GeometryEngine, Polygon, SkyGeometry, SkyPoint};
pub use ingest::{
    add_observations, catalog_exists, init_catalog, read_star_rows, read_star_rows_csv,
    IngestSummary, StarBatch,
};
pub use intercal::{
    analyze_network, calibrate, prepare_network, set_zeropoint_reference, solve_network,
    unset_zeropoint_reference, AnalyzeConfig, CalibrationReport, EdgeAnalysis, NetworkSolution,
    SolveConfig, ZeroPoint,
};
pub use meta::Metadata;
pub use overlap::Overlaps;
pub use settings::Settings;
pub use store::{
    Bandpass, BandpassId, Catalog, CatalogId, CatalogStar, CatalogStarId, CatalogStore, EdgeId,
    IntercalEdge, MemoryStore, NewCatalog, NewCatalogStar, Observation, Star, StarId,
};
