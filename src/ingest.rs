//! Catalog ingest.
//!
//! Ingest is two steps: [`init_catalog`] get-or-creates the catalog row and
//! its bandpasses, then [`add_observations`] appends catalog stars and their
//! magnitudes in committed chunks. `add_observations` may be called several
//! times to append stars in batches.

use std::io::Read;
use std::path::Path;

use anyhow::Context;
use nalgebra::DMatrix;
use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::geometry::Footprint;
use crate::meta::Metadata;
use crate::store::{
    BandpassId, CatalogId, CatalogStore, NewCatalog, NewCatalogStar, Observation,
};

/// Catalog stars inserted per commit.
pub const INGEST_CHUNK: usize = 1000;

/// Column-oriented star rows for one catalog. `mag` and `mag_err` are
/// `(n_stars, n_bands)` with bands in the order passed to ingest; NaN marks a
/// missing measurement.
#[derive(Debug, Clone)]
pub struct StarBatch {
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub ra: Vec<f64>,
    pub dec: Vec<f64>,
    pub cfrac: Vec<f64>,
    pub mag: DMatrix<f64>,
    pub mag_err: DMatrix<f64>,
}

impl StarBatch {
    pub fn len(&self) -> usize {
        self.ra.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ra.is_empty()
    }

    /// Check that every column has one entry per star and that the
    /// magnitude matrices have one column per band.
    pub fn validate(&self, n_bands: usize) -> Result<()> {
        let n = self.ra.len();
        for (name, len) in [
            ("x", self.x.len()),
            ("y", self.y.len()),
            ("dec", self.dec.len()),
            ("cfrac", self.cfrac.len()),
            ("mag rows", self.mag.nrows()),
            ("mag_err rows", self.mag_err.nrows()),
        ] {
            if len != n {
                return Err(Error::ShapeMismatch(format!(
                    "{name} has {len} entries, expected {n}"
                )));
            }
        }
        for (name, cols) in [("mag", self.mag.ncols()), ("mag_err", self.mag_err.ncols())] {
            if cols != n_bands {
                return Err(Error::ShapeMismatch(format!(
                    "{name} has {cols} columns for {n_bands} bands"
                )));
            }
        }
        Ok(())
    }
}

/// Counts from one [`add_observations`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestSummary {
    pub n_stars: usize,
    pub n_observations: usize,
    /// Non-finite magnitudes that were not stored.
    pub n_skipped: usize,
}

/// `true` if a catalog with this (name, instrument) is already stored.
pub fn catalog_exists<S: CatalogStore + ?Sized>(store: &S, name: &str, instrument: &str) -> bool {
    store.find_catalog(name, instrument).is_some()
}

/// Get-or-create the catalog and every bandpass, then commit.
///
/// An existing catalog keeps its stored footprint and metadata.
pub fn init_catalog<S: CatalogStore + ?Sized>(
    store: &mut S,
    name: &str,
    instrument: &str,
    band_names: &[&str],
    band_system: &str,
    footprint: Footprint,
    meta: Metadata,
) -> Result<CatalogId> {
    let (id, created) = store.find_or_create_catalog(NewCatalog {
        name: name.to_string(),
        instrument: instrument.to_string(),
        footprint,
        meta,
    })?;
    for band in band_names {
        store.find_or_create_bandpass(band, band_system)?;
    }
    store.commit()?;
    if created {
        info!("Created catalog {}/{} ({})", name, instrument, id);
    } else {
        debug!("Catalog {}/{} already exists ({})", name, instrument, id);
    }
    Ok(id)
}

/// Append catalog stars and their observations to an initialized catalog.
///
/// Every row is validated before anything is written. Rows are then inserted
/// in chunks of [`INGEST_CHUNK`] stars, each chunk committed on its own.
/// Non-finite magnitudes are skipped.
pub fn add_observations<S: CatalogStore + ?Sized>(
    store: &mut S,
    name: &str,
    instrument: &str,
    band_names: &[&str],
    band_system: &str,
    batch: &StarBatch,
) -> Result<IngestSummary> {
    batch.validate(band_names.len())?;
    let catalog = store
        .find_catalog(name, instrument)
        .ok_or_else(|| Error::CatalogNameNotFound {
            name: name.to_string(),
            instrument: instrument.to_string(),
        })?;
    let band_ids = band_names
        .iter()
        .map(|band| {
            store
                .find_bandpass(band, band_system)
                .ok_or_else(|| Error::BandpassNameNotFound {
                    name: band.to_string(),
                    system: band_system.to_string(),
                })
        })
        .collect::<Result<Vec<BandpassId>>>()?;

    let rows = (0..batch.len())
        .map(|i| {
            NewCatalogStar::new(
                batch.x[i],
                batch.y[i],
                batch.ra[i],
                batch.dec[i],
                batch.cfrac[i],
            )
        })
        .collect::<Result<Vec<_>>>()?;

    let mut summary = IngestSummary::default();
    let mut offset = 0usize;
    let mut rows = rows.into_iter().peekable();
    while rows.peek().is_some() {
        let chunk: Vec<NewCatalogStar> = rows.by_ref().take(INGEST_CHUNK).collect();
        let ids = store.insert_catalog_stars(catalog, chunk)?;

        let mut observations = Vec::with_capacity(ids.len() * band_ids.len());
        for (k, &cs) in ids.iter().enumerate() {
            let i = offset + k;
            for (j, &bandpass) in band_ids.iter().enumerate() {
                let mag = batch.mag[(i, j)];
                if !mag.is_finite() {
                    summary.n_skipped += 1;
                    continue;
                }
                observations.push(Observation {
                    catalog_star: cs,
                    bandpass,
                    mag,
                    mag_err: batch.mag_err[(i, j)],
                });
            }
        }
        summary.n_stars += ids.len();
        summary.n_observations += observations.len();
        store.insert_observations(observations)?;
        store.commit()?;
        offset += ids.len();
        debug!("Committed chunk: {} stars so far", summary.n_stars);
    }

    info!(
        "Ingested {} stars, {} observations into {}/{} ({} skipped)",
        summary.n_stars, summary.n_observations, name, instrument, summary.n_skipped
    );
    Ok(summary)
}

// ── CSV ─────────────────────────────────────────────────────────────────────

/// Read star rows from a CSV file with a header row.
///
/// Required columns are `x`, `y`, `ra`, `dec` and `cfrac`, plus `<band>` and
/// `<band>_err` for every band name. Empty or unparsable magnitude fields
/// become NaN and are skipped at ingest.
pub fn read_star_rows_csv<P: AsRef<Path>>(file: P, band_names: &[&str]) -> anyhow::Result<StarBatch> {
    let path = file.as_ref();
    let f = std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    read_star_rows(f, band_names).with_context(|| format!("reading {}", path.display()))
}

/// [`read_star_rows_csv`] over any reader.
pub fn read_star_rows<R: Read>(reader: R, band_names: &[&str]) -> anyhow::Result<StarBatch> {
    let mut rdr = csv::ReaderBuilder::new().trim(csv::Trim::All).from_reader(reader);
    let headers = rdr.headers()?.clone();
    let column = |name: &str| -> anyhow::Result<usize> {
        headers
            .iter()
            .position(|h| h == name)
            .ok_or_else(|| anyhow::anyhow!("missing CSV column '{}'", name))
    };
    let (cx, cy, cra, cdec, ccfrac) = (
        column("x")?,
        column("y")?,
        column("ra")?,
        column("dec")?,
        column("cfrac")?,
    );
    let mag_cols = band_names
        .iter()
        .map(|&b| Ok((column(b)?, column(&format!("{b}_err"))?)))
        .collect::<anyhow::Result<Vec<_>>>()?;

    let mut x = Vec::new();
    let mut y = Vec::new();
    let mut ra = Vec::new();
    let mut dec = Vec::new();
    let mut cfrac = Vec::new();
    let mut mags: Vec<f64> = Vec::new();
    let mut errs: Vec<f64> = Vec::new();

    for (line, result) in rdr.records().enumerate() {
        let record = result?;
        let required = |col: usize, name: &str| -> anyhow::Result<f64> {
            record
                .get(col)
                .unwrap_or("")
                .parse::<f64>()
                .with_context(|| format!("row {}: bad '{}' value", line + 1, name))
        };
        let optional = |col: usize| -> f64 {
            match record.get(col) {
                Some(s) if !s.is_empty() => s.parse().unwrap_or(f64::NAN),
                _ => f64::NAN,
            }
        };
        x.push(required(cx, "x")?);
        y.push(required(cy, "y")?);
        ra.push(required(cra, "ra")?);
        dec.push(required(cdec, "dec")?);
        cfrac.push(required(ccfrac, "cfrac")?);
        for &(cm, ce) in &mag_cols {
            mags.push(optional(cm));
            errs.push(optional(ce));
        }
    }

    let n = ra.len();
    let n_bands = band_names.len();
    Ok(StarBatch {
        x,
        y,
        ra,
        dec,
        cfrac,
        mag: DMatrix::from_row_slice(n, n_bands, &mags),
        mag_err: DMatrix::from_row_slice(n, n_bands, &errs),
    })
}
