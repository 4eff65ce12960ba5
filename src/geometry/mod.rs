//! Sky geometry: points, footprint polygons and the geometry engine seam.
//!
//! Footprints are multi-polygons with (RA, Dec) vertices in degrees. Polygon
//! edges are straight lines in the (RA, Dec) plane, which is where
//! intersection, union and containment are evaluated. Areas are solid angles
//! of those regions on the sphere (the integral of cos(dec) dRA dDec), in
//! square degrees. Point-to-point distances are great-circle separations.
//!
//! A polygon edge always takes the shorter way around in RA, so a ring may
//! cross RA = 0. Such polygons are split at the origin into parts that each
//! lie within [0, 360].
//!
//! The accretion and calibration code only talks to [`GeometryEngine`];
//! [`SkyGeometry`] is the bundled implementation. Its native distance unit is
//! either degrees or "geography meters" (arc length on a sphere of radius
//! [`R_EARTH`]), the convention of spatial databases that store sky
//! positions as geographic points.

pub(crate) mod clip;

use std::fmt;

use serde::Deserialize;

use crate::error::{Error, Result};
use clip::Pt;

/// Sphere radius (meters) used to map sky angles onto geography units.
pub const R_EARTH: f64 = 6_371_008.7714;

/// Convert an angle on the sky (degrees) to geography meters.
pub fn degree_to_meter(deg: f64) -> f64 {
    deg * std::f64::consts::PI * R_EARTH / 180.0
}

/// Convert geography meters back to degrees on the sky.
pub fn meter_to_degree(m: f64) -> f64 {
    m * 180.0 / (std::f64::consts::PI * R_EARTH)
}

/// Convert an area in square geography meters to square degrees.
pub fn sq_meter_to_sq_degree(area: f64) -> f64 {
    let f = 180.0 / std::f64::consts::PI / R_EARTH;
    area * f * f
}

/// Convert an area in square degrees to square geography meters.
pub fn sq_degree_to_sq_meter(area: f64) -> f64 {
    let f = std::f64::consts::PI * R_EARTH / 180.0;
    area * f * f
}

pub fn arcsec_to_degree(arcsec: f64) -> f64 {
    arcsec / 3600.0
}

/// Great-circle separation between two sky positions, in degrees (haversine).
pub fn angular_separation_deg(a: SkyPoint, b: SkyPoint) -> f64 {
    let (ra1, dec1) = (a.ra.to_radians(), a.dec.to_radians());
    let (ra2, dec2) = (b.ra.to_radians(), b.dec.to_radians());
    let sin_ddec = ((dec2 - dec1) * 0.5).sin();
    let sin_dra = ((ra2 - ra1) * 0.5).sin();
    let h = sin_ddec * sin_ddec + dec1.cos() * dec2.cos() * sin_dra * sin_dra;
    (2.0 * h.sqrt().min(1.0).asin()).to_degrees()
}

/// A position on the sky, degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyPoint {
    pub ra: f64,
    pub dec: f64,
}

impl SkyPoint {
    /// Build a point without range checks.
    pub fn new(ra: f64, dec: f64) -> Self {
        Self { ra, dec }
    }

    /// Build a point, requiring ra ∈ [0, 360] and dec ∈ [-90, 90].
    pub fn checked(ra: f64, dec: f64) -> Result<Self> {
        let valid = ra.is_finite()
            && dec.is_finite()
            && (0.0..=360.0).contains(&ra)
            && (-90.0..=90.0).contains(&dec);
        if !valid {
            return Err(Error::InvalidCoordinate { ra, dec });
        }
        Ok(Self { ra, dec })
    }

    /// Well-known-text encoding, e.g. `POINT(10.0000000000 40.0000000000)`.
    pub fn to_wkt(&self) -> String {
        format!("POINT({:.10} {:.10})", self.ra, self.dec)
    }

    fn pt(&self) -> Pt {
        [self.ra, self.dec]
    }
}

/// One closed footprint polygon. The ring is closed on construction: the
/// first vertex is repeated at the end when the caller did not do so.
#[derive(Debug, Clone, PartialEq)]
pub struct Polygon {
    ring: Vec<SkyPoint>,
}

impl Polygon {
    /// Every vertex must be a valid sky position (see [`SkyPoint::checked`]).
    pub fn new(vertices: Vec<SkyPoint>) -> Result<Self> {
        if vertices.len() < 3 {
            return Err(Error::InvalidFootprint(format!(
                "polygon needs at least 3 vertices, got {}",
                vertices.len()
            )));
        }
        for v in &vertices {
            SkyPoint::checked(v.ra, v.dec)?;
        }
        let mut ring = vertices;
        if ring.first() != ring.last() {
            ring.push(ring[0]);
        }
        Ok(Self { ring })
    }

    /// Build from `(ra, dec)` pairs.
    pub fn from_pairs(vertices: &[(f64, f64)]) -> Result<Self> {
        Self::new(vertices.iter().map(|&(ra, dec)| SkyPoint::new(ra, dec)).collect())
    }

    /// The closed ring (first vertex == last vertex).
    pub fn ring(&self) -> &[SkyPoint] {
        &self.ring
    }

    /// Open ring with RA unwrapped so consecutive vertices never differ by
    /// more than 180°. The result may extend past 0 or 360.
    fn open_ring(&self) -> Vec<Pt> {
        let mut ring: Vec<Pt> = Vec::with_capacity(self.ring.len() - 1);
        for v in &self.ring[..self.ring.len() - 1] {
            let mut p = v.pt();
            if let Some(prev) = ring.last() {
                let step = (p[0] - prev[0] + 180.0).rem_euclid(360.0) - 180.0;
                p[0] = prev[0] + step;
            }
            ring.push(p);
        }
        ring
    }
}

/// Split a convex piece at multiples of 360° RA and shift each part into
/// [0, 360].
fn fold_ra(piece: Vec<Pt>) -> Vec<Vec<Pt>> {
    let (lo, hi) = piece
        .iter()
        .fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), p| (lo.min(p[0]), hi.max(p[0])));
    if lo >= 0.0 && hi <= 360.0 {
        return vec![piece];
    }
    let first = (lo / 360.0).floor() as i64;
    let last = (hi / 360.0).ceil() as i64;
    (first..last)
        .filter_map(|k| {
            let x0 = k as f64 * 360.0;
            let strip = [[x0, -91.0], [x0 + 360.0, -91.0], [x0 + 360.0, 91.0], [x0, 91.0]];
            let mut part = clip::clip_convex(&piece, &strip);
            if part.is_empty() {
                return None;
            }
            for p in &mut part {
                p[0] = (p[0] - x0).clamp(0.0, 360.0);
            }
            Some(part)
        })
        .collect()
}

/// A sky footprint: one or more polygons, plus their convex decomposition.
#[derive(Debug, Clone)]
pub struct Footprint {
    polygons: Vec<Polygon>,
    pieces: Vec<Vec<Pt>>,
    bounds: [f64; 4],
}

impl PartialEq for Footprint {
    fn eq(&self, other: &Self) -> bool {
        self.polygons == other.polygons
    }
}

impl Footprint {
    pub fn new(polygons: Vec<Polygon>) -> Result<Self> {
        if polygons.is_empty() {
            return Err(Error::InvalidFootprint("footprint has no polygons".into()));
        }
        let mut pieces = Vec::new();
        for (i, poly) in polygons.iter().enumerate() {
            let ring = clip::normalize_ring(&poly.open_ring()).ok_or_else(|| {
                Error::InvalidFootprint(format!("polygon {i} is degenerate (zero area)"))
            })?;
            pieces.extend(clip::convex_pieces(&ring).into_iter().flat_map(fold_ra));
        }
        Ok(Self::assemble(polygons, pieces))
    }

    /// Build a footprint from vertex lists of `(ra, dec)` pairs, one list per polygon.
    pub fn from_vertex_lists(lists: &[Vec<(f64, f64)>]) -> Result<Self> {
        let polygons = lists
            .iter()
            .map(|v| Polygon::from_pairs(v))
            .collect::<Result<Vec<_>>>()?;
        Self::new(polygons)
    }

    /// Box between two RA meridians and two Dec parallels.
    ///
    /// The RA side spans the shorter arc from `ra_min` to `ra_max`, so
    /// `rectangle(359.5, 0.5, ..)` is a 1° wide box across RA = 0.
    pub fn rectangle(ra_min: f64, ra_max: f64, dec_min: f64, dec_max: f64) -> Result<Self> {
        Self::from_vertex_lists(&[vec![
            (ra_min, dec_min),
            (ra_max, dec_min),
            (ra_max, dec_max),
            (ra_min, dec_max),
        ]])
    }

    /// Footprint made of already-convex CCW pieces (clip results).
    fn from_pieces(pieces: Vec<Vec<Pt>>) -> Option<Self> {
        if pieces.is_empty() {
            return None;
        }
        let polygons = pieces
            .iter()
            .map(|p| {
                let mut ring: Vec<SkyPoint> = p.iter().map(|v| SkyPoint::new(v[0], v[1])).collect();
                ring.push(ring[0]);
                Polygon { ring }
            })
            .collect();
        Some(Self::assemble(polygons, pieces))
    }

    fn assemble(polygons: Vec<Polygon>, pieces: Vec<Vec<Pt>>) -> Self {
        let mut bounds = [f64::INFINITY, f64::INFINITY, f64::NEG_INFINITY, f64::NEG_INFINITY];
        for p in pieces.iter().flatten() {
            bounds[0] = bounds[0].min(p[0]);
            bounds[1] = bounds[1].min(p[1]);
            bounds[2] = bounds[2].max(p[0]);
            bounds[3] = bounds[3].max(p[1]);
        }
        Self {
            polygons,
            pieces,
            bounds,
        }
    }

    pub fn polygons(&self) -> &[Polygon] {
        &self.polygons
    }

    /// Polygon vertex lists as `(ra, dec)` pairs (closed rings).
    pub fn vertex_lists(&self) -> Vec<Vec<(f64, f64)>> {
        self.polygons
            .iter()
            .map(|p| p.ring().iter().map(|v| (v.ra, v.dec)).collect())
            .collect()
    }

    /// `[ra_min, dec_min, ra_max, dec_max]`, within RA [0, 360]. A footprint
    /// crossing RA = 0 spans the full RA range.
    pub fn bounds(&self) -> [f64; 4] {
        self.bounds
    }

    fn bounds_overlap(&self, other: &Footprint) -> bool {
        let (a, b) = (self.bounds, other.bounds);
        a[0] <= b[2] && b[0] <= a[2] && a[1] <= b[3] && b[1] <= a[3]
    }

    /// Well-known-text `MULTIPOLYGON`.
    pub fn to_wkt(&self) -> String {
        let parts: Vec<String> = self
            .polygons
            .iter()
            .map(|p| {
                let verts: Vec<String> = p
                    .ring()
                    .iter()
                    .map(|v| format!("{:.10} {:.10}", v.ra, v.dec))
                    .collect();
                format!("(({}))", verts.join(","))
            })
            .collect();
        format!("MULTIPOLYGON({})", parts.join(","))
    }
}

impl fmt::Display for Footprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = self.bounds;
        write!(
            f,
            "{} polygon(s), RA [{:.4}, {:.4}], Dec [{:.4}, {:.4}]",
            self.polygons.len(),
            b[0],
            b[2],
            b[1],
            b[3]
        )
    }
}

/// Spatial predicates and measures the accretion and calibration code relies on.
pub trait GeometryEngine {
    /// `true` when the footprints share at least one point (touching counts).
    fn intersects(&self, a: &Footprint, b: &Footprint) -> bool;

    /// Intersection footprint; `None` when the overlap has no area.
    fn intersection(&self, a: &Footprint, b: &Footprint) -> Option<Footprint>;

    /// Area in native units.
    fn area(&self, f: &Footprint) -> f64;

    /// Convert a native area to square degrees.
    fn native_area_to_sq_deg(&self, area: f64) -> f64;

    /// Area in square degrees.
    fn area_sq_deg(&self, f: &Footprint) -> f64 {
        self.native_area_to_sq_deg(self.area(f))
    }

    /// Union of several footprints.
    fn union(&self, footprints: &[&Footprint]) -> Option<Footprint>;

    /// Inclusive point-in-footprint test.
    fn contains(&self, f: &Footprint, p: SkyPoint) -> bool;

    /// Point separation in native units.
    fn distance(&self, a: SkyPoint, b: SkyPoint) -> f64;

    /// Convert a sky angle in degrees to native distance units.
    fn degrees_to_native(&self, deg: f64) -> f64;

    /// Convert a native distance back to degrees.
    fn native_to_degrees(&self, d: f64) -> f64;

    fn within_distance(&self, a: SkyPoint, b: SkyPoint, radius: f64) -> bool {
        self.distance(a, b) <= radius
    }
}

/// Native distance unit of [`SkyGeometry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DistanceUnits {
    #[default]
    Degrees,
    /// Arc length on a sphere of radius [`R_EARTH`], in meters.
    GeographyMeters,
}

/// Bundled geometry engine: (RA, Dec) polygons measured on the sphere,
/// great-circle distances.
#[derive(Debug, Clone, Copy, Default)]
pub struct SkyGeometry {
    pub units: DistanceUnits,
}

impl SkyGeometry {
    pub fn new(units: DistanceUnits) -> Self {
        Self { units }
    }
}

impl GeometryEngine for SkyGeometry {
    fn intersects(&self, a: &Footprint, b: &Footprint) -> bool {
        if !a.bounds_overlap(b) {
            return false;
        }
        a.pieces
            .iter()
            .any(|pa| b.pieces.iter().any(|pb| clip::convex_intersects(pa, pb)))
    }

    fn intersection(&self, a: &Footprint, b: &Footprint) -> Option<Footprint> {
        if !a.bounds_overlap(b) {
            return None;
        }
        let mut pieces = Vec::new();
        for pa in &a.pieces {
            for pb in &b.pieces {
                let c = clip::clip_convex(pa, pb);
                if !c.is_empty() {
                    pieces.push(c);
                }
            }
        }
        Footprint::from_pieces(pieces)
    }

    fn area(&self, f: &Footprint) -> f64 {
        let sq_deg = clip::union_sky_area(&f.pieces);
        match self.units {
            DistanceUnits::Degrees => sq_deg,
            DistanceUnits::GeographyMeters => sq_degree_to_sq_meter(sq_deg),
        }
    }

    fn native_area_to_sq_deg(&self, area: f64) -> f64 {
        match self.units {
            DistanceUnits::Degrees => area,
            DistanceUnits::GeographyMeters => sq_meter_to_sq_degree(area),
        }
    }

    fn union(&self, footprints: &[&Footprint]) -> Option<Footprint> {
        match footprints {
            [] => None,
            [single] => Some((*single).clone()),
            many => {
                let polygons = many.iter().flat_map(|f| f.polygons.iter().cloned()).collect();
                let pieces = many.iter().flat_map(|f| f.pieces.iter().cloned()).collect();
                Some(Footprint::assemble(polygons, pieces))
            }
        }
    }

    fn contains(&self, f: &Footprint, p: SkyPoint) -> bool {
        let b = f.bounds;
        if p.dec < b[1] || p.dec > b[3] {
            return false;
        }
        let inside = |ra: f64| {
            ra >= b[0]
                && ra <= b[2]
                && f.pieces
                    .iter()
                    .any(|piece| clip::convex_contains(piece, [ra, p.dec]))
        };
        // RA = 0 and RA = 360 are the same meridian.
        let ra = p.ra.rem_euclid(360.0);
        inside(ra) || (ra == 0.0 && inside(360.0))
    }

    fn distance(&self, a: SkyPoint, b: SkyPoint) -> f64 {
        self.degrees_to_native(angular_separation_deg(a, b))
    }

    fn degrees_to_native(&self, deg: f64) -> f64 {
        match self.units {
            DistanceUnits::Degrees => deg,
            DistanceUnits::GeographyMeters => degree_to_meter(deg),
        }
    }

    fn native_to_degrees(&self, d: f64) -> f64 {
        match self.units {
            DistanceUnits::Degrees => d,
            DistanceUnits::GeographyMeters => meter_to_degree(d),
        }
    }
}
