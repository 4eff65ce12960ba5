//! Incremental spatial index for radius-tolerance searches on the sky.
//!
//! `SkyIndex` bins entries in a HEALPix-style spherical grid: latitude is
//! partitioned into `3 * nside` bins in `z = sin(dec)`, and longitude into
//! `4 * nside` bins in right ascension, for a total of `12 * nside^2` cells.
//! Unlike a build-once catalog, entries can be inserted and removed at any
//! time, which is what the growing star table needs during accretion.
//!
//! Query flow:
//! 1. Compute candidate cells intersecting the cone around a position.
//! 2. Scan only entries in those cells.
//! 3. Apply exact angular filtering using a dot-product threshold.
//! 4. Return keys with their separation, nearest first.

use std::collections::HashMap;
use std::f64::consts::{PI, TAU};

use nalgebra::Vector3;

use crate::geometry::SkyPoint;

/// Default resolution; cells are roughly 0.9° across.
pub const DEFAULT_NSIDE: u32 = 64;

#[derive(Debug, Clone)]
struct Entry {
    uvec: Vector3<f64>,
    cell: u32,
}

#[derive(Debug, Clone)]
pub struct SkyIndex {
    n_lat: u32,
    n_lon: u32,
    cells: Vec<Vec<u64>>,
    entries: HashMap<u64, Entry>,
}

impl Default for SkyIndex {
    fn default() -> Self {
        Self::new(DEFAULT_NSIDE)
    }
}

impl SkyIndex {
    /// Build an empty index. `nside` must be greater than zero.
    pub fn new(nside: u32) -> Self {
        assert!(nside > 0, "nside must be > 0");
        let n_lat = 3 * nside;
        let n_lon = 4 * nside;
        Self {
            n_lat,
            n_lon,
            cells: vec![Vec::new(); (n_lat * n_lon) as usize],
            entries: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Insert (or move) an entry.
    pub fn insert(&mut self, key: u64, position: SkyPoint) {
        self.remove(key);
        let ra = position.ra.to_radians();
        let dec = position.dec.to_radians();
        let cell = Self::cell_for_radec(self.n_lat, self.n_lon, ra, dec);
        self.cells[cell as usize].push(key);
        self.entries.insert(
            key,
            Entry {
                uvec: radec_to_uvec(ra, dec),
                cell,
            },
        );
    }

    /// Remove an entry; returns `false` if the key was not indexed.
    pub fn remove(&mut self, key: u64) -> bool {
        match self.entries.remove(&key) {
            Some(entry) => {
                self.cells[entry.cell as usize].retain(|&k| k != key);
                true
            }
            None => false,
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.cells.iter_mut().for_each(Vec::clear);
    }

    /// Keys within `radius_deg` of `center`, with separations in degrees,
    /// nearest first (ties broken by key).
    pub fn query(&self, center: SkyPoint, radius_deg: f64) -> Vec<(u64, f64)> {
        if self.is_empty() {
            return Vec::new();
        }
        let radius = radius_deg.to_radians().clamp(0.0, PI);
        let dir = radec_to_uvec(center.ra.to_radians(), center.dec.to_radians());
        let cos_radius = radius.cos();

        let lon_step = TAU / self.n_lon as f64;

        let dec_center = dir.z.clamp(-1.0, 1.0).asin();
        let dec_min = dec_center - radius;
        let dec_max = dec_center + radius;
        // A cone reaching over a pole covers every right ascension there.
        let contains_pole = dec_max >= PI / 2.0 || dec_min <= -PI / 2.0;
        let z_min = dec_min.max(-PI / 2.0).sin();
        let z_max = dec_max.min(PI / 2.0).sin();

        // Widest right-ascension extent of a small circle that excludes the poles.
        let lon_half_span = if contains_pole {
            PI
        } else {
            let s = radius.sin() / dec_center.cos().max(1e-12);
            if s >= 1.0 {
                PI
            } else {
                s.asin() + lon_step
            }
        };

        let mut phi = dir.y.atan2(dir.x);
        if phi < 0.0 {
            phi += TAU;
        }
        let lon_min = phi - lon_half_span;
        let lon_max = phi + lon_half_span;

        let mut out = Vec::new();
        for lat_bin in Self::z_bin_range(self.n_lat, z_min, z_max) {
            if lon_max - lon_min >= TAU {
                for lon_bin in 0..self.n_lon {
                    self.collect_cell_matches(lat_bin, lon_bin, &dir, cos_radius, &mut out);
                }
                continue;
            }

            self.for_each_wrapped_lon_bin(lon_min, lon_max, |lon_bin| {
                self.collect_cell_matches(lat_bin, lon_bin, &dir, cos_radius, &mut out);
            });
        }

        out.sort_by(|a, b| a.1.total_cmp(&b.1).then(a.0.cmp(&b.0)));
        out.dedup_by_key(|e| e.0);
        out
    }

    fn collect_cell_matches(
        &self,
        lat_bin: u32,
        lon_bin: u32,
        dir: &Vector3<f64>,
        cos_radius: f64,
        out: &mut Vec<(u64, f64)>,
    ) {
        let cell = (lat_bin * self.n_lon + lon_bin) as usize;
        for &key in &self.cells[cell] {
            let Some(entry) = self.entries.get(&key) else {
                continue;
            };
            let cos_sep = dir.dot(&entry.uvec);
            if cos_sep >= cos_radius {
                // atan2 of |cross| and dot stays accurate at arcsecond scales.
                let sep = dir.cross(&entry.uvec).norm().atan2(cos_sep);
                out.push((key, sep.to_degrees()));
            }
        }
    }

    fn for_each_wrapped_lon_bin<F>(&self, lon_min: f64, lon_max: f64, mut f: F)
    where
        F: FnMut(u32),
    {
        let start_bin = Self::phi_to_lon_bin(self.n_lon, wrap_angle(lon_min));
        let end_bin = Self::phi_to_lon_bin(self.n_lon, wrap_angle(lon_max));

        if start_bin <= end_bin {
            for lon_bin in start_bin..=end_bin {
                f(lon_bin);
            }
            return;
        }

        for lon_bin in start_bin..self.n_lon {
            f(lon_bin);
        }
        for lon_bin in 0..=end_bin {
            f(lon_bin);
        }
    }

    fn z_bin_range(n_lat: u32, z_min: f64, z_max: f64) -> std::ops::RangeInclusive<u32> {
        Self::z_to_lat_bin(n_lat, z_min)..=Self::z_to_lat_bin(n_lat, z_max)
    }

    fn cell_for_radec(n_lat: u32, n_lon: u32, ra_rad: f64, dec_rad: f64) -> u32 {
        let phi = wrap_angle(ra_rad);
        let z = dec_rad.sin().clamp(-1.0, 1.0);
        Self::z_to_lat_bin(n_lat, z) * n_lon + Self::phi_to_lon_bin(n_lon, phi)
    }

    fn z_to_lat_bin(n_lat: u32, z: f64) -> u32 {
        let u = ((z.clamp(-1.0, 1.0) + 1.0) * 0.5).clamp(0.0, 1.0);
        ((u * n_lat as f64).floor() as u32).min(n_lat - 1)
    }

    fn phi_to_lon_bin(n_lon: u32, phi: f64) -> u32 {
        let u = (phi / TAU).clamp(0.0, 1.0 - f64::EPSILON);
        ((u * n_lon as f64).floor() as u32).min(n_lon - 1)
    }
}

fn wrap_angle(theta_rad: f64) -> f64 {
    let w = theta_rad.rem_euclid(TAU);
    if w >= TAU {
        0.0
    } else {
        w
    }
}

fn radec_to_uvec(ra_rad: f64, dec_rad: f64) -> Vector3<f64> {
    let (sin_ra, cos_ra) = ra_rad.sin_cos();
    let (sin_dec, cos_dec) = dec_rad.sin_cos();
    Vector3::new(cos_dec * cos_ra, cos_dec * sin_ra, sin_dec)
}
