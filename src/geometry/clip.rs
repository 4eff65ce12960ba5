//! Planar polygon kernels on (RA, Dec) degree vertices.
//!
//! Every footprint polygon is normalized to a counter-clockwise ring and
//! split into convex pieces (the polygon itself when already convex,
//! otherwise an ear-clipped triangulation). All predicates below assume
//! convex CCW pieces:
//!
//! - separating-axis intersection test
//! - Sutherland–Hodgman clipping
//! - exact planar and spherical area of a union of pieces by horizontal
//!   slab decomposition

pub(crate) type Pt = [f64; 2];

const EPS: f64 = 1e-12;

#[inline]
fn cross(a: Pt, b: Pt, c: Pt) -> f64 {
    (b[0] - a[0]) * (c[1] - a[1]) - (b[1] - a[1]) * (c[0] - a[0])
}

/// Shoelace signed area of an open ring (positive when counter-clockwise).
pub(crate) fn signed_area(ring: &[Pt]) -> f64 {
    let n = ring.len();
    if n < 3 {
        return 0.0;
    }
    let mut acc = 0.0;
    for i in 0..n {
        let p = ring[i];
        let q = ring[(i + 1) % n];
        acc += p[0] * q[1] - q[0] * p[1];
    }
    0.5 * acc
}

/// Drop a closing vertex, repeated vertices and collinear vertices, and
/// orient the ring counter-clockwise. Returns `None` for degenerate rings.
pub(crate) fn normalize_ring(vertices: &[Pt]) -> Option<Vec<Pt>> {
    let mut ring: Vec<Pt> = Vec::with_capacity(vertices.len());
    for &v in vertices {
        if ring.last().is_some_and(|last| same_point(*last, v)) {
            continue;
        }
        ring.push(v);
    }
    while ring.len() > 1 && same_point(ring[0], ring[ring.len() - 1]) {
        ring.pop();
    }

    // Collinear removal may expose new collinear triples; iterate to a fixed point.
    loop {
        let n = ring.len();
        if n < 3 {
            return None;
        }
        let keep: Vec<bool> = (0..n)
            .map(|i| {
                let prev = ring[(i + n - 1) % n];
                let next = ring[(i + 1) % n];
                cross(prev, ring[i], next).abs() > EPS
            })
            .collect();
        if keep.iter().all(|&k| k) {
            break;
        }
        ring = ring
            .iter()
            .zip(&keep)
            .filter(|(_, &k)| k)
            .map(|(&p, _)| p)
            .collect();
    }

    let area = signed_area(&ring);
    if area.abs() <= EPS {
        return None;
    }
    if area < 0.0 {
        ring.reverse();
    }
    Some(ring)
}

fn same_point(a: Pt, b: Pt) -> bool {
    (a[0] - b[0]).abs() <= EPS && (a[1] - b[1]).abs() <= EPS
}

/// `true` if a CCW ring turns left (or goes straight) at every vertex.
pub(crate) fn is_convex(ring: &[Pt]) -> bool {
    let n = ring.len();
    (0..n).all(|i| cross(ring[i], ring[(i + 1) % n], ring[(i + 2) % n]) >= -EPS)
}

/// Split a normalized CCW ring into convex CCW pieces.
pub(crate) fn convex_pieces(ring: &[Pt]) -> Vec<Vec<Pt>> {
    if is_convex(ring) {
        return vec![ring.to_vec()];
    }
    triangulate(ring)
        .into_iter()
        .map(|t| t.to_vec())
        .collect()
}

/// Ear-clipping triangulation of a simple CCW polygon.
fn triangulate(ring: &[Pt]) -> Vec<[Pt; 3]> {
    let mut idx: Vec<usize> = (0..ring.len()).collect();
    let mut triangles = Vec::with_capacity(ring.len().saturating_sub(2));

    while idx.len() > 3 {
        let m = idx.len();
        let mut clipped = false;
        for i in 0..m {
            let ia = idx[(i + m - 1) % m];
            let ib = idx[i];
            let ic = idx[(i + 1) % m];
            let (a, b, c) = (ring[ia], ring[ib], ring[ic]);
            if cross(a, b, c) <= EPS {
                continue;
            }
            let blocked = idx
                .iter()
                .filter(|&&j| j != ia && j != ib && j != ic)
                .any(|&j| point_in_triangle(ring[j], a, b, c));
            if blocked {
                continue;
            }
            triangles.push([a, b, c]);
            idx.remove(i);
            clipped = true;
            break;
        }
        if !clipped {
            // Self-intersecting input; keep whatever was clipped so far.
            break;
        }
    }
    if idx.len() == 3 {
        triangles.push([ring[idx[0]], ring[idx[1]], ring[idx[2]]]);
    }
    triangles
}

fn point_in_triangle(p: Pt, a: Pt, b: Pt, c: Pt) -> bool {
    cross(a, b, p) >= -EPS && cross(b, c, p) >= -EPS && cross(c, a, p) >= -EPS
}

/// Inclusive point-in-convex-polygon test.
pub(crate) fn convex_contains(poly: &[Pt], p: Pt) -> bool {
    let n = poly.len();
    (0..n).all(|i| cross(poly[i], poly[(i + 1) % n], p) >= -EPS)
}

/// Separating-axis test for two convex CCW polygons. Touching counts as intersecting.
pub(crate) fn convex_intersects(a: &[Pt], b: &[Pt]) -> bool {
    !separated_by_edges_of(a, b) && !separated_by_edges_of(b, a)
}

fn separated_by_edges_of(a: &[Pt], b: &[Pt]) -> bool {
    let n = a.len();
    (0..n).any(|i| {
        let p = a[i];
        let q = a[(i + 1) % n];
        // Every vertex of b strictly on the outer (right) side of edge p→q.
        b.iter().all(|&v| cross(p, q, v) < -EPS)
    })
}

/// Clip a convex subject polygon by a convex CCW clip polygon.
///
/// Returns the (possibly empty) convex intersection ring.
pub(crate) fn clip_convex(subject: &[Pt], clip: &[Pt]) -> Vec<Pt> {
    let mut output: Vec<Pt> = subject.to_vec();
    let n = clip.len();
    for i in 0..n {
        if output.is_empty() {
            break;
        }
        let c1 = clip[i];
        let c2 = clip[(i + 1) % n];
        let input = std::mem::take(&mut output);
        let m = input.len();
        for j in 0..m {
            let cur = input[j];
            let prev = input[(j + m - 1) % m];
            let cur_in = cross(c1, c2, cur) >= -EPS;
            let prev_in = cross(c1, c2, prev) >= -EPS;
            if cur_in {
                if !prev_in {
                    if let Some(x) = line_intersection(prev, cur, c1, c2) {
                        output.push(x);
                    }
                }
                output.push(cur);
            } else if prev_in {
                if let Some(x) = line_intersection(prev, cur, c1, c2) {
                    output.push(x);
                }
            }
        }
    }
    match normalize_ring(&output) {
        Some(ring) => ring,
        None => Vec::new(),
    }
}

/// Intersection of segment p→q with the infinite line through a→b.
fn line_intersection(p: Pt, q: Pt, a: Pt, b: Pt) -> Option<Pt> {
    let d1 = [q[0] - p[0], q[1] - p[1]];
    let d2 = [b[0] - a[0], b[1] - a[1]];
    let denom = d1[0] * d2[1] - d1[1] * d2[0];
    if denom.abs() < 1e-300 {
        return None;
    }
    let t = ((a[0] - p[0]) * d2[1] - (a[1] - p[1]) * d2[0]) / denom;
    Some([p[0] + t * d1[0], p[1] + t * d1[1]])
}

/// Ordinate where segments p1→p2 and q1→q2 cross, if they do.
fn segment_crossing_y(p1: Pt, p2: Pt, q1: Pt, q2: Pt) -> Option<f64> {
    let r = [p2[0] - p1[0], p2[1] - p1[1]];
    let s = [q2[0] - q1[0], q2[1] - q1[1]];
    let denom = r[0] * s[1] - r[1] * s[0];
    if denom.abs() < 1e-300 {
        return None;
    }
    let qp = [q1[0] - p1[0], q1[1] - p1[1]];
    let t = (qp[0] * s[1] - qp[1] * s[0]) / denom;
    let u = (qp[0] * r[1] - qp[1] * r[0]) / denom;
    if (0.0..=1.0).contains(&t) && (0.0..=1.0).contains(&u) {
        Some(p1[1] + t * r[1])
    } else {
        None
    }
}

/// Horizontal extent of a convex polygon at ordinate `y`.
fn cross_section(poly: &[Pt], y: f64) -> Option<(f64, f64)> {
    let n = poly.len();
    let mut lo = f64::INFINITY;
    let mut hi = f64::NEG_INFINITY;
    for i in 0..n {
        let p = poly[i];
        let q = poly[(i + 1) % n];
        if p[1] == q[1] {
            continue;
        }
        let (ymin, ymax) = if p[1] < q[1] { (p[1], q[1]) } else { (q[1], p[1]) };
        if y < ymin || y > ymax {
            continue;
        }
        let x = p[0] + (y - p[1]) * (q[0] - p[0]) / (q[1] - p[1]);
        lo = lo.min(x);
        hi = hi.max(x);
    }
    (lo < hi).then_some((lo, hi))
}

/// Length of the union of the pieces' cross-sections at ordinate `y`.
fn union_length(pieces: &[Vec<Pt>], y: f64, intervals: &mut Vec<(f64, f64)>) -> f64 {
    intervals.clear();
    intervals.extend(pieces.iter().filter_map(|p| cross_section(p, y)));
    if intervals.is_empty() {
        return 0.0;
    }
    intervals.sort_by(|a, b| a.0.total_cmp(&b.0));
    let mut length = 0.0;
    let (mut lo, mut hi) = intervals[0];
    for &(a, b) in &intervals[1..] {
        if a > hi {
            length += hi - lo;
            lo = a;
            hi = b;
        } else {
            hi = hi.max(b);
        }
    }
    length + hi - lo
}

/// Integrate the union of convex pieces over horizontal slabs.
///
/// The plane is cut at every vertex ordinate and every edge crossing. Inside
/// a slab each piece's cross-section is an interval whose endpoints are
/// linear in y and never swap order, so the union length is linear too.
/// `weigh(y0, y1, l0, l1)` integrates one slab given the union length at its
/// lower and upper edges.
fn integrate_slabs<F>(pieces: &[Vec<Pt>], weigh: F) -> f64
where
    F: Fn(f64, f64, f64, f64) -> f64,
{
    let mut ys: Vec<f64> = pieces.iter().flatten().map(|p| p[1]).collect();
    let edges: Vec<(usize, Pt, Pt)> = pieces
        .iter()
        .enumerate()
        .flat_map(|(k, poly)| {
            let n = poly.len();
            (0..n).map(move |i| (k, poly[i], poly[(i + 1) % n]))
        })
        .collect();
    for (i, &(ka, a1, a2)) in edges.iter().enumerate() {
        for &(kb, b1, b2) in &edges[i + 1..] {
            if ka == kb {
                continue;
            }
            if let Some(y) = segment_crossing_y(a1, a2, b1, b2) {
                ys.push(y);
            }
        }
    }
    ys.sort_by(|a, b| a.total_cmp(b));
    ys.dedup_by(|a, b| (*a - *b).abs() <= EPS);

    let mut total = 0.0;
    let mut intervals: Vec<(f64, f64)> = Vec::with_capacity(pieces.len());
    for w in ys.windows(2) {
        let height = w[1] - w[0];
        if height <= EPS {
            continue;
        }
        // Sample away from the slab edges, where sections degenerate, and
        // extrapolate the linear length back to them.
        let la = union_length(pieces, w[0] + 0.25 * height, &mut intervals);
        let lb = union_length(pieces, w[0] + 0.75 * height, &mut intervals);
        if la <= 0.0 && lb <= 0.0 {
            continue;
        }
        let half = 0.5 * (lb - la);
        total += weigh(w[0], w[1], la - half, lb + half);
    }
    total
}

/// Exact planar area of the union of convex pieces.
pub(crate) fn union_area(pieces: &[Vec<Pt>]) -> f64 {
    match pieces.len() {
        0 => 0.0,
        1 => signed_area(&pieces[0]).abs(),
        _ => integrate_slabs(pieces, |y0, y1, l0, l1| 0.5 * (y1 - y0) * (l0 + l1)),
    }
}

/// Exact solid angle, in square degrees, of the union of convex pieces whose
/// vertices are (RA, Dec) degrees: the integral of cos(dec) dRA dDec.
///
/// Within a slab the RA length is linear in dec, and the product with
/// cos(dec) integrates in closed form.
pub(crate) fn union_sky_area(pieces: &[Vec<Pt>]) -> f64 {
    if pieces.is_empty() {
        return 0.0;
    }
    let integral = integrate_slabs(pieces, |y0, y1, l0, l1| {
        let (t0, t1) = (y0.to_radians(), y1.to_radians());
        let slope = (l1 - l0) / (t1 - t0);
        l0 * (t1.sin() - t0.sin()) + slope * ((t1 - t0) * t1.sin() + t1.cos() - t0.cos())
    });
    integral.to_degrees()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn square(x0: f64, y0: f64, size: f64) -> Vec<Pt> {
        vec![[x0, y0], [x0 + size, y0], [x0 + size, y0 + size], [x0, y0 + size]]
    }

    #[test]
    fn normalize_reorients_and_drops_closure() {
        let cw = vec![[0.0, 0.0], [0.0, 1.0], [1.0, 1.0], [1.0, 0.0], [0.0, 0.0]];
        let ring = normalize_ring(&cw).unwrap();
        assert_eq!(ring.len(), 4);
        assert!(signed_area(&ring) > 0.0);
    }

    #[test]
    fn normalize_rejects_degenerate() {
        assert!(normalize_ring(&[[0.0, 0.0], [1.0, 1.0], [2.0, 2.0]]).is_none());
        assert!(normalize_ring(&[[0.0, 0.0], [1.0, 0.0]]).is_none());
    }

    #[test]
    fn l_shape_is_triangulated() {
        let l = normalize_ring(&[
            [0.0, 0.0],
            [2.0, 0.0],
            [2.0, 1.0],
            [1.0, 1.0],
            [1.0, 2.0],
            [0.0, 2.0],
        ])
        .unwrap();
        assert!(!is_convex(&l));
        let pieces = convex_pieces(&l);
        assert_eq!(pieces.len(), 4);
        let total: f64 = pieces.iter().map(|p| signed_area(p)).sum();
        assert!((total - 3.0).abs() < 1e-12, "area {total}");
    }

    #[test]
    fn clip_overlapping_squares() {
        let a = square(0.0, 0.0, 2.0);
        let b = square(1.0, 1.0, 2.0);
        let c = clip_convex(&a, &b);
        assert!((signed_area(&c) - 1.0).abs() < 1e-12);
        assert!(convex_intersects(&a, &b));
    }

    #[test]
    fn disjoint_and_touching() {
        let a = square(0.0, 0.0, 1.0);
        let far = square(5.0, 5.0, 1.0);
        let touching = square(1.0, 0.0, 1.0);
        assert!(!convex_intersects(&a, &far));
        assert!(clip_convex(&a, &far).is_empty());
        assert!(convex_intersects(&a, &touching));
        assert!(clip_convex(&a, &touching).is_empty());
    }

    #[test]
    fn union_area_counts_overlap_once() {
        let pieces = vec![square(0.0, 0.0, 2.0), square(1.0, 1.0, 2.0)];
        assert!((union_area(&pieces) - 7.0).abs() < 1e-9);

        let rotated = vec![
            vec![[0.0, -1.0], [1.0, 0.0], [0.0, 1.0], [-1.0, 0.0]],
            square(-0.6, -0.6, 1.2),
        ];
        // The square pokes out of the diamond (area 2) at four corner
        // triangles of area 0.02 each.
        assert!((union_area(&rotated) - 2.08).abs() < 1e-9);
    }

    #[test]
    fn sky_area_weights_by_cos_dec() {
        // 1° of RA between dec 60 and 61: (sin 61° - sin 60°) · 180/π.
        let high = vec![square(10.0, 60.0, 1.0)];
        let expected = (61f64.to_radians().sin() - 60f64.to_radians().sin()).to_degrees();
        assert!((union_sky_area(&high) - expected).abs() < 1e-12);
        assert!((union_sky_area(&high) - 0.4924).abs() < 1e-4);

        // RA width shrinking linearly from 2° at the equator to 0 at dec 60.
        let tri = vec![vec![[0.0, 0.0], [2.0, 0.0], [0.0, 60.0]]];
        let t1 = 60f64.to_radians();
        let exact = (2.0 * (1.0 - t1.cos()) / t1).to_degrees();
        assert!((union_sky_area(&tri) - exact).abs() < 1e-9, "{}", union_sky_area(&tri));

        // Overlapping pieces count once.
        let pieces = vec![square(0.0, 40.0, 2.0), square(1.0, 41.0, 2.0)];
        let band = |a: f64, b: f64| (b.to_radians().sin() - a.to_radians().sin()).to_degrees();
        let expected = 2.0 * band(40.0, 41.0) + 3.0 * band(41.0, 42.0) + 2.0 * band(42.0, 43.0);
        assert!((union_sky_area(&pieces) - expected).abs() < 1e-9);
    }

    #[test]
    fn contains_is_inclusive() {
        let a = square(0.0, 0.0, 1.0);
        assert!(convex_contains(&a, [0.5, 0.5]));
        assert!(convex_contains(&a, [1.0, 0.5]));
        assert!(!convex_contains(&a, [1.5, 0.5]));
    }
}
