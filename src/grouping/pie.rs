use glam::DVec3;

use crate::config::PieParams;
use crate::error::Result;
use crate::inspect;
use crate::schedule::CancelToken;
use crate::types::Surface;

use super::{ClusterKey, ClusterMap, Grouper};

const ANGLE_EPSILON: f64 = 1e-9;

/// Buckets surfaces into angular segments and concentric rings around an axis.
///
/// Angles are measured in the plane perpendicular to the axis, starting at
/// the world X axis projected onto that plane (world Z when the axis is
/// parallel to X) and increasing towards `axis × reference`.
pub struct PieGrouper {
    params: PieParams,
    axis: DVec3,
    reference: DVec3,
    binormal: DVec3,
}

impl PieGrouper {
    /// `params` must already have passed `ClusterStrategy::validate`.
    pub fn new(params: PieParams) -> Self {
        let axis = DVec3::from_array(params.axis).normalize();
        let mut reference = DVec3::X - axis * DVec3::X.dot(axis);
        if reference.length_squared() < 1e-8 {
            reference = DVec3::Z - axis * DVec3::Z.dot(axis);
        }
        let reference = reference.normalize();
        let binormal = axis.cross(reference);
        Self {
            params,
            axis,
            reference,
            binormal,
        }
    }

    /// Angle in degrees, normalized to `[0, 360)`, and radius of `point`.
    pub fn polar(&self, point: [f64; 3]) -> (f64, f64) {
        let d = DVec3::from_array(point) - DVec3::from_array(self.params.origin);
        let planar = d - self.axis * d.dot(self.axis);
        let radius = planar.length();
        let mut angle = planar
            .dot(self.binormal)
            .atan2(planar.dot(self.reference))
            .to_degrees()
            .rem_euclid(360.0);
        // A full turn is the same ray as zero
        if angle >= 360.0 - ANGLE_EPSILON {
            angle = 0.0;
        }
        (angle, radius)
    }

    /// Segment and ring indices of `point`.
    pub fn segment_and_ring(&self, point: [f64; 3]) -> (u32, u64) {
        let (angle, radius) = self.polar(point);
        let segment_span = 360.0 / self.params.segments as f64;
        let segment = ((angle / segment_span).floor() as u32).min(self.params.segments - 1);
        let ring = (radius / self.params.ring_spacing).floor() as u64;
        (segment, ring)
    }

    fn key(&self, segment: u32, ring: u64) -> ClusterKey {
        if self.params.combine_inner_ring && ring == 0 {
            ClusterKey("pie(hub)".into())
        } else {
            ClusterKey(format!("pie(seg{segment},ring{ring})"))
        }
    }
}

impl Grouper for PieGrouper {
    fn group(&self, surfaces: &[&Surface], _cancel: &CancelToken) -> Result<ClusterMap> {
        let mut map = ClusterMap::new();
        for surface in surfaces {
            let (segment, ring) = self.segment_and_ring(inspect::center(surface));
            map.entry(self.key(segment, ring)).or_default().push(surface.id);
        }
        Ok(map)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grouping::test_support::surface_at;

    fn pie(segments: u32, combine_inner_ring: bool) -> PieGrouper {
        PieGrouper::new(PieParams {
            origin: [0.0; 3],
            axis: [0.0, 1.0, 0.0],
            segments,
            ring_spacing: 10.0,
            combine_inner_ring,
        })
    }

    fn at_angle(degrees: f64, radius: f64) -> [f64; 3] {
        // For a +Y axis the reference is +X and the binormal is Y × X = -Z.
        let r = degrees.to_radians();
        [radius * r.cos(), 0.0, -radius * r.sin()]
    }

    #[test]
    fn angle_zero_and_full_turn_share_segment() {
        let p = pie(8, false);
        let (s0, _) = p.segment_and_ring(at_angle(0.0, 15.0));
        let (s360, _) = p.segment_and_ring(at_angle(360.0, 15.0));
        assert_eq!(s0, 0);
        assert_eq!(s360, 0);
    }

    #[test]
    fn segment_and_ring_formula() {
        let p = pie(4, false);
        for (deg, radius, seg, ring) in [
            (10.0, 5.0, 0, 0),
            (100.0, 15.0, 1, 1),
            (190.0, 25.0, 2, 2),
            (280.0, 35.0, 3, 3),
        ] {
            assert_eq!(
                p.segment_and_ring(at_angle(deg, radius)),
                (seg, ring),
                "angle {deg} radius {radius}"
            );
        }
    }

    #[test]
    fn height_along_axis_is_ignored() {
        let p = pie(4, false);
        let mut high = at_angle(45.0, 12.0);
        high[1] = 500.0;
        assert_eq!(p.segment_and_ring(high), p.segment_and_ring(at_angle(45.0, 12.0)));
    }

    #[test]
    fn hub_collapses_inner_ring() {
        let p = pie(4, true);
        let a = surface_at(1, at_angle(10.0, 2.0));
        let b = surface_at(2, at_angle(200.0, 2.0));
        let c = surface_at(3, at_angle(200.0, 12.0));
        let map = p.group(&[&a, &b, &c], &CancelToken::new()).unwrap();
        assert_eq!(map.len(), 2);
        assert_eq!(map[&ClusterKey("pie(hub)".into())].len(), 2);
    }

    #[test]
    fn axis_parallel_to_x_uses_z_reference() {
        let p = PieGrouper::new(PieParams {
            origin: [0.0; 3],
            axis: [1.0, 0.0, 0.0],
            segments: 4,
            ring_spacing: 1.0,
            combine_inner_ring: false,
        });
        let (angle, radius) = p.polar([3.0, 0.0, 2.0]);
        assert!(angle.abs() < 1e-9);
        assert!((radius - 2.0).abs() < 1e-9);
    }
}
