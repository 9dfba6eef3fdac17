use rstar::{PointDistance, RTree, RTreeObject, AABB};

use crate::page::{Line, Page};

/// Line center in page-relative coordinates, origin top-left, both axes
/// in [0, 1].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LineAnchor {
    pub center: [f64; 2],
    /// Index of the line in its page.
    pub line: usize,
}

impl RTreeObject for LineAnchor {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        AABB::from_point(self.center)
    }
}

impl PointDistance for LineAnchor {
    fn distance_2(&self, point: &[f64; 2]) -> f64 {
        let dx = self.center[0] - point[0];
        let dy = self.center[1] - point[1];
        dx * dx + dy * dy
    }
}

/// Spatial index of one page's line centers.
#[derive(Debug, Clone)]
pub struct PageLayout {
    anchors: Vec<LineAnchor>,
    tree: RTree<LineAnchor>,
}

impl PageLayout {
    /// Lines without a polygon or with blank text are skipped.
    pub fn from_lines(lines: &[Line], width: f64, height: f64) -> Self {
        let (w, h) = (width.max(f64::EPSILON), height.max(f64::EPSILON));
        let anchors: Vec<LineAnchor> = lines
            .iter()
            .enumerate()
            .filter(|(_, l)| !l.text.trim().is_empty())
            .filter_map(|(idx, l)| {
                let c = l.polygon.as_ref()?.center()?;
                Some(LineAnchor {
                    center: [(c.x / w).clamp(0.0, 1.0), (c.y / h).clamp(0.0, 1.0)],
                    line: idx,
                })
            })
            .collect();
        let tree = RTree::bulk_load(anchors.clone());
        Self { anchors, tree }
    }

    pub fn from_page(page: &Page) -> Self {
        Self::from_lines(&page.lines, page.width, page.height)
    }

    pub fn anchors(&self) -> &[LineAnchor] {
        &self.anchors
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }

    /// Mean distance from each of our anchors to the nearest anchor of `other`.
    fn mean_displacement(&self, other: &PageLayout) -> Option<f64> {
        if self.anchors.is_empty() || other.anchors.is_empty() {
            return None;
        }
        let total: f64 = self
            .anchors
            .iter()
            .filter_map(|a| other.tree.nearest_neighbor(&a.center))
            .zip(self.anchors.iter())
            .map(|(nearest, a)| nearest.distance_2(&a.center).sqrt())
            .sum();
        Some(total / self.anchors.len() as f64)
    }

    /// Layout similarity in [0, 1].
    ///
    /// Symmetric mean nearest-neighbour displacement, clamped at
    /// `max_distance` and inverted, then damped by how different the two
    /// line counts are (a page with three lines is not a good match for a
    /// page with forty even when the three sit in the right places).
    pub fn similarity(&self, other: &PageLayout, max_distance: f64) -> f64 {
        let (Some(forward), Some(backward)) = (
            self.mean_displacement(other),
            other.mean_displacement(self),
        ) else {
            return 0.0;
        };
        let displacement = (forward + backward) / 2.0;
        let closeness = 1.0 - (displacement / max_distance).clamp(0.0, 1.0);

        let (a, b) = (self.len() as f64, other.len() as f64);
        let count_ratio = a.min(b) / a.max(b);
        (closeness * (0.7 + 0.3 * count_ratio)).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::page::Polygon;

    fn line_at(x: f64, y: f64) -> Line {
        Line::new("x", Polygon::rect(x, y, x + 1.0, y + 0.2))
    }

    #[test]
    fn identical_layouts_score_one() {
        let lines = vec![line_at(1.0, 1.0), line_at(1.0, 3.0), line_at(4.0, 6.0)];
        let a = PageLayout::from_lines(&lines, 8.0, 11.0);
        let b = PageLayout::from_lines(&lines, 8.0, 11.0);
        assert!((a.similarity(&b, 0.25) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn scaled_page_keeps_relative_positions() {
        let small = vec![line_at(1.0, 1.0), line_at(2.0, 5.0)];
        let big: Vec<Line> = vec![
            Line::new("x", Polygon::rect(2.0, 2.0, 4.0, 2.4)),
            Line::new("x", Polygon::rect(4.0, 10.0, 6.0, 10.4)),
        ];
        let a = PageLayout::from_lines(&small, 8.0, 11.0);
        let b = PageLayout::from_lines(&big, 16.0, 22.0);
        assert!(a.similarity(&b, 0.25) > 0.99);
    }

    #[test]
    fn far_apart_layouts_score_zero() {
        let a = PageLayout::from_lines(&[line_at(0.0, 0.0)], 8.0, 11.0);
        let b = PageLayout::from_lines(&[line_at(7.0, 10.5)], 8.0, 11.0);
        assert_eq!(a.similarity(&b, 0.25), 0.0);
    }

    #[test]
    fn empty_layout_scores_zero() {
        let a = PageLayout::from_lines(&[], 8.0, 11.0);
        let b = PageLayout::from_lines(&[line_at(1.0, 1.0)], 8.0, 11.0);
        assert_eq!(a.similarity(&b, 0.25), 0.0);
    }
}
