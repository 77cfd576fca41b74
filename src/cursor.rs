//! The virtual cursor: tracks the current and previous pointer position in
//! global coordinates and walks every motion pixel-by-pixel so the cursor
//! can never cross a void between ragged screen edges.

use thiserror::Error;

use virtual_input::layout::Layout;

#[derive(Debug, Error)]
pub enum CursorError {
    #[error("cursor walk stuck off-screen at ({x}, {y})")]
    Stuck { x: i64, y: i64 },
}

pub struct Cursor {
    pos: (f64, f64),
    prev: (f64, f64),
    /// layout generation the position was last validated against
    generation: u64,
}

impl Cursor {
    pub fn new() -> Self {
        Self {
            pos: (0.0, 0.0),
            prev: (0.0, 0.0),
            generation: 0,
        }
    }

    pub fn position(&self) -> (f64, f64) {
        self.pos
    }

    pub fn previous(&self) -> (f64, f64) {
        self.prev
    }

    /// Re-home to output 0's origin when the layout changed beneath the
    /// cursor and its position stopped being covered by any output.
    /// Returns true when the cursor moved.
    pub fn revalidate(&mut self, layout: &Layout) -> bool {
        if layout.generation() == self.generation {
            return false;
        }
        self.generation = layout.generation();
        if layout.contains(self.pos.0, self.pos.1) && layout.contains(self.prev.0, self.prev.1) {
            return false;
        }
        let Some(home) = layout.home() else {
            return false;
        };
        self.pos = home;
        self.prev = home;
        true
    }

    /// Apply a relative motion. Returns the walked final position, or
    /// `None` when no output has been confirmed yet.
    pub fn motion_relative(
        &mut self,
        dx: f64,
        dy: f64,
        layout: &Layout,
    ) -> Result<Option<(f64, f64)>, CursorError> {
        let Some(target) = layout.clamp(self.pos.0 + dx, self.pos.1 + dy) else {
            return Ok(None);
        };
        self.step_to(target, layout).map(Some)
    }

    /// Apply an absolute motion with coordinates normalized to `[0, 1]`
    /// over the global space.
    pub fn motion_absolute(
        &mut self,
        nx: f64,
        ny: f64,
        layout: &Layout,
    ) -> Result<Option<(f64, f64)>, CursorError> {
        let Some(space) = layout.space() else {
            return Ok(None);
        };
        let x = space.x as f64 + nx * (space.width - 1) as f64;
        let y = space.y as f64 + ny * (space.height - 1) as f64;
        let Some(target) = layout.clamp(x, y) else {
            return Ok(None);
        };
        self.step_to(target, layout).map(Some)
    }

    fn step_to(&mut self, target: (f64, f64), layout: &Layout) -> Result<(f64, f64), CursorError> {
        self.prev = self.pos;
        let end = walk(self.prev, target, layout, |_| {})?;
        self.pos = end;
        Ok(end)
    }
}

/// Walk the straight line from `start` to `end` in integer-snapped steps
/// along the steeper axis, calling `visit` for every on-screen point.
///
/// A step landing off-screen retreats one pixel toward the last on-screen
/// point on a single axis; the retreat point becomes the new start and the
/// remaining path is straightened perpendicular to the retreat axis, so the
/// cursor glides along the wall. The returned point is where the walk
/// actually ended, which differs from `end` when a wall was hit.
fn walk(
    start: (f64, f64),
    end: (f64, f64),
    layout: &Layout,
    mut visit: impl FnMut((f64, f64)),
) -> Result<(f64, f64), CursorError> {
    let mut start = (start.0.round(), start.1.round());
    let mut end = (end.0.round(), end.1.round());
    let mut last = start;
    // glides that cannot move the start point; two in a row means the
    // cursor sits in a concave corner and stays there
    let mut stalled = 0;

    'line: loop {
        let dx = end.0 - start.0;
        let dy = end.1 - start.1;
        let step_x = dx != 0.0 && (dy / dx).abs() < 1.0;
        let steps = if step_x { dx.abs() } else { dy.abs() };

        let mut pos = 0.0;
        loop {
            let point = if pos >= steps {
                end
            } else if step_x {
                (
                    start.0 + pos * dx.signum(),
                    (start.1 + pos * (dy / dx).abs() * dy.signum()).round(),
                )
            } else {
                let x = if dx == 0.0 {
                    start.0
                } else {
                    (start.0 + pos * (dx / dy).abs() * dx.signum()).round()
                };
                (x, start.1 + pos * dy.signum())
            };

            if !layout.contains(point.0, point.1) {
                let toward_x = (point.0 - last.0).signum();
                let toward_y = (point.1 - last.1).signum();
                let retreat_x = (point.0 - toward_x, point.1);
                let retreat_y = (point.0, point.1 - toward_y);

                let (new_start, new_end) =
                    if toward_x != 0.0 && layout.contains(retreat_x.0, retreat_x.1) {
                        (retreat_x, (retreat_x.0, end.1))
                    } else if toward_y != 0.0 && layout.contains(retreat_y.0, retreat_y.1) {
                        (retreat_y, (end.0, retreat_y.1))
                    } else {
                        return Err(CursorError::Stuck {
                            x: point.0 as i64,
                            y: point.1 as i64,
                        });
                    };

                if new_start == start {
                    stalled += 1;
                    if stalled >= 2 {
                        // cornered; the walk ends at the wall
                        return Ok(start);
                    }
                } else {
                    stalled = 0;
                }
                start = new_start;
                end = new_end;
                last = start;
                continue 'line;
            }

            visit(point);
            last = point;
            if point == end {
                return Ok(end);
            }
            pos += 1.0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use virtual_input::layout::Rect;

    fn single_output() -> Layout {
        let mut l = Layout::default();
        l.rebuild(vec![Rect::new(0, 0, 1000, 1000)]).unwrap();
        l
    }

    fn staircase() -> Layout {
        // A at (0,0) 1000x1000, B at (1000,500) 1000x500; the region
        // x >= 1000, y < 500 is a void
        let mut l = Layout::default();
        l.rebuild(vec![
            Rect::new(0, 0, 1000, 1000),
            Rect::new(1000, 500, 1000, 500),
        ])
        .unwrap();
        l
    }

    fn collect(start: (f64, f64), end: (f64, f64), layout: &Layout) -> Vec<(f64, f64)> {
        let mut points = Vec::new();
        walk(start, end, layout, |p| points.push(p)).unwrap();
        points
    }

    #[test]
    fn walk_to_self_is_a_single_point() {
        let l = single_output();
        let points = collect((5.0, 5.0), (5.0, 5.0), &l);
        assert_eq!(points, vec![(5.0, 5.0)]);
    }

    #[test]
    fn single_pixel_diagonal_has_exactly_two_points() {
        let l = single_output();
        let points = collect((10.0, 10.0), (11.0, 11.0), &l);
        assert_eq!(points, vec![(10.0, 10.0), (11.0, 11.0)]);
    }

    #[test]
    fn shallow_lines_step_in_x_and_land_exactly() {
        let l = single_output();
        let points = collect((0.0, 0.0), (9.0, 3.0), &l);
        assert_eq!(points.len(), 10);
        assert_eq!(points[0], (0.0, 0.0));
        assert_eq!(points[9], (9.0, 3.0));
        for pair in points.windows(2) {
            assert_eq!(pair[1].0 - pair[0].0, 1.0);
        }
    }

    #[test]
    fn vertical_lines_walk_unit_y() {
        let l = single_output();
        let points = collect((4.0, 0.0), (4.0, 6.0), &l);
        assert_eq!(points.len(), 7);
        assert!(points.iter().all(|p| p.0 == 4.0));
    }

    #[test]
    fn diagonal_across_the_staircase_stays_in_the_union() {
        let l = staircase();
        let mut points = Vec::new();
        let end = walk((500.0, 100.0), (1100.0, 700.0), &l, |p| points.push(p)).unwrap();
        assert_eq!(end, (1100.0, 700.0));
        for p in points {
            assert!(l.contains(p.0, p.1), "walk left the union at {p:?}");
        }
    }

    #[test]
    fn glide_slides_along_the_wall_into_the_void_shadow() {
        let l = staircase();
        // the straight line would cross the void; the walk must glide down
        // the x=999 wall and end on a valid point
        let end = walk((500.0, 100.0), (1400.0, 400.0), &l, |_| {}).unwrap();
        assert!(l.contains(end.0, end.1));
        assert_ne!(end, (1400.0, 400.0));
    }

    #[test]
    fn relative_motion_clamps_to_the_space() {
        let l = single_output();
        let mut cursor = Cursor::new();
        cursor.revalidate(&l);
        let target = cursor.motion_relative(-50.0, 20.0, &l).unwrap().unwrap();
        assert_eq!(target, (0.0, 20.0));
        assert_eq!(cursor.previous(), (0.0, 0.0));
        assert_eq!(cursor.position(), (0.0, 20.0));
    }

    #[test]
    fn motion_with_no_outputs_is_dropped() {
        let l = Layout::default();
        let mut cursor = Cursor::new();
        assert_eq!(cursor.motion_relative(5.0, 5.0, &l).unwrap(), None);
    }

    #[test]
    fn absolute_motion_spans_the_space() {
        let l = single_output();
        let mut cursor = Cursor::new();
        cursor.revalidate(&l);
        let target = cursor.motion_absolute(1.0, 1.0, &l).unwrap().unwrap();
        assert_eq!(target, (999.0, 999.0));
    }

    #[test]
    fn layout_change_rehomes_an_orphaned_cursor() {
        let mut l = single_output();
        let mut cursor = Cursor::new();
        cursor.revalidate(&l);
        cursor.motion_relative(500.0, 500.0, &l).unwrap();
        assert_eq!(cursor.position(), (500.0, 500.0));

        l.rebuild(vec![Rect::new(100, 100, 200, 200)]).unwrap();
        assert!(cursor.revalidate(&l));
        assert_eq!(cursor.position(), (100.0, 100.0));
        assert_eq!(cursor.previous(), (100.0, 100.0));
    }

    #[test]
    fn unchanged_layout_does_not_rehome() {
        let l = single_output();
        let mut cursor = Cursor::new();
        cursor.revalidate(&l);
        cursor.motion_relative(10.0, 10.0, &l).unwrap();
        assert!(!cursor.revalidate(&l));
        assert_eq!(cursor.position(), (10.0, 10.0));
    }
}
