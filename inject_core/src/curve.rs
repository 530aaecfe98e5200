use inject_runtime::{Bounds, Vec3I};

/// Walks every cell of `bounds` so that consecutive points share a face.
///
/// Layers advance along +y. Within a layer rows advance along z, reversing
/// direction on every other layer, and each row runs along x in the opposite
/// direction to the row before it.
pub fn snake_curve(bounds: Bounds) -> Vec<Vec3I> {
    let size = bounds.size();
    let mut points = Vec::with_capacity(bounds.volume());
    let mut row = 0usize;
    for layer in 0..size.y {
        let y = bounds.min.y + layer;
        for step_z in 0..size.z {
            let z = if layer % 2 == 0 {
                bounds.min.z + step_z
            } else {
                bounds.max.z - step_z
            };
            for step_x in 0..size.x {
                let x = if row % 2 == 0 {
                    bounds.min.x + step_x
                } else {
                    bounds.max.x - step_x
                };
                points.push(Vec3I::new(x, y, z));
            }
            row += 1;
        }
    }
    points
}

#[cfg(test)]
mod tests {
    use super::*;
    use inject_runtime::Direction;

    fn assert_face_connected(points: &[Vec3I]) {
        for pair in points.windows(2) {
            assert!(
                Direction::between(pair[0], pair[1]).is_some(),
                "{} -> {} is not a single step",
                pair[0],
                pair[1]
            );
        }
    }

    #[test]
    fn covers_every_cell_once() {
        let bounds = Bounds::new(Vec3I::new(2, 1, 3), Vec3I::new(5, 3, 4));
        let points = snake_curve(bounds);
        assert_eq!(points.len(), bounds.volume());
        let mut sorted = points.clone();
        sorted.sort();
        sorted.dedup();
        assert_eq!(sorted.len(), points.len());
        assert!(points.iter().all(|point| bounds.contains(*point)));
        assert_eq!(points[0], bounds.min);
    }

    #[test]
    fn consecutive_points_are_neighbours() {
        for (a, b) in [
            (Vec3I::new(0, 0, 0), Vec3I::new(7, 7, 4)),
            (Vec3I::new(0, 0, 0), Vec3I::new(0, 3, 0)),
            (Vec3I::new(0, 0, 0), Vec3I::new(2, 2, 0)),
            (Vec3I::new(-1, 4, 9), Vec3I::new(1, 5, 12)),
        ] {
            assert_face_connected(&snake_curve(Bounds::new(a, b)));
        }
    }

    #[test]
    fn single_row_is_straight() {
        let points = snake_curve(Bounds::new(Vec3I::ZERO, Vec3I::new(3, 0, 0)));
        assert_eq!(
            points,
            vec![
                Vec3I::new(0, 0, 0),
                Vec3I::new(1, 0, 0),
                Vec3I::new(2, 0, 0),
                Vec3I::new(3, 0, 0),
            ]
        );
    }
}
