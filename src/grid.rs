//! 検出ヘッドのグリッド座標を計算するモジュール

/// 1つの検出ヘッドの出力グリッドに対応する座標テーブル
///
/// `coord(y, x) == (x / grid_width, y / grid_height)` で、
/// 作成後に変更されることはありません。
#[derive(Clone, Debug, PartialEq)]
pub struct GridGeometry {
    grid_width: usize,
    grid_height: usize,
    /// 行優先 (`y * grid_width + x`)
    coord: Vec<(f32, f32)>,
    inv_grid_wh: (f32, f32),
}

/// `n / d` を倍精度で計算してから単精度に丸めます。
fn ratio(n: usize, d: usize) -> f32 {
    (n as f64 / d as f64) as f32
}

impl GridGeometry {
    /// 新しい `GridGeometry` を作成します。
    ///
    /// # Args
    /// * `grid_height` - グリッドの高さ (1以上)
    /// * `grid_width` - グリッドの幅 (1以上)
    pub fn new(grid_height: usize, grid_width: usize) -> Self {
        debug_assert!(grid_height > 0 && grid_width > 0);
        let coord = (0..grid_height)
            .flat_map(|y| (0..grid_width).map(move |x| (ratio(x, grid_width), ratio(y, grid_height))))
            .collect();
        Self {
            grid_width,
            grid_height,
            coord,
            inv_grid_wh: (ratio(1, grid_width), ratio(1, grid_height)),
        }
    }

    pub fn grid_width(&self) -> usize {
        self.grid_width
    }

    pub fn grid_height(&self) -> usize {
        self.grid_height
    }

    /// セル数 (`grid_height * grid_width`)
    pub fn cells(&self) -> usize {
        self.coord.len()
    }

    /// セル (`y`, `x`) の左上の正規化座標
    pub fn coord(&self, y: usize, x: usize) -> (f32, f32) {
        self.coord[y * self.grid_width + x]
    }

    pub fn coords(&self) -> &[(f32, f32)] {
        &self.coord
    }

    /// (1 / grid_width, 1 / grid_height)
    pub fn inv_grid_wh(&self) -> (f32, f32) {
        self.inv_grid_wh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn coordinates_cover_every_cell_once() {
        for (h, w) in [(1, 1), (2, 3), (13, 13), (26, 19)] {
            let g = GridGeometry::new(h, w);
            assert_eq!(g.cells(), h * w);
            assert_eq!(g.inv_grid_wh(), (1. / w as f32, 1. / h as f32));
            for y in 0..h {
                for x in 0..w {
                    assert_eq!(g.coord(y, x), (x as f32 / w as f32, y as f32 / h as f32));
                }
            }
            let mut seen = g.coords().to_vec();
            seen.sort_by(|a, b| a.partial_cmp(b).unwrap());
            seen.dedup();
            assert_eq!(seen.len(), h * w);
        }
    }

    #[test]
    fn coordinates_stay_in_unit_square() {
        let g = GridGeometry::new(7, 5);
        assert!(g
            .coords()
            .iter()
            .all(|&(x, y)| (0.0..1.0).contains(&x) && (0.0..1.0).contains(&y)));
        assert_eq!(g.coord(6, 4), (0.8, 6. / 7.));
    }
}
