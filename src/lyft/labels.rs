use ndarray::{Array3, ArrayView2};
use serde::{Deserialize, Serialize};

/// Category codes of the CARLA style label rasters that feed the two classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelCodes {
    pub lane_line: u8,
    pub lane: u8,
    pub vehicle: u8,
}

impl Default for LabelCodes {
    fn default() -> Self {
        Self {
            lane_line: 6,
            lane: 7,
            vehicle: 10,
        }
    }
}

/// Rows at or below `row` (on a `reference_height` tall raster) show the ego
/// vehicle's hood and never count as a car.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HoodExclusion {
    pub row: u32,
    pub reference_height: u32,
}

impl Default for HoodExclusion {
    fn default() -> Self {
        Self {
            row: 495,
            reference_height: 600,
        }
    }
}

impl HoodExclusion {
    // First excluded row for a raster `height` rows tall. A zero reference
    // height excludes nothing.
    pub fn cutoff(&self, height: usize) -> usize {
        (height as u64 * self.row as u64)
            .checked_div(self.reference_height as u64)
            .map_or(height, |row| row as usize)
    }
}

pub const ROAD_CHANNEL: usize = 0;
pub const CAR_CHANNEL: usize = 1;

// Maps a HxW label raster to a HxWx2 binary mask: road (lane + lane line) and
// car minus hood. Codes are u16 so 16-bit rasters are matched without rescaling.
pub fn process_labels(labels: ArrayView2<u16>, codes: &LabelCodes, hood: &HoodExclusion) -> Array3<u8> {
    let lane_line = u16::from(codes.lane_line);
    let lane = u16::from(codes.lane);
    let vehicle = u16::from(codes.vehicle);
    let (height, width) = labels.dim();
    let cutoff = hood.cutoff(height);
    let mut mask = Array3::<u8>::zeros((height, width, 2));
    for ((y, x), &code) in labels.indexed_iter() {
        if code == lane_line || code == lane {
            mask[[y, x, ROAD_CHANNEL]] = 1;
        }
        if code == vehicle && y < cutoff {
            mask[[y, x, CAR_CHANNEL]] = 1;
        }
    }

    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    fn transform(labels: &Array2<u16>) -> Array3<u8> {
        process_labels(labels.view(), &LabelCodes::default(), &HoodExclusion::default())
    }

    #[test]
    fn road_and_car_with_hood_excluded() {
        let mut labels = Array2::<u16>::zeros((600, 800));
        labels[[100, 200]] = 7;
        labels[[100, 300]] = 10;
        labels[[550, 300]] = 10;

        let mask = transform(&labels);
        assert_eq!(mask.dim(), (600, 800, 2));
        assert_eq!(mask[[100, 200, ROAD_CHANNEL]], 1);
        assert_eq!(mask[[100, 200, CAR_CHANNEL]], 0);
        assert_eq!(mask[[100, 300, CAR_CHANNEL]], 1);
        assert_eq!(mask[[100, 300, ROAD_CHANNEL]], 0);
        assert_eq!(mask[[550, 300, CAR_CHANNEL]], 0);
        assert_eq!(mask.iter().map(|&v| v as usize).sum::<usize>(), 2);
    }

    #[test]
    fn lane_lines_count_as_road() {
        let mut labels = Array2::<u16>::zeros((4, 4));
        labels[[0, 0]] = 6;
        labels[[3, 3]] = 7;
        labels[[1, 1]] = 5;

        let mask = transform(&labels);
        assert_eq!(mask[[0, 0, ROAD_CHANNEL]], 1);
        assert_eq!(mask[[3, 3, ROAD_CHANNEL]], 1);
        assert_eq!(mask[[1, 1, ROAD_CHANNEL]], 0);
    }

    #[test]
    fn boundary_row_is_excluded() {
        let mut labels = Array2::<u16>::zeros((600, 2));
        labels[[494, 0]] = 10;
        labels[[495, 0]] = 10;

        let mask = transform(&labels);
        assert_eq!(mask[[494, 0, CAR_CHANNEL]], 1);
        assert_eq!(mask[[495, 0, CAR_CHANNEL]], 0);
    }

    #[test]
    fn cutoff_scales_with_height() {
        let hood = HoodExclusion::default();
        assert_eq!(hood.cutoff(600), 495);
        assert_eq!(hood.cutoff(1200), 990);
        assert_eq!(hood.cutoff(300), 247);

        let mut labels = Array2::<u16>::zeros((300, 1));
        labels[[246, 0]] = 10;
        labels[[247, 0]] = 10;
        let mask = transform(&labels);
        assert_eq!(mask[[246, 0, CAR_CHANNEL]], 1);
        assert_eq!(mask[[247, 0, CAR_CHANNEL]], 0);
    }

    #[test]
    fn zero_reference_height_keeps_every_row() {
        let hood = HoodExclusion { row: 495, reference_height: 0 };
        assert_eq!(hood.cutoff(600), 600);

        let mut labels = Array2::<u16>::zeros((600, 1));
        labels[[599, 0]] = 10;
        let mask = process_labels(labels.view(), &LabelCodes::default(), &hood);
        assert_eq!(mask[[599, 0, CAR_CHANNEL]], 1);
    }

    #[test]
    fn wide_codes_do_not_alias_byte_codes() {
        let mut labels = Array2::<u16>::zeros((1, 2));
        labels[[0, 0]] = 7;
        labels[[0, 1]] = 7 + 256;
        let mask = transform(&labels);
        assert_eq!(mask[[0, 0, ROAD_CHANNEL]], 1);
        assert_eq!(mask[[0, 1, ROAD_CHANNEL]], 0);
    }

    #[test]
    fn empty_raster_is_fine() {
        let labels = Array2::<u16>::zeros((0, 0));
        assert_eq!(transform(&labels).dim(), (0, 0, 2));
    }
}
