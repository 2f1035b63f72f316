use crate::prelude::{
    EstimationError, EstimationResult, Position, PositionEstimator, ANCHOR_ROLES,
};
use crate::processing::store::CompletedGroup;

/// Signal-ratio heuristic over the fixed right-triangle anchor layout.
///
/// With `r0, r1, r2` the strengths seen by anchors `(0,0)`, `(D,0)` and `(D,D)`:
/// `x = r0 / (r0 + r1) * D` and `y = r1 / (r1 + r2) * D`. This is not
/// multilateration; it only assumes strength falls off monotonically with
/// distance.
#[derive(Debug, Clone, Copy)]
pub struct RatioEstimator {
    distance: f64,
}

impl RatioEstimator {
    pub fn new(distance: f64) -> Self {
        Self { distance }
    }

    pub fn distance(&self) -> f64 {
        self.distance
    }
}

fn fraction(a: i32, b: i32) -> EstimationResult<f64> {
    let sum = i64::from(a) + i64::from(b);
    if sum == 0 {
        return Err(EstimationError::DegenerateSignal { a, b });
    }
    Ok(f64::from(a) / sum as f64)
}

impl PositionEstimator for RatioEstimator {
    fn estimate(&self, group: &CompletedGroup) -> EstimationResult<Position> {
        let [r0, r1, r2] = match group.readings.as_slice() {
            [a, b, c] => [a.signal_strength, b.signal_strength, c.signal_strength],
            other => {
                return Err(EstimationError::UnsupportedAnchorCount {
                    expected: ANCHOR_ROLES,
                    actual: other.len(),
                })
            }
        };

        let f01 = fraction(r0, r1)?;
        let f12 = fraction(r1, r2)?;
        Ok(Position {
            x: f01 * self.distance,
            y: f12 * self.distance,
        })
    }

    fn name(&self) -> &'static str {
        "signal-ratio"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::processing::store::GroupOrdering;
    use crate::wire::{CorrelationTag, Reading};

    fn group(strengths: &[i32]) -> CompletedGroup {
        let readings = strengths
            .iter()
            .enumerate()
            .map(|(idx, &signal_strength)| Reading {
                device_id: "AA:BB:CC:DD:EE:FF".into(),
                tag: CorrelationTag::canonical("1"),
                signal_strength,
                observed_at: idx as f64,
                source_id: format!("r{}", idx),
            })
            .collect();
        CompletedGroup {
            device_id: "AA:BB:CC:DD:EE:FF".into(),
            tag: CorrelationTag::canonical("1"),
            readings,
            ordering: GroupOrdering::AnchorRoles,
        }
    }

    #[test]
    fn ratio_estimate_matches_reference_values() {
        let estimator = RatioEstimator::new(10.0);
        let position = estimator.estimate(&group(&[-40, -60, -50])).unwrap();
        assert!((position.x - 4.0).abs() < 1e-12);
        assert!((position.y - 60.0 / 110.0 * 10.0).abs() < 1e-12);
        assert!((position.y - 5.4545).abs() < 1e-4);
    }

    #[test]
    fn repeated_estimates_are_identical() {
        let estimator = RatioEstimator::new(10.0);
        let input = group(&[-40, -60, -50]);
        let first = estimator.estimate(&input).unwrap();
        for _ in 0..16 {
            assert_eq!(estimator.estimate(&input).unwrap(), first);
        }
    }

    #[test]
    fn zero_sum_is_degenerate() {
        let estimator = RatioEstimator::new(10.0);
        assert_eq!(
            estimator.estimate(&group(&[40, -40, -50])),
            Err(EstimationError::DegenerateSignal { a: 40, b: -40 })
        );
        assert_eq!(
            estimator.estimate(&group(&[-40, 30, -30])),
            Err(EstimationError::DegenerateSignal { a: 30, b: -30 })
        );
    }

    #[test]
    fn only_three_anchors_are_supported() {
        let estimator = RatioEstimator::new(10.0);
        assert_eq!(
            estimator.estimate(&group(&[-40, -60])),
            Err(EstimationError::UnsupportedAnchorCount {
                expected: 3,
                actual: 2
            })
        );
        assert_eq!(
            estimator.estimate(&group(&[-40, -60, -50, -70])),
            Err(EstimationError::UnsupportedAnchorCount {
                expected: 3,
                actual: 4
            })
        );
    }
}
