//! Representative-score selection and tier mapping.
//!
//! One score is used directly, two use the higher, three use the median
//! ("middle score"). Tier thresholds are fixed and independent of the
//! program's configured score range.

use std::collections::BTreeMap;

use crate::models::{BureauCode, ScoreBounds, Tier};

pub const TIER_1_MIN: i32 = 620;
pub const TIER_2_MIN: i32 = 580;
pub const TIER_3_MIN: i32 = 500;

/// Score the tier is computed from, or `None` when no bureau returned one.
pub fn representative_score(scores: &BTreeMap<BureauCode, Option<i32>>) -> Option<i32> {
    let mut present: Vec<i32> = scores.values().filter_map(|s| *s).collect();
    present.sort_unstable();
    match present.len() {
        0 => None,
        1 => Some(present[0]),
        2 => Some(present[1]),
        // Median of an odd count; only three bureaus exist.
        n => Some(present[n / 2]),
    }
}

pub fn tier_for_score(score: i32) -> Tier {
    if score >= TIER_1_MIN {
        Tier::Tier1
    } else if score >= TIER_2_MIN {
        Tier::Tier2
    } else if score >= TIER_3_MIN {
        Tier::Tier3
    } else {
        Tier::Below
    }
}

/// Maps bureau scores to a tier. `_bounds` is accepted so callers pass the
/// program context, but thresholds do not depend on it; see
/// [`within_program_range`] for the informational range check.
pub fn classify(scores: &BTreeMap<BureauCode, Option<i32>>, _bounds: &ScoreBounds) -> Tier {
    match representative_score(scores) {
        Some(score) => tier_for_score(score),
        None => Tier::Filtered,
    }
}

/// Whether the representative score lies inside the program's configured range.
pub fn within_program_range(
    scores: &BTreeMap<BureauCode, Option<i32>>,
    bounds: &ScoreBounds,
) -> Option<bool> {
    representative_score(scores).map(|score| bounds.contains(score))
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDS: ScoreBounds = ScoreBounds {
        min_score: 300,
        max_score: 850,
    };

    fn scores(values: &[(BureauCode, Option<i32>)]) -> BTreeMap<BureauCode, Option<i32>> {
        values.iter().copied().collect()
    }

    #[test]
    fn single_score_is_used_directly() {
        let s = scores(&[(BureauCode::Tu, Some(585))]);
        assert_eq!(representative_score(&s), Some(585));
        assert_eq!(classify(&s, &BOUNDS), Tier::Tier2);
    }

    #[test]
    fn nulls_are_ignored() {
        let s = scores(&[
            (BureauCode::Eq, None),
            (BureauCode::Tu, Some(640)),
            (BureauCode::Ex, None),
        ]);
        assert_eq!(classify(&s, &BOUNDS), Tier::Tier1);
    }

    #[test]
    fn empty_map_is_filtered() {
        assert_eq!(classify(&BTreeMap::new(), &BOUNDS), Tier::Filtered);
        assert_eq!(within_program_range(&BTreeMap::new(), &BOUNDS), None);
    }

    #[test]
    fn range_check_uses_program_bounds() {
        let narrow = ScoreBounds {
            min_score: 640,
            max_score: 850,
        };
        let s = scores(&[(BureauCode::Eq, Some(630))]);
        assert_eq!(within_program_range(&s, &narrow), Some(false));
        // Tier does not move with the program range.
        assert_eq!(classify(&s, &narrow), Tier::Tier1);
    }
}
