use serde::Serialize;

/// Battery percentage below which a lost vehicle lands instead of flying home.
pub const DEFAULT_BATTERY_THRESHOLD_PCT: u8 = 70;

/// Safety action chosen by [`decide`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    Disarm,
    /// On the ground with motors off; nothing to do.
    AlreadyDisarmed,
    LandThenDisarm,
    ReturnToLaunch,
}

/// Termination decision table.
///
/// | landed | armed | battery            | action           |
/// |--------|-------|--------------------|------------------|
/// | yes    | yes   | any                | disarm           |
/// | yes    | no    | any                | nothing          |
/// | no     | any   | unknown or < limit | land, disarm     |
/// | no     | any   | >= limit           | return to launch |
///
/// Unknown battery after a reconnect could be a full pack or a nearly empty
/// one, so it is treated as low.
pub fn decide(landed: bool, armed: bool, battery_remaining: Option<u8>, threshold_pct: u8) -> Action {
    if landed {
        return if armed { Action::Disarm } else { Action::AlreadyDisarmed };
    }
    match battery_remaining {
        Some(pct) if pct >= threshold_pct => Action::ReturnToLaunch,
        _ => Action::LandThenDisarm,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T: u8 = DEFAULT_BATTERY_THRESHOLD_PCT;

    #[test]
    fn landed_cases_ignore_battery() {
        for battery in [None, Some(0), Some(69), Some(70), Some(100)] {
            assert_eq!(decide(true, true, battery, T), Action::Disarm);
            assert_eq!(decide(true, false, battery, T), Action::AlreadyDisarmed);
        }
    }

    #[test]
    fn airborne_low_battery_lands() {
        assert_eq!(decide(false, true, Some(0), T), Action::LandThenDisarm);
        assert_eq!(decide(false, true, Some(69), T), Action::LandThenDisarm);
        assert_eq!(decide(false, false, Some(12), T), Action::LandThenDisarm);
    }

    #[test]
    fn airborne_unknown_battery_assumes_worst() {
        assert_eq!(decide(false, true, None, T), Action::LandThenDisarm);
        assert_eq!(decide(false, false, None, T), Action::LandThenDisarm);
    }

    #[test]
    fn airborne_healthy_battery_returns_home() {
        assert_eq!(decide(false, true, Some(70), T), Action::ReturnToLaunch);
        assert_eq!(decide(false, true, Some(100), T), Action::ReturnToLaunch);
    }

    #[test]
    fn airborne_never_just_disarms() {
        for armed in [false, true] {
            for battery in std::iter::once(None).chain((0..=100).map(Some)) {
                let a = decide(false, armed, battery, T);
                assert!(matches!(a, Action::LandThenDisarm | Action::ReturnToLaunch), "{battery:?} -> {a:?}");
            }
        }
    }
}
