use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Hazard {
    Hypoxia,
    Hyperoxia,
}

#[derive(Clone, Copy, Debug)]
pub struct SafetyLimits {
    /// PPO2 below this is hypoxic
    pub hypoxic_below: f64,
    /// PPO2 above this risks CNS toxicity
    pub hyperoxic_above: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            hypoxic_below: 0.16,
            hyperoxic_above: 2.0,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyStatus {
    pub hypoxic: bool,
    pub hyperoxic: bool,
    pub fatal: bool,
}

impl SafetyStatus {
    pub fn hazard(&self) -> Option<Hazard> {
        if self.hypoxic {
            Some(Hazard::Hypoxia)
        } else if self.hyperoxic {
            Some(Hazard::Hyperoxia)
        } else {
            None
        }
    }
}

/// Derive the diver's status from the loop PPO2.
/// Nothing is latched: a later PPO2 back in range clears every flag.
pub fn evaluate(limits: &SafetyLimits, ppo2: f64) -> SafetyStatus {
    let hypoxic = ppo2 < limits.hypoxic_below;
    let hyperoxic = ppo2 > limits.hyperoxic_above;
    SafetyStatus {
        hypoxic,
        hyperoxic,
        fatal: hypoxic || hyperoxic,
    }
}

/// Display thresholds for the dive computer readout. These only colour the
/// display; they never change [`SafetyStatus`].
#[derive(Clone, Copy, Debug)]
pub struct AlarmLimits {
    /// Readings above this are flagged
    pub reading_high: f64,
    /// Readings below this are flagged
    pub reading_low: f64,
    /// Readings at or below this are taken as a dead cell, not a low loop
    pub reading_floor: f64,
    /// END beyond this is narcotic (m)
    pub narcotic_end_m: f64,
}

impl Default for AlarmLimits {
    fn default() -> Self {
        Self {
            reading_high: 1.60,
            reading_low: 0.40,
            reading_floor: 0.01,
            narcotic_end_m: 40.0,
        }
    }
}

/// Colour class for one PPO2 number on the display.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadingAlarm {
    Normal,
    /// Out of the working band
    Warning,
    /// Below the hypoxic limit
    Hypoxic,
}

pub fn reading_alarm(limits: &SafetyLimits, alarms: &AlarmLimits, ppo2: f64) -> ReadingAlarm {
    if ppo2 < limits.hypoxic_below {
        ReadingAlarm::Hypoxic
    } else if ppo2 > alarms.reading_high
        || (ppo2 < alarms.reading_low && ppo2 > alarms.reading_floor)
    {
        ReadingAlarm::Warning
    } else {
        ReadingAlarm::Normal
    }
}

/// What the diver is suffering from, worst first.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DiverCondition {
    Ok,
    Narcosis,
    Hypoxia,
    Hyperoxia,
}

pub fn diver_condition(
    status: &SafetyStatus,
    alarms: &AlarmLimits,
    equivalent_narcotic_depth_m: f64,
) -> DiverCondition {
    match status.hazard() {
        Some(Hazard::Hyperoxia) => DiverCondition::Hyperoxia,
        Some(Hazard::Hypoxia) => DiverCondition::Hypoxia,
        None if equivalent_narcotic_depth_m > alarms.narcotic_end_m => DiverCondition::Narcosis,
        None => DiverCondition::Ok,
    }
}

/// True when the diver is deeper than the diluent's MOD.
pub fn beyond_mod(depth_m: f64, max_operating_depth_m: f64) -> bool {
    max_operating_depth_m < depth_m
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundaries_are_exclusive() {
        let l = SafetyLimits::default();
        assert!(!evaluate(&l, 0.16).fatal);
        assert!(!evaluate(&l, 2.0).fatal);
        assert!(evaluate(&l, 0.159).hypoxic);
        assert!(evaluate(&l, 2.01).hyperoxic);
    }

    #[test]
    fn fatal_iff_either_hazard() {
        let l = SafetyLimits::default();
        for i in 0..=300 {
            let ppo2 = i as f64 * 0.01;
            let s = evaluate(&l, ppo2);
            assert_eq!(s.fatal, s.hypoxic || s.hyperoxic);
            assert_eq!(s.fatal, s.hazard().is_some());
        }
    }

    #[test]
    fn hazard_reports_kind() {
        let l = SafetyLimits::default();
        assert_eq!(evaluate(&l, 0.05).hazard(), Some(Hazard::Hypoxia));
        assert_eq!(evaluate(&l, 2.5).hazard(), Some(Hazard::Hyperoxia));
        assert_eq!(evaluate(&l, 1.2).hazard(), None);
    }

    #[test]
    fn readings_are_classed_for_display() {
        let (l, a) = (SafetyLimits::default(), AlarmLimits::default());
        assert_eq!(reading_alarm(&l, &a, 1.2), ReadingAlarm::Normal);
        assert_eq!(reading_alarm(&l, &a, 1.60), ReadingAlarm::Normal);
        assert_eq!(reading_alarm(&l, &a, 0.40), ReadingAlarm::Normal);
        assert_eq!(reading_alarm(&l, &a, 1.61), ReadingAlarm::Warning);
        assert_eq!(reading_alarm(&l, &a, 0.39), ReadingAlarm::Warning);
        assert_eq!(reading_alarm(&l, &a, 0.16), ReadingAlarm::Warning);
        assert_eq!(reading_alarm(&l, &a, 0.15), ReadingAlarm::Hypoxic);
        assert_eq!(reading_alarm(&l, &a, 0.0), ReadingAlarm::Hypoxic);
    }

    #[test]
    fn condition_prefers_hazard_over_narcosis() {
        let (l, a) = (SafetyLimits::default(), AlarmLimits::default());
        assert_eq!(diver_condition(&evaluate(&l, 1.2), &a, 20.0), DiverCondition::Ok);
        assert_eq!(diver_condition(&evaluate(&l, 1.2), &a, 40.0), DiverCondition::Ok);
        assert_eq!(diver_condition(&evaluate(&l, 1.2), &a, 41.0), DiverCondition::Narcosis);
        assert_eq!(diver_condition(&evaluate(&l, 2.4), &a, 55.0), DiverCondition::Hyperoxia);
        assert_eq!(diver_condition(&evaluate(&l, 0.1), &a, 55.0), DiverCondition::Hypoxia);
    }

    #[test]
    fn depth_alarm_past_mod() {
        assert!(!beyond_mod(30.0, 56.7));
        assert!(!beyond_mod(56.7, 56.7));
        assert!(beyond_mod(60.0, 56.7));
        assert!(!beyond_mod(200.0, f64::INFINITY));
    }
}
