// SPDX-License-Identifier: MIT

//! Adaptive configuration seeding

use once_cell::sync::Lazy;
use serde_json::Value;
use std::collections::HashSet;

use crate::core::session::ExperimentConfig;
use crate::flow::tracker::{AdaptiveAnalysis, RecoveryPotential};

/// Parameters that describe the experiment itself and may be carried from
/// one node to another. Identity fields such as `Test Name` stay with the node.
static EXPERIMENT_PARAMETERS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "Test Type",
        "Test Mode",
        "Test Time",
        "Loops",
        "Content",
        "Configuration (Mask)",
        "Check Core",
        "Reset",
        "Reset on PASS",
        "Stop on Fail",
        "Pseudo Config",
        "Disable 2 Cores",
        "Core License",
        "Post Process",
        "Linux Content Line",
        "Dragon Content Line",
        "Voltage Type",
        "Voltage IA",
        "Voltage CFC",
        "Frequency IA",
        "Frequency CFC",
        "Type",
        "Domain",
        "Start",
        "End",
        "Steps",
    ]
    .into_iter()
    .collect()
});

const PPVC: &str = "PPVC";

pub fn is_experiment_parameter(name: &str) -> bool {
    EXPERIMENT_PARAMETERS.contains(name)
}

/// Build the configuration an Adaptive node runs with
///
/// Starts from the node's own parameters, overlays the source experiment's
/// experiment parameters, pins the swept domain to the sweep's safe value and
/// picks the voltage type from the recovery potential.
pub fn seed_config(own: &ExperimentConfig, analysis: &AdaptiveAnalysis) -> ExperimentConfig {
    let mut parameters = own.parameters.clone();

    for (name, value) in &analysis.recommended_config.parameters {
        if is_experiment_parameter(name) {
            parameters.insert(name.clone(), value.clone());
        }
    }

    if let Some(insights) = &analysis.sweep_insights {
        if let Some(safe) = insights.recommended_value() {
            log::info!(
                "Adaptive seed: {} = {:.3} ({:?})",
                insights.parameter_key,
                safe,
                insights.pattern
            );
            parameters.insert(insights.parameter_key.clone(), Value::from(safe));
        }
    }

    let source_voltage_type = analysis.recommended_config.get_str("Voltage Type");
    match analysis.recovery_potential {
        RecoveryPotential::High | RecoveryPotential::Medium => {
            parameters.insert("Voltage Type".to_string(), Value::from(PPVC));
        }
        _ => {
            if let Some(kind) = source_voltage_type {
                parameters.insert("Voltage Type".to_string(), Value::from(kind));
            }
        }
    }

    ExperimentConfig::new(own.key.clone(), parameters)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flow::tracker::{SweepInsights, SweepPattern};
    use serde_json::json;

    fn analysis(potential: RecoveryPotential, sweep: Option<SweepInsights>) -> AdaptiveAnalysis {
        let params = json!({
            "Test Name": "source test",
            "Test Type": "Loops",
            "Loops": 7,
            "Content": "Dragon",
            "Voltage Type": "vbump",
            "COM Port": 8
        });
        AdaptiveAnalysis {
            source_node_id: "a1".to_string(),
            source_node_name: "AllFail".to_string(),
            recommended_config: ExperimentConfig::new(
                "cfgSource",
                params.as_object().unwrap().clone(),
            ),
            sweep_insights: sweep,
            recovery_potential: potential,
            fail_rate: 100.0,
            fail_count: 5,
            selection_reason: String::new(),
        }
    }

    fn own() -> ExperimentConfig {
        let params = json!({"Test Name": "adaptive test", "Loops": 3});
        ExperimentConfig::new("cfgAdaptive", params.as_object().unwrap().clone())
    }

    #[test]
    fn test_seed_keeps_identity_and_filters_parameters() {
        let seeded = seed_config(&own(), &analysis(RecoveryPotential::Low, None));
        assert_eq!(seeded.key, "cfgAdaptive");
        assert_eq!(seeded.test_name(), Some("adaptive test"));
        assert_eq!(seeded.get_f64("Loops"), Some(7.0));
        assert_eq!(seeded.get_str("Content"), Some("Dragon"));
        assert!(seeded.get("COM Port").is_none());
        assert_eq!(seeded.get_str("Voltage Type"), Some("vbump"));
    }

    #[test]
    fn test_seed_switches_to_ppvc_with_recovery_potential() {
        let seeded = seed_config(&own(), &analysis(RecoveryPotential::Medium, None));
        assert_eq!(seeded.get_str("Voltage Type"), Some("PPVC"));
    }

    #[test]
    fn test_seed_applies_sweep_safe_value() {
        let insights = SweepInsights {
            parameter_key: "Voltage IA".to_string(),
            pattern: SweepPattern::ThresholdSensitivity,
            pass_range: Some((0.9, 1.0)),
            safe_values: vec![0.9, 0.95, 1.0],
            recommendation: String::new(),
        };
        let seeded = seed_config(&own(), &analysis(RecoveryPotential::High, Some(insights)));
        assert_eq!(seeded.get_f64("Voltage IA"), Some(0.9));
    }
}
