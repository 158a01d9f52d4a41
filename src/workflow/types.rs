//! Shared types for the compliance pipeline.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Stages ──────────────────────────────────────────────────────────

/// One of the four sequential pipeline stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Classification,
    RegulatoryMapping,
    Synthesis,
    Planning,
}

impl Stage {
    pub const ALL: [Stage; 4] = [
        Stage::Classification,
        Stage::RegulatoryMapping,
        Stage::Synthesis,
        Stage::Planning,
    ];

    /// Short label for logging and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Classification => "classification",
            Self::RegulatoryMapping => "regulatory_mapping",
            Self::Synthesis => "synthesis",
            Self::Planning => "planning",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

// ── Stage outputs ───────────────────────────────────────────────────

/// Output of the classification stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub business_type: String,
    pub location: String,
    #[serde(default)]
    pub specific_area: Option<String>,
    #[serde(default)]
    pub products: Vec<String>,
    #[serde(default)]
    pub confidence_score: Option<f64>,
}

/// How binding a requirement is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequirementCategory {
    Mandatory,
    Conditional,
    Recommended,
}

impl RequirementCategory {
    /// Rendering order used by the formatter.
    pub const ORDERED: [RequirementCategory; 3] = [
        RequirementCategory::Mandatory,
        RequirementCategory::Conditional,
        RequirementCategory::Recommended,
    ];

    pub fn heading(&self) -> &'static str {
        match self {
            Self::Mandatory => "Mandatory",
            Self::Conditional => "Conditional",
            Self::Recommended => "Recommended",
        }
    }
}

/// A permit, licence or registration produced by the regulatory mapping stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceRequirement {
    pub requirement_id: String,
    pub name: String,
    pub authority: String,
    pub category: RequirementCategory,
}

/// Output of the regulatory mapping stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegulatoryMapping {
    pub requirements: Vec<ComplianceRequirement>,
}

/// A single actionable step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComplianceStep {
    pub step_number: u32,
    pub title: String,
    #[serde(default)]
    pub description: String,
    /// Estimated cost in KES.
    pub cost: u64,
    pub timeline_days: u32,
    pub authority: String,
    #[serde(default)]
    pub documents_required: Vec<String>,
    /// Weak reference into the run's requirements.
    pub requirement_id: String,
}

/// Output of the synthesis stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Synthesis {
    pub detailed_steps: Vec<ComplianceStep>,
}

/// Output of the planning stage. Totals are advisory; the roadmap recomputes them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    #[serde(default)]
    pub session_id: Option<String>,
    pub compliance_steps: Vec<ComplianceStep>,
    #[serde(default)]
    pub total_estimated_cost: Option<u64>,
    #[serde(default)]
    pub total_timeline_days: Option<u32>,
    #[serde(default)]
    pub business_type: Option<String>,
    #[serde(default)]
    pub location: Option<String>,
}

// ── Roadmap ─────────────────────────────────────────────────────────

/// The final result of one successful pipeline run.
///
/// Fields are private: a roadmap is built once through [`ComplianceRoadmap::new`],
/// which derives the totals from the steps, and is read-only afterwards.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ComplianceRoadmap {
    session_id: String,
    compliance_steps: Vec<ComplianceStep>,
    requirements: Vec<ComplianceRequirement>,
    total_estimated_cost: u64,
    total_timeline_days: u32,
    business_type: String,
    location: String,
    generated_at: DateTime<Utc>,
}

/// Serialized shape used to reload a roadmap from storage.
#[derive(Deserialize)]
struct StoredRoadmap {
    session_id: String,
    compliance_steps: Vec<ComplianceStep>,
    requirements: Vec<ComplianceRequirement>,
    business_type: String,
    location: String,
    generated_at: DateTime<Utc>,
}

impl ComplianceRoadmap {
    /// Assemble a roadmap. Steps are ordered by step number and totals are
    /// summed from the steps.
    pub fn new(
        session_id: impl Into<String>,
        mut compliance_steps: Vec<ComplianceStep>,
        requirements: Vec<ComplianceRequirement>,
        business_type: impl Into<String>,
        location: impl Into<String>,
    ) -> Self {
        compliance_steps.sort_by_key(|s| s.step_number);
        // Validated steps never reach the cap.
        let total_estimated_cost = compliance_steps
            .iter()
            .fold(0u64, |acc, s| acc.saturating_add(s.cost));
        let total_timeline_days = compliance_steps
            .iter()
            .fold(0u32, |acc, s| acc.saturating_add(s.timeline_days));
        Self {
            session_id: session_id.into(),
            compliance_steps,
            requirements,
            total_estimated_cost,
            total_timeline_days,
            business_type: business_type.into(),
            location: location.into(),
            generated_at: Utc::now(),
        }
    }

    /// Rebuild from the JSON written by `to_json`. Totals are recomputed.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        let stored: StoredRoadmap = serde_json::from_str(json)?;
        let mut roadmap = Self::new(
            stored.session_id,
            stored.compliance_steps,
            stored.requirements,
            stored.business_type,
            stored.location,
        );
        roadmap.generated_at = stored.generated_at;
        Ok(roadmap)
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn compliance_steps(&self) -> &[ComplianceStep] {
        &self.compliance_steps
    }

    pub fn requirements(&self) -> &[ComplianceRequirement] {
        &self.requirements
    }

    pub fn total_estimated_cost(&self) -> u64 {
        self.total_estimated_cost
    }

    pub fn total_timeline_days(&self) -> u32 {
        self.total_timeline_days
    }

    pub fn business_type(&self) -> &str {
        &self.business_type
    }

    pub fn location(&self) -> &str {
        &self.location
    }

    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    /// Look up the requirement a step refers to.
    pub fn requirement_for(&self, step: &ComplianceStep) -> Option<&ComplianceRequirement> {
        self.requirements
            .iter()
            .find(|r| r.requirement_id == step.requirement_id)
    }

    /// Steps grouped by the category of their requirement, in rendering order.
    /// Categories with no steps are omitted.
    pub fn steps_by_category(&self) -> Vec<(RequirementCategory, Vec<&ComplianceStep>)> {
        let categories: HashMap<&str, RequirementCategory> = self
            .requirements
            .iter()
            .map(|r| (r.requirement_id.as_str(), r.category))
            .collect();

        RequirementCategory::ORDERED
            .iter()
            .filter_map(|category| {
                let steps: Vec<&ComplianceStep> = self
                    .compliance_steps
                    .iter()
                    .filter(|s| categories.get(s.requirement_id.as_str()) == Some(category))
                    .collect();
                (!steps.is_empty()).then_some((*category, steps))
            })
            .collect()
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn totals_are_summed_from_steps() {
        let roadmap = ComplianceRoadmap::new(
            "s1",
            vec![step(2, "r1", 1500, 3), step(1, "r1", 5000, 7), step(3, "r2", 0, 1)],
            vec![
                requirement("r1", RequirementCategory::Mandatory),
                requirement("r2", RequirementCategory::Recommended),
            ],
            "retail",
            "Nairobi",
        );
        assert_eq!(roadmap.total_estimated_cost(), 6500);
        assert_eq!(roadmap.total_timeline_days(), 11);
        let numbers: Vec<u32> = roadmap.compliance_steps().iter().map(|s| s.step_number).collect();
        assert_eq!(numbers, vec![1, 2, 3]);
    }

    #[test]
    fn sum_invariant_holds_across_shapes() {
        for n in 0..12u64 {
            let steps: Vec<ComplianceStep> = (1..=n)
                .map(|i| step(i as u32, "r1", i * 750, 1))
                .collect();
            let expected: u64 = steps.iter().map(|s| s.cost).sum();
            let roadmap = ComplianceRoadmap::new(
                "s",
                steps,
                vec![requirement("r1", RequirementCategory::Mandatory)],
                "t",
                "l",
            );
            assert_eq!(roadmap.total_estimated_cost(), expected);
        }
    }

    #[test]
    fn json_reload_recomputes_totals() {
        let roadmap = ComplianceRoadmap::new(
            "s1",
            vec![step(1, "r1", 5000, 7)],
            vec![requirement("r1", RequirementCategory::Mandatory)],
            "retail",
            "Westlands",
        );
        let mut value: serde_json::Value =
            serde_json::from_str(&roadmap.to_json().unwrap()).unwrap();
        value["total_estimated_cost"] = serde_json::json!(999_999);
        let reloaded = ComplianceRoadmap::from_json(&value.to_string()).unwrap();
        assert_eq!(reloaded.total_estimated_cost(), 5000);
        assert_eq!(reloaded.generated_at(), roadmap.generated_at());
        assert_eq!(reloaded, roadmap);
    }

    #[test]
    fn steps_grouped_in_category_order() {
        let roadmap = ComplianceRoadmap::new(
            "s1",
            vec![step(1, "rec", 100, 1), step(2, "man", 200, 2), step(3, "man", 300, 3)],
            vec![
                requirement("rec", RequirementCategory::Recommended),
                requirement("man", RequirementCategory::Mandatory),
            ],
            "retail",
            "Nairobi",
        );
        let groups = roadmap.steps_by_category();
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, RequirementCategory::Mandatory);
        assert_eq!(groups[0].1.len(), 2);
        assert_eq!(groups[1].0, RequirementCategory::Recommended);
    }

    #[test]
    fn category_serializes_snake_case() {
        let json = serde_json::to_string(&RequirementCategory::Conditional).unwrap();
        assert_eq!(json, "\"conditional\"");
        assert_eq!(Stage::RegulatoryMapping.to_string(), "regulatory_mapping");
    }
}
