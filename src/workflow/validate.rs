//! Shape checks applied to every stage output before it feeds the next stage.
//!
//! Any failure here is a `StageError::SchemaValidation` and is never retried.

use std::collections::HashSet;

use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::error::StageError;
use crate::workflow::types::{
    Classification, ComplianceRequirement, ComplianceStep, Plan, RegulatoryMapping, Stage,
    Synthesis,
};

fn invalid(stage: Stage, reason: impl Into<String>) -> StageError {
    StageError::SchemaValidation {
        stage,
        reason: reason.into(),
    }
}

fn decode<T: DeserializeOwned>(stage: Stage, raw: Value) -> Result<T, StageError> {
    serde_json::from_value(raw).map_err(|e| invalid(stage, e.to_string()))
}

pub fn classification(raw: Value) -> Result<Classification, StageError> {
    let stage = Stage::Classification;
    let mut out: Classification = decode(stage, raw)?;
    out.business_type = out.business_type.trim().to_string();
    out.location = out.location.trim().to_string();
    if out.business_type.is_empty() {
        return Err(invalid(stage, "business_type is empty"));
    }
    if out.location.is_empty() {
        return Err(invalid(stage, "location is empty"));
    }
    if let Some(score) = out.confidence_score {
        if !(0.0..=1.0).contains(&score) {
            return Err(invalid(stage, format!("confidence_score {score} out of range")));
        }
    }
    out.products.retain(|p| !p.trim().is_empty());
    Ok(out)
}

pub fn regulatory_mapping(raw: Value) -> Result<RegulatoryMapping, StageError> {
    let stage = Stage::RegulatoryMapping;
    let out: RegulatoryMapping = decode(stage, raw)?;
    if out.requirements.is_empty() {
        return Err(invalid(stage, "no requirements returned"));
    }
    let mut seen = HashSet::new();
    for req in &out.requirements {
        if req.requirement_id.trim().is_empty() {
            return Err(invalid(stage, "requirement with empty requirement_id"));
        }
        if !seen.insert(req.requirement_id.as_str()) {
            return Err(invalid(
                stage,
                format!("duplicate requirement_id {}", req.requirement_id),
            ));
        }
    }
    Ok(out)
}

pub fn synthesis(
    raw: Value,
    requirements: &[ComplianceRequirement],
) -> Result<Synthesis, StageError> {
    let stage = Stage::Synthesis;
    let mut out: Synthesis = decode(stage, raw)?;
    out.detailed_steps = steps(stage, out.detailed_steps, requirements)?;
    Ok(out)
}

pub fn plan(raw: Value, requirements: &[ComplianceRequirement]) -> Result<Plan, StageError> {
    let stage = Stage::Planning;
    let mut out: Plan = decode(stage, raw)?;
    out.compliance_steps = steps(stage, out.compliance_steps, requirements)?;
    Ok(out)
}

/// Shared step checks: non-empty, sequential numbering from 1, sane fields,
/// totals that fit their types, and every `requirement_id` resolving to a
/// known requirement.
fn steps(
    stage: Stage,
    mut steps: Vec<ComplianceStep>,
    requirements: &[ComplianceRequirement],
) -> Result<Vec<ComplianceStep>, StageError> {
    if steps.is_empty() {
        return Err(invalid(stage, "at least one compliance step is required"));
    }

    steps.sort_by_key(|s| s.step_number);
    let mut total_cost: u64 = 0;
    let mut total_days: u32 = 0;
    for (index, step) in steps.iter_mut().enumerate() {
        let expected = index as u32 + 1;
        if step.step_number != expected {
            return Err(invalid(
                stage,
                format!(
                    "step numbers must be unique and sequential from 1 (found {} at position {expected})",
                    step.step_number
                ),
            ));
        }
        if step.title.trim().is_empty() {
            return Err(invalid(stage, format!("step {expected} has an empty title")));
        }
        if step.timeline_days == 0 {
            return Err(invalid(stage, format!("step {expected} has a zero timeline")));
        }
        total_cost = total_cost
            .checked_add(step.cost)
            .ok_or_else(|| invalid(stage, format!("total cost overflows at step {expected}")))?;
        total_days = total_days.checked_add(step.timeline_days).ok_or_else(|| {
            invalid(stage, format!("total timeline overflows at step {expected}"))
        })?;
        step.documents_required = step
            .documents_required
            .iter()
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .collect();
    }

    let known: HashSet<&str> = requirements
        .iter()
        .map(|r| r.requirement_id.as_str())
        .collect();
    if let Some(orphan) = steps
        .iter()
        .find(|s| !known.contains(s.requirement_id.as_str()))
    {
        return Err(invalid(
            stage,
            format!(
                "step {} references unknown requirement {}",
                orphan.step_number, orphan.requirement_id
            ),
        ));
    }

    Ok(steps)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::workflow::types::RequirementCategory;
    use crate::workflow::types::fixtures::requirement;

    fn reqs() -> Vec<ComplianceRequirement> {
        vec![requirement("sbp", RequirementCategory::Mandatory)]
    }

    fn step_json(n: u32, req: &str) -> Value {
        json!({
            "step_number": n,
            "title": "Single Business Permit",
            "description": "Apply at the county offices",
            "cost": 5000,
            "timeline_days": 7,
            "authority": "Nairobi City County",
            "documents_required": ["ID copy", "  "],
            "requirement_id": req
        })
    }

    #[test]
    fn classification_accepts_minimal_shape() {
        let out = classification(json!({
            "business_type": " electronics retail ",
            "location": "Westlands"
        }))
        .unwrap();
        assert_eq!(out.business_type, "electronics retail");
        assert!(out.products.is_empty());
        assert!(out.specific_area.is_none());
    }

    #[test]
    fn classification_rejects_missing_location() {
        let err = classification(json!({"business_type": "retail"})).unwrap_err();
        assert!(!err.is_transient());
        assert_eq!(err.stage(), Stage::Classification);
    }

    #[test]
    fn classification_rejects_bad_confidence() {
        assert!(classification(json!({
            "business_type": "retail",
            "location": "Nairobi",
            "confidence_score": 4.2
        }))
        .is_err());
    }

    #[test]
    fn mapping_rejects_non_list() {
        let err = regulatory_mapping(json!({"requirements": "not-a-list"})).unwrap_err();
        assert!(matches!(err, StageError::SchemaValidation { stage: Stage::RegulatoryMapping, .. }));
    }

    #[test]
    fn mapping_rejects_unknown_category() {
        let err = regulatory_mapping(json!({"requirements": [{
            "requirement_id": "r1", "name": "x", "authority": "y", "category": "optional"
        }]}))
        .unwrap_err();
        assert!(matches!(err, StageError::SchemaValidation { .. }));
    }

    #[test]
    fn mapping_rejects_duplicates() {
        let item = json!({"requirement_id": "r1", "name": "x", "authority": "y", "category": "mandatory"});
        assert!(regulatory_mapping(json!({"requirements": [item.clone(), item]})).is_err());
    }

    #[test]
    fn synthesis_trims_documents() {
        let out = synthesis(json!({"detailed_steps": [step_json(1, "sbp")]}), &reqs()).unwrap();
        assert_eq!(out.detailed_steps[0].documents_required, vec!["ID copy".to_string()]);
    }

    #[test]
    fn orphaned_requirement_is_rejected() {
        let err = synthesis(json!({"detailed_steps": [step_json(1, "ghost")]}), &reqs()).unwrap_err();
        match err {
            StageError::SchemaValidation { reason, .. } => assert!(reason.contains("ghost")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn non_sequential_steps_rejected() {
        let raw = json!({"compliance_steps": [step_json(1, "sbp"), step_json(3, "sbp")]});
        assert!(plan(raw, &reqs()).is_err());
    }

    #[test]
    fn negative_cost_rejected() {
        let mut bad = step_json(1, "sbp");
        bad["cost"] = json!(-10);
        assert!(plan(json!({"compliance_steps": [bad]}), &reqs()).is_err());
    }

    #[test]
    fn overflowing_timeline_rejected() {
        let mut first = step_json(1, "sbp");
        let mut second = step_json(2, "sbp");
        first["timeline_days"] = json!(3_000_000_000u32);
        second["timeline_days"] = json!(3_000_000_000u32);
        let err = plan(json!({"compliance_steps": [first, second]}), &reqs()).unwrap_err();
        match err {
            StageError::SchemaValidation { stage, reason } => {
                assert_eq!(stage, Stage::Planning);
                assert!(reason.contains("timeline"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn overflowing_cost_rejected() {
        let mut first = step_json(1, "sbp");
        let mut second = step_json(2, "sbp");
        first["cost"] = json!(u64::MAX);
        second["cost"] = json!(1);
        let raw = json!({"detailed_steps": [first, second]});
        assert!(matches!(
            synthesis(raw, &reqs()),
            Err(StageError::SchemaValidation { .. })
        ));
    }

    #[test]
    fn plan_steps_are_sorted() {
        let raw = json!({"compliance_steps": [step_json(2, "sbp"), step_json(1, "sbp")]});
        let out = plan(raw, &reqs()).unwrap();
        assert_eq!(out.compliance_steps[0].step_number, 1);
    }
}
