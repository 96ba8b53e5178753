//! Mode parameter payload validation.
//!
//! Validates parameter bundles without contacting any hardware, so a GUI can
//! check a request before submission. CV carries real lab-safety rules; the
//! remaining modes currently check required fields only and say so via a
//! `not_implemented` warning.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{AppResult, BoxError};

/// Machine-readable description of a single validation finding.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ValidationIssue {
    /// Name of the validated parameter field
    pub field: String,
    /// Stable error or warning code
    pub code: String,
    /// Human-readable explanation of the issue
    pub message: String,
}

impl ValidationIssue {
    fn new(field: &str, code: &str, message: impl Into<String>) -> Self {
        Self {
            field: field.to_string(),
            code: code.to_string(),
            message: message.into(),
        }
    }
}

/// Structured validation response for the validation endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Flag indicating validation success
    pub ok: bool,
    /// Blocking validation errors
    pub errors: Vec<ValidationIssue>,
    /// Non-blocking validation hints
    pub warnings: Vec<ValidationIssue>,
}

impl ValidationResult {
    fn from_issues(errors: Vec<ValidationIssue>, warnings: Vec<ValidationIssue>) -> Self {
        Self {
            ok: errors.is_empty(),
            errors,
            warnings,
        }
    }
}

/// Run the configured validator for a mode.
///
/// Returns [`BoxError::UnsupportedMode`] when no validator exists for the
/// requested mode.
pub fn validate_mode_payload(mode: &str, params: &Map<String, Value>) -> AppResult<ValidationResult> {
    match mode.to_uppercase().as_str() {
        "CV" => Ok(validate_cv(params)),
        "DC" => Ok(validate_required_only(
            params,
            &["duration_s", "voltage_v"],
            "DC validation is not yet implemented; values were not checked.",
        )),
        "AC" => Ok(validate_required_only(
            params,
            &["duration_s", "frequency_hz", "voltage_v"],
            "AC validation is not yet implemented; values were not checked.",
        )),
        "LSV" => Ok(validate_required_only(
            params,
            &["start", "end", "scan_rate"],
            "LSV validation is not yet implemented; values were not checked.",
        )),
        "EIS" => Ok(validate_required_only(
            params,
            &["freq_start_hz", "freq_end_hz", "points", "spacing"],
            "EIS validation is not yet implemented; values were not checked.",
        )),
        "CDL" => Ok(validate_required_only(
            params,
            &["vertex_a_v", "vertex_b_v", "cycles"],
            "CDL validation is not yet implemented; values were not checked.",
        )),
        "CA" => Ok(validate_required_only(
            params,
            &["duration", "potential"],
            "CA validation is not yet implemented; values were not checked.",
        )),
        _ => Err(BoxError::UnsupportedMode(mode.to_string())),
    }
}

fn is_empty(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::String(s)) => s.trim().is_empty(),
        Some(_) => false,
    }
}

fn coerce_float(
    field: &str,
    params: &Map<String, Value>,
    errors: &mut Vec<ValidationIssue>,
    positive: bool,
    bounds: Option<(f64, f64)>,
) -> Option<f64> {
    let raw = params.get(field);
    if is_empty(raw) {
        errors.push(ValidationIssue::new(
            field,
            "missing_field",
            "Field is required.",
        ));
        return None;
    }

    let number = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let Some(number) = number else {
        errors.push(ValidationIssue::new(
            field,
            "not_a_number",
            "Value must be numeric.",
        ));
        return None;
    };

    if positive && number <= 0.0 {
        errors.push(ValidationIssue::new(
            field,
            "must_be_positive",
            "Value must be greater than zero.",
        ));
    }
    if let Some((min, max)) = bounds {
        if number < min {
            errors.push(ValidationIssue::new(
                field,
                "min_value",
                format!("Value must be at least {min}."),
            ));
        }
        if number > max {
            errors.push(ValidationIssue::new(
                field,
                "max_value",
                format!("Value must be at most {max}."),
            ));
        }
    }
    Some(number)
}

fn coerce_int(
    field: &str,
    params: &Map<String, Value>,
    errors: &mut Vec<ValidationIssue>,
    positive: bool,
) -> Option<i64> {
    let raw = params.get(field);
    if is_empty(raw) {
        errors.push(ValidationIssue::new(
            field,
            "missing_field",
            "Field is required.",
        ));
        return None;
    }
    let number = match raw {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    let Some(number) = number else {
        errors.push(ValidationIssue::new(
            field,
            "not_an_integer",
            "Value must be an integer.",
        ));
        return None;
    };
    let integer = number as i64;
    if positive && integer <= 0 {
        errors.push(ValidationIssue::new(
            field,
            "must_be_positive",
            "Value must be greater than zero.",
        ));
    }
    Some(integer)
}

/// CV parameters checked against lab safety limits and simple heuristics.
fn validate_cv(params: &Map<String, Value>) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();
    let voltage_bounds = Some((-10.0, 10.0));

    let start = coerce_float("start", params, &mut errors, false, voltage_bounds);
    let vertex1 = coerce_float("vertex1", params, &mut errors, false, voltage_bounds);
    let vertex2 = coerce_float("vertex2", params, &mut errors, false, voltage_bounds);
    let end = coerce_float("end", params, &mut errors, false, voltage_bounds);
    let scan_rate = coerce_float("scan_rate", params, &mut errors, true, None);
    let cycles = coerce_int("cycles", params, &mut errors, true);

    if let (Some(s), Some(v1), Some(v2), Some(e)) = (start, vertex1, vertex2, end) {
        if s == v1 && v1 == v2 && v2 == e {
            errors.push(ValidationIssue::new(
                "end",
                "zero_sweep",
                "Potential sweep must span at least one vertex.",
            ));
        }
    }

    if scan_rate.is_some_and(|r| r > 5.0) {
        warnings.push(ValidationIssue::new(
            "scan_rate",
            "high_value",
            "Scan rate exceeds 5 V/s; verify hardware capability.",
        ));
    }
    if cycles.is_some_and(|c| c > 50) {
        warnings.push(ValidationIssue::new(
            "cycles",
            "high_value",
            "Cycle count above 50 may lead to long experiment times.",
        ));
    }

    ValidationResult::from_issues(errors, warnings)
}

fn validate_required_only(
    params: &Map<String, Value>,
    required: &[&str],
    note: &str,
) -> ValidationResult {
    let mut errors = Vec::new();
    for field in required {
        if is_empty(params.get(*field)) {
            errors.push(ValidationIssue::new(
                field,
                "missing_field",
                "Field is required.",
            ));
        }
    }
    let warnings = vec![ValidationIssue::new("*", "not_implemented", note)];
    ValidationResult::from_issues(errors, warnings)
}
