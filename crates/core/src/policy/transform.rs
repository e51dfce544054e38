use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::digest::sha256_hex;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct BandThreshold {
    pub min: f64,
    pub label: String,
}

/// Field-level reduction applied by the minimizer before a value leaves the
/// gateway.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldTransform {
    MaskLast4,
    Count,
    Hash,
    Band { thresholds: Vec<BandThreshold> },
}

impl FieldTransform {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MaskLast4 => "mask_last4",
            Self::Count => "count",
            Self::Hash => "hash",
            Self::Band { .. } => "band",
        }
    }

    /// Returns `None` when the transform does not apply to the value; the
    /// caller must then drop the field.
    pub fn apply(&self, value: Value) -> Option<Value> {
        match self {
            Self::MaskLast4 => mask_last4(&value).map(Value::String),
            Self::Count => match value {
                Value::Array(items) => Some(Value::from(items.len())),
                Value::Object(entries) => Some(Value::from(entries.len())),
                _ => None,
            },
            Self::Hash => match value {
                Value::Null => None,
                Value::String(text) => Some(Value::String(sha256_hex(text.as_bytes()))),
                other => Some(Value::String(sha256_hex(other.to_string().as_bytes()))),
            },
            Self::Band { thresholds } => {
                let number = numeric(&value)?;
                thresholds
                    .iter()
                    .find(|threshold| number >= threshold.min)
                    .map(|threshold| Value::String(threshold.label.clone()))
            }
        }
    }

    /// Thresholds sorted highest first so the first match is the band.
    pub(crate) fn normalized(self) -> Result<Self, String> {
        match self {
            Self::Band { mut thresholds } => {
                if thresholds.is_empty() {
                    return Err("band transform needs at least one threshold".to_owned());
                }
                if thresholds.iter().any(|threshold| !threshold.min.is_finite()) {
                    return Err("band thresholds must be finite numbers".to_owned());
                }
                thresholds.sort_by(|left, right| right.min.total_cmp(&left.min));
                Ok(Self::Band { thresholds })
            }
            other => Ok(other),
        }
    }
}

fn mask_last4(value: &Value) -> Option<String> {
    let text = match value {
        Value::String(text) => text.clone(),
        Value::Number(number) => number.to_string(),
        _ => return None,
    };
    let length = text.chars().count();
    if length == 0 {
        return None;
    }
    if length <= 4 {
        return Some("*".repeat(length));
    }
    let visible: String = text.chars().skip(length - 4).collect();
    Some(format!("{}{}", "*".repeat(length - 4), visible))
}

fn numeric(value: &Value) -> Option<f64> {
    match value {
        Value::Number(number) => number.as_f64(),
        Value::String(text) => text.trim().parse::<f64>().ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{BandThreshold, FieldTransform};

    fn credit_bands() -> FieldTransform {
        FieldTransform::Band {
            thresholds: vec![
                BandThreshold { min: 300.0, label: "poor".to_owned() },
                BandThreshold { min: 670.0, label: "good".to_owned() },
                BandThreshold { min: 800.0, label: "excellent".to_owned() },
            ],
        }
        .normalized()
        .expect("valid band")
    }

    #[test]
    fn mask_keeps_only_the_last_four_characters() {
        assert_eq!(
            FieldTransform::MaskLast4.apply(json!("ACC-12345678")),
            Some(json!("********5678"))
        );
        assert_eq!(FieldTransform::MaskLast4.apply(json!(12345678)), Some(json!("****5678")));
        assert_eq!(FieldTransform::MaskLast4.apply(json!("123")), Some(json!("***")));
        assert_eq!(FieldTransform::MaskLast4.apply(json!({"nested": true})), None);
    }

    #[test]
    fn band_maps_to_first_threshold_met() {
        let bands = credit_bands();
        assert_eq!(bands.apply(json!(720)), Some(json!("good")));
        assert_eq!(bands.apply(json!(815.5)), Some(json!("excellent")));
        assert_eq!(bands.apply(json!("650")), Some(json!("poor")));
        assert_eq!(bands.apply(json!(120)), None);
        assert_eq!(bands.apply(json!("n/a")), None);
    }

    #[test]
    fn count_reduces_collections() {
        assert_eq!(FieldTransform::Count.apply(json!([1, 2, 3])), Some(json!(3)));
        assert_eq!(FieldTransform::Count.apply(json!({"a": 1})), Some(json!(1)));
        assert_eq!(FieldTransform::Count.apply(json!(9)), None);
    }

    #[test]
    fn hash_is_a_stable_pseudonym() {
        let first = FieldTransform::Hash.apply(json!("123-45-6789"));
        assert_eq!(first, FieldTransform::Hash.apply(json!("123-45-6789")));
        assert_ne!(first, Some(json!("123-45-6789")));
        assert_eq!(FieldTransform::Hash.apply(json!(null)), None);
    }

    #[test]
    fn empty_band_is_rejected() {
        assert!(FieldTransform::Band { thresholds: Vec::new() }.normalized().is_err());
    }

    #[test]
    fn transforms_deserialize_from_tagged_config() {
        let parsed: FieldTransform =
            toml::from_str("kind = \"band\"\nthresholds = [{ min = 700.0, label = \"good\" }]")
                .expect("band");
        assert_eq!(parsed.name(), "band");
    }
}
