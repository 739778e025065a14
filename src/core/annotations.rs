use crate::domain::model::ServiceIntent;
use crate::utils::error::{HolepunchError, Result};
use std::collections::{BTreeMap, HashMap};

pub const PUNCH_EXTERNAL_ANNOTATION: &str = "holepunch/punch-external";
pub const PORT_MAP_ANNOTATION_PREFIX: &str = "holepunch.port/";

/// 只有值完全等於 "true" 才算啟用，不做布林轉換
pub fn is_opted_in(annotations: &BTreeMap<String, String>) -> bool {
    annotations
        .get(PUNCH_EXTERNAL_ANNOTATION)
        .is_some_and(|value| value == "true")
}

/// Reads `holepunch.port/<internal>` = `<external>` annotations.
///
/// Any malformed entry fails the whole parse.
pub fn port_remap(annotations: &BTreeMap<String, String>) -> Result<HashMap<u16, u16>> {
    let mut remap = HashMap::new();

    for (key, value) in annotations {
        let Some(suffix) = key.strip_prefix(PORT_MAP_ANNOTATION_PREFIX) else {
            continue;
        };

        let internal = parse_port(suffix).map_err(|reason| HolepunchError::ParseError {
            key: key.clone(),
            value: value.clone(),
            reason: format!("internal port '{}' {}", suffix, reason),
        })?;
        let external = parse_port(value).map_err(|reason| HolepunchError::ParseError {
            key: key.clone(),
            value: value.clone(),
            reason: format!("external port '{}' {}", value, reason),
        })?;

        remap.insert(internal, external);
    }

    Ok(remap)
}

pub fn parse_intent(annotations: &BTreeMap<String, String>) -> Result<ServiceIntent> {
    Ok(ServiceIntent {
        opted_in: is_opted_in(annotations),
        port_remap: port_remap(annotations)?,
    })
}

// u16::from_str accepts a leading '+', annotations must be plain digits.
fn parse_port(raw: &str) -> std::result::Result<u16, String> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err("is not a base-10 number".to_string());
    }
    raw.parse::<u16>()
        .map_err(|_| "does not fit in 16 bits".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn annotations(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_opt_in_requires_exact_true() {
        assert!(is_opted_in(&annotations(&[(PUNCH_EXTERNAL_ANNOTATION, "true")])));

        for value in ["TRUE", "True", "1", "yes", " true", ""] {
            assert!(
                !is_opted_in(&annotations(&[(PUNCH_EXTERNAL_ANNOTATION, value)])),
                "{:?} must not opt in",
                value
            );
        }
        assert!(!is_opted_in(&BTreeMap::new()));
    }

    #[test]
    fn test_port_remap() {
        let remap = port_remap(&annotations(&[
            (PUNCH_EXTERNAL_ANNOTATION, "true"),
            ("holepunch.port/80", "3000"),
            ("holepunch.port/443", "4000"),
            ("unrelated/annotation", "x"),
        ]))
        .unwrap();

        assert_eq!(remap, HashMap::from([(80, 3000), (443, 4000)]));
    }

    #[test]
    fn test_port_remap_non_numeric_errors() {
        let result = port_remap(&annotations(&[("holepunch.port/80", "some-non-numeric-value")]));
        assert!(matches!(result, Err(HolepunchError::ParseError { .. })));

        let result = port_remap(&annotations(&[("holepunch.port/http", "3000")]));
        assert!(matches!(result, Err(HolepunchError::ParseError { .. })));
    }

    #[test]
    fn test_port_remap_invalid_port_number_errors() {
        // 70000 超過 16 位元
        let result = port_remap(&annotations(&[("holepunch.port/80", "70000")]));
        match result {
            Err(HolepunchError::ParseError { reason, .. }) => {
                assert!(reason.contains("16 bits"))
            }
            other => panic!("expected ParseError, got {:?}", other),
        }

        assert!(port_remap(&annotations(&[("holepunch.port/80", "-1")])).is_err());
        assert!(port_remap(&annotations(&[("holepunch.port/80", "+3000")])).is_err());
        assert!(port_remap(&annotations(&[("holepunch.port/", "3000")])).is_err());
    }

    #[test]
    fn test_one_bad_entry_discards_everything() {
        let result = parse_intent(&annotations(&[
            (PUNCH_EXTERNAL_ANNOTATION, "true"),
            ("holepunch.port/80", "3000"),
            ("holepunch.port/443", "99999"),
        ]));
        assert!(result.is_err());
    }

    #[test]
    fn test_parse_intent_identity_default() {
        let intent = parse_intent(&annotations(&[
            (PUNCH_EXTERNAL_ANNOTATION, "true"),
            ("holepunch.port/80", "3000"),
        ]))
        .unwrap();

        assert!(intent.opted_in);
        assert_eq!(intent.external_port(80), 3000);
        assert_eq!(intent.external_port(8080), 8080);
    }
}
