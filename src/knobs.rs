//! Transport knob parsing
//!
//! Knobs arrive as a JSON object mapping stringified parameter IDs to
//! values. Integer and boolean values pass through as `u64`; a few knobs
//! take structured strings with bespoke encodings. Parsing is all-or-nothing
//! so that a partially applied knob set can never reach the transport, and
//! the output is sorted for deterministic downstream handling.

use serde_json::Value;
use thiserror::Error;
use tracing::warn;

use crate::{congestion::CongestionControlType, MAX_PRIORITY};

const KNOB_FRACTION_MAX: u64 = 100;

/// Multiplier packing the auto-background priority threshold above the
/// utilization percentage
pub const PRIORITY_THRESHOLD_KNOB_MULTIPLIER: u64 = 1000;

/// Knobs whose values are carried as structured strings
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u64)]
pub enum TransportKnobParamId {
    /// Congestion control algorithm, as a lowercase name
    CcAlgorithm = 1,
    /// RTT factor applied during startup, as `"{numerator}/{denominator}"`
    StartupRttFactor = 2,
    /// Auto background mode, as `"{priority_threshold},{percent_utilization}"`
    AutoBackgroundMode = 3,
    /// RTT factor applied at steady state, same format as `StartupRttFactor`
    DefaultRttFactor = 4,
}

impl TransportKnobParamId {
    fn from_u64(id: u64) -> Option<Self> {
        match id {
            1 => Some(Self::CcAlgorithm),
            2 => Some(Self::StartupRttFactor),
            3 => Some(Self::AutoBackgroundMode),
            4 => Some(Self::DefaultRttFactor),
            _ => None,
        }
    }
}

/// One parsed knob
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub struct TransportKnobParam {
    pub id: u64,
    pub val: u64,
}

#[derive(Debug, Clone, Eq, PartialEq, Error)]
pub enum KnobsParseError {
    #[error("knobs are not valid JSON")]
    InvalidJson,
    #[error("knob root is not an object")]
    NotAnObject,
    #[error("knob key does not parse as an unsigned integer")]
    InvalidKey,
    #[error("knob value has an unsupported type")]
    InvalidValueType,
    #[error("string value for a knob that does not take strings")]
    UnknownStringKnob,
    #[error("knob value is out of range or malformed")]
    InvalidValue,
}

/// Parse a serialized knob set
///
/// Returns the knobs sorted by id, then value. Any unrecognized or
/// out-of-range input fails the whole parse.
pub fn parse_transport_knobs(serialized: &str) -> Result<Vec<TransportKnobParam>, KnobsParseError> {
    let root: Value = serde_json::from_str(serialized).map_err(|e| {
        warn!("failed to parse knobs: {e}");
        KnobsParseError::InvalidJson
    })?;
    let object = match root {
        Value::Object(map) => map,
        _ => return Err(KnobsParseError::NotAnObject),
    };

    let mut params = Vec::with_capacity(object.len());
    for (key, val) in &object {
        let id = key
            .parse::<u64>()
            .map_err(|_| KnobsParseError::InvalidKey)?;
        let val = match val {
            Value::Bool(b) => u64::from(*b),
            Value::Number(n) => n.as_u64().ok_or(KnobsParseError::InvalidValue)?,
            Value::String(s) => parse_string_knob(id, s)?,
            // Knob values cannot be arrays, objects, or null
            _ => return Err(KnobsParseError::InvalidValueType),
        };
        params.push(TransportKnobParam { id, val });
    }

    // Sort by id, then value
    params.sort();
    Ok(params)
}

fn parse_string_knob(id: u64, s: &str) -> Result<u64, KnobsParseError> {
    match TransportKnobParamId::from_u64(id) {
        Some(TransportKnobParamId::CcAlgorithm) => {
            let cc = CongestionControlType::from_knob_str(s).ok_or_else(|| {
                warn!("unknown cc type {s}");
                KnobsParseError::InvalidValue
            })?;
            Ok(cc as u64)
        }
        Some(TransportKnobParamId::StartupRttFactor)
        | Some(TransportKnobParamId::DefaultRttFactor) => parse_rtt_factor(s),
        Some(TransportKnobParamId::AutoBackgroundMode) => parse_auto_background(s),
        None => {
            warn!("string param type is not valid for knob {id}");
            Err(KnobsParseError::UnknownStringKnob)
        }
    }
}

/// `"{numerator}/{denominator}"` with both in (0, 100), packed as
/// `numerator * 100 + denominator`
fn parse_rtt_factor(s: &str) -> Result<u64, KnobsParseError> {
    let (num, den) = s.split_once('/').ok_or_else(|| {
        warn!("rtt factor knob expected format {{numerator}}/{{denominator}}");
        KnobsParseError::InvalidValue
    })?;
    let numerator = num.parse::<u64>().map_err(|_| KnobsParseError::InvalidValue)?;
    let denominator = den.parse::<u64>().map_err(|_| KnobsParseError::InvalidValue)?;
    if numerator == 0
        || denominator == 0
        || numerator >= KNOB_FRACTION_MAX
        || denominator >= KNOB_FRACTION_MAX
    {
        warn!("rtt factor knob numerator and denominator must be in (0,{KNOB_FRACTION_MAX})");
        return Err(KnobsParseError::InvalidValue);
    }
    Ok(numerator * KNOB_FRACTION_MAX + denominator)
}

/// `"{priority_threshold},{percent_utilization}"` with the threshold in
/// [0, 7] and the percentage in [25, 100], packed as
/// `priority * PRIORITY_THRESHOLD_KNOB_MULTIPLIER + percent`
fn parse_auto_background(s: &str) -> Result<u64, KnobsParseError> {
    let (priority, percent) = s.split_once(',').ok_or_else(|| {
        warn!("auto background mode knob expected format {{priority}},{{percent}}");
        KnobsParseError::InvalidValue
    })?;
    let priority = priority
        .trim()
        .parse::<u64>()
        .map_err(|_| KnobsParseError::InvalidValue)?;
    let percent = percent
        .trim()
        .parse::<u64>()
        .map_err(|_| KnobsParseError::InvalidValue)?;
    if priority > u64::from(MAX_PRIORITY) || !(25..=100).contains(&percent) {
        warn!(
            "invalid auto background mode parameters: priority must be in [0,{MAX_PRIORITY}], \
             percent in [25,100]"
        );
        return Err(KnobsParseError::InvalidValue);
    }
    Ok(priority * PRIORITY_THRESHOLD_KNOB_MULTIPLIER + percent)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn integer_and_bool_values() {
        let parsed = parse_transport_knobs(r#"{"17":42,"9":true,"11":false}"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                TransportKnobParam { id: 9, val: 1 },
                TransportKnobParam { id: 11, val: 0 },
                TransportKnobParam { id: 17, val: 42 },
            ]
        );
    }

    #[test]
    fn string_knobs() {
        let parsed = parse_transport_knobs(r#"{"1":"cubic","2":"1/2","3":"4,50"}"#).unwrap();
        assert_eq!(
            parsed,
            vec![
                TransportKnobParam {
                    id: 1,
                    val: CongestionControlType::Cubic as u64,
                },
                TransportKnobParam { id: 2, val: 102 },
                TransportKnobParam {
                    id: 3,
                    val: 4 * PRIORITY_THRESHOLD_KNOB_MULTIPLIER + 50,
                },
            ]
        );
    }

    #[test]
    fn sorted_by_id_then_value() {
        let parsed = parse_transport_knobs(r#"{"5":3,"2":"10/20","4":"1/1"}"#).unwrap();
        let ids: Vec<u64> = parsed.iter().map(|p| p.id).collect();
        assert_eq!(ids, vec![2, 4, 5]);
        assert_eq!(parsed[0].val, 10 * 100 + 20);
    }

    #[test]
    fn whole_parse_fails_on_bad_entries() {
        // Unknown CC algorithm
        assert!(parse_transport_knobs(r#"{"1":"warp"}"#).is_err());
        // Malformed fraction
        assert!(parse_transport_knobs(r#"{"2":"12"}"#).is_err());
        // Fraction out of range
        assert!(parse_transport_knobs(r#"{"2":"100/1"}"#).is_err());
        assert!(parse_transport_knobs(r#"{"2":"0/1"}"#).is_err());
        // Priority threshold too large, percent too small
        assert!(parse_transport_knobs(r#"{"3":"8,50"}"#).is_err());
        assert!(parse_transport_knobs(r#"{"3":"4,24"}"#).is_err());
        // String for a knob that does not take strings
        assert!(parse_transport_knobs(r#"{"99":"on"}"#).is_err());
        // Bad key, bad value types
        assert!(parse_transport_knobs(r#"{"x":1}"#).is_err());
        assert!(parse_transport_knobs(r#"{"1":[1]}"#).is_err());
        assert!(parse_transport_knobs(r#"{"1":null}"#).is_err());
        assert!(parse_transport_knobs(r#"{"4":-3}"#).is_err());
        // Not an object
        assert!(parse_transport_knobs("[1,2]").is_err());
        assert!(parse_transport_knobs("not json").is_err());
    }
}
