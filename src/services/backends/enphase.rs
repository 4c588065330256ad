//! Enphase IQ Gateway (Envoy)
//!
//! No authentication; everything comes from a single `/production.json` call.

use super::{Backend, LegContext, LegSpec};
use anyhow::{anyhow, Context};
use serde_json::Value;

const ENERGY_FIELDS: [&str; 4] = ["wNow", "whLifetime", "whToday", "whLastSevenDays"];
const STORAGE_FIELDS: [&str; 2] = ["wNow", "whNow"];

/// Enphase gateway backend
#[derive(Debug, Clone, Default)]
pub struct EnphaseGateway;

impl EnphaseGateway {
    pub fn new() -> Self {
        Self
    }
}

impl Backend for EnphaseGateway {
    fn metric_category(&self) -> &'static str {
        "enphase"
    }

    fn endpoints(&self) -> Vec<LegSpec> {
        vec![LegSpec {
            name: "production",
            path: "/production.json",
            handler: apply_production,
        }]
    }
}

fn apply_production(payload: &Value, ctx: &LegContext<'_>) -> anyhow::Result<()> {
    let production = find_entry(payload, "production", |entry| type_is(entry, "eim"))?;
    set_fields(ctx, "production", production, &ENERGY_FIELDS)?;

    let consumption = find_entry(payload, "consumption", |entry| {
        type_is(entry, "eim")
            && entry.get("measurementType").and_then(Value::as_str) == Some("total-consumption")
    })?;
    set_fields(ctx, "consumption", consumption, &ENERGY_FIELDS)?;

    let storage = find_entry(payload, "storage", |entry| type_is(entry, "acb"))?;
    set_fields(ctx, "storage", storage, &STORAGE_FIELDS)?;

    Ok(())
}

fn type_is(entry: &Value, expected: &str) -> bool {
    entry.get("type").and_then(Value::as_str) == Some(expected)
}

fn find_entry<'a>(
    payload: &'a Value,
    section: &str,
    matches: impl Fn(&Value) -> bool,
) -> anyhow::Result<&'a Value> {
    payload
        .get(section)
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("'{}' is missing or not an array", section))?
        .iter()
        .find(|entry| matches(*entry))
        .with_context(|| format!("no matching '{}' entry", section))
}

fn set_fields(ctx: &LegContext<'_>, section: &str, entry: &Value, fields: &[&str]) -> anyhow::Result<()> {
    for field in fields {
        let value = entry
            .get(*field)
            .and_then(Value::as_f64)
            .with_context(|| format!("'{}' entry has no numeric '{}'", section, field))?;
        ctx.gauge(section, field, value);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sink::testing::RecordingSink;
    use crate::services::sink::MetricScope;
    use serde_json::json;

    fn production_json() -> Value {
        json!({
            "production": [
                { "type": "inverters", "activeCount": 20, "wNow": 4000 },
                { "type": "eim", "wNow": 4123.5, "whLifetime": 9876543.0, "whToday": 15000, "whLastSevenDays": 98000 }
            ],
            "consumption": [
                { "type": "eim", "measurementType": "net-consumption", "wNow": -300, "whLifetime": 1, "whToday": 2, "whLastSevenDays": 3 },
                { "type": "eim", "measurementType": "total-consumption", "wNow": 850, "whLifetime": 5000000, "whToday": 9000, "whLastSevenDays": 60000 }
            ],
            "storage": [
                { "type": "acb", "wNow": -250, "whNow": 6400 }
            ]
        })
    }

    #[test]
    fn test_production_document() {
        let sink = RecordingSink::new();
        let scope = MetricScope::new("enphase", "envoy.local");
        apply_production(&production_json(), &LegContext::new(&sink, &scope, "production")).unwrap();

        assert_eq!(sink.len(), 10);
        assert_eq!(sink.get("solarapiproxy_enphase_production_wNow"), Some(4123.5));
        assert_eq!(sink.get("solarapiproxy_enphase_consumption_wNow"), Some(850.0));
        assert_eq!(sink.get("solarapiproxy_enphase_consumption_whLastSevenDays"), Some(60000.0));
        assert_eq!(sink.get("solarapiproxy_enphase_storage_whNow"), Some(6400.0));
    }

    #[test]
    fn test_missing_storage_fails_leg() {
        let sink = RecordingSink::new();
        let scope = MetricScope::new("enphase", "envoy.local");
        let mut doc = production_json();
        doc["storage"] = json!([{ "type": "other" }]);

        let err = apply_production(&doc, &LegContext::new(&sink, &scope, "production")).unwrap_err();
        assert!(err.to_string().contains("storage"));
    }

    #[test]
    fn test_backend_shape() {
        let backend = EnphaseGateway::new();
        assert!(!backend.uses_auth_token());
        assert_eq!(backend.probe_path(), None);
        assert_eq!(backend.endpoints().len(), 1);
    }
}
