//! Tesla Backup Gateway / Powerwall
//!
//! Authenticated with the gateway's local `customer` login. Five endpoints are
//! polled per collection; each one is parsed independently.

use super::{Backend, LegContext, LegSpec, LoginError, SessionPolicy};
use crate::services::transport::{HttpRequest, HttpTransport};
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use chrono::DateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use tokio_util::sync::CancellationToken;

const LOGIN_PATH: &str = "/api/login/Basic";
const SOE_PATH: &str = "/api/system_status/soe";

/// Operation modes exported as a one-hot `operation/mode` gauge
const OPERATION_MODES: [&str; 3] = ["self_consumption", "autonomous", "backup"];

/// Local login for the gateway
#[derive(Clone, Serialize)]
pub struct TeslaCredentials {
    pub email: String,
    pub password: String,
    pub username: String,
}

impl fmt::Debug for TeslaCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TeslaCredentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .field("username", &self.username)
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(default)]
    token: Option<String>,
}

/// Tesla gateway backend
#[derive(Debug, Clone)]
pub struct TeslaGateway {
    credentials: TeslaCredentials,
    policy: SessionPolicy,
}

impl TeslaGateway {
    pub fn new(credentials: TeslaCredentials, policy: SessionPolicy) -> Self {
        Self {
            credentials,
            policy,
        }
    }
}

#[async_trait]
impl Backend for TeslaGateway {
    fn metric_category(&self) -> &'static str {
        "tesla_gateway"
    }

    fn uses_auth_token(&self) -> bool {
        true
    }

    fn probe_path(&self) -> Option<&'static str> {
        Some(SOE_PATH)
    }

    fn session_policy(&self) -> SessionPolicy {
        self.policy
    }

    async fn fetch_credential(
        &self,
        transport: &dyn HttpTransport,
        cancel: &CancellationToken,
    ) -> Result<String, LoginError> {
        let body = serde_json::to_value(&self.credentials)
            .map_err(|e| LoginError::Malformed(e.to_string()))?;
        let response = transport
            .send(HttpRequest::post_json(LOGIN_PATH, body), cancel)
            .await?;

        if response.is_rate_limited() {
            return Err(LoginError::RateLimited);
        }
        if !response.is_success() {
            return Err(LoginError::Rejected {
                status: response.status,
                body: response.body,
            });
        }

        let parsed: LoginResponse = serde_json::from_str(&response.body)
            .map_err(|e| LoginError::Malformed(e.to_string()))?;
        match parsed.token {
            Some(token) if !token.is_empty() => Ok(token),
            _ => Err(LoginError::Malformed(
                "login response did not contain a token".to_string(),
            )),
        }
    }

    fn endpoints(&self) -> Vec<LegSpec> {
        vec![
            LegSpec {
                name: "meter_aggregates",
                path: "/api/meters/aggregates",
                handler: apply_meter_aggregates,
            },
            LegSpec {
                name: "powerwall_percentage",
                path: SOE_PATH,
                handler: apply_powerwall_percentage,
            },
            LegSpec {
                name: "site_info",
                path: "/api/site_info",
                handler: apply_site_info,
            },
            LegSpec {
                name: "status",
                path: "/api/status",
                handler: apply_status,
            },
            LegSpec {
                name: "operation",
                path: "/api/operation",
                handler: apply_operation,
            },
        ]
    }
}

// ============================================================================
// Leg handlers
// ============================================================================

fn apply_meter_aggregates(payload: &Value, ctx: &LegContext<'_>) -> anyhow::Result<()> {
    let categories = payload
        .as_object()
        .ok_or_else(|| anyhow!("meter aggregates is not an object"))?;

    for (category, fields) in categories {
        let Some(fields) = fields.as_object() else {
            tracing::warn!(category = %category, "Skipping non-object meter category");
            continue;
        };
        for (field, value) in fields {
            match value {
                Value::Number(n) => {
                    if let Some(v) = n.as_f64() {
                        ctx.gauge(category, field, v);
                    }
                }
                // Strings on this endpoint are timestamps
                Value::String(s) => {
                    if let Some(seconds) = parse_timestamp(s) {
                        ctx.gauge(category, field, seconds as f64);
                    }
                }
                other => tracing::warn!(
                    category = %category,
                    field = %field,
                    kind = json_kind(other),
                    "Unsupported meter value kind"
                ),
            }
        }
    }

    Ok(())
}

fn apply_powerwall_percentage(payload: &Value, ctx: &LegContext<'_>) -> anyhow::Result<()> {
    let percentage = number_field(payload, "percentage")?;
    ctx.gauge("powerwall", "percentage", percentage);
    Ok(())
}

fn apply_site_info(payload: &Value, ctx: &LegContext<'_>) -> anyhow::Result<()> {
    let fields = payload
        .as_object()
        .ok_or_else(|| anyhow!("site info is not an object"))?;

    for (field, value) in fields {
        if let Some(v) = value.as_f64() {
            ctx.gauge("siteinfo", field, v);
        }
    }
    Ok(())
}

fn apply_status(payload: &Value, ctx: &LegContext<'_>) -> anyhow::Result<()> {
    let start_time = string_field(payload, "start_time")?;
    match parse_timestamp(start_time) {
        Some(seconds) => ctx.gauge("status", "start_time", seconds as f64),
        None => tracing::warn!(value = %start_time, "Unparseable gateway start_time"),
    }

    let up_time = string_field(payload, "up_time_seconds")?;
    match parse_up_time(up_time) {
        Some(seconds) => ctx.gauge("status", "up_time_seconds", seconds as f64),
        None => tracing::warn!(value = %up_time, "Unparseable gateway up_time_seconds"),
    }

    Ok(())
}

fn apply_operation(payload: &Value, ctx: &LegContext<'_>) -> anyhow::Result<()> {
    let reserve = number_field(payload, "backup_reserve_percent")?;
    ctx.gauge("operation", "backup_reserve_percent", reserve);

    let real_mode = string_field(payload, "real_mode")?;
    for mode in OPERATION_MODES {
        let active = if mode == real_mode { 1.0 } else { 0.0 };
        ctx.labeled_gauge("operation", "mode", &[("mode", mode)], active);
    }
    Ok(())
}

// ============================================================================
// Field parsing
// ============================================================================

fn number_field(payload: &Value, name: &str) -> anyhow::Result<f64> {
    payload
        .get(name)
        .and_then(Value::as_f64)
        .with_context(|| format!("missing numeric field '{}'", name))
}

fn string_field<'a>(payload: &'a Value, name: &str) -> anyhow::Result<&'a str> {
    payload
        .get(name)
        .and_then(Value::as_str)
        .with_context(|| format!("missing string field '{}'", name))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Unix seconds for an RFC 3339 timestamp or the gateway's
/// `2023-01-15 10:20:30 +0000` form
pub(crate) fn parse_timestamp(value: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(value)
        .or_else(|_| DateTime::parse_from_str(value, "%Y-%m-%d %H:%M:%S %z"))
        .map(|dt| dt.timestamp())
        .ok()
}

/// Whole seconds from an uptime like `27h3m45.123456789s`
pub(crate) fn parse_up_time(value: &str) -> Option<u64> {
    let (hours, rest) = value.split_once('h')?;
    let (minutes, rest) = rest.split_once('m')?;
    let seconds = rest.strip_suffix('s')?;
    let whole = match seconds.split_once('.') {
        Some((whole, fraction)) if fraction.chars().all(|c| c.is_ascii_digit()) => whole,
        Some(_) => return None,
        None => seconds,
    };

    let digits = |s: &str| -> Option<u64> {
        if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        s.parse().ok()
    };

    Some(digits(hours)? * 3600 + digits(minutes)? * 60 + digits(whole)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::sink::testing::RecordingSink;
    use crate::services::sink::MetricScope;
    use crate::services::transport::testing::ScriptedTransport;
    use crate::services::transport::HttpResponse;
    use serde_json::json;

    fn gateway() -> TeslaGateway {
        TeslaGateway::new(
            TeslaCredentials {
                email: "owner@example.com".into(),
                password: "hunter2".into(),
                username: "customer".into(),
            },
            SessionPolicy::default(),
        )
    }

    fn apply(handler: super::super::LegHandler, payload: Value) -> (RecordingSink, anyhow::Result<()>) {
        let sink = RecordingSink::new();
        let scope = MetricScope::new("tesla_gateway", "powerwall");
        let result = handler(&payload, &LegContext::new(&sink, &scope, "test"));
        (sink, result)
    }

    #[test]
    fn test_parse_up_time() {
        assert_eq!(parse_up_time("27h3m45.123456789s"), Some(27 * 3600 + 3 * 60 + 45));
        assert_eq!(parse_up_time("0h0m9s"), Some(9));
        assert_eq!(parse_up_time("1h2m"), None);
        assert_eq!(parse_up_time("h2m3s"), None);
        assert_eq!(parse_up_time("1h2m3.xs"), None);
    }

    #[test]
    fn test_parse_timestamp_formats() {
        assert_eq!(parse_timestamp("2023-01-15T10:20:30Z"), Some(1673778030));
        assert_eq!(parse_timestamp("2023-01-15 10:20:30 +0000"), Some(1673778030));
        assert_eq!(parse_timestamp("2023-01-15T02:20:30.5-08:00"), Some(1673778030));
        assert_eq!(parse_timestamp("yesterday"), None);
    }

    #[test]
    fn test_meter_aggregates() {
        let (sink, result) = apply(
            apply_meter_aggregates,
            json!({
                "site": {
                    "instant_power": -1520.5,
                    "last_communication_time": "2023-01-15T10:20:30Z",
                    "flags": [1, 2]
                },
                "battery": { "instant_power": 300 },
                "note": "not a category"
            }),
        );
        result.unwrap();

        assert_eq!(sink.get("solarapiproxy_tesla_gateway_site_instant_power"), Some(-1520.5));
        assert_eq!(
            sink.get("solarapiproxy_tesla_gateway_site_last_communication_time"),
            Some(1673778030.0)
        );
        assert_eq!(sink.get("solarapiproxy_tesla_gateway_battery_instant_power"), Some(300.0));
        assert_eq!(sink.len(), 3);
    }

    #[test]
    fn test_powerwall_percentage() {
        let (sink, result) = apply(apply_powerwall_percentage, json!({ "percentage": 81.25 }));
        result.unwrap();
        assert_eq!(sink.get("solarapiproxy_tesla_gateway_powerwall_percentage"), Some(81.25));

        let (_, result) = apply(apply_powerwall_percentage, json!({}));
        assert!(result.is_err());
    }

    #[test]
    fn test_site_info_keeps_numbers_only() {
        let (sink, result) = apply(
            apply_site_info,
            json!({ "nominal_system_energy_kWh": 13.5, "site_name": "Home", "max_site_meter_power_kW": 1000 }),
        );
        result.unwrap();
        assert_eq!(
            sink.keys(),
            vec![
                "solarapiproxy_tesla_gateway_siteinfo_max_site_meter_power_kW".to_string(),
                "solarapiproxy_tesla_gateway_siteinfo_nominal_system_energy_kWh".to_string(),
            ]
        );
    }

    #[test]
    fn test_status() {
        let (sink, result) = apply(
            apply_status,
            json!({ "start_time": "2023-01-15 10:20:30 +0000", "up_time_seconds": "1h1m1.5s" }),
        );
        result.unwrap();
        assert_eq!(sink.get("solarapiproxy_tesla_gateway_status_start_time"), Some(1673778030.0));
        assert_eq!(sink.get("solarapiproxy_tesla_gateway_status_up_time_seconds"), Some(3661.0));
    }

    #[test]
    fn test_operation_mode_is_one_hot() {
        let (sink, result) = apply(
            apply_operation,
            json!({ "backup_reserve_percent": 20, "real_mode": "autonomous" }),
        );
        result.unwrap();

        assert_eq!(
            sink.get("solarapiproxy_tesla_gateway_operation_backup_reserve_percent"),
            Some(20.0)
        );
        assert_eq!(sink.get("solarapiproxy_tesla_gateway_operation_mode{mode=autonomous}"), Some(1.0));
        assert_eq!(
            sink.get("solarapiproxy_tesla_gateway_operation_mode{mode=self_consumption}"),
            Some(0.0)
        );
        assert_eq!(sink.get("solarapiproxy_tesla_gateway_operation_mode{mode=backup}"), Some(0.0));
    }

    #[tokio::test]
    async fn test_login_posts_credentials() {
        let transport = ScriptedTransport::new(|request| {
            let body = request.body.clone().unwrap_or_default();
            if request.path == LOGIN_PATH && body["email"] == "owner@example.com" && body["username"] == "customer" {
                Ok(HttpResponse::new(200, r#"{"email":"owner@example.com","token":"abc=="}"#))
            } else {
                Ok(HttpResponse::new(400, "bad request"))
            }
        });

        let token = gateway()
            .fetch_credential(&transport, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(token, "abc==");
    }

    #[tokio::test]
    async fn test_login_failures() {
        let cancel = CancellationToken::new();

        let limited = ScriptedTransport::new(|_| Ok(HttpResponse::new(429, "")));
        assert_eq!(
            gateway().fetch_credential(&limited, &cancel).await,
            Err(LoginError::RateLimited)
        );

        let denied = ScriptedTransport::new(|_| Ok(HttpResponse::new(401, "bad password")));
        assert!(matches!(
            gateway().fetch_credential(&denied, &cancel).await,
            Err(LoginError::Rejected { status: 401, .. })
        ));

        let empty = ScriptedTransport::new(|_| Ok(HttpResponse::new(200, r#"{"token":""}"#)));
        assert!(matches!(
            gateway().fetch_credential(&empty, &cancel).await,
            Err(LoginError::Malformed(_))
        ));
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        assert!(!format!("{:?}", gateway()).contains("hunter2"));
    }
}
