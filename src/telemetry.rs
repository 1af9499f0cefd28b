use crate::config::{CeilometerConfig, MeterConfig};
use crate::estimator::EstimationResult;
use crate::state::MonitorState;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::info;

/// Refresh the token when it expires within this margin (clock skew allowance).
pub const TOKEN_REFRESH_MARGIN_SECS: i64 = 60;

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Error, Debug)]
pub enum TelemetryError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed auth response: {0}")]
    Auth(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct AuthToken {
    pub token: String,
    pub expires: DateTime<Utc>,
}

impl AuthToken {
    /// Token for backends that do not authenticate.
    pub fn never_expiring() -> Self {
        Self {
            token: "dummy".to_string(),
            expires: DateTime::<Utc>::MAX_UTC,
        }
    }

    pub fn needs_refresh(&self, now: DateTime<Utc>) -> bool {
        now + chrono::Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) > self.expires
    }
}

/// Accepts `2015-06-01T12:00:00Z`, fractional seconds, or an explicit offset.
pub fn parse_expiry(s: &str) -> Result<DateTime<Utc>, TelemetryError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    let naive = NaiveDateTime::parse_from_str(s.trim_end_matches('Z'), "%Y-%m-%dT%H:%M:%S%.f")
        .map_err(|e| TelemetryError::Auth(format!("bad expiry {s:?}: {e}")))?;
    Ok(Utc.from_utc_datetime(&naive))
}

/// Who a metered sample is attributed to.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MeterIdentity {
    pub meter_name: String,
    pub username: String,
    pub project_id: Option<String>,
    pub resource_id: Option<String>,
}

/// Flat string-to-string record handed to the metering backend.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct MeterRecord(BTreeMap<String, String>);

impl MeterRecord {
    /// Lifecycle marker such as `initialized` or `exited`.
    pub fn event(name: &str, now: DateTime<Utc>) -> Self {
        let mut fields = BTreeMap::new();
        fields.insert(
            name.to_string(),
            now.format("%Y-%m-%dT%H:%M:%S").to_string(),
        );
        Self(fields)
    }

    pub fn measurement(now: DateTime<Utc>, state: &MonitorState, est: &EstimationResult) -> Self {
        let link = &state.link;
        let fields = [
            ("timestamp", now.format("%Y-%m-%dT%H.%M.%S").to_string()),
            ("interface", state.interface.clone()),
            ("linerate", link.linerate.to_string()),
            ("alarm_trigger_value", link.alarm_trigger.to_string()),
            ("cutoff", link.cutoff.to_string()),
            ("tx", est.mean_tx.to_string()),
            ("var_tx", est.var_tx.to_string()),
            ("mu_tx", est.mu_tx.to_string()),
            ("sigma2_tx", est.sigma2_tx.to_string()),
            ("overload_risk_tx", est.overload_risk_tx.to_string()),
            ("alarm_tx", link.alarm(est.overload_risk_tx).to_string()),
            ("rx", est.mean_rx.to_string()),
            ("var_rx", est.var_rx.to_string()),
            ("mu_rx", est.mu_rx.to_string()),
            ("sigma2_rx", est.sigma2_rx.to_string()),
            ("overload_risk_rx", est.overload_risk_rx.to_string()),
            ("alarm_rx", link.alarm(est.overload_risk_rx).to_string()),
            ("sample_rate", state.sample_rate.to_string()),
            ("estimation_interval", state.estimation_interval.to_string()),
            ("meter_interval", state.meter_interval.to_string()),
        ];
        Self(
            fields
                .into_iter()
                .map(|(k, v)| (k.to_string(), v))
                .collect(),
        )
    }

    #[cfg(test)]
    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    #[cfg(test)]
    pub fn is_event(&self, name: &str) -> bool {
        self.0.len() == 1 && self.0.contains_key(name)
    }

    fn to_json_line(&self) -> Result<String, TelemetryError> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Token issuance and sample submission, owned by the metering backend.
#[async_trait]
pub trait Telemetry: Send + Sync {
    async fn issue_token(&self) -> Result<AuthToken, TelemetryError>;

    async fn put_meter(
        &self,
        meter: &MeterIdentity,
        record: &MeterRecord,
        token: &AuthToken,
    ) -> Result<Value, TelemetryError>;
}

pub fn from_config(cfg: &MeterConfig) -> Result<(Arc<dyn Telemetry>, MeterIdentity), TelemetryError> {
    Ok(match cfg {
        MeterConfig::Ceilometer(c) => (
            Arc::new(CeilometerClient::new(c)?),
            MeterIdentity {
                meter_name: c.name.clone(),
                username: c.username.clone(),
                project_id: Some(c.project_id.clone()),
                resource_id: Some(c.resource_id.clone()),
            },
        ),
        MeterConfig::File { path } => (
            Arc::new(FileSink { path: path.clone() }),
            MeterIdentity::default(),
        ),
        MeterConfig::Socket { addr } => (
            Arc::new(SocketSink { addr: addr.clone() }),
            MeterIdentity::default(),
        ),
        MeterConfig::Console => (Arc::new(ConsoleSink), MeterIdentity::default()),
    })
}

/// Keystone v2 authentication plus Ceilometer v2 sample submission.
pub struct CeilometerClient {
    http: reqwest::Client,
    auth_url: String,
    meter_url: String,
    tenant: String,
    username: String,
    password: String,
}

impl CeilometerClient {
    pub fn new(cfg: &CeilometerConfig) -> Result<Self, TelemetryError> {
        let http = reqwest::Client::builder().timeout(HTTP_TIMEOUT).build()?;
        Ok(Self {
            http,
            auth_url: format!("http://{}:5000/v2.0/tokens", cfg.controller),
            meter_url: format!("http://{}:8777/v2/meters", cfg.controller),
            tenant: cfg.tenant.clone(),
            username: cfg.username.clone(),
            password: cfg.password.clone(),
        })
    }
}

#[async_trait]
impl Telemetry for CeilometerClient {
    async fn issue_token(&self) -> Result<AuthToken, TelemetryError> {
        let payload = json!({
            "auth": {
                "tenantName": self.tenant,
                "passwordCredentials": {
                    "username": self.username,
                    "password": self.password,
                }
            }
        });
        let body: Value = self
            .http
            .post(&self.auth_url)
            .json(&payload)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(AuthToken {
            token: str_at(&body, "/access/token/id")?.to_string(),
            expires: parse_expiry(str_at(&body, "/access/token/expires")?)?,
        })
    }

    async fn put_meter(
        &self,
        meter: &MeterIdentity,
        record: &MeterRecord,
        token: &AuthToken,
    ) -> Result<Value, TelemetryError> {
        // Everything of interest travels in resource_metadata.
        let sample = json!([{
            "counter_name": meter.meter_name,
            "counter_type": "gauge",
            "counter_unit": "b/s",
            "counter_volume": 0,
            "project_id": meter.project_id,
            "resource_id": meter.resource_id,
            "user_id": meter.username,
            "resource_metadata": record,
        }]);
        let url = format!("{}/{}", self.meter_url, meter.meter_name);
        let reply = self
            .http
            .post(url)
            .header("X-Auth-Token", &token.token)
            .json(&sample)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        Ok(reply)
    }
}

fn str_at<'a>(body: &'a Value, ptr: &str) -> Result<&'a str, TelemetryError> {
    body.pointer(ptr)
        .and_then(Value::as_str)
        .ok_or_else(|| TelemetryError::Auth(format!("missing {ptr}")))
}

/// Appends each record as a JSON line.
pub struct FileSink {
    pub path: PathBuf,
}

#[async_trait]
impl Telemetry for FileSink {
    async fn issue_token(&self) -> Result<AuthToken, TelemetryError> {
        Ok(AuthToken::never_expiring())
    }

    async fn put_meter(
        &self,
        _meter: &MeterIdentity,
        record: &MeterRecord,
        _token: &AuthToken,
    ) -> Result<Value, TelemetryError> {
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(record.to_json_line()?.as_bytes()).await?;
        file.flush().await?;
        Ok(serde_json::to_value(record)?)
    }
}

/// Writes each record as a JSON line over a fresh TCP connection.
pub struct SocketSink {
    pub addr: String,
}

#[async_trait]
impl Telemetry for SocketSink {
    async fn issue_token(&self) -> Result<AuthToken, TelemetryError> {
        Ok(AuthToken::never_expiring())
    }

    async fn put_meter(
        &self,
        _meter: &MeterIdentity,
        record: &MeterRecord,
        _token: &AuthToken,
    ) -> Result<Value, TelemetryError> {
        let mut stream = tokio::net::TcpStream::connect(&self.addr).await?;
        stream.write_all(record.to_json_line()?.as_bytes()).await?;
        stream.shutdown().await?;
        Ok(serde_json::to_value(record)?)
    }
}

/// Logs records instead of submitting them.
pub struct ConsoleSink;

#[async_trait]
impl Telemetry for ConsoleSink {
    async fn issue_token(&self) -> Result<AuthToken, TelemetryError> {
        Ok(AuthToken::never_expiring())
    }

    async fn put_meter(
        &self,
        _meter: &MeterIdentity,
        record: &MeterRecord,
        _token: &AuthToken,
    ) -> Result<Value, TelemetryError> {
        let value = serde_json::to_value(record)?;
        info!(target: "meter", "{}", value);
        Ok(value)
    }
}
