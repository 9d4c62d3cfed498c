//! HQ client
//!
//! Speaks the HQ coordination protocol over HTTP. Every failure mode -
//! missing configuration, disabled reporting, transport errors, error
//! statuses, malformed bodies - degrades to a logged non-answer; the
//! daemon never depends on HQ being reachable.

use crate::config::HqApiConfig;
use crate::store::OffenseRow;
use crate::warden::SENTINEL_IP;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};
use ureq::Agent;

const USER_AGENT: &str = "Interceptor Client";

/// Result of one report delivery attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReportOutcome {
    /// HQ accepted the report and returned the address reputation
    Delivered { ab_score: i64, total_reports: i64 },
    /// HQ answered with `error: true`; the report must not be retried
    Rejected { code: i64, message: String },
    /// No usable answer; the report stays queued
    Unavailable,
}

/// Response body shared by every HQ endpoint
#[derive(Debug, Deserialize)]
struct HqResponse {
    #[serde(default)]
    error: bool,
    code: Option<i64>,
    message: Option<String>,
    ab_score: Option<i64>,
    #[serde(rename = "hq_totalReports")]
    total_reports: Option<i64>,
}

/// Map a decoded HQ body to a delivery outcome
fn classify(body: HqResponse) -> ReportOutcome {
    if body.error {
        return ReportOutcome::Rejected {
            code: body.code.unwrap_or(0),
            message: body.message.unwrap_or_default(),
        };
    }
    match (body.ab_score, body.total_reports) {
        (Some(ab_score), Some(total_reports)) => ReportOutcome::Delivered {
            ab_score,
            total_reports,
        },
        _ => ReportOutcome::Unavailable,
    }
}

pub struct HqClient {
    agent: Agent,
    cfg: Option<HqApiConfig>,
    hostname: String,
    version: String,
}

impl HqClient {
    pub fn new(cfg: Option<HqApiConfig>, hostname: String, version: String) -> Self {
        let timeout = cfg.as_ref().map(|c| c.timeout).unwrap_or(30);
        let agent = Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(timeout)))
            .build()
            .new_agent();

        Self {
            agent,
            cfg,
            hostname,
            version,
        }
    }

    /// Whether HQ is configured and enabled at all
    pub fn active(&self) -> bool {
        self.cfg.as_ref().map(|c| c.active).unwrap_or(false)
    }

    /// Whether offenses are forwarded to HQ
    pub fn reporting_enabled(&self) -> bool {
        self.cfg
            .as_ref()
            .map(|c| c.active && c.report)
            .unwrap_or(false)
    }

    fn endpoint(&self, cfg: &HqApiConfig, path: &str) -> String {
        format!("{}/{}", cfg.url.trim_end_matches('/'), path)
    }

    fn get(&self, path: &str) -> bool {
        let Some(cfg) = &self.cfg else {
            return false;
        };
        let url = self.endpoint(cfg, path);

        let result = self
            .agent
            .get(&url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .header("user-agent", USER_AGENT)
            .header("Key", &cfg.api_key)
            .call();

        match result {
            Ok(_) => {
                debug!(%url, "HQ answered");
                true
            }
            Err(ureq::Error::StatusCode(code)) => {
                warn!(%url, code, "HQ returned error status");
                false
            }
            Err(e) => {
                warn!(%url, error = %e, "HQ request failed");
                false
            }
        }
    }

    /// Announce this daemon to HQ at startup, best effort
    pub fn hello(&self) -> bool {
        if !self.active() {
            return false;
        }
        self.get(&format!("hello/{}", self.version))
    }

    /// Periodic liveness signal
    pub fn ping(&self) -> bool {
        if !self.active() {
            return false;
        }
        self.get("ping/")
    }

    /// Forward one offense to HQ
    pub fn report(&self, offense: &OffenseRow) -> ReportOutcome {
        let Some(cfg) = &self.cfg else {
            return ReportOutcome::Unavailable;
        };
        if !cfg.active || !cfg.report {
            return ReportOutcome::Unavailable;
        }
        if offense.ip_address == SENTINEL_IP.to_string() {
            return ReportOutcome::Unavailable;
        }

        let url = self.endpoint(cfg, "report_v2/");
        let payload = serde_json::json!({
            "intrusion_datetime": offense.created_on,
            "intrusion_detail": offense.detail,
            "intrusion_service_id": offense.service_id,
            "ip_address": offense.ip_address,
            "reported_hostname": self.hostname,
            "module_name": offense.module_name,
            "keyword": offense.keyword,
        });

        let result = self
            .agent
            .post(&url)
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .header("user-agent", USER_AGENT)
            .header("Key", &cfg.api_key)
            .send_json(&payload);

        match result {
            Ok(mut resp) => match resp.body_mut().read_json::<HqResponse>() {
                Ok(body) => {
                    let outcome = classify(body);
                    match &outcome {
                        ReportOutcome::Delivered {
                            ab_score,
                            total_reports,
                        } => debug!(
                            ip = %offense.ip_address,
                            ab_score,
                            total_reports,
                            "report delivered"
                        ),
                        ReportOutcome::Rejected { code, message } => warn!(
                            ip = %offense.ip_address,
                            code,
                            %message,
                            "HQ rejected report"
                        ),
                        ReportOutcome::Unavailable => warn!(
                            ip = %offense.ip_address,
                            "HQ answer missing reputation fields"
                        ),
                    }
                    outcome
                }
                Err(e) => {
                    warn!(ip = %offense.ip_address, error = %e, "malformed HQ response");
                    ReportOutcome::Unavailable
                }
            },
            Err(ureq::Error::StatusCode(code)) => {
                warn!(ip = %offense.ip_address, code, "HQ unavailable");
                ReportOutcome::Unavailable
            }
            Err(e) => {
                warn!(ip = %offense.ip_address, error = %e, "HQ request failed");
                ReportOutcome::Unavailable
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn offense(ip: &str) -> OffenseRow {
        OffenseRow {
            id: 1,
            created_on: "2024-02-17 19:26:16".to_string(),
            service_id: "18".to_string(),
            detail: "line".to_string(),
            module_name: "sshd".to_string(),
            ip_address: ip.to_string(),
            keyword: "kw".to_string(),
            user: String::new(),
        }
    }

    fn enabled_cfg() -> HqApiConfig {
        serde_json::from_str(
            r#"{"active": true, "report": true, "url": "http://127.0.0.1:9", "api_key": "k", "timeout": 1}"#,
        )
        .unwrap()
    }

    #[test]
    fn test_unconfigured_client_is_inert() {
        let client = HqClient::new(None, "host".into(), "2.1.0".into());
        assert!(!client.active());
        assert!(!client.reporting_enabled());
        assert!(!client.hello());
        assert!(!client.ping());
        assert_eq!(client.report(&offense("203.0.113.5")), ReportOutcome::Unavailable);
    }

    #[test]
    fn test_disabled_report_flag() {
        let cfg: HqApiConfig = serde_json::from_str(
            r#"{"active": true, "report": false, "url": "http://127.0.0.1:9"}"#,
        )
        .unwrap();
        let client = HqClient::new(Some(cfg), "host".into(), "2.1.0".into());
        assert!(client.active());
        assert!(!client.reporting_enabled());
        assert_eq!(client.report(&offense("203.0.113.5")), ReportOutcome::Unavailable);
    }

    #[test]
    fn test_sentinel_never_reported() {
        // Port 9 (discard) would fail anyway; the sentinel check returns
        // before any socket is opened
        let client = HqClient::new(Some(enabled_cfg()), "host".into(), "2.1.0".into());
        assert_eq!(client.report(&offense("0.0.0.0")), ReportOutcome::Unavailable);
    }

    #[test]
    fn test_endpoint_join() {
        let client = HqClient::new(Some(enabled_cfg()), "host".into(), "2.1.0".into());
        let cfg = client.cfg.as_ref().unwrap();
        assert_eq!(
            client.endpoint(cfg, "report_v2/"),
            "http://127.0.0.1:9/report_v2/"
        );
        assert_eq!(client.endpoint(cfg, "ping/"), "http://127.0.0.1:9/ping/");
    }

    #[test]
    fn test_classify_delivered() {
        let body: HqResponse = serde_json::from_str(
            r#"{"error": false, "code": 200, "message": "ok", "ab_score": 95, "hq_totalReports": 2}"#,
        )
        .unwrap();
        assert_eq!(
            classify(body),
            ReportOutcome::Delivered { ab_score: 95, total_reports: 2 }
        );
    }

    #[test]
    fn test_classify_rejected() {
        let body: HqResponse =
            serde_json::from_str(r#"{"error": true, "code": 403, "message": "bad key"}"#).unwrap();
        assert_eq!(
            classify(body),
            ReportOutcome::Rejected { code: 403, message: "bad key".to_string() }
        );
    }

    #[test]
    fn test_classify_missing_fields_is_unavailable() {
        let body: HqResponse =
            serde_json::from_str(r#"{"error": false, "code": 200, "message": "ok"}"#).unwrap();
        assert_eq!(classify(body), ReportOutcome::Unavailable);
    }
}
