use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate};
use chrono_tz::Tz;
use http::{HeaderMap, StatusCode};
use log::{debug, error, info, warn};
use std::time::Duration;
use ureq::Agent;

use crate::clock::Clock;

pub const ADD_STATUS_URL: &str = "https://pvoutput.org/service/r2/addstatus.jsp";
pub const ADD_OUTPUT_URL: &str = "https://pvoutput.org/service/r2/addoutput.jsp";

const HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_ATTEMPTS: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(5);
const COMMENT_LIMIT: usize = 30;
const LOW_REMAINING_REQUESTS: u32 = 10;

pub type Form = Vec<(&'static str, String)>;

/// Sends one form-encoded POST and hands back the response head.
pub trait Transport {
    fn post_form(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        form: &[(&'static str, String)],
    ) -> Result<http::Response<()>>;
}

impl<T: Transport + ?Sized> Transport for &T {
    fn post_form(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        form: &[(&'static str, String)],
    ) -> Result<http::Response<()>> {
        (**self).post_form(url, headers, form)
    }
}

/// Blocking HTTP transport with a 10 second overall timeout. Non-2xx statuses
/// are returned as responses so the caller can inspect them.
pub struct UreqTransport {
    agent: Agent,
}

impl UreqTransport {
    pub fn new() -> Self {
        let agent = Agent::config_builder()
            .timeout_global(Some(HTTP_TIMEOUT))
            .http_status_as_error(false)
            .build()
            .into();
        Self { agent }
    }
}

impl Default for UreqTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport for UreqTransport {
    fn post_form(
        &self,
        url: &str,
        headers: &[(&'static str, String)],
        form: &[(&'static str, String)],
    ) -> Result<http::Response<()>> {
        let mut request = self.agent.post(url);
        for (name, value) in headers {
            request = request.header(*name, value.as_str());
        }
        let response = request
            .send_form(form.iter().map(|(key, value)| (*key, value.as_str())))
            .with_context(|| format!("POST to {} failed", url))?;
        let (parts, _body) = response.into_parts();
        Ok(http::Response::from_parts(parts, ()))
    }
}

/// Live status for the "add status" service.
#[derive(Debug, Clone)]
pub struct StatusRecord {
    pub timestamp: DateTime<Tz>,
    /// Generated energy in Wh, subject to [`EnergyFilter`].
    pub energy_generated: Option<f64>,
    pub power_generated: Option<f32>,
    /// Consumed energy in Wh.
    pub energy_consumed: Option<f64>,
    pub power_consumed: Option<f32>,
    pub temperature: Option<f32>,
    pub voltage_dc: Option<f32>,
    pub cumulative: bool,
    pub voltage_ac: Option<f32>,
    pub temperature_inverter: Option<f32>,
    /// Lifetime energy in Wh.
    pub energy_lifetime: Option<f64>,
    pub comment: Option<String>,
    /// DC input power, only used to derive the efficiency.
    pub power_dc: Option<f32>,
}

impl StatusRecord {
    pub fn new(timestamp: DateTime<Tz>) -> Self {
        Self {
            timestamp,
            energy_generated: None,
            power_generated: None,
            energy_consumed: None,
            power_consumed: None,
            temperature: None,
            voltage_dc: None,
            cumulative: false,
            voltage_ac: None,
            temperature_inverter: None,
            energy_lifetime: None,
            comment: None,
            power_dc: None,
        }
    }

    /// Efficiency as generated power over DC power, when both are known and DC power is positive.
    pub fn efficiency(&self) -> Option<f32> {
        match (self.power_generated, self.power_dc) {
            (Some(generated), Some(dc)) if dc > 0.0 => Some(generated / dc),
            _ => None,
        }
    }

    /// Build the form fields. The filter decides whether `v1` is included and
    /// is updated with the generated energy on every call.
    pub fn to_form(&self, filter: &mut EnergyFilter) -> Form {
        let mut form: Form = vec![
            ("d", self.timestamp.format("%Y%m%d").to_string()),
            ("t", self.timestamp.format("%H:%M").to_string()),
        ];

        if let Some(energy) = self.energy_generated.and_then(|e| filter.admit(e)) {
            form.push(("v1", energy.to_string()));
        }
        if let Some(power) = self.power_generated {
            form.push(("v2", power.to_string()));
        }
        if let Some(energy) = self.energy_consumed {
            form.push(("v3", (energy as i64).to_string()));
        }
        if let Some(power) = self.power_consumed {
            form.push(("v4", power.to_string()));
        }
        if let Some(temperature) = self.temperature {
            form.push(("v5", temperature.to_string()));
        }
        if let Some(voltage) = self.voltage_dc {
            form.push(("v6", voltage.to_string()));
        }
        form.push(("c1", if self.cumulative { "1" } else { "0" }.to_string()));
        if let Some(voltage) = self.voltage_ac {
            form.push(("v8", voltage.to_string()));
        }
        if let Some(temperature) = self.temperature_inverter {
            form.push(("v9", temperature.to_string()));
        }
        if let Some(energy) = self.energy_lifetime {
            form.push(("v10", (energy as i64).to_string()));
        }
        if let Some(comment) = &self.comment {
            form.push(("m1", truncate_comment(comment)));
        }
        if let Some(efficiency) = self.efficiency() {
            form.push(("v12", efficiency.to_string()));
        }

        form
    }
}

/// End of day summary for the "add output" service.
#[derive(Debug, Clone)]
pub struct OutputRecord {
    pub date: NaiveDate,
    /// Generated energy in Wh.
    pub generated: Option<f64>,
    /// Exported energy in Wh.
    pub exported: Option<f64>,
    /// Consumed energy in Wh.
    pub consumed: Option<f64>,
    pub comment: Option<String>,
}

impl OutputRecord {
    pub fn to_form(&self) -> Form {
        let mut form: Form = vec![("d", self.date.format("%Y%m%d").to_string())];
        if let Some(energy) = self.generated {
            form.push(("g", (energy as i64).to_string()));
        }
        if let Some(energy) = self.exported {
            form.push(("e", (energy as i64).to_string()));
        }
        if let Some(energy) = self.consumed {
            form.push(("c", (energy as i64).to_string()));
        }
        if let Some(comment) = &self.comment {
            form.push(("cm", truncate_comment(comment)));
        }
        form
    }
}

fn truncate_comment(comment: &str) -> String {
    comment.chars().take(COMMENT_LIMIT).collect()
}

/// Only lets a cumulative energy value through when it exceeds the last one seen.
///
/// Some meters update their counters in coarse steps. Re-sending a flat counter
/// makes the service derive zero average power between steps.
#[derive(Debug, Default)]
pub struct EnergyFilter {
    last_reported: f64,
}

impl EnergyFilter {
    /// Returns the whole Wh to report, if any. The stored value follows every
    /// finite read; non-finite values are dropped without touching it.
    pub fn admit(&mut self, energy: f64) -> Option<i64> {
        if !energy.is_finite() {
            return None;
        }
        let increased = energy > self.last_reported;
        self.last_reported = energy.floor();
        increased.then_some(energy as i64)
    }

    pub fn last_reported(&self) -> f64 {
        self.last_reported
    }
}

/// Rate limit state advertised on every response.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitInfo {
    pub remaining: Option<u32>,
    /// Seconds until the window resets.
    pub reset_delay: Option<u64>,
}

impl RateLimitInfo {
    /// `X-Rate-Limit-Reset` carries a Unix timestamp; `now` turns it into a delay.
    pub fn from_headers(headers: &HeaderMap, now: i64) -> Self {
        let remaining = header(headers, "X-Rate-Limit-Remaining").and_then(|v| v.trim().parse().ok());
        let reset_delay = header(headers, "X-Rate-Limit-Reset")
            .and_then(|v| v.trim().parse::<f64>().ok())
            .map(|reset| (reset - now as f64).round().max(0.0) as u64);
        Self {
            remaining,
            reset_delay,
        }
    }
}

fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Delivered,
    GaveUp,
    /// No system ID was available, nothing was sent.
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Delivery {
    pub attempts: u32,
    pub outcome: Outcome,
}

/// PVOutput API client. Uploads are serial and failures stay inside this type.
pub struct PvOutput<T, C> {
    transport: T,
    clock: C,
    api_key: String,
    system_id: Option<String>,
    filter: EnergyFilter,
}

impl<T: Transport, C: Clock> PvOutput<T, C> {
    pub fn new(transport: T, clock: C, api_key: String, system_id: Option<String>) -> Self {
        Self {
            transport,
            clock,
            api_key,
            system_id,
            filter: EnergyFilter::default(),
        }
    }

    pub fn last_reported_energy(&self) -> f64 {
        self.filter.last_reported()
    }

    /// Upload a live status. `system_id` overrides the configured one.
    pub fn send_status(&mut self, record: &StatusRecord, system_id: Option<&str>) -> Delivery {
        let form = record.to_form(&mut self.filter);
        self.call(ADD_STATUS_URL, &form, system_id)
    }

    /// Upload an end of day summary.
    pub fn send_output(&mut self, record: &OutputRecord, system_id: Option<&str>) -> Delivery {
        let form = record.to_form();
        self.call(ADD_OUTPUT_URL, &form, system_id)
    }

    fn call(&self, url: &str, form: &[(&'static str, String)], system_id: Option<&str>) -> Delivery {
        let Some(system_id) = system_id.or(self.system_id.as_deref()) else {
            warn!("Missing PVOutput system ID, not sending anything");
            return Delivery {
                attempts: 0,
                outcome: Outcome::Skipped,
            };
        };

        let headers = [
            ("X-Pvoutput-Apikey", self.api_key.clone()),
            ("X-Pvoutput-SystemId", system_id.to_string()),
            ("X-Rate-Limit", "1".to_string()),
        ];
        debug!("POST {} {:?}", url, form);

        for attempt in 1..=MAX_ATTEMPTS {
            let retry_in = match self.transport.post_form(url, &headers, form) {
                Ok(response) => {
                    let limit =
                        RateLimitInfo::from_headers(response.headers(), self.clock.now().timestamp());
                    if let Some(remaining) = limit.remaining {
                        if remaining < LOW_REMAINING_REQUESTS {
                            warn!(
                                "Only {} requests left, reset after {} seconds",
                                remaining,
                                limit.reset_delay.unwrap_or(0)
                            );
                        }
                    }

                    let status = response.status();
                    if status.is_success() {
                        info!("Uploaded to {} (attempt {})", url, attempt);
                        return Delivery {
                            attempts: attempt,
                            outcome: Outcome::Delivered,
                        };
                    }
                    if status == StatusCode::FORBIDDEN {
                        warn!("Forbidden by PVOutput, rate limit exceeded");
                        limit
                            .reset_delay
                            .map_or(RETRY_DELAY, |delay| Duration::from_secs(delay + 1))
                    } else {
                        error!("HTTP error from PVOutput: {}", status);
                        RETRY_DELAY
                    }
                }
                Err(e) => {
                    error!("Failed to reach PVOutput: {:#}", e);
                    RETRY_DELAY
                }
            };

            if attempt < MAX_ATTEMPTS {
                self.clock.sleep(retry_in);
            }
        }

        error!("Failed to call PVOutput API after {} attempts", MAX_ATTEMPTS);
        Delivery {
            attempts: MAX_ATTEMPTS,
            outcome: Outcome::GaveUp,
        }
    }
}
