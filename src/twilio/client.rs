use serde::Deserialize;

use crate::config::TwilioConfig;

/// Call-progress events subscribed on every outbound call. Terminal
/// statuses (`busy`, `no-answer`, `failed`, `canceled`) are reported by
/// Twilio as `CallStatus` values without an explicit subscription.
const STATUS_EVENTS: [&str; 4] = ["initiated", "ringing", "answered", "completed"];

/// Twilio REST API client for initiating outbound calls.
pub struct TwilioClient {
    client: reqwest::Client,
    api_base: String,
    account_sid: String,
    auth_token: String,
    from_number: String,
}

/// A successfully created call.
#[derive(Debug, Deserialize)]
pub struct PlacedCall {
    pub sid: String,
    pub status: String,
}

impl TwilioClient {
    pub fn new(twilio_config: &TwilioConfig) -> Self {
        Self::with_api_base(twilio_config, "https://api.twilio.com")
    }

    pub fn with_api_base(twilio_config: &TwilioConfig, api_base: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            api_base: api_base.trim_end_matches('/').to_string(),
            account_sid: twilio_config.account_sid.clone(),
            auth_token: twilio_config.auth_token.clone(),
            from_number: twilio_config.phone_number.clone(),
        }
    }

    /// The configured caller ID, used when a request does not supply one.
    pub fn default_from(&self) -> &str {
        &self.from_number
    }

    /// Create an outbound call. Twilio dials `to`; on answer it fetches
    /// TwiML from `twiml_url` and reports progress to `status_callback`.
    pub async fn place_call(
        &self,
        to: &str,
        from: &str,
        twiml_url: &str,
        status_callback: &str,
    ) -> Result<PlacedCall, OutboundError> {
        if !is_valid_e164(to) {
            return Err(OutboundError::InvalidNumber(to.to_string()));
        }

        let url = format!(
            "{}/2010-04-01/Accounts/{}/Calls.json",
            self.api_base, self.account_sid
        );

        let mut params = vec![
            ("To", to),
            ("From", from),
            ("Url", twiml_url),
            ("StatusCallback", status_callback),
            ("StatusCallbackMethod", "POST"),
        ];
        for event in STATUS_EVENTS {
            params.push(("StatusCallbackEvent", event));
        }

        let resp = self
            .client
            .post(&url)
            .basic_auth(&self.account_sid, Some(&self.auth_token))
            .form(&params)
            .send()
            .await
            .map_err(|e| OutboundError::Request(e.to_string()))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(OutboundError::Api(format!("{status}: {body}")));
        }

        let call: PlacedCall = resp
            .json()
            .await
            .map_err(|e| OutboundError::Request(e.to_string()))?;

        tracing::info!(to, call_sid = %call.sid, status = %call.status, "Outbound call created");
        Ok(call)
    }
}

/// E.164 check: optional `+`, leading digit 1-9, then 1 to 14 more digits.
pub fn is_valid_e164(number: &str) -> bool {
    let digits = number.strip_prefix('+').unwrap_or(number);
    let mut chars = digits.chars();
    matches!(chars.next(), Some('1'..='9'))
        && (2..=15).contains(&digits.len())
        && chars.all(|c| c.is_ascii_digit())
}

#[derive(Debug, thiserror::Error)]
pub enum OutboundError {
    #[error("Invalid destination number: {0}")]
    InvalidNumber(String),
    #[error("HTTP request failed: {0}")]
    Request(String),
    #[error("Twilio API error: {0}")]
    Api(String),
}
