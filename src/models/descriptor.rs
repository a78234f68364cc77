// src/models/descriptor.rs
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{tariff::rating_profile_key, VOICE};

/// The rating request: who is calling where, over which time window.
///
/// Wire form uses PascalCase field names so external producers can submit
/// descriptors over JSON-RPC unchanged.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct CallDescriptor {
    #[serde(rename = "TOR")]
    pub tor: String,
    pub direction: String,
    pub tenant: String,
    pub category: String,
    pub subject: String,
    pub account: String,
    pub destination: String,
    pub time_start: DateTime<Utc>,
    pub time_end: DateTime<Utc>,
    /// Zero for the first slice of a call; the connect fee is only applied
    /// when the loop index is zero.
    pub loop_index: u64,
    /// Requested amount in seconds for max-session queries; when zero the
    /// descriptor's own duration is used.
    pub amount: f64,
    pub rated: bool,
}

impl CallDescriptor {
    pub fn tor(&self) -> &str {
        if self.tor.is_empty() {
            VOICE
        } else {
            &self.tor
        }
    }

    pub fn duration(&self) -> Duration {
        self.time_end - self.time_start
    }

    pub fn seconds_amount(&self) -> f64 {
        if self.amount > 0.0 {
            self.amount
        } else {
            self.duration().num_seconds() as f64
        }
    }

    /// Account key in the `direction:tenant:account` form.
    pub fn account_key(&self) -> String {
        format!("{}:{}:{}", self.direction, self.tenant, self.account)
    }

    pub fn rating_key(&self, subject: &str) -> String {
        rating_profile_key(&self.direction, &self.tenant, &self.category, subject)
    }

    /// Balance chain key for a type of record, e.g. `*voice*out`.
    pub fn balance_key(&self, tor: &str) -> String {
        format!("{}{}", tor, self.direction)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.destination.is_empty() {
            return Err("empty destination".to_string());
        }
        if self.time_start >= self.time_end {
            return Err(format!(
                "time start {} not before time end {}",
                self.time_start, self.time_end
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> CallDescriptor {
        CallDescriptor {
            direction: "*out".to_string(),
            tenant: "cgrates.org".to_string(),
            category: "call".to_string(),
            subject: "12346".to_string(),
            account: "12346".to_string(),
            destination: "447956933443".to_string(),
            time_start: Utc.with_ymd_and_hms(2014, 3, 4, 6, 0, 0).unwrap(),
            time_end: Utc.with_ymd_and_hms(2014, 3, 4, 6, 0, 10).unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn test_keys() {
        let cd = sample();
        assert_eq!(cd.account_key(), "*out:cgrates.org:12346");
        assert_eq!(cd.rating_key("*any"), "*out:cgrates.org:call:*any");
        assert_eq!(cd.balance_key("*voice"), "*voice*out");
    }

    #[test]
    fn test_validate_rejects_inverted_window() {
        let mut cd = sample();
        cd.time_end = cd.time_start;
        assert!(cd.validate().is_err());
    }

    #[test]
    fn test_wire_form_is_pascal_case() {
        let json = serde_json::to_string(&sample()).unwrap();
        assert!(json.contains("\"Tenant\":\"cgrates.org\""));
        assert!(json.contains("\"Destination\":\"447956933443\""));
        assert!(json.contains("\"TimeStart\""));
    }
}
