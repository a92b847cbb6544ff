use std::path::PathBuf;

use crate::model::{MS_PER_HOUR, Minutes, Ms};

/// Rules the booking service applies on top of the mechanical ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BookingPolicy {
    /// A student cancellation at least this far ahead of the start is credited back.
    pub credit_lead_time_ms: Ms,
    pub default_duration_min: Minutes,
    pub default_step_min: Minutes,
}

impl Default for BookingPolicy {
    fn default() -> Self {
        Self {
            credit_lead_time_ms: 24 * MS_PER_HOUR,
            default_duration_min: 60,
            default_step_min: 30,
        }
    }
}

/// Server configuration, read from `TUTORSLOT_*` environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    pub bind: String,
    pub port: u16,
    pub data_dir: PathBuf,
    pub password: String,
    pub max_connections: usize,
    pub compact_threshold: u64,
    pub metrics_port: Option<u16>,
    pub tls_cert: Option<String>,
    pub tls_key: Option<String>,
    pub policy: BookingPolicy,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Unset keys take their defaults;
    /// set-but-malformed keys are an error.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let defaults = BookingPolicy::default();
        let credit_lead_hours: i64 = parse_or(&lookup, "TUTORSLOT_CREDIT_LEAD_HOURS", 24)?;
        let credit_lead_time_ms = credit_lead_hours
            .checked_mul(MS_PER_HOUR)
            .filter(|ms| *ms >= 0)
            .ok_or_else(|| ConfigError::Invalid {
                key: "TUTORSLOT_CREDIT_LEAD_HOURS",
                value: credit_lead_hours.to_string(),
            })?;
        let policy = BookingPolicy {
            credit_lead_time_ms,
            default_duration_min: parse_positive(
                &lookup,
                "TUTORSLOT_DEFAULT_DURATION_MIN",
                defaults.default_duration_min,
            )?,
            default_step_min: parse_positive(
                &lookup,
                "TUTORSLOT_DEFAULT_STEP_MIN",
                defaults.default_step_min,
            )?,
        };

        let tls_cert = lookup("TUTORSLOT_TLS_CERT");
        let tls_key = lookup("TUTORSLOT_TLS_KEY");
        if tls_cert.is_some() != tls_key.is_some() {
            return Err(ConfigError::TlsPair);
        }

        Ok(Self {
            bind: lookup("TUTORSLOT_BIND").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&lookup, "TUTORSLOT_PORT", 5433)?,
            data_dir: PathBuf::from(lookup("TUTORSLOT_DATA_DIR").unwrap_or_else(|| "./data".into())),
            password: lookup("TUTORSLOT_PASSWORD").unwrap_or_else(|| "tutorslot".into()),
            max_connections: parse_or(&lookup, "TUTORSLOT_MAX_CONNECTIONS", 256)?,
            compact_threshold: parse_or(&lookup, "TUTORSLOT_COMPACT_THRESHOLD", 1000)?,
            metrics_port: parse_opt(&lookup, "TUTORSLOT_METRICS_PORT")?,
            tls_cert,
            tls_key,
            policy,
        })
    }

    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }
}

fn parse_opt<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> Result<Option<T>, ConfigError> {
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

fn parse_or<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    Ok(parse_opt(lookup, key)?.unwrap_or(default))
}

fn parse_positive(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
    default: Minutes,
) -> Result<Minutes, ConfigError> {
    let v: Minutes = parse_or(lookup, key, default)?;
    if v <= 0 || v > crate::limits::MAX_SLOT_MINUTES {
        return Err(ConfigError::Invalid { key, value: v.to_string() });
    }
    Ok(v)
}

#[derive(Debug, PartialEq, Eq)]
pub enum ConfigError {
    Invalid { key: &'static str, value: String },
    TlsPair,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Invalid { key, value } => write!(f, "invalid value for {key}: {value:?}"),
            ConfigError::TlsPair => write!(
                f,
                "both TUTORSLOT_TLS_CERT and TUTORSLOT_TLS_KEY must be set, or neither"
            ),
        }
    }
}

impl std::error::Error for ConfigError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k| map.get(k).cloned()
    }

    #[test]
    fn defaults_when_unset() {
        let cfg = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg.port, 5433);
        assert_eq!(cfg.listen_addr(), "0.0.0.0:5433");
        assert_eq!(cfg.max_connections, 256);
        assert_eq!(cfg.compact_threshold, 1000);
        assert_eq!(cfg.metrics_port, None);
        assert_eq!(cfg.policy, BookingPolicy::default());
        assert_eq!(cfg.policy.credit_lead_time_ms, 24 * MS_PER_HOUR);
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = Config::from_lookup(lookup(&[
            ("TUTORSLOT_PORT", "6000"),
            ("TUTORSLOT_METRICS_PORT", "9100"),
            ("TUTORSLOT_CREDIT_LEAD_HOURS", "48"),
            ("TUTORSLOT_DEFAULT_DURATION_MIN", "45"),
            ("TUTORSLOT_DEFAULT_STEP_MIN", "15"),
        ]))
        .unwrap();
        assert_eq!(cfg.port, 6000);
        assert_eq!(cfg.metrics_port, Some(9100));
        assert_eq!(cfg.policy.credit_lead_time_ms, 48 * MS_PER_HOUR);
        assert_eq!(cfg.policy.default_duration_min, 45);
        assert_eq!(cfg.policy.default_step_min, 15);
    }

    #[test]
    fn malformed_number_is_an_error() {
        let err = Config::from_lookup(lookup(&[("TUTORSLOT_PORT", "lots")])).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid { key: "TUTORSLOT_PORT", value: "lots".into() }
        );
    }

    #[test]
    fn lead_time_out_of_range_rejected() {
        let huge = i64::MAX.to_string();
        for value in [huge.as_str(), "-1"] {
            let err = Config::from_lookup(lookup(&[("TUTORSLOT_CREDIT_LEAD_HOURS", value)])).unwrap_err();
            assert_eq!(
                err,
                ConfigError::Invalid { key: "TUTORSLOT_CREDIT_LEAD_HOURS", value: value.into() }
            );
        }
    }

    #[test]
    fn zero_step_rejected() {
        assert!(Config::from_lookup(lookup(&[("TUTORSLOT_DEFAULT_STEP_MIN", "0")])).is_err());
    }

    #[test]
    fn tls_needs_both_halves() {
        let err = Config::from_lookup(lookup(&[("TUTORSLOT_TLS_CERT", "cert.pem")])).unwrap_err();
        assert_eq!(err, ConfigError::TlsPair);
    }
}
