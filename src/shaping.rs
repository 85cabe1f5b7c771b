//! Link impairment compiler
//!
//! Translates declarative [`Constraints`] into `tc` argument vectors: a netem
//! layer for delay, jitter and loss at `root handle 1:`, followed by a tbf
//! rate limiter parented to it.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Ethernet frame size used for default tbf limit/burst.
pub const DEFAULT_MTU_BYTES: u64 = 1518;

#[derive(Error, Debug, PartialEq)]
pub enum ShapingError {
    #[error("{field} requires delay to be set")]
    MissingDelay { field: &'static str },

    #[error("invalid quantity for {field}: {value:?}")]
    InvalidQuantity { field: &'static str, value: String },

    #[error("{field} out of range: {value}")]
    OutOfRange { field: &'static str, value: f64 },
}

/// A number, optionally given as a string with a magnitude suffix.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Quantity {
    Int(u64),
    Float(f64),
    Text(String),
}

impl From<u64> for Quantity {
    fn from(v: u64) -> Self {
        Quantity::Int(v)
    }
}

impl From<f64> for Quantity {
    fn from(v: f64) -> Self {
        Quantity::Float(v)
    }
}

impl From<&str> for Quantity {
    fn from(v: &str) -> Self {
        Quantity::Text(v.to_string())
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quantity::Int(v) => write!(f, "{}", v),
            Quantity::Float(v) => write!(f, "{}", v),
            Quantity::Text(v) => f.write_str(v),
        }
    }
}

impl Quantity {
    pub fn value(&self, field: &'static str) -> Result<f64, ShapingError> {
        let v = match self {
            Quantity::Int(v) => *v as f64,
            Quantity::Float(v) => *v,
            Quantity::Text(s) => parse_quantity(s).ok_or_else(|| ShapingError::InvalidQuantity {
                field,
                value: s.clone(),
            })?,
        };
        if !v.is_finite() || v < 0.0 {
            return Err(ShapingError::OutOfRange { field, value: v });
        }
        Ok(v)
    }

    fn integer(&self, field: &'static str) -> Result<u64, ShapingError> {
        Ok(self.value(field)?.round() as u64)
    }

    fn percent(&self, field: &'static str) -> Result<f64, ShapingError> {
        let v = self.value(field)?;
        if v > 100.0 {
            return Err(ShapingError::OutOfRange { field, value: v });
        }
        Ok(v)
    }
}

/// Parse `"<number>[K|M|G|T][i]"`. A trailing `i` selects powers of 1024,
/// otherwise powers of 1000. Suffixes are case-insensitive.
pub fn parse_quantity(s: &str) -> Option<f64> {
    let s = s.trim();
    let (body, binary) = match s.strip_suffix(|c: char| c == 'i' || c == 'I') {
        Some(rest) => (rest, true),
        None => (s, false),
    };
    let base: f64 = if binary { 1024.0 } else { 1000.0 };
    let (digits, exp) = match body.chars().last()?.to_ascii_lowercase() {
        'k' => (&body[..body.len() - 1], 1),
        'm' => (&body[..body.len() - 1], 2),
        'g' => (&body[..body.len() - 1], 3),
        't' => (&body[..body.len() - 1], 4),
        _ if binary => return None,
        _ => (body, 0),
    };
    let n: f64 = digits.trim().parse().ok()?;
    Some(n * base.powi(exp))
}

/// Per-interface impairments.
///
/// `delay` and `jitter` are microseconds, `loss` and the correlations are
/// percentages, `rate` is bits per second, `limit` and `burst` are bytes.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Constraints {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jitter_correlation: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loss_correlation: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Quantity>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub burst: Option<Quantity>,
}

impl Constraints {
    pub fn delay_us(delay: u64) -> Self {
        Self {
            delay: Some(delay.into()),
            ..Default::default()
        }
    }

    pub fn with_jitter(mut self, jitter: u64) -> Self {
        self.jitter = Some(jitter.into());
        self
    }

    pub fn with_loss(mut self, loss: f64) -> Self {
        self.loss = Some(loss.into());
        self
    }

    pub fn with_rate(mut self, rate: impl Into<Quantity>) -> Self {
        self.rate = Some(rate.into());
        self
    }

    /// Check policy without producing commands.
    pub fn validate(&self) -> Result<(), ShapingError> {
        self.compile("check").map(|_| ())
    }

    /// `tc` argument vectors (without the `tc` word) for `ifname`, in the
    /// order they must be applied. Empty when nothing is constrained.
    pub fn compile(&self, ifname: &str) -> Result<Vec<Vec<String>>, ShapingError> {
        if self.delay.is_none() {
            if self.jitter.is_some() || self.jitter_correlation.is_some() {
                return Err(ShapingError::MissingDelay { field: "jitter" });
            }
            if self.loss.is_some() || self.loss_correlation.is_some() {
                return Err(ShapingError::MissingDelay { field: "loss" });
            }
        }

        let mut cmds = Vec::new();
        let mut netem = false;

        if let Some(delay) = &self.delay {
            let mut args = words(&["qdisc", "add", "dev", ifname, "root", "handle", "1:", "netem"]);
            args.push("delay".into());
            args.push(format!("{}usec", delay.integer("delay")?));
            if let Some(jitter) = &self.jitter {
                args.push(format!("{}usec", jitter.integer("jitter")?));
                if let Some(corr) = &self.jitter_correlation {
                    args.push(format!("{}%", corr.percent("jitter-correlation")?));
                }
            }
            if let Some(loss) = &self.loss {
                args.push("loss".into());
                args.push(format!("{}%", loss.percent("loss")?));
                if let Some(corr) = &self.loss_correlation {
                    args.push(format!("{}%", corr.percent("loss-correlation")?));
                }
            }
            cmds.push(args);
            netem = true;
        }

        if let Some(rate) = &self.rate {
            let limit = match &self.limit {
                Some(q) => q.integer("limit")?,
                None => DEFAULT_MTU_BYTES,
            };
            let burst = match &self.burst {
                Some(q) => q.integer("burst")?,
                None => 2 * DEFAULT_MTU_BYTES,
            };
            let mut args = words(&["qdisc", "add", "dev", ifname]);
            if netem {
                args.extend(words(&["parent", "1:1", "handle", "10:"]));
            } else {
                args.extend(words(&["root", "handle", "10:"]));
            }
            args.push("tbf".into());
            args.push("rate".into());
            args.push(format!("{}bit", rate.integer("rate")?));
            args.push("burst".into());
            args.push(burst.to_string());
            args.push("limit".into());
            args.push(limit.to_string());
            cmds.push(args);
        }

        Ok(cmds)
    }
}

/// `tc` arguments that remove whatever root qdisc is installed.
pub fn clear_args(ifname: &str) -> Vec<String> {
    words(&["qdisc", "del", "dev", ifname, "root"])
}

fn words(w: &[&str]) -> Vec<String> {
    w.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quantity() {
        assert_eq!(parse_quantity("1500"), Some(1500.0));
        assert_eq!(parse_quantity("10k"), Some(10_000.0));
        assert_eq!(parse_quantity("10K"), Some(10_000.0));
        assert_eq!(parse_quantity("2M"), Some(2_000_000.0));
        assert_eq!(parse_quantity("1Ki"), Some(1024.0));
        assert_eq!(parse_quantity("1Mi"), Some(1_048_576.0));
        assert_eq!(parse_quantity("1.5G"), Some(1.5e9));
        assert_eq!(parse_quantity("7i"), None);
        assert_eq!(parse_quantity("fast"), None);
        assert_eq!(parse_quantity(""), None);
    }

    #[test]
    fn test_delay_and_jitter() {
        let c = Constraints::delay_us(80000).with_jitter(8000);
        let cmds = c.compile("eth0").unwrap();
        assert_eq!(cmds.len(), 1);
        assert_eq!(
            cmds[0].join(" "),
            "qdisc add dev eth0 root handle 1: netem delay 80000usec 8000usec"
        );
    }

    #[test]
    fn test_loss_requires_delay() {
        let c = Constraints::default().with_loss(30.0);
        assert_eq!(c.compile("eth0"), Err(ShapingError::MissingDelay { field: "loss" }));

        let c = Constraints::delay_us(0).with_loss(30.0);
        let cmds = c.compile("eth0").unwrap();
        assert!(cmds[0].join(" ").ends_with("delay 0usec loss 30%"));
    }

    #[test]
    fn test_jitter_requires_delay() {
        let c = Constraints {
            jitter: Some(10.into()),
            ..Default::default()
        };
        assert_eq!(c.validate(), Err(ShapingError::MissingDelay { field: "jitter" }));
    }

    #[test]
    fn test_rate_chained_under_netem() {
        let c = Constraints::delay_us(1000).with_rate("10M");
        let cmds = c.compile("r1-eth0").unwrap();
        assert_eq!(cmds.len(), 2);
        assert_eq!(
            cmds[1].join(" "),
            "qdisc add dev r1-eth0 parent 1:1 handle 10: tbf rate 10000000bit burst 3036 limit 1518"
        );
    }

    #[test]
    fn test_rate_alone_is_root() {
        let mut c = Constraints::default().with_rate(1_000_000u64);
        c.burst = Some("4Ki".into());
        c.limit = Some(3000u64.into());
        let cmds = c.compile("eth1").unwrap();
        assert_eq!(
            cmds,
            vec![words(&[
                "qdisc", "add", "dev", "eth1", "root", "handle", "10:", "tbf", "rate",
                "1000000bit", "burst", "4096", "limit", "3000"
            ])]
        );
    }

    #[test]
    fn test_correlations() {
        let c = Constraints {
            delay: Some(100.into()),
            jitter: Some(10.into()),
            jitter_correlation: Some(25.into()),
            loss: Some(Quantity::Float(1.5)),
            loss_correlation: Some(50.into()),
            ..Default::default()
        };
        let cmds = c.compile("x").unwrap();
        assert_eq!(
            cmds[0][7..].join(" "),
            "netem delay 100usec 10usec 25% loss 1.5% 50%"
        );
    }

    #[test]
    fn test_bad_values() {
        let c = Constraints::default().with_rate("lots");
        assert!(matches!(c.compile("x"), Err(ShapingError::InvalidQuantity { .. })));
        let c = Constraints::delay_us(1).with_loss(120.0);
        assert!(matches!(c.compile("x"), Err(ShapingError::OutOfRange { .. })));
    }

    #[test]
    fn test_deserialize_kebab_case() {
        let c: Constraints =
            serde_json::from_str(r#"{"delay": 40000, "jitter": "4k", "loss-correlation": 5}"#).unwrap();
        assert_eq!(c.delay, Some(Quantity::Int(40000)));
        assert_eq!(c.jitter, Some(Quantity::Text("4k".into())));
        assert_eq!(c.loss_correlation, Some(Quantity::Int(5)));
    }
}
