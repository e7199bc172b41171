//! Tiered commission fees.
//!
//! A schedule is an ordered list of brackets. The bracket that contains the
//! bid amount decides the rate, and that rate applies to the whole amount.
//! Rates are in basis points (1/100 of a percent) and fees round half-up
//! to the cent.

use serde::{Deserialize, Serialize};

use crate::errors::MarketError;

const BPS_DENOMINATOR: i64 = 10_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionTier {
    /// Inclusive upper bound in cents. `None` marks the open-ended top tier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub up_to_cents: Option<i64>,
    pub rate_bps: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommissionBreakdown {
    pub base_cents: i64,
    pub rate_bps: u32,
    /// Zero-based index of the tier that applied.
    pub tier: usize,
    pub fee_cents: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CommissionTier>", into = "Vec<CommissionTier>")]
pub struct CommissionSchedule {
    tiers: Vec<CommissionTier>,
}

impl CommissionSchedule {
    pub fn new(tiers: Vec<CommissionTier>) -> Result<Self, MarketError> {
        let Some(last) = tiers.last() else {
            return Err(MarketError::InvalidSchedule(
                "at least one tier is required".into(),
            ));
        };
        if last.up_to_cents.is_some() {
            return Err(MarketError::InvalidSchedule(
                "the last tier must have no upper bound".into(),
            ));
        }

        let mut previous: Option<i64> = None;
        for (i, tier) in tiers.iter().enumerate() {
            if tier.rate_bps as i64 > BPS_DENOMINATOR {
                return Err(MarketError::InvalidSchedule(format!(
                    "tier {} rate {} bps exceeds 100%",
                    i, tier.rate_bps
                )));
            }
            if i + 1 < tiers.len() {
                let Some(bound) = tier.up_to_cents else {
                    return Err(MarketError::InvalidSchedule(format!(
                        "tier {} has no upper bound but is not the last tier",
                        i
                    )));
                };
                if bound < 0 || previous.is_some_and(|p| bound <= p) {
                    return Err(MarketError::InvalidSchedule(format!(
                        "tier {} bound {} must be non-negative and above the previous tier",
                        i, bound
                    )));
                }
                previous = Some(bound);
            }
        }

        Ok(Self { tiers })
    }

    pub fn tiers(&self) -> &[CommissionTier] {
        &self.tiers
    }

    pub fn quote(&self, amount_cents: i64) -> Result<CommissionBreakdown, MarketError> {
        if amount_cents < 0 {
            return Err(MarketError::validation(format!(
                "amount must not be negative, got {}",
                amount_cents
            )));
        }

        let (tier, bracket) = self
            .tiers
            .iter()
            .enumerate()
            .find(|(_, t)| t.up_to_cents.is_none_or(|bound| amount_cents <= bound))
            .ok_or_else(|| MarketError::InvalidSchedule("no tier covers the amount".into()))?;

        let scaled = (amount_cents as i128) * (bracket.rate_bps as i128);
        let fee = (scaled + (BPS_DENOMINATOR as i128) / 2) / BPS_DENOMINATOR as i128;
        let fee_cents = i64::try_from(fee)
            .map_err(|_| MarketError::validation("commission overflows"))?;

        Ok(CommissionBreakdown {
            base_cents: amount_cents,
            rate_bps: bracket.rate_bps,
            tier,
            fee_cents,
        })
    }
}

impl Default for CommissionSchedule {
    fn default() -> Self {
        Self {
            tiers: vec![
                CommissionTier {
                    up_to_cents: Some(100_000),
                    rate_bps: 1_000,
                },
                CommissionTier {
                    up_to_cents: Some(500_000),
                    rate_bps: 800,
                },
                CommissionTier {
                    up_to_cents: Some(2_000_000),
                    rate_bps: 600,
                },
                CommissionTier {
                    up_to_cents: None,
                    rate_bps: 400,
                },
            ],
        }
    }
}

impl TryFrom<Vec<CommissionTier>> for CommissionSchedule {
    type Error = MarketError;

    fn try_from(tiers: Vec<CommissionTier>) -> Result<Self, Self::Error> {
        Self::new(tiers)
    }
}

impl From<CommissionSchedule> for Vec<CommissionTier> {
    fn from(schedule: CommissionSchedule) -> Self {
        schedule.tiers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_schedule_brackets() {
        let schedule = CommissionSchedule::default();

        let small = schedule.quote(50_000).unwrap();
        assert_eq!(small.tier, 0);
        assert_eq!(small.fee_cents, 5_000);

        let mid = schedule.quote(300_000).unwrap();
        assert_eq!(mid.tier, 1);
        assert_eq!(mid.rate_bps, 800);
        assert_eq!(mid.fee_cents, 24_000);

        let large = schedule.quote(5_000_000).unwrap();
        assert_eq!(large.tier, 3);
        assert_eq!(large.fee_cents, 200_000);
    }

    #[test]
    fn test_bound_is_inclusive() {
        let schedule = CommissionSchedule::default();
        assert_eq!(schedule.quote(100_000).unwrap().tier, 0);
        assert_eq!(schedule.quote(100_001).unwrap().tier, 1);
    }

    #[test]
    fn test_fee_rounds_half_up() {
        let schedule = CommissionSchedule::new(vec![CommissionTier {
            up_to_cents: None,
            rate_bps: 250,
        }])
        .unwrap();
        // 2.5% of 1.02 = 0.0255 -> 3 cents
        assert_eq!(schedule.quote(102).unwrap().fee_cents, 3);
        // 2.5% of 1.00 = 0.025 -> 3 cents (half rounds up)
        assert_eq!(schedule.quote(100).unwrap().fee_cents, 3);
        // 2.5% of 0.99 = 0.02475 -> 2 cents
        assert_eq!(schedule.quote(99).unwrap().fee_cents, 2);
    }

    #[test]
    fn test_zero_and_negative_amounts() {
        let schedule = CommissionSchedule::default();
        assert_eq!(schedule.quote(0).unwrap().fee_cents, 0);
        assert!(matches!(
            schedule.quote(-1),
            Err(MarketError::Validation(_))
        ));
    }

    #[test]
    fn test_rejects_bounded_last_tier() {
        let err = CommissionSchedule::new(vec![CommissionTier {
            up_to_cents: Some(1_000),
            rate_bps: 500,
        }])
        .unwrap_err();
        assert!(err.to_string().contains("last tier"));
    }

    #[test]
    fn test_rejects_unordered_tiers() {
        let err = CommissionSchedule::new(vec![
            CommissionTier { up_to_cents: Some(5_000), rate_bps: 500 },
            CommissionTier { up_to_cents: Some(1_000), rate_bps: 400 },
            CommissionTier { up_to_cents: None, rate_bps: 300 },
        ])
        .unwrap_err();
        assert!(matches!(err, MarketError::InvalidSchedule(_)));
    }

    #[test]
    fn test_rejects_rate_above_hundred_percent() {
        assert!(
            CommissionSchedule::new(vec![CommissionTier {
                up_to_cents: None,
                rate_bps: 10_001,
            }])
            .is_err()
        );
        assert!(CommissionSchedule::new(vec![]).is_err());
    }

    #[test]
    fn test_deserialize_validates() {
        let ok: CommissionSchedule = serde_json::from_str(
            r#"[{"up_to_cents": 1000, "rate_bps": 900}, {"rate_bps": 700}]"#,
        )
        .unwrap();
        assert_eq!(ok.tiers().len(), 2);

        let bad =
            serde_json::from_str::<CommissionSchedule>(r#"[{"up_to_cents": 10, "rate_bps": 1}]"#);
        assert!(bad.is_err());
    }
}
