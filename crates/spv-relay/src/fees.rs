//! Query-fee metering and relayer reward settlement.

/// Tunable fee and reward parameters.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct FeeParams {
    /// Estimated cost of one header submission, in native units.
    /// External parameter, refreshed by the operator.
    pub submission_cost: u64,
    /// Expected inclusion queries per fee epoch; the congestion pivot.
    pub baseline_queries: u64,
    /// Relayer markup on top of the submission cost, in percent.
    pub relayer_fee_pct: u64,
}

impl Default for FeeParams {
    fn default() -> Self {
        Self {
            submission_cost: 100_000,
            baseline_queries: 100,
            relayer_fee_pct: 15,
        }
    }
}

/// Settlement of one relayer reward.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewardOutcome {
    /// Amount covered by banked native fee revenue.
    pub native: u64,
    /// Shortfall routed through the secondary token payer.
    pub secondary: u64,
    /// Secondary payout failure, if any. Never aborts the submission.
    pub payment_error: Option<String>,
}

/// Seam for the secondary reward-token transfer.
pub trait RewardPayer {
    fn pay(
        &mut self,
        recipient: &str,
        amount: u64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>>;
}

/// Payer with no secondary token configured; shortfalls are forfeited.
#[derive(Debug, Default)]
pub struct NullPayer;

impl RewardPayer for NullPayer {
    fn pay(
        &mut self,
        _recipient: &str,
        _amount: u64,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
        Ok(())
    }
}

/// Per-epoch query accounting and the native fee pool.
#[derive(Debug, Clone)]
pub struct FeeMeter {
    params: FeeParams,
    /// Queries served in the current fee epoch.
    epoch_queries: u64,
    /// Native fee revenue not yet paid out as rewards.
    native_pool: u64,
}

impl FeeMeter {
    pub fn new(params: FeeParams) -> Self {
        Self {
            params,
            epoch_queries: 0,
            native_pool: 0,
        }
    }

    pub fn params(&self) -> &FeeParams {
        &self.params
    }

    pub fn set_params(&mut self, params: FeeParams) {
        self.params = params;
    }

    pub fn epoch_queries(&self) -> u64 {
        self.epoch_queries
    }

    pub fn native_pool(&self) -> u64 {
        self.native_pool
    }

    /// Restore counters from persisted state.
    pub fn restore(&mut self, epoch_queries: u64, native_pool: u64) {
        self.epoch_queries = epoch_queries;
        self.native_pool = native_pool;
    }

    /// Quote the fee for one inclusion query.
    ///
    /// Amortizes the submission cost over the baseline query volume, scaled
    /// up once the epoch's query count exceeds the baseline.
    pub fn required_fee(&self) -> u64 {
        let baseline = self.params.baseline_queries.max(1);
        let base = self.params.submission_cost / baseline;
        base * self.epoch_queries.max(baseline) / baseline
    }

    /// Bank a cleared payment and count the query.
    pub fn record_query(&mut self, payment: u64) {
        self.epoch_queries += 1;
        self.native_pool += payment;
    }

    /// Reset the query counter when finalization crosses an epoch boundary.
    pub fn maybe_roll_epoch(&mut self, finalized_height: u64, epoch_length: u64) {
        if epoch_length > 0 && finalized_height % epoch_length == 0 {
            self.epoch_queries = 0;
        }
    }

    /// Full reward owed to the relayer of a finalized block.
    pub fn reward_due(&self) -> u64 {
        self.params.submission_cost * (100 + self.params.relayer_fee_pct) / 100
    }

    /// Pay the relayer reward: native pool first, secondary token for the
    /// shortfall. A secondary transfer failure is reported in the outcome,
    /// never propagated.
    pub fn settle_reward(&mut self, payer: &mut dyn RewardPayer, recipient: &str) -> RewardOutcome {
        let due = self.reward_due();
        let native = due.min(self.native_pool);
        self.native_pool -= native;
        let secondary = due - native;

        let payment_error = if secondary > 0 {
            payer.pay(recipient, secondary).err().map(|e| e.to_string())
        } else {
            None
        };

        RewardOutcome {
            native,
            secondary,
            payment_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingPayer;

    impl RewardPayer for FailingPayer {
        fn pay(
            &mut self,
            _recipient: &str,
            _amount: u64,
        ) -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
            Err("token transfer reverted".into())
        }
    }

    fn meter() -> FeeMeter {
        FeeMeter::new(FeeParams {
            submission_cost: 10_000,
            baseline_queries: 10,
            relayer_fee_pct: 20,
        })
    }

    #[test]
    fn fee_is_flat_below_baseline_then_scales() {
        let mut meter = meter();
        assert_eq!(meter.required_fee(), 1_000);
        for _ in 0..10 {
            let fee = meter.required_fee();
            meter.record_query(fee);
        }
        // At 2x the baseline the fee has doubled.
        for _ in 0..10 {
            let fee = meter.required_fee();
            meter.record_query(fee);
        }
        assert_eq!(meter.required_fee(), 2_000);
    }

    #[test]
    fn epoch_roll_resets_congestion() {
        let mut meter = meter();
        for _ in 0..30 {
            meter.record_query(1_000);
        }
        assert!(meter.required_fee() > 1_000);
        meter.maybe_roll_epoch(4032, 2016);
        assert_eq!(meter.required_fee(), 1_000);
        // Off-boundary heights do not roll.
        meter.record_query(1_000);
        meter.maybe_roll_epoch(4033, 2016);
        assert_eq!(meter.epoch_queries(), 1);
    }

    #[test]
    fn reward_prefers_native_pool() {
        let mut meter = meter();
        meter.record_query(5_000);
        let outcome = meter.settle_reward(&mut NullPayer, "relayer");
        assert_eq!(outcome.native, 5_000);
        assert_eq!(outcome.secondary, 7_000);
        assert!(outcome.payment_error.is_none());
        assert_eq!(meter.native_pool(), 0);
    }

    #[test]
    fn secondary_failure_is_swallowed() {
        let mut meter = meter();
        let outcome = meter.settle_reward(&mut FailingPayer, "relayer");
        assert_eq!(outcome.native, 0);
        assert_eq!(outcome.secondary, 12_000);
        assert_eq!(
            outcome.payment_error.as_deref(),
            Some("token transfer reverted")
        );
    }
}
