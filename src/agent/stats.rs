//! Run statistics.

use std::fmt;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use crate::agent::AgentState;
use crate::config::ModelPricing;

/// Summary of one agent run, printed at exit.
pub struct RunStats<'a> {
    state: &'a AgentState,
    pricing: Option<&'a ModelPricing>,
}

impl<'a> RunStats<'a> {
    pub fn new(state: &'a AgentState, pricing: Option<&'a ModelPricing>) -> Self {
        Self { state, pricing }
    }

    /// Output tokens per second of backend time.
    pub fn tokens_per_sec(&self) -> f64 {
        let secs = self.state.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.state.usage.output as f64 / secs
        } else {
            0.0
        }
    }

    /// Cost in USD, if the model has pricing.
    pub fn cost(&self) -> Option<Decimal> {
        self.pricing
            .map(|p| p.cost(self.state.usage.input, self.state.usage.output))
    }

    /// How many runs like this one a dollar buys.
    pub fn runs_per_dollar(&self) -> Option<Decimal> {
        self.cost()
            .filter(|c| *c > Decimal::ZERO)
            .map(|c| (dec!(1) / c).floor())
    }
}

impl fmt::Display for RunStats<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let usage = &self.state.usage;
        writeln!(f, "Model: {}", self.state.model)?;
        writeln!(f, "Messages: {}", self.state.conversation.len())?;
        writeln!(
            f,
            "Tokens: {} in / {} out ({} total)",
            usage.input, usage.output, usage.total
        )?;
        writeln!(f, "Speed: {:.1} tokens/sec", self.tokens_per_sec())?;

        match (self.pricing, self.cost()) {
            (Some(pricing), Some(cost)) => {
                writeln!(
                    f,
                    "Price: ${} (input ${} / output ${} per 1M tokens)",
                    cost.round_dp(6).normalize(),
                    pricing.input_price,
                    pricing.output_price
                )?;
                match self.runs_per_dollar() {
                    Some(runs) => writeln!(f, "Runs per $1: {}", runs)?,
                    None => writeln!(f, "Runs per $1: unlimited")?,
                }
            }
            _ => writeln!(f, "Price: unknown")?,
        }

        if self.state.sandbox_violations.is_empty() {
            write!(f, "Sandbox violations: none")
        } else {
            write!(f, "Sandbox violations:")?;
            for violation in &self.state.sandbox_violations {
                write!(f, "\n  - {}", violation)?;
            }
            Ok(())
        }
    }
}
