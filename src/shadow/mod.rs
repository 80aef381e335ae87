//! Shadow trading: phase gating, hypothesis matching and paper settlement.
//!
//! Everything in this module is hypothetical. No order is ever placed.

pub mod hypothesis;
pub mod phase;
pub mod settlement;

pub use hypothesis::{HypothesisEngine, HypothesisStats, MomentumSignal};
pub use phase::{compute_phase, current_phase, read_phase_inputs, PhaseReadings, PAPER_TRADING_DISCLAIMER};
pub use settlement::{clv_percent, compute_pnl, PnL, ShadowSettler};
