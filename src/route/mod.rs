//! Routing: versioned decision table plus the staged evaluator.

pub mod evaluator;
pub mod ruleset;

pub use evaluator::{evaluate_routing, RouteInputs};
pub use ruleset::{default_ruleset, RouteCondition, RouteRule, RouteTarget, RoutingRuleset};
