//! Strategies deciding how many tokens an operation costs.
//!
//! A strategy is a pure function of the caller-supplied [`ConsumeArgs`]. The
//! bucket calls it under its exclusive lock, right before checking the balance.
//!
//! | Strategy | Argument | Cost |
//! |----------|----------|------|
//! | [`StaticConsume`] | ignored | fixed at construction |
//! | [`DynamicConsume`] | integer | the integer itself |
//! | [`RuleConsume`] | object of named values | cost of the first matching rule |
//!
//! Any `Fn(&ConsumeArgs) -> Result<i64, StrategyError>` is a strategy as well.

use crate::error::{ConfigError, StrategyError};
use crate::predicate::{Predicate, PredicateCompiler};

/// Opaque argument handed to [`Bucket::consume`](crate::bucket::Bucket::consume).
///
/// `ConsumeArgs::Null` is the "no argument" value.
pub type ConsumeArgs = serde_json::Value;

/// Computes the token cost of an operation.
pub trait ConsumeStrategy: Send + Sync {
    /// Returns the number of tokens the operation described by `args` costs.
    ///
    /// A returned cost is never negative.
    fn tokens_to_consume(&self, args: &ConsumeArgs) -> Result<i64, StrategyError>;
}

impl<F> ConsumeStrategy for F
where
    F: Fn(&ConsumeArgs) -> Result<i64, StrategyError> + Send + Sync,
{
    #[inline]
    fn tokens_to_consume(&self, args: &ConsumeArgs) -> Result<i64, StrategyError> {
        self(args)
    }
}

/// Always costs the same number of tokens.
///
/// # Example
///
/// ```rust
/// use rate_guard_bucket::consume_strategy::{ConsumeArgs, ConsumeStrategy, StaticConsume};
///
/// let strategy = StaticConsume::new(5).unwrap();
/// assert_eq!(strategy.tokens_to_consume(&ConsumeArgs::Null).unwrap(), 5);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StaticConsume {
    tokens: i64,
}

impl StaticConsume {
    /// Creates a strategy costing `tokens` per operation.
    ///
    /// # Errors
    /// [`ConfigError::NegativeCost`] if `tokens < 0`.
    pub fn new(tokens: i64) -> Result<Self, ConfigError> {
        if tokens < 0 {
            return Err(ConfigError::NegativeCost { cost: tokens });
        }
        Ok(StaticConsume { tokens })
    }

    pub fn tokens(&self) -> i64 {
        self.tokens
    }
}

impl Default for StaticConsume {
    /// One token per operation.
    fn default() -> Self {
        StaticConsume { tokens: 1 }
    }
}

impl ConsumeStrategy for StaticConsume {
    #[inline(always)]
    fn tokens_to_consume(&self, _args: &ConsumeArgs) -> Result<i64, StrategyError> {
        Ok(self.tokens)
    }
}

/// Costs whatever integer the caller passes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DynamicConsume;

impl DynamicConsume {
    pub fn new() -> Self {
        DynamicConsume
    }
}

impl ConsumeStrategy for DynamicConsume {
    /// # Errors
    /// * [`StrategyError::ArgumentNotInteger`] if `args` is not an integer fitting in `i64`
    /// * [`StrategyError::NegativeCost`] if the integer is negative
    fn tokens_to_consume(&self, args: &ConsumeArgs) -> Result<i64, StrategyError> {
        let tokens = args.as_i64().ok_or(StrategyError::ArgumentNotInteger)?;
        if tokens < 0 {
            return Err(StrategyError::NegativeCost { cost: tokens });
        }
        Ok(tokens)
    }
}

/// One entry of a [`RuleConsume`]: when `expression` holds, the operation costs `tokens`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ConsumeRule {
    /// Boolean predicate evaluated against the consume arguments.
    pub expression: String,
    /// Cost when the predicate matches.
    pub tokens: i64,
}

impl ConsumeRule {
    pub fn new(expression: impl Into<String>, tokens: i64) -> Self {
        ConsumeRule {
            expression: expression.into(),
            tokens,
        }
    }
}

struct CompiledRule {
    expression: String,
    tokens: i64,
    predicate: Box<dyn Predicate>,
}

/// Picks the cost from an ordered list of rules; the first rule whose predicate
/// evaluates to `true` wins.
///
/// Rules are checked at construction: negative costs and predicates the engine
/// cannot compile are rejected there, never at evaluation time.
///
/// # Example
///
/// ```rust
/// # #[cfg(feature = "expr")]
/// # {
/// use rate_guard_bucket::consume_strategy::{ConsumeRule, ConsumeStrategy, RuleConsume};
/// use serde_json::json;
///
/// let strategy = RuleConsume::new(vec![
///     ConsumeRule::new("size > 1024", 50),
///     ConsumeRule::new(r#"kind == "bulk""#, 40),
///     ConsumeRule::new("true", 1),
/// ])
/// .unwrap();
///
/// assert_eq!(strategy.tokens_to_consume(&json!({"size": 4096, "kind": "single"})).unwrap(), 50);
/// assert_eq!(strategy.tokens_to_consume(&json!({"size": 10, "kind": "bulk"})).unwrap(), 40);
/// assert_eq!(strategy.tokens_to_consume(&json!({"size": 10, "kind": "single"})).unwrap(), 1);
/// # }
/// ```
pub struct RuleConsume {
    rules: Vec<CompiledRule>,
}

impl RuleConsume {
    /// Compiles `rules` with the bundled `evalexpr` engine.
    ///
    /// Object arguments expose each key as a variable; see
    /// [`ExprCompiler`](crate::predicate::ExprCompiler) for the value mapping.
    #[cfg(feature = "expr")]
    pub fn new(rules: Vec<ConsumeRule>) -> Result<Self, ConfigError> {
        Self::with_compiler(rules, &crate::predicate::ExprCompiler)
    }

    /// Compiles `rules` with a caller-supplied predicate engine.
    ///
    /// # Errors
    /// * [`ConfigError::NegativeCost`] if any rule costs less than zero
    /// * whatever the compiler reports for a rejected predicate
    pub fn with_compiler<C>(rules: Vec<ConsumeRule>, compiler: &C) -> Result<Self, ConfigError>
    where
        C: PredicateCompiler + ?Sized,
    {
        let mut compiled = Vec::with_capacity(rules.len());
        for rule in rules {
            if rule.tokens < 0 {
                return Err(ConfigError::NegativeCost { cost: rule.tokens });
            }
            let predicate = compiler.compile(&rule.expression)?;
            compiled.push(CompiledRule {
                expression: rule.expression,
                tokens: rule.tokens,
                predicate,
            });
        }
        Ok(RuleConsume { rules: compiled })
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl std::fmt::Debug for RuleConsume {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.rules.iter().map(|rule| (&rule.expression, rule.tokens)))
            .finish()
    }
}

impl ConsumeStrategy for RuleConsume {
    fn tokens_to_consume(&self, args: &ConsumeArgs) -> Result<i64, StrategyError> {
        for rule in &self.rules {
            let matched = rule
                .predicate
                .evaluate(args)
                .map_err(|source| StrategyError::Evaluation {
                    expression: rule.expression.clone(),
                    source,
                })?;
            if matched {
                return Ok(rule.tokens);
            }
        }
        Err(StrategyError::NoRuleMatched)
    }
}
