//! Boolean predicate capability used by [`RuleConsume`](crate::consume_strategy::RuleConsume).
//!
//! The expression language is not part of this crate. A [`PredicateCompiler`]
//! turns source text into a [`Predicate`] once, at strategy construction; the
//! predicate is then evaluated against every consume argument. With the `expr`
//! feature (enabled by default) [`ExprCompiler`] provides an engine backed by
//! [`evalexpr`].

use crate::consume_strategy::ConsumeArgs;
use crate::error::{BoxError, ConfigError};

/// A compiled boolean predicate.
pub trait Predicate: Send + Sync {
    /// Evaluates the predicate against the consume arguments.
    fn evaluate(&self, args: &ConsumeArgs) -> Result<bool, BoxError>;
}

/// Compiles predicate source text.
pub trait PredicateCompiler {
    /// Compiles `expression`, rejecting anything that cannot yield a boolean.
    fn compile(&self, expression: &str) -> Result<Box<dyn Predicate>, ConfigError>;
}

#[cfg(feature = "expr")]
pub use self::expr::ExprCompiler;

#[cfg(feature = "expr")]
mod expr {
    use evalexpr::{ContextWithMutableVariables, HashMapContext, Node, Value};

    use super::{Predicate, PredicateCompiler};
    use crate::consume_strategy::ConsumeArgs;
    use crate::error::{BoxError, ConfigError};

    /// [`evalexpr`]-backed predicate engine.
    ///
    /// When the consume argument is a JSON object every key becomes a variable:
    /// booleans, strings, integers and floats map to their `evalexpr`
    /// counterparts, `null` to the empty value and arrays to tuples. Nested
    /// objects cannot be represented and fail evaluation. Any other argument
    /// evaluates against an empty context.
    ///
    /// Expressions are parsed at compile time. A constant expression (one that
    /// reads no variable) must evaluate to a boolean there as well; the type of
    /// expressions reading variables is only known at evaluation time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct ExprCompiler;

    struct ExprPredicate {
        node: Node,
    }

    impl PredicateCompiler for ExprCompiler {
        fn compile(&self, expression: &str) -> Result<Box<dyn Predicate>, ConfigError> {
            let node = evalexpr::build_operator_tree(expression).map_err(|err| {
                ConfigError::InvalidPredicate {
                    expression: expression.to_owned(),
                    source: Box::new(err),
                }
            })?;

            // Constant expressions evaluate without variables; check their type now.
            if let Ok(value) = node.eval_with_context(&HashMapContext::new()) {
                if !matches!(value, Value::Boolean(_)) {
                    return Err(ConfigError::NonBooleanPredicate {
                        expression: expression.to_owned(),
                    });
                }
            }

            Ok(Box::new(ExprPredicate { node }))
        }
    }

    impl Predicate for ExprPredicate {
        fn evaluate(&self, args: &ConsumeArgs) -> Result<bool, BoxError> {
            let context = context_from_args(args)?;
            Ok(self.node.eval_boolean_with_context(&context)?)
        }
    }

    fn context_from_args(args: &ConsumeArgs) -> Result<HashMapContext, BoxError> {
        let mut context = HashMapContext::new();
        if let ConsumeArgs::Object(map) = args {
            for (name, value) in map {
                context.set_value(name.clone(), to_value(name, value)?)?;
            }
        }
        Ok(context)
    }

    fn to_value(name: &str, value: &serde_json::Value) -> Result<Value, BoxError> {
        Ok(match value {
            serde_json::Value::Null => Value::Empty,
            serde_json::Value::Bool(b) => Value::Boolean(*b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Int(i),
                None => Value::Float(n.as_f64().unwrap_or(f64::NAN)),
            },
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Array(items) => Value::Tuple(
                items
                    .iter()
                    .map(|item| to_value(name, item))
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            serde_json::Value::Object(_) => {
                return Err(format!("argument `{}` is a nested object", name).into());
            }
        })
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use serde_json::json;

        #[test]
        fn integer_comparison() {
            let predicate = ExprCompiler.compile("arg > 10").unwrap();
            assert!(predicate.evaluate(&json!({"arg": 20})).unwrap());
            assert!(!predicate.evaluate(&json!({"arg": 10})).unwrap());
        }

        #[test]
        fn string_and_float_values() {
            let predicate = ExprCompiler.compile(r#"kind == "bulk" && ratio < 0.5"#).unwrap();
            assert!(predicate.evaluate(&json!({"kind": "bulk", "ratio": 0.25})).unwrap());
            assert!(!predicate.evaluate(&json!({"kind": "bulk", "ratio": 0.75})).unwrap());
        }

        #[test]
        fn unbound_variable_fails_evaluation() {
            let predicate = ExprCompiler.compile("arg > 10").unwrap();
            assert!(predicate.evaluate(&ConsumeArgs::Null).is_err());
        }

        #[test]
        fn nested_object_fails_evaluation() {
            let predicate = ExprCompiler.compile("true").unwrap();
            assert!(predicate.evaluate(&json!({"inner": {"a": 1}})).is_err());
        }

        #[test]
        fn syntax_error_rejected() {
            let result = ExprCompiler.compile("(arg > 1");
            assert!(matches!(result, Err(ConfigError::InvalidPredicate { .. })));
        }

        #[test]
        fn constant_non_boolean_rejected() {
            let result = ExprCompiler.compile("1 + 2");
            assert!(matches!(result, Err(ConfigError::NonBooleanPredicate { .. })));
        }
    }
}
