//! Parsing of parameter values given on the command line.

use anyhow::Context;
use apmon::Value;
use clap::ValueEnum;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum ValueKind {
    /// An integer if possible, then a real number, then a string.
    #[default]
    Auto,
    String,
    Int,
    Real32,
    Real64,
}

pub fn parse_value(s: &str, kind: ValueKind) -> anyhow::Result<Value> {
    let value = match kind {
        ValueKind::Auto => {
            if let Ok(i) = s.parse::<i32>() {
                Value::Int32(i)
            } else if let Ok(f) = s.parse::<f64>() {
                Value::Real64(f)
            } else {
                Value::from(s)
            }
        }
        ValueKind::String => Value::from(s),
        ValueKind::Int => Value::Int32(s.parse().with_context(|| format!("invalid integer: {s}"))?),
        ValueKind::Real32 => Value::Real32(s.parse().with_context(|| format!("invalid real number: {s}"))?),
        ValueKind::Real64 => Value::Real64(s.parse().with_context(|| format!("invalid real number: {s}"))?),
    };
    Ok(value)
}
