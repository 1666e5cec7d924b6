//! Numeric builtins: `abs`, `divmod`, `pow`, `round`, `chr`, `ord`, `bin`, `oct` and `hex`.

use num_bigint::BigInt;
use num_integer::Integer;
use num_traits::{One, Signed, Zero};

use super::keyword_only;
use crate::{
    exception_private::{RunError, RunResult},
    expressions::Operator,
    interp::ExecCtx,
    ops::{
        self,
        arith::{self, float_to_int},
        call::call_special,
        format::format_value,
    },
    types::CallArgs,
    value::Value,
};

/// Implementation of the abs() builtin function.
///
/// `abs(i64::MIN)` overflows the inline representation and promotes to a big integer.
pub fn builtin_abs(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("abs", 1, 1)?;
    match &args.positional[0] {
        Value::Int(n) => Ok(n
            .checked_abs()
            .map_or_else(|| Value::from_bigint(BigInt::from(*n).abs()), Value::Int)),
        Value::Bool(b) => Ok(Value::Int(i64::from(*b))),
        Value::BigInt(n) => Ok(Value::from_bigint(n.abs())),
        Value::Float(f) => Ok(Value::Float(f.abs())),
        value @ Value::Instance(_) => call_special(ctx, value, "__abs__", CallArgs::new())?
            .ok_or_else(|| bad_operand("abs", value)),
        other => Err(bad_operand("abs", other)),
    }
}

fn bad_operand(func: &str, value: &Value) -> RunError {
    RunError::type_error(format!("bad operand type for {func}(): '{}'", value.type_name()))
}

/// `divmod(a, b)` as `(a // b, a % b)`.
pub fn builtin_divmod(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("divmod", 2, 2)?;
    let (a, b) = (&args.positional[0], &args.positional[1]);
    if let Some(result) = call_special(ctx, a, "__divmod__", CallArgs::positional([b.clone()]))?
        && !matches!(result, Value::NotImplemented)
    {
        return Ok(result);
    }
    let quotient = arith::binary(ctx, Operator::FloorDiv, a, b)?;
    let remainder = arith::binary(ctx, Operator::Mod, a, b)?;
    Ok(Value::tuple(vec![quotient, remainder]))
}

/// `pow(base, exp, mod=None)`; the three-argument form is modular exponentiation on ints.
pub fn builtin_pow(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let [modulus] = keyword_only(&mut args, "pow", ["mod"])?;
    args.check("pow", 2, 3)?;
    let modulus = args.get(2).cloned().or(modulus).filter(|m| !m.is_none());
    let (base, exp) = (&args.positional[0], &args.positional[1]);
    match modulus {
        None => arith::binary(ctx, Operator::Pow, base, exp),
        Some(modulus) => {
            let (Some(base), Some(exp), Some(modulus)) = (base.as_bigint(), exp.as_bigint(), modulus.as_bigint()) else {
                return Err(RunError::type_error(
                    "pow() 3rd argument not allowed unless all arguments are integers",
                ));
            };
            modular_pow(&base, &exp, &modulus).map(Value::from_bigint)
        }
    }
}

fn modular_pow(base: &BigInt, exp: &BigInt, modulus: &BigInt) -> RunResult<BigInt> {
    if modulus.is_zero() {
        return Err(RunError::value_error("pow() 3rd argument cannot be 0"));
    }
    if !exp.is_negative() {
        return Ok(base.modpow(exp, modulus));
    }
    let gcd = base.extended_gcd(modulus);
    if !gcd.gcd.abs().is_one() {
        return Err(RunError::value_error("base is not invertible for the given modulus"));
    }
    let inverse = gcd.x.mod_floor(modulus);
    Ok(inverse.modpow(&-exp, modulus))
}

/// `round(number, ndigits=None)` with round-half-to-even.
pub fn builtin_round(ctx: &mut ExecCtx, mut args: CallArgs) -> RunResult<Value> {
    let [ndigits] = keyword_only(&mut args, "round", ["ndigits"])?;
    args.check("round", 1, 2)?;
    let ndigits = match args.get(1).cloned().or(ndigits) {
        None | Some(Value::None) => None,
        Some(n) => Some(ops::expect_index(ctx, &n)?),
    };
    let number = &args.positional[0];
    match number {
        Value::Float(f) => match ndigits {
            None => float_to_int(f.round_ties_even()),
            Some(n) => Ok(Value::Float(round_float(*f, n))),
        },
        Value::Int(_) | Value::Bool(_) | Value::BigInt(_) => {
            let value = number.as_bigint().unwrap_or_default();
            match ndigits {
                Some(n) if n < 0 => Ok(Value::from_bigint(round_int(&value, n.unsigned_abs()))),
                _ => Ok(Value::from_bigint(value)),
            }
        }
        Value::Instance(_) => {
            let args = ndigits.map(Value::Int).into_iter();
            call_special(ctx, number, "__round__", CallArgs::positional(args))?.ok_or_else(|| {
                RunError::type_error(format!(
                    "type {} doesn't define __round__ method",
                    number.type_name()
                ))
            })
        }
        other => Err(RunError::type_error(format!(
            "type {} doesn't define __round__ method",
            other.type_name()
        ))),
    }
}

fn round_float(f: f64, ndigits: i64) -> f64 {
    if !f.is_finite() || ndigits > 308 {
        return f;
    }
    if ndigits >= 0 {
        // Formatting rounds the exact binary value.
        let precision = usize::try_from(ndigits).unwrap_or(0);
        return format!("{f:.precision$}").parse().unwrap_or(f);
    }
    let Ok(exponent) = i32::try_from(-ndigits) else {
        return 0.0_f64.copysign(f);
    };
    let scale = 10f64.powi(exponent);
    let rounded = (f / scale).round_ties_even() * scale;
    if rounded.is_finite() { rounded } else { 0.0_f64.copysign(f) }
}

fn round_int(value: &BigInt, digits: u64) -> BigInt {
    let Ok(digits) = u32::try_from(digits) else {
        return BigInt::zero();
    };
    let scale: BigInt = BigInt::from(10).pow(digits);
    let (mut quotient, remainder) = value.div_mod_floor(&scale);
    let twice = remainder * 2;
    if twice > scale || (twice == scale && quotient.is_odd()) {
        quotient += 1;
    }
    quotient * scale
}

/// `chr(i)`.
pub fn builtin_chr(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("chr", 1, 1)?;
    let code = ops::expect_index(ctx, &args.positional[0])?;
    u32::try_from(code)
        .ok()
        .and_then(char::from_u32)
        .map(|c| Value::from(c.to_string()))
        .ok_or_else(|| RunError::value_error("chr() arg not in range(0x110000)"))
}

/// `ord(c)` for one-character strings and one-byte bytes.
pub fn builtin_ord(_: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    args.check("ord", 1, 1)?;
    match &args.positional[0] {
        Value::Str(s) => {
            let mut chars = s.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) => Ok(Value::Int(i64::from(u32::from(c)))),
                _ => Err(RunError::type_error(format!(
                    "ord() expected a character, but string of length {} found",
                    s.chars().count()
                ))),
            }
        }
        Value::Bytes(b) if b.len() == 1 => Ok(Value::Int(i64::from(b[0]))),
        Value::Bytes(b) => Err(RunError::type_error(format!(
            "ord() expected a character, but string of length {} found",
            b.len()
        ))),
        other => Err(RunError::type_error(format!(
            "ord() expected string of length 1, but {} found",
            other.type_name()
        ))),
    }
}

pub fn builtin_bin(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    radix_string(ctx, args, "bin", "#b")
}

pub fn builtin_oct(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    radix_string(ctx, args, "oct", "#o")
}

pub fn builtin_hex(ctx: &mut ExecCtx, args: CallArgs) -> RunResult<Value> {
    radix_string(ctx, args, "hex", "#x")
}

fn radix_string(ctx: &mut ExecCtx, args: CallArgs, func: &str, spec: &str) -> RunResult<Value> {
    args.check(func, 1, 1)?;
    let value = &args.positional[0];
    let int = match value {
        Value::Int(_) | Value::Bool(_) | Value::BigInt(_) => value.clone(),
        Value::Instance(_) => match call_special(ctx, value, "__index__", CallArgs::new())? {
            Some(result) if result.is_int_like() => result,
            _ => return Err(not_integer(value)),
        },
        other => return Err(not_integer(other)),
    };
    format_value(ctx, &int, spec).map(Value::from)
}

fn not_integer(value: &Value) -> RunError {
    RunError::type_error(format!(
        "'{}' object cannot be interpreted as an integer",
        value.type_name()
    ))
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn integer_rounding_is_half_even() {
        assert_eq!(round_int(&BigInt::from(25), 1), BigInt::from(20));
        assert_eq!(round_int(&BigInt::from(35), 1), BigInt::from(40));
        assert_eq!(round_int(&BigInt::from(-15), 1), BigInt::from(-20));
        assert_eq!(round_int(&BigInt::from(1234), 2), BigInt::from(1200));
    }

    #[test]
    fn float_rounding_uses_the_binary_value() {
        assert_eq!(round_float(2.675, 2), 2.67);
        assert_eq!(round_float(1234.5, -2), 1200.0);
    }

    #[test]
    fn modular_pow_handles_inverses() {
        let m = BigInt::from(7);
        assert_eq!(modular_pow(&BigInt::from(3), &BigInt::from(4), &m).unwrap(), BigInt::from(4));
        assert_eq!(modular_pow(&BigInt::from(3), &BigInt::from(-1), &m).unwrap(), BigInt::from(5));
        let err = modular_pow(&BigInt::from(2), &BigInt::from(-1), &BigInt::from(4)).unwrap_err();
        assert_eq!(err.message(), "base is not invertible for the given modulus");
    }
}
