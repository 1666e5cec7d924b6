use crate::{
    exception_private::{RunError, RunResult},
    value::Value,
};

/// The `range` object. Bounds are limited to `i64`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PyRange {
    pub start: i64,
    pub stop: i64,
    pub step: i64,
}

impl PyRange {
    pub fn new(start: i64, stop: i64, step: i64) -> RunResult<Self> {
        if step == 0 {
            return Err(RunError::value_error("range() arg 3 must not be zero"));
        }
        Ok(Self { start, stop, step })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        let (lo, hi, step) = if self.step > 0 {
            (i128::from(self.start), i128::from(self.stop), i128::from(self.step))
        } else {
            (i128::from(self.stop), i128::from(self.start), -i128::from(self.step))
        };
        if lo >= hi {
            0
        } else {
            usize::try_from((hi - lo - 1) / step + 1).unwrap_or(usize::MAX)
        }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The element at a non-negative index.
    #[must_use]
    pub fn get(&self, index: usize) -> Option<i64> {
        if index >= self.len() {
            return None;
        }
        let offset = i128::try_from(index).ok()? * i128::from(self.step);
        i64::try_from(i128::from(self.start) + offset).ok()
    }

    #[must_use]
    pub fn contains(&self, value: i64) -> bool {
        let in_bounds = if self.step > 0 {
            self.start <= value && value < self.stop
        } else {
            self.stop < value && value <= self.start
        };
        in_bounds && (i128::from(value) - i128::from(self.start)) % i128::from(self.step) == 0
    }
}

/// The `slice` object.
#[derive(Debug, Clone)]
pub struct PySlice {
    pub start: Value,
    pub stop: Value,
    pub step: Value,
}

impl PySlice {
    /// Resolves the slice against a sequence of length `len`, as `slice.indices` does.
    pub fn indices(&self, len: usize) -> RunResult<(i64, i64, i64)> {
        let len = i64::try_from(len).unwrap_or(i64::MAX);
        let step = match &self.step {
            Value::None => 1,
            other => slice_int(other)?,
        };
        if step == 0 {
            return Err(RunError::value_error("slice step cannot be zero"));
        }
        let (lower, upper) = if step < 0 { (-1, len - 1) } else { (0, len) };
        let clamp = |value: &Value, default: i64| -> RunResult<i64> {
            match value {
                Value::None => Ok(default),
                other => {
                    let mut i = slice_int(other)?;
                    if i < 0 {
                        i += len;
                        if i < lower {
                            i = lower;
                        }
                    } else if i > upper {
                        i = upper;
                    }
                    Ok(i)
                }
            }
        };
        let start = clamp(&self.start, if step < 0 { upper } else { lower })?;
        let stop = clamp(&self.stop, if step < 0 { lower } else { upper })?;
        Ok((start, stop, step))
    }

    /// Positions selected by this slice in a sequence of length `len`.
    pub fn positions(&self, len: usize) -> RunResult<Vec<usize>> {
        let (start, stop, step) = self.indices(len)?;
        let mut out = Vec::new();
        let mut i = start;
        while (step > 0 && i < stop) || (step < 0 && i > stop) {
            if let Ok(index) = usize::try_from(i) {
                out.push(index);
            }
            i += step;
        }
        Ok(out)
    }
}

fn slice_int(value: &Value) -> RunResult<i64> {
    match value {
        Value::Int(i) => Ok(*i),
        Value::Bool(b) => Ok(i64::from(*b)),
        Value::BigInt(b) => Ok(if b.sign() == num_bigint::Sign::Minus { i64::MIN } else { i64::MAX }),
        _ => Err(RunError::type_error(
            "slice indices must be integers or None or have an __index__ method",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_length_and_membership() {
        let r = PyRange::new(10, 0, -3).unwrap();
        assert_eq!(r.len(), 4);
        assert_eq!(r.get(3), Some(1));
        assert!(r.contains(4));
        assert!(!r.contains(5));
        assert!(PyRange::new(0, 1, 0).is_err());
    }

    #[test]
    fn negative_slices_clamp() {
        let slice = PySlice {
            start: Value::None,
            stop: Value::None,
            step: Value::Int(-1),
        };
        assert_eq!(slice.positions(3).unwrap(), vec![2, 1, 0]);
        let slice = PySlice {
            start: Value::Int(-2),
            stop: Value::Int(100),
            step: Value::None,
        };
        assert_eq!(slice.positions(5).unwrap(), vec![3, 4]);
    }
}
