//! Forward mode differentiation of force laws with dual numbers.

use crate::traits::Scalar;
use num_traits::{One, Zero};
use std::ops::{Add, Div, Mul, Neg, Sub};

/// `value + slope * e` with `e^2 = 0`. The slope carries the derivative with
/// respect to whichever input was seeded.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
pub struct Dual {
    value: f64,
    slope: f64,
}

impl Dual {
    /// Input being differentiated against.
    pub fn seeded(value: f64) -> Self {
        Self { value, slope: 1.0 }
    }

    pub fn lift(value: f64) -> Self {
        Self { value, slope: 0.0 }
    }

    pub fn slope(self) -> f64 {
        self.slope
    }

    /// Applies a scalar function with value `fx` and derivative `dfdx` at
    /// `self.value`.
    fn chain(self, fx: f64, dfdx: f64) -> Self {
        Self {
            value: fx,
            slope: dfdx * self.slope,
        }
    }
}

impl Zero for Dual {
    fn zero() -> Self {
        Self::lift(0.0)
    }

    fn is_zero(&self) -> bool {
        *self == Self::zero()
    }
}

impl One for Dual {
    fn one() -> Self {
        Self::lift(1.0)
    }
}

macro_rules! linear_op {
    ($trait:ident, $method:ident, $op:tt) => {
        impl $trait for Dual {
            type Output = Self;

            fn $method(self, rhs: Self) -> Self {
                Self {
                    value: self.value $op rhs.value,
                    slope: self.slope $op rhs.slope,
                }
            }
        }
    };
}

linear_op!(Add, add, +);
linear_op!(Sub, sub, -);

impl Mul for Dual {
    type Output = Self;

    fn mul(self, rhs: Self) -> Self {
        Self {
            value: self.value * rhs.value,
            slope: self.slope * rhs.value + rhs.slope * self.value,
        }
    }
}

impl Div for Dual {
    type Output = Self;

    fn div(self, rhs: Self) -> Self {
        let value = self.value / rhs.value;
        Self {
            value,
            slope: (self.slope - value * rhs.slope) / rhs.value,
        }
    }
}

impl Neg for Dual {
    type Output = Self;

    fn neg(self) -> Self {
        self.chain(-self.value, -1.0)
    }
}

impl Scalar for Dual {
    fn from_f64(value: f64) -> Self {
        Self::lift(value)
    }

    fn value(self) -> f64 {
        self.value
    }

    fn abs(self) -> Self {
        let sign = if self.value < 0.0 { -1.0 } else { 1.0 };
        self.chain(self.value.abs(), sign)
    }

    fn powi(self, n: i32) -> Self {
        self.chain(self.value.powi(n), f64::from(n) * self.value.powi(n - 1))
    }
}

/// `(f, df/da, df/db)` at `(a, b)`, one forward pass per argument.
pub fn value_and_partials<F>(f: F, a: f64, b: f64) -> (f64, f64, f64)
where
    F: Fn(Dual, Dual) -> Dual,
{
    let along_a = f(Dual::seeded(a), Dual::lift(b));
    let along_b = f(Dual::lift(a), Dual::seeded(b));
    (along_a.value, along_a.slope, along_b.slope)
}
