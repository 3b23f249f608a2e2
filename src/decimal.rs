//! Exact decimal quantities with units.
//!
//! Every monetary or rate value in factforge is a [`Quantity`]: a
//! `BigDecimal` amount tagged with a [`Unit`]. Floats never enter the
//! calculation path.
//!
//! # Unit algebra
//!
//! - `add`, `sub`, `min`, `max` require equal units.
//! - Multiplying by a scaling unit (`Ratio`, `Count`, `Percent`,
//!   `BasisPoints`) keeps the other operand's unit. Percent scales by 1/100,
//!   basis points by 1/10000.
//! - `X / X` yields a `Ratio`; `X / scaling` yields `X`.
//! - Anything else is a unit mismatch.
//!
//! Intermediate results are capped at [`MAX_SIGNIFICANT_DIGITS`] significant
//! digits and rejected beyond [`MAX_INTEGER_DIGITS`] integer digits. Amounts
//! entering the kernel (parsed, deserialized, client data, constants) are
//! range checked first, so an exponent like `1e1000000` is refused before any
//! arithmetic rescales it.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use bigdecimal::{BigDecimal, RoundingMode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ExecutionError, ValidationError};

/// Significant digits kept for intermediate results.
pub const MAX_SIGNIFICANT_DIGITS: u64 = 34;

/// Largest integer part accepted before a calculation is rejected.
pub const MAX_INTEGER_DIGITS: u64 = 28;

/// Largest number of periods accepted by [`Quantity::compound`].
pub const MAX_COMPOUND_PERIODS: u32 = 1200;

/// Largest rounding scale (decimal places).
pub const MAX_ROUNDING_SCALE: u32 = 28;

/// Most decimal places accepted on an incoming amount.
pub const MAX_AMOUNT_SCALE: i64 = 34;

/// Longest decimal text accepted by [`Quantity::parse`] and deserialization.
pub const MAX_AMOUNT_TEXT_LEN: usize = 64;

/// Unit attached to every quantity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unit {
    /// Australian dollars.
    Dollars,
    /// Percentage points (15 means 15%).
    Percent,
    /// Basis points (150 means 1.5%).
    BasisPoints,
    /// Elapsed years.
    Years,
    /// Dimensionless ratio (0.15 means 15%).
    Ratio,
    /// Dimensionless count.
    Count,
}

impl Unit {
    /// Multiplier that turns this unit into a plain scaling factor, if it is one.
    fn scale_factor(self) -> Option<BigDecimal> {
        match self {
            Self::Ratio | Self::Count => Some(BigDecimal::from(1)),
            Self::Percent => Some(BigDecimal::new(1.into(), 2)),
            Self::BasisPoints => Some(BigDecimal::new(1.into(), 4)),
            Self::Dollars | Self::Years => None,
        }
    }

    /// Returns true if this unit can scale another quantity.
    #[must_use]
    pub fn is_scaling(self) -> bool {
        self.scale_factor().is_some()
    }

    /// Wire name of the unit.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Dollars => "dollars",
            Self::Percent => "percent",
            Self::BasisPoints => "basis_points",
            Self::Years => "years",
            Self::Ratio => "ratio",
            Self::Count => "count",
        }
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An exact decimal amount with a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Quantity {
    /// The amount. Serialized as a decimal string.
    #[serde(serialize_with = "serialize_amount", deserialize_with = "deserialize_amount")]
    pub amount: BigDecimal,
    /// The unit.
    pub unit: Unit,
}

fn serialize_amount<S: Serializer>(amount: &BigDecimal, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&amount.to_string())
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawAmount {
    Text(String),
    Integer(i64),
}

fn deserialize_amount<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigDecimal, D::Error> {
    match RawAmount::deserialize(deserializer)? {
        RawAmount::Text(text) => parse_amount(&text).map_err(serde::de::Error::custom),
        RawAmount::Integer(value) => Ok(BigDecimal::from(value)),
    }
}

/// Parses decimal text, refusing over-long text and out-of-range amounts.
fn parse_amount(text: &str) -> Result<BigDecimal, String> {
    let text = text.trim();
    if text.len() > MAX_AMOUNT_TEXT_LEN {
        return Err(format!("decimal text longer than {MAX_AMOUNT_TEXT_LEN} characters"));
    }
    let amount = BigDecimal::from_str(text).map_err(|e| format!("'{text}' is not a decimal: {e}"))?;
    match range_issue(&amount) {
        Some(reason) => Err(reason),
        None => Ok(amount),
    }
}

fn integer_digits(value: &BigDecimal) -> i64 {
    let (_, scale) = value.as_bigint_and_exponent();
    let digits = i64::try_from(value.digits()).unwrap_or(i64::MAX);
    digits.saturating_sub(scale)
}

/// Describes why an incoming amount is out of range. Reads only the digit
/// count and exponent, never rescales.
pub(crate) fn range_issue(value: &BigDecimal) -> Option<String> {
    if integer_digits(value) > i64::try_from(MAX_INTEGER_DIGITS).unwrap_or(i64::MAX) {
        return Some(format!("more than {MAX_INTEGER_DIGITS} integer digits"));
    }
    let (_, scale) = value.as_bigint_and_exponent();
    if scale > MAX_AMOUNT_SCALE {
        return Some(format!("more than {MAX_AMOUNT_SCALE} decimal places"));
    }
    None
}

fn zero() -> BigDecimal {
    BigDecimal::from(0)
}

/// Caps a value at the significant-digit limit and rejects oversized integer parts.
fn guard(value: BigDecimal) -> Result<BigDecimal, ExecutionError> {
    let value = if value.digits() > MAX_SIGNIFICANT_DIGITS {
        value.with_prec(MAX_SIGNIFICANT_DIGITS)
    } else {
        value
    };
    if integer_digits(&value) > i64::try_from(MAX_INTEGER_DIGITS).unwrap_or(i64::MAX) {
        return Err(ExecutionError::PrecisionExceeded {
            reason: format!("result has more than {MAX_INTEGER_DIGITS} integer digits"),
        });
    }
    Ok(value)
}

fn mismatch(operation: &str, left: Unit, right: Unit) -> ExecutionError {
    ExecutionError::UnitMismatch {
        operation: operation.to_string(),
        left,
        right,
    }
}

impl Quantity {
    /// Creates a quantity.
    #[must_use]
    pub const fn new(amount: BigDecimal, unit: Unit) -> Self {
        Self { amount, unit }
    }

    /// Parses a decimal string into a quantity.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidQuery` if the text is not a decimal,
    /// `ValidationError::PrecisionExceeded` if it is too long or out of range.
    pub fn parse(text: &str, unit: Unit) -> Result<Self, ValidationError> {
        let trimmed = text.trim();
        if trimmed.len() > MAX_AMOUNT_TEXT_LEN {
            return Err(ValidationError::PrecisionExceeded {
                field: "amount".to_string(),
                reason: format!("decimal text longer than {MAX_AMOUNT_TEXT_LEN} characters"),
            });
        }
        let amount = BigDecimal::from_str(trimmed).map_err(|e| ValidationError::InvalidQuery {
            reason: format!("'{trimmed}' is not a decimal: {e}"),
        })?;
        if let Some(reason) = range_issue(&amount) {
            return Err(ValidationError::PrecisionExceeded {
                field: "amount".to_string(),
                reason,
            });
        }
        Ok(Self { amount, unit })
    }

    /// Checks that the amount fits the kernel's integer and scale limits.
    ///
    /// Cheap for any input; call it on values built with [`Quantity::new`]
    /// before they reach arithmetic.
    ///
    /// # Errors
    ///
    /// `PrecisionExceeded` naming the limit that was broken.
    pub fn check_range(&self) -> Result<(), ExecutionError> {
        match range_issue(&self.amount) {
            Some(reason) => Err(ExecutionError::PrecisionExceeded { reason }),
            None => Ok(()),
        }
    }

    /// Creates a quantity from an integer amount.
    #[must_use]
    pub fn from_int(amount: i64, unit: Unit) -> Self {
        Self {
            amount: BigDecimal::from(amount),
            unit,
        }
    }

    /// A zero amount in the given unit.
    #[must_use]
    pub fn zero(unit: Unit) -> Self {
        Self { amount: zero(), unit }
    }

    /// Returns true if the amount is zero.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.amount == zero()
    }

    /// Returns true if the amount is below zero.
    #[must_use]
    pub fn is_negative(&self) -> bool {
        self.amount < zero()
    }

    /// Returns the amount as a decimal string.
    #[must_use]
    pub fn amount_string(&self) -> String {
        self.amount.to_string()
    }

    fn require_same_unit(&self, other: &Self, operation: &str) -> Result<(), ExecutionError> {
        if self.unit == other.unit {
            Ok(())
        } else {
            Err(mismatch(operation, self.unit, other.unit))
        }
    }

    /// Sum of two quantities of the same unit.
    ///
    /// # Errors
    ///
    /// `UnitMismatch` on differing units, `PrecisionExceeded` on overflow.
    pub fn add(&self, other: &Self) -> Result<Self, ExecutionError> {
        self.require_same_unit(other, "add")?;
        Ok(Self::new(guard(&self.amount + &other.amount)?, self.unit))
    }

    /// Difference of two quantities of the same unit.
    ///
    /// # Errors
    ///
    /// `UnitMismatch` on differing units, `PrecisionExceeded` on overflow.
    pub fn sub(&self, other: &Self) -> Result<Self, ExecutionError> {
        self.require_same_unit(other, "sub")?;
        Ok(Self::new(guard(&self.amount - &other.amount)?, self.unit))
    }

    /// Product following the unit algebra in the module docs.
    ///
    /// # Errors
    ///
    /// `UnitMismatch` when neither operand scales the other.
    pub fn mul(&self, other: &Self) -> Result<Self, ExecutionError> {
        let product = &self.amount * &other.amount;
        if let Some(factor) = other.unit.scale_factor() {
            return Ok(Self::new(guard(product * factor)?, self.unit));
        }
        if let Some(factor) = self.unit.scale_factor() {
            return Ok(Self::new(guard(product * factor)?, other.unit));
        }
        Err(mismatch("mul", self.unit, other.unit))
    }

    /// Quotient following the unit algebra in the module docs.
    ///
    /// # Errors
    ///
    /// `Arithmetic` on division by zero, `UnitMismatch` on incompatible units.
    pub fn div(&self, other: &Self) -> Result<Self, ExecutionError> {
        let (divisor, unit) = if self.unit == other.unit {
            (other.amount.clone(), Unit::Ratio)
        } else if let Some(factor) = other.unit.scale_factor() {
            (&other.amount * factor, self.unit)
        } else {
            return Err(mismatch("div", self.unit, other.unit));
        };
        if divisor == zero() {
            return Err(ExecutionError::Arithmetic {
                reason: "division by zero".to_string(),
            });
        }
        Ok(Self::new(guard(&self.amount / &divisor)?, unit))
    }

    /// Negated quantity.
    #[must_use]
    pub fn neg(&self) -> Self {
        Self::new(-self.amount.clone(), self.unit)
    }

    /// Smaller of two quantities of the same unit.
    ///
    /// # Errors
    ///
    /// `UnitMismatch` on differing units.
    pub fn min(&self, other: &Self) -> Result<Self, ExecutionError> {
        self.require_same_unit(other, "min")?;
        Ok(if other.amount < self.amount { other.clone() } else { self.clone() })
    }

    /// Larger of two quantities of the same unit.
    ///
    /// # Errors
    ///
    /// `UnitMismatch` on differing units.
    pub fn max(&self, other: &Self) -> Result<Self, ExecutionError> {
        self.require_same_unit(other, "max")?;
        Ok(if other.amount > self.amount { other.clone() } else { self.clone() })
    }

    /// Clamps negative amounts to zero.
    #[must_use]
    pub fn floor_zero(&self) -> Self {
        if self.is_negative() {
            Self::zero(self.unit)
        } else {
            self.clone()
        }
    }

    /// Compares two quantities of the same unit.
    ///
    /// # Errors
    ///
    /// `UnitMismatch` on differing units.
    pub fn compare(&self, other: &Self) -> Result<Ordering, ExecutionError> {
        self.require_same_unit(other, "compare")?;
        Ok(self.amount.cmp(&other.amount))
    }

    /// Grows `self` by `rate` per period over `periods` periods.
    ///
    /// Exact repeated multiplication by `1 + rate`; each step is capped at
    /// [`MAX_SIGNIFICANT_DIGITS`].
    ///
    /// # Errors
    ///
    /// `UnitMismatch` if `rate` is not a scaling unit, `Arithmetic` if
    /// `periods` exceeds [`MAX_COMPOUND_PERIODS`].
    pub fn compound(&self, rate: &Self, periods: u32) -> Result<Self, ExecutionError> {
        let Some(factor) = rate.unit.scale_factor() else {
            return Err(mismatch("compound", self.unit, rate.unit));
        };
        if periods > MAX_COMPOUND_PERIODS {
            return Err(ExecutionError::Arithmetic {
                reason: format!("compounding over {periods} periods exceeds {MAX_COMPOUND_PERIODS}"),
            });
        }
        let growth = BigDecimal::from(1) + &rate.amount * factor;
        let mut value = self.amount.clone();
        for _ in 0..periods {
            value = guard(&value * &growth)?;
        }
        Ok(Self::new(value, self.unit))
    }
}

impl fmt::Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.unit)
    }
}

/// Rounding method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingMethod {
    /// Ties away from zero.
    HalfUp,
    /// Ties to even (banker's rounding).
    HalfEven,
    /// Toward zero.
    Truncate,
}

impl RoundingMethod {
    const fn mode(self) -> RoundingMode {
        match self {
            Self::HalfUp => RoundingMode::HalfUp,
            Self::HalfEven => RoundingMode::HalfEven,
            Self::Truncate => RoundingMode::Down,
        }
    }
}

/// Where rounding is applied during evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundingPoint {
    /// After every arithmetic step and on the final result.
    EachStep,
    /// Only on the final result.
    Final,
}

/// Rounding policy declared per rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RoundingPolicy {
    /// Rounding method.
    pub method: RoundingMethod,
    /// Decimal places kept.
    pub scale: u32,
    /// When rounding applies.
    pub point: RoundingPoint,
}

impl Default for RoundingPolicy {
    /// Cents, half-up, on the final result.
    fn default() -> Self {
        Self::cents()
    }
}

impl RoundingPolicy {
    /// Creates a policy.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidRounding` if `scale` exceeds [`MAX_ROUNDING_SCALE`].
    pub fn new(method: RoundingMethod, scale: u32, point: RoundingPoint) -> Result<Self, ValidationError> {
        let policy = Self { method, scale, point };
        policy.validate()?;
        Ok(policy)
    }

    /// Half-up to whole cents on the final result.
    #[must_use]
    pub const fn cents() -> Self {
        Self {
            method: RoundingMethod::HalfUp,
            scale: 2,
            point: RoundingPoint::Final,
        }
    }

    /// Validates the scale bound.
    ///
    /// # Errors
    ///
    /// Returns `ValidationError::InvalidRounding` if `scale` exceeds [`MAX_ROUNDING_SCALE`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.scale > MAX_ROUNDING_SCALE {
            return Err(ValidationError::InvalidRounding {
                reason: format!("scale {} exceeds {MAX_ROUNDING_SCALE}", self.scale),
            });
        }
        Ok(())
    }

    /// Rounds an amount. Applying the same policy twice is a no-op.
    #[must_use]
    pub fn apply(&self, amount: &BigDecimal) -> BigDecimal {
        amount.with_scale_round(i64::from(self.scale), self.method.mode())
    }

    /// Rounds a quantity, keeping its unit.
    #[must_use]
    pub fn apply_to(&self, quantity: &Quantity) -> Quantity {
        Quantity::new(self.apply(&quantity.amount), quantity.unit)
    }

    /// Returns true if intermediate steps are rounded.
    #[must_use]
    pub fn rounds_each_step(&self) -> bool {
        self.point == RoundingPoint::EachStep
    }
}
