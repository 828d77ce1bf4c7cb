use crate::traits::Scalar;
use serde::{Deserialize, Serialize};
use std::ops::Index;
use thiserror::Error;

/// Shape violations detected when assembling a tableau, either from code or
/// from a decoded record.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TableauError {
    #[error("a tableau must have at least one stage")]
    NoStages,
    #[error("beta row {row} has {len} entries, expected {expected}")]
    RaggedBetaRow {
        row: usize,
        len: usize,
        expected: usize,
    },
    #[error("alpha has {len} entries, expected {expected} for {stages} stages")]
    AlphaLength {
        len: usize,
        expected: usize,
        stages: u32,
    },
    #[error("beta has {len} rows, expected {expected} for {stages} stages")]
    BetaRows {
        len: usize,
        expected: usize,
        stages: u32,
    },
    #[error("weight vector has {len} entries, expected {stages}")]
    WeightLength { len: usize, stages: u32 },
    #[error("a tableau record must carry either Coefs or Coefs1 and Coefs2")]
    WeightKeys,
}

/// Lower-triangular table of stage-coupling coefficients.
///
/// Row `i` (0-indexed) holds the weights for the k-vectors feeding stage
/// `i + 1`, so it has exactly `i + 1` entries. The shape is checked once at
/// construction; the rows are immutable afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct BetaTable<T> {
    rows: Vec<Vec<T>>,
}

impl<T: Scalar> BetaTable<T> {
    /// Validating constructor used by deserialization.
    pub fn try_new(rows: Vec<Vec<T>>) -> Result<Self, TableauError> {
        for (i, row) in rows.iter().enumerate() {
            if row.len() != i + 1 {
                return Err(TableauError::RaggedBetaRow {
                    row: i,
                    len: row.len(),
                    expected: i + 1,
                });
            }
        }
        Ok(Self { rows })
    }

    /// Panics if row `i` does not have exactly `i + 1` entries.
    pub fn new(rows: Vec<Vec<T>>) -> Self {
        Self::try_new(rows).unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn rows(&self) -> &[Vec<T>] {
        &self.rows
    }
}

impl<T: Scalar> Index<usize> for BetaTable<T> {
    type Output = [T];

    fn index(&self, row: usize) -> &[T] {
        &self.rows[row]
    }
}

/// Coefficient description of one explicit Runge-Kutta method.
///
/// `alpha` holds the stage time-offsets (length `stages - 1`), `beta` the
/// triangular stage couplings, `coefs1` the solution weights, and `coefs2`
/// an optional second weight vector forming an embedded pair for error
/// estimation. Immutable once built; a mismatched shape is a programming
/// error and the plain constructors panic on it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TableauRecord<T>", into = "TableauRecord<T>")]
pub struct ButcherTableau<T: Scalar> {
    alpha: Vec<T>,
    beta: BetaTable<T>,
    coefs1: Vec<T>,
    coefs2: Option<Vec<T>>,
    stages: u32,
    order: u32,
}

impl<T: Scalar> ButcherTableau<T> {
    /// Builds a tableau with a single solution-weight vector.
    pub fn new(alpha: Vec<T>, beta: BetaTable<T>, coefs: Vec<T>, stages: u32, order: u32) -> Self {
        Self::try_new(alpha, beta, coefs, stages, order).unwrap_or_else(|e| panic!("{e}"))
    }

    /// Builds a tableau with an embedded pair of solution-weight vectors.
    pub fn new_embedded(
        alpha: Vec<T>,
        beta: BetaTable<T>,
        coefs1: Vec<T>,
        coefs2: Vec<T>,
        stages: u32,
        order: u32,
    ) -> Self {
        Self::try_new_embedded(alpha, beta, coefs1, coefs2, stages, order)
            .unwrap_or_else(|e| panic!("{e}"))
    }

    pub fn try_new(
        alpha: Vec<T>,
        beta: BetaTable<T>,
        coefs: Vec<T>,
        stages: u32,
        order: u32,
    ) -> Result<Self, TableauError> {
        Self::check_shape(&alpha, &beta, &coefs, stages)?;
        Ok(Self {
            alpha,
            beta,
            coefs1: coefs,
            coefs2: None,
            stages,
            order,
        })
    }

    pub fn try_new_embedded(
        alpha: Vec<T>,
        beta: BetaTable<T>,
        coefs1: Vec<T>,
        coefs2: Vec<T>,
        stages: u32,
        order: u32,
    ) -> Result<Self, TableauError> {
        Self::check_shape(&alpha, &beta, &coefs1, stages)?;
        if coefs2.len() != stages as usize {
            return Err(TableauError::WeightLength {
                len: coefs2.len(),
                stages,
            });
        }
        Ok(Self {
            alpha,
            beta,
            coefs1,
            coefs2: Some(coefs2),
            stages,
            order,
        })
    }

    fn check_shape(
        alpha: &[T],
        beta: &BetaTable<T>,
        coefs: &[T],
        stages: u32,
    ) -> Result<(), TableauError> {
        if stages == 0 {
            return Err(TableauError::NoStages);
        }
        let expected = stages as usize - 1;
        if alpha.len() != expected {
            return Err(TableauError::AlphaLength {
                len: alpha.len(),
                expected,
                stages,
            });
        }
        if beta.len() != expected {
            return Err(TableauError::BetaRows {
                len: beta.len(),
                expected,
                stages,
            });
        }
        if coefs.len() != stages as usize {
            return Err(TableauError::WeightLength {
                len: coefs.len(),
                stages,
            });
        }
        Ok(())
    }

    pub fn alpha(&self) -> &[T] {
        &self.alpha
    }

    pub fn beta(&self) -> &BetaTable<T> {
        &self.beta
    }

    pub fn coefs1(&self) -> &[T] {
        &self.coefs1
    }

    pub fn coefs2(&self) -> Option<&[T]> {
        self.coefs2.as_deref()
    }

    /// Whether the tableau carries a second weight vector for embedded
    /// error estimation.
    pub fn embedded(&self) -> bool {
        self.coefs2.is_some()
    }

    pub fn stages(&self) -> u32 {
        self.stages
    }

    /// Formal convergence order of the method. Drives the step-size factor
    /// exponent; not derived from the coefficients.
    pub fn order(&self) -> u32 {
        self.order
    }
}

fn weights<T: Scalar>(values: &[f64]) -> Vec<T> {
    values
        .iter()
        .map(|&v| T::from_f64(v).unwrap())
        .collect()
}

fn couplings<T: Scalar>(rows: &[&[f64]]) -> BetaTable<T> {
    BetaTable::new(rows.iter().map(|row| weights(row)).collect())
}

/// The built-in method library. Each function returns a fresh immutable
/// tableau; callers are expected to hand it to an integrator and leave it
/// alone.
impl<T: Scalar> ButcherTableau<T> {
    /// Forward Euler, order 1.
    pub fn rk1() -> Self {
        Self::new(Vec::new(), BetaTable::new(Vec::new()), weights(&[1.0]), 1, 1)
    }

    /// Heun's two-stage method, order 2.
    pub fn rk2() -> Self {
        Self::new(
            weights(&[1.0]),
            couplings(&[&[1.0]]),
            weights(&[0.5, 0.5]),
            2,
            2,
        )
    }

    /// The classic fourth-order method.
    pub fn rk4() -> Self {
        Self::new(
            weights(&[0.5, 0.5, 1.0]),
            couplings(&[&[0.5], &[0.0, 0.5], &[0.0, 0.0, 1.0]]),
            weights(&[1.0 / 6.0, 1.0 / 3.0, 1.0 / 3.0, 1.0 / 6.0]),
            4,
            4,
        )
    }

    /// The 3/8-rule variant of the fourth-order method.
    pub fn rk38() -> Self {
        Self::new(
            weights(&[1.0 / 3.0, 2.0 / 3.0, 1.0]),
            couplings(&[&[1.0 / 3.0], &[-1.0 / 3.0, 1.0], &[1.0, -1.0, 1.0]]),
            weights(&[1.0 / 8.0, 3.0 / 8.0, 3.0 / 8.0, 1.0 / 8.0]),
            4,
            4,
        )
    }

    /// Fehlberg's embedded 1(2) pair.
    pub fn rkf12() -> Self {
        Self::new_embedded(
            weights(&[1.0]),
            couplings(&[&[1.0]]),
            weights(&[0.5, 0.5]),
            weights(&[1.0, 0.0]),
            2,
            2,
        )
    }

    /// Fehlberg's embedded 4(5) pair.
    pub fn rkf45() -> Self {
        Self::new_embedded(
            weights(&[0.25, 3.0 / 8.0, 12.0 / 13.0, 1.0, 0.5]),
            couplings(&[
                &[0.25],
                &[3.0 / 32.0, 9.0 / 32.0],
                &[1932.0 / 2197.0, -7200.0 / 2197.0, 7296.0 / 2197.0],
                &[439.0 / 216.0, -8.0, 3680.0 / 513.0, -845.0 / 4104.0],
                &[-8.0 / 27.0, 2.0, -3544.0 / 2565.0, 1859.0 / 4104.0, -11.0 / 40.0],
            ]),
            weights(&[
                16.0 / 135.0,
                0.0,
                6656.0 / 12825.0,
                28561.0 / 56430.0,
                -9.0 / 50.0,
                2.0 / 55.0,
            ]),
            weights(&[
                25.0 / 216.0,
                0.0,
                1408.0 / 2565.0,
                2197.0 / 4104.0,
                -0.2,
                0.0,
            ]),
            6,
            5,
        )
    }

    /// The Cash-Karp embedded 4(5) pair.
    pub fn rkck45() -> Self {
        Self::new_embedded(
            weights(&[0.2, 0.3, 0.6, 1.0, 7.0 / 8.0]),
            couplings(&[
                &[0.2],
                &[3.0 / 40.0, 9.0 / 40.0],
                &[0.3, -0.9, 6.0 / 5.0],
                &[-11.0 / 54.0, 2.5, -70.0 / 27.0, 35.0 / 27.0],
                &[
                    1631.0 / 55296.0,
                    175.0 / 512.0,
                    575.0 / 13824.0,
                    44275.0 / 110592.0,
                    253.0 / 4096.0,
                ],
            ]),
            weights(&[
                37.0 / 378.0,
                0.0,
                250.0 / 621.0,
                125.0 / 594.0,
                0.0,
                512.0 / 1771.0,
            ]),
            weights(&[
                2825.0 / 27648.0,
                0.0,
                18575.0 / 48384.0,
                13525.0 / 55296.0,
                277.0 / 14336.0,
                0.25,
            ]),
            6,
            5,
        )
    }

    /// Fehlberg's embedded 7(8) pair.
    pub fn rkf78() -> Self {
        Self::new_embedded(
            weights(&[
                2.0 / 27.0,
                1.0 / 9.0,
                1.0 / 6.0,
                5.0 / 12.0,
                0.5,
                5.0 / 6.0,
                1.0 / 6.0,
                2.0 / 3.0,
                1.0 / 3.0,
                1.0,
                0.0,
                1.0,
            ]),
            couplings(&[
                &[2.0 / 27.0],
                &[1.0 / 36.0, 1.0 / 12.0],
                &[1.0 / 24.0, 0.0, 1.0 / 8.0],
                &[5.0 / 12.0, 0.0, -25.0 / 16.0, 25.0 / 16.0],
                &[1.0 / 20.0, 0.0, 0.0, 0.25, 0.2],
                &[-25.0 / 108.0, 0.0, 0.0, 125.0 / 108.0, -65.0 / 27.0, 125.0 / 54.0],
                &[
                    31.0 / 300.0,
                    0.0,
                    0.0,
                    0.0,
                    61.0 / 225.0,
                    -2.0 / 9.0,
                    13.0 / 900.0,
                ],
                &[
                    2.0,
                    0.0,
                    0.0,
                    -53.0 / 6.0,
                    704.0 / 45.0,
                    -107.0 / 9.0,
                    67.0 / 90.0,
                    3.0,
                ],
                &[
                    -91.0 / 108.0,
                    0.0,
                    0.0,
                    23.0 / 108.0,
                    -976.0 / 135.0,
                    311.0 / 54.0,
                    -19.0 / 60.0,
                    17.0 / 6.0,
                    -1.0 / 12.0,
                ],
                &[
                    2383.0 / 4100.0,
                    0.0,
                    0.0,
                    -341.0 / 164.0,
                    4496.0 / 1025.0,
                    -301.0 / 82.0,
                    2133.0 / 4100.0,
                    45.0 / 82.0,
                    45.0 / 164.0,
                    18.0 / 41.0,
                ],
                &[
                    3.0 / 205.0,
                    0.0,
                    0.0,
                    0.0,
                    0.0,
                    -6.0 / 41.0,
                    -3.0 / 205.0,
                    -3.0 / 41.0,
                    3.0 / 41.0,
                    6.0 / 41.0,
                    0.0,
                ],
                &[
                    -1777.0 / 4100.0,
                    0.0,
                    0.0,
                    -341.0 / 164.0,
                    4496.0 / 1025.0,
                    -289.0 / 82.0,
                    2193.0 / 4100.0,
                    51.0 / 82.0,
                    33.0 / 164.0,
                    12.0 / 41.0,
                    0.0,
                    1.0,
                ],
            ]),
            weights(&[
                0.0,
                0.0,
                0.0,
                0.0,
                0.0,
                34.0 / 105.0,
                9.0 / 35.0,
                9.0 / 35.0,
                9.0 / 280.0,
                9.0 / 280.0,
                0.0,
                41.0 / 840.0,
                41.0 / 840.0,
            ]),
            weights(&[
                41.0 / 840.0,
                0.0,
                0.0,
                0.0,
                0.0,
                34.0 / 105.0,
                9.0 / 35.0,
                9.0 / 35.0,
                9.0 / 280.0,
                9.0 / 280.0,
                41.0 / 840.0,
                0.0,
                0.0,
            ]),
            13,
            8,
        )
    }
}

/// Wire shape of a tableau. Plain tableaus carry `Coefs`; embedded ones
/// carry `Coefs1` and `Coefs2`. `Beta` is omitted when the method has a
/// single stage.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", bound(deserialize = "T: Deserialize<'de>"))]
struct TableauRecord<T> {
    alpha: Vec<T>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    beta: Vec<Vec<T>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    coefs: Option<Vec<T>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    coefs1: Option<Vec<T>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    coefs2: Option<Vec<T>>,
    stage: u32,
    order: u32,
}

impl<T: Scalar> TryFrom<TableauRecord<T>> for ButcherTableau<T> {
    type Error = TableauError;

    fn try_from(record: TableauRecord<T>) -> Result<Self, TableauError> {
        let beta = BetaTable::try_new(record.beta)?;
        match (record.coefs, record.coefs1, record.coefs2) {
            (Some(coefs), None, None) => {
                Self::try_new(record.alpha, beta, coefs, record.stage, record.order)
            }
            (None, Some(coefs1), Some(coefs2)) => Self::try_new_embedded(
                record.alpha,
                beta,
                coefs1,
                coefs2,
                record.stage,
                record.order,
            ),
            _ => Err(TableauError::WeightKeys),
        }
    }
}

impl<T: Scalar> From<ButcherTableau<T>> for TableauRecord<T> {
    fn from(tb: ButcherTableau<T>) -> Self {
        let (coefs, coefs1, coefs2) = match tb.coefs2 {
            Some(c2) => (None, Some(tb.coefs1), Some(c2)),
            None => (Some(tb.coefs1), None, None),
        };
        Self {
            alpha: tb.alpha,
            beta: tb.beta.rows,
            coefs,
            coefs1,
            coefs2,
            stage: tb.stages,
            order: tb.order,
        }
    }
}
