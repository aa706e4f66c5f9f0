//! Measurement types shared by the sessions and the scheduler.

/// Hashrate measurement.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct HashRate(pub f64); // hashes per second

impl HashRate {
    /// Get value as kilohashes per second
    pub fn as_kilohashes(&self) -> f64 {
        self.0 / 1_000.0
    }

    /// Get value as megahashes per second
    pub fn as_megahashes(&self) -> f64 {
        self.0 / 1_000_000.0
    }

    /// Get value as gigahashes per second
    pub fn as_gigahashes(&self) -> f64 {
        self.0 / 1_000_000_000.0
    }

    /// Format as human-readable string with appropriate units
    pub fn to_human_readable(&self) -> String {
        if self.0 >= 1_000_000_000.0 {
            format!("{:.2} GH/s", self.as_gigahashes())
        } else if self.0 >= 1_000_000.0 {
            format!("{:.2} MH/s", self.as_megahashes())
        } else if self.0 >= 1_000.0 {
            format!("{:.2} kH/s", self.as_kilohashes())
        } else {
            format!("{:.0} H/s", self.0)
        }
    }
}

impl From<HashRate> for f64 {
    fn from(rate: HashRate) -> Self {
        rate.0
    }
}

impl std::ops::Add for HashRate {
    type Output = HashRate;

    fn add(self, rhs: Self) -> Self {
        HashRate(self.0 + rhs.0)
    }
}

impl std::iter::Sum for HashRate {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(HashRate::default(), |a, b| a + b)
    }
}

/// Exponentially decayed average.
///
/// Every sample first multiplies the running sum and weight by `factor`,
/// so old samples fade out geometrically.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayedAverage {
    factor: f64,
    sum: f64,
    weight: f64,
}

impl DecayedAverage {
    pub const fn new(factor: f64) -> Self {
        Self {
            factor,
            sum: 0.0,
            weight: 0.0,
        }
    }

    pub fn add(&mut self, value: f64) {
        self.sum = self.sum * self.factor + value;
        self.weight = self.weight * self.factor + 1.0;
    }

    /// Average of the samples, or zero before the first sample.
    pub fn value(&self) -> f64 {
        if self.weight > 0.0 {
            self.sum / self.weight
        } else {
            0.0
        }
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }
}

/// Pair of decayed sums whose ratio is reported, such as device time over
/// loop time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DecayedRatio {
    factor: f64,
    numerator: f64,
    denominator: f64,
}

impl DecayedRatio {
    pub const fn new(factor: f64) -> Self {
        Self {
            factor,
            numerator: 0.0,
            denominator: 0.0,
        }
    }

    pub fn add(&mut self, numerator: f64, denominator: f64) {
        self.numerator = self.numerator * self.factor + numerator;
        self.denominator = self.denominator * self.factor + denominator;
    }

    pub fn numerator(&self) -> f64 {
        self.numerator
    }

    pub fn denominator(&self) -> f64 {
        self.denominator
    }

    pub fn ratio(&self) -> f64 {
        if self.denominator > 0.0 {
            self.numerator / self.denominator
        } else {
            0.0
        }
    }
}
