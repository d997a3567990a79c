use super::Indicator;

/// Exponential moving average, seeded with an SMA of the first `period`
/// values, then smoothed with k = 2 / (period + 1).
#[derive(Debug, Clone)]
pub struct Ema {
    period: usize,
    multiplier: f64,
    seed: Vec<f64>,
    value: Option<f64>,
}

impl Ema {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            multiplier: 2.0 / (period as f64 + 1.0),
            seed: Vec::with_capacity(period),
            value: None,
        }
    }

    pub fn update(&mut self, price: f64) -> Option<f64> {
        match self.value {
            Some(prev) => {
                let next = (price - prev) * self.multiplier + prev;
                self.value = Some(next);
            }
            None => {
                self.seed.push(price);
                if self.seed.len() == self.period {
                    let sma = self.seed.iter().sum::<f64>() / self.period as f64;
                    self.value = Some(sma);
                }
            }
        }
        self.value
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

impl Indicator for Ema {
    fn name(&self) -> &'static str {
        "EMA"
    }

    fn is_ready(&self) -> bool {
        self.value.is_some()
    }

    fn reset(&mut self) {
        self.seed.clear();
        self.value = None;
    }
}
