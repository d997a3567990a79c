use super::Indicator;

#[derive(Debug, Clone, Copy)]
pub struct BollingerOutput {
    pub upper: f64,
    pub middle: f64,
    pub lower: f64,
}

impl BollingerOutput {
    /// Band width relative to the middle band.
    pub fn width(&self) -> f64 {
        if self.middle == 0.0 {
            return 0.0;
        }
        (self.upper - self.lower) / self.middle
    }

    /// Where a price sits in the band: 0 at the lower line, 1 at the upper.
    pub fn position(&self, price: f64) -> f64 {
        let range = self.upper - self.lower;
        if range == 0.0 {
            return 0.5;
        }
        (price - self.lower) / range
    }
}

#[derive(Debug, Clone)]
pub struct BollingerBands {
    period: usize,
    std_dev_mult: f64,
    window: Vec<f64>,
}

impl BollingerBands {
    pub fn new(period: usize, std_dev_mult: f64) -> Self {
        Self {
            period,
            std_dev_mult,
            window: Vec::with_capacity(period + 1),
        }
    }

    pub fn update(&mut self, price: f64) -> Option<BollingerOutput> {
        self.window.push(price);
        if self.window.len() > self.period {
            self.window.remove(0);
        }
        self.output()
    }

    pub fn output(&self) -> Option<BollingerOutput> {
        if self.window.len() < self.period {
            return None;
        }
        let n = self.period as f64;
        let mean = self.window.iter().sum::<f64>() / n;
        let variance = self.window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
        let sd = variance.sqrt();
        Some(BollingerOutput {
            upper: mean + self.std_dev_mult * sd,
            middle: mean,
            lower: mean - self.std_dev_mult * sd,
        })
    }
}

impl Indicator for BollingerBands {
    fn name(&self) -> &'static str {
        "BollingerBands"
    }

    fn is_ready(&self) -> bool {
        self.window.len() >= self.period
    }

    fn reset(&mut self) {
        self.window.clear();
    }
}
