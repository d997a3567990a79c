use super::{highest, lowest, sma, Indicator};

#[derive(Debug, Clone, Copy)]
pub struct StochasticOutput {
    pub k: f64,
    pub d: f64,
}

/// Fast stochastic oscillator: %K from the high/low range, %D as an SMA of
/// recent %K values.
#[derive(Debug, Clone)]
pub struct Stochastic {
    period: usize,
    d_period: usize,
    highs: Vec<f64>,
    lows: Vec<f64>,
    k_values: Vec<f64>,
    output: Option<StochasticOutput>,
}

impl Stochastic {
    pub fn new(period: usize, d_period: usize) -> Self {
        Self {
            period,
            d_period,
            highs: Vec::new(),
            lows: Vec::new(),
            k_values: Vec::new(),
            output: None,
        }
    }

    pub fn update(&mut self, high: f64, low: f64, close: f64) -> Option<StochasticOutput> {
        self.highs.push(high);
        self.lows.push(low);
        if self.highs.len() > self.period {
            self.highs.remove(0);
            self.lows.remove(0);
        }
        if self.highs.len() < self.period {
            return None;
        }

        let hh = highest(&self.highs, self.period)?;
        let ll = lowest(&self.lows, self.period)?;
        let range = hh - ll;
        let k = if range == 0.0 { 50.0 } else { (close - ll) / range * 100.0 };

        self.k_values.push(k);
        if self.k_values.len() > self.d_period {
            self.k_values.remove(0);
        }
        if self.k_values.len() < self.d_period {
            return None;
        }

        let d = sma(&self.k_values, self.d_period)?;
        self.output = Some(StochasticOutput { k, d });
        self.output
    }

    pub fn output(&self) -> Option<StochasticOutput> {
        self.output
    }
}

impl Indicator for Stochastic {
    fn name(&self) -> &'static str {
        "Stochastic"
    }

    fn is_ready(&self) -> bool {
        self.output.is_some()
    }

    fn reset(&mut self) {
        self.highs.clear();
        self.lows.clear();
        self.k_values.clear();
        self.output = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_at_range_top_gives_100() {
        let mut stoch = Stochastic::new(5, 3);
        let mut out = None;
        for i in 0..10 {
            let base = 10.0 + i as f64;
            out = stoch.update(base + 1.0, base - 1.0, base + 1.0);
        }
        let out = out.unwrap();
        assert!(out.k > 99.0);
    }

    #[test]
    fn degenerate_range_reads_midline() {
        let mut stoch = Stochastic::new(3, 2);
        let mut out = None;
        for _ in 0..6 {
            out = stoch.update(5.0, 5.0, 5.0);
        }
        let out = out.unwrap();
        assert_eq!(out.k, 50.0);
        assert_eq!(out.d, 50.0);
    }
}
