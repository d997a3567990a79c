use super::{ema::Ema, Indicator};

#[derive(Debug, Clone, Copy)]
pub struct MacdOutput {
    pub macd_line: f64,
    pub signal_line: f64,
    pub histogram: f64,
}

#[derive(Debug, Clone)]
pub struct Macd {
    fast_ema: Ema,
    slow_ema: Ema,
    signal_ema: Ema,
    output: Option<MacdOutput>,
    prev_histogram: Option<f64>,
}

impl Macd {
    pub fn new(fast_period: usize, slow_period: usize, signal_period: usize) -> Self {
        Self {
            fast_ema: Ema::new(fast_period),
            slow_ema: Ema::new(slow_period),
            signal_ema: Ema::new(signal_period),
            output: None,
            prev_histogram: None,
        }
    }

    pub fn default_params() -> Self {
        Self::new(12, 26, 9)
    }

    pub fn update(&mut self, price: f64) -> Option<MacdOutput> {
        let fast = self.fast_ema.update(price);
        let slow = self.slow_ema.update(price);

        if let (Some(f), Some(s)) = (fast, slow) {
            let macd_line = f - s;
            if let Some(signal) = self.signal_ema.update(macd_line) {
                self.prev_histogram = self.output.map(|o| o.histogram);
                self.output = Some(MacdOutput {
                    macd_line,
                    signal_line: signal,
                    histogram: macd_line - signal,
                });
            }
        }

        self.output
    }

    pub fn output(&self) -> Option<MacdOutput> {
        self.output
    }

    pub fn is_bullish_crossover(&self) -> bool {
        match (self.output, self.prev_histogram) {
            (Some(curr), Some(prev)) => prev < 0.0 && curr.histogram >= 0.0,
            _ => false,
        }
    }
}

impl Indicator for Macd {
    fn name(&self) -> &'static str {
        "MACD"
    }

    fn is_ready(&self) -> bool {
        self.output.is_some()
    }

    fn reset(&mut self) {
        self.fast_ema.reset();
        self.slow_ema.reset();
        self.signal_ema.reset();
        self.output = None;
        self.prev_histogram = None;
    }
}
