use super::Indicator;

/// Wilder RSI. Seeds with simple averages over the first `period` changes,
/// then applies Wilder smoothing.
#[derive(Debug, Clone)]
pub struct Rsi {
    period: usize,
    avg_gain: Option<f64>,
    avg_loss: Option<f64>,
    prev_price: Option<f64>,
    gains: Vec<f64>,
    losses: Vec<f64>,
    value: Option<f64>,
}

impl Rsi {
    pub fn new(period: usize) -> Self {
        Self {
            period,
            avg_gain: None,
            avg_loss: None,
            prev_price: None,
            gains: Vec::with_capacity(period),
            losses: Vec::with_capacity(period),
            value: None,
        }
    }

    pub fn update(&mut self, price: f64) -> Option<f64> {
        if let Some(prev) = self.prev_price {
            let change = price - prev;
            let gain = change.max(0.0);
            let loss = (-change).max(0.0);

            if self.gains.len() < self.period {
                self.gains.push(gain);
                self.losses.push(loss);

                if self.gains.len() == self.period {
                    let n = self.period as f64;
                    self.avg_gain = Some(self.gains.iter().sum::<f64>() / n);
                    self.avg_loss = Some(self.losses.iter().sum::<f64>() / n);
                    self.value = self.compute();
                }
            } else if let (Some(avg_gain), Some(avg_loss)) = (self.avg_gain, self.avg_loss) {
                let n = self.period as f64;
                self.avg_gain = Some((avg_gain * (n - 1.0) + gain) / n);
                self.avg_loss = Some((avg_loss * (n - 1.0) + loss) / n);
                self.value = self.compute();
            }
        }

        self.prev_price = Some(price);
        self.value
    }

    fn compute(&self) -> Option<f64> {
        match (self.avg_gain, self.avg_loss) {
            (Some(avg_gain), Some(avg_loss)) => {
                if avg_loss == 0.0 {
                    Some(100.0)
                } else {
                    let rs = avg_gain / avg_loss;
                    Some(100.0 - 100.0 / (1.0 + rs))
                }
            }
            _ => None,
        }
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

impl Indicator for Rsi {
    fn name(&self) -> &'static str {
        "RSI"
    }

    fn is_ready(&self) -> bool {
        self.value.is_some()
    }

    fn reset(&mut self) {
        self.avg_gain = None;
        self.avg_loss = None;
        self.prev_price = None;
        self.gains.clear();
        self.losses.clear();
        self.value = None;
    }
}

/// RSI over a finished slice of closes; the streaming struct fed once.
pub fn rsi_from_closes(closes: &[f64], period: usize) -> Option<f64> {
    let mut rsi = Rsi::new(period);
    let mut out = None;
    for &c in closes {
        out = rsi.update(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotone_rise_pins_high() {
        let closes: Vec<f64> = (1..=30).map(|i| i as f64).collect();
        let value = rsi_from_closes(&closes, 14).unwrap();
        assert_eq!(value, 100.0);
    }

    #[test]
    fn monotone_fall_pins_low() {
        let closes: Vec<f64> = (1..=30).rev().map(|i| i as f64).collect();
        let value = rsi_from_closes(&closes, 14).unwrap();
        assert!(value < 1.0);
    }

    #[test]
    fn needs_period_plus_one_values() {
        let closes = [1.0; 14];
        assert!(rsi_from_closes(&closes, 14).is_none());
        let closes = [1.0; 15];
        assert!(rsi_from_closes(&closes, 14).is_some());
    }
}
