/// Bounded window of samples with a decaying average on top.
///
/// Used to smooth pause times, mark utilisation and scavenger work so a
/// single outlier does not swing the pacing decisions.
#[derive(Clone, Debug)]
pub struct TruncatedSeq {
    num: usize,
    sum: f64,
    davg: f64,
    dvariance: f64,
    alpha: f64,
    sequence: Box<[f64]>,
    next: usize,
}

impl TruncatedSeq {
    pub fn new(length: usize, alpha: f64) -> Self {
        assert!(length > 0);
        Self {
            num: 0,
            sum: 0.0,
            davg: 0.0,
            dvariance: 0.0,
            alpha,
            sequence: vec![0.0; length].into_boxed_slice(),
            next: 0,
        }
    }

    pub fn num(&self) -> usize {
        self.num
    }

    pub fn add(&mut self, val: f64) {
        if self.num == 0 {
            self.davg = val;
            self.dvariance = 0.0;
        } else {
            let diff = val - self.davg;
            let incr = self.alpha * diff;
            self.davg += incr;
            self.dvariance = (1.0 - self.alpha) * (self.dvariance + diff * incr);
        }

        self.sum -= self.sequence[self.next];
        self.sum += val;
        self.sequence[self.next] = val;
        self.next = (self.next + 1) % self.sequence.len();

        if self.num < self.sequence.len() {
            self.num += 1;
        }
    }

    pub fn last(&self) -> f64 {
        if self.num == 0 {
            return 0.0;
        }
        self.sequence[(self.next + self.sequence.len() - 1) % self.sequence.len()]
    }

    pub fn maximum(&self) -> f64 {
        self.iter().fold(0.0, f64::max)
    }

    pub fn avg(&self) -> f64 {
        if self.num == 0 {
            0.0
        } else {
            self.sum / self.num as f64
        }
    }

    pub fn davg(&self) -> f64 {
        self.davg
    }

    pub fn dsd(&self) -> f64 {
        if self.num <= 1 || self.dvariance < 0.0 {
            return 0.0;
        }
        self.dvariance.sqrt()
    }

    /// Samples from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = f64> + '_ {
        let len = self.sequence.len();
        let first = (self.next + len - self.num) % len;
        (0..self.num).map(move |i| self.sequence[(first + i) % len])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_drops_old_samples() {
        let mut seq = TruncatedSeq::new(3, 0.3);
        for v in [1.0, 2.0, 3.0, 10.0] {
            seq.add(v);
        }
        assert_eq!(seq.num(), 3);
        assert_eq!(seq.iter().collect::<Vec<_>>(), vec![2.0, 3.0, 10.0]);
        assert_eq!(seq.last(), 10.0);
        assert_eq!(seq.maximum(), 10.0);
        assert!((seq.avg() - 5.0).abs() < 1e-9);
    }

    #[test]
    fn decaying_average_follows_samples() {
        let mut seq = TruncatedSeq::new(10, 0.5);
        seq.add(4.0);
        assert_eq!(seq.davg(), 4.0);
        seq.add(8.0);
        assert_eq!(seq.davg(), 6.0);
        assert!(seq.dsd() > 0.0);
    }
}
