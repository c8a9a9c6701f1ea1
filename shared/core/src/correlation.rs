use serde::Serialize;

/// Pearson, Spearman and Kendall (tau-b) correlation between two paired samples.
/// A statistic is `None` when it is undefined for the input, e.g. fewer than two
/// pairs or a sample with zero variance. Pairs holding a NaN or an infinity are
/// left out.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize)]
pub struct Correlation {
    pub pearson: Option<f64>,
    pub spearman: Option<f64>,
    pub kendall: Option<f64>,
}

impl Correlation {
    pub fn compute(a: &[f64], b: &[f64]) -> Result<Self, &'static str> {
        check_lengths(a, b)?;
        let (a, b): (Vec<f64>, Vec<f64>) = a
            .iter()
            .zip(b)
            .filter(|(x, y)| x.is_finite() && y.is_finite())
            .map(|(x, y)| (*x, *y))
            .unzip();
        Ok(Self {
            pearson: pearson(&a, &b)?,
            spearman: spearman(&a, &b)?,
            kendall: kendall_tau(&a, &b)?,
        })
    }

    /// Averages each statistic over the correlations where it is defined.
    pub fn mean(correlations: &[Correlation]) -> Self {
        fn mean_of(values: impl Iterator<Item = Option<f64>>) -> Option<f64> {
            let (sum, count) = values
                .flatten()
                .fold((0.0, 0usize), |(sum, count), x| (sum + x, count + 1));
            match count {
                0 => None,
                n => Some(sum / n as f64),
            }
        }

        Self {
            pearson: mean_of(correlations.iter().map(|x| x.pearson)),
            spearman: mean_of(correlations.iter().map(|x| x.spearman)),
            kendall: mean_of(correlations.iter().map(|x| x.kendall)),
        }
    }
}

fn check_lengths(a: &[f64], b: &[f64]) -> Result<(), &'static str> {
    if a.len() != b.len() {
        return Err("Input arrays must have the same length");
    }
    Ok(())
}

pub fn pearson(a: &[f64], b: &[f64]) -> Result<Option<f64>, &'static str> {
    check_lengths(a, b)?;
    let n = a.len();
    if n < 2 {
        return Ok(None);
    }

    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;
    let (mut cov, mut var_a, mut var_b) = (0.0, 0.0, 0.0);
    for (x, y) in a.iter().zip(b.iter()) {
        let dx = x - mean_a;
        let dy = y - mean_b;
        cov += dx * dy;
        var_a += dx * dx;
        var_b += dy * dy;
    }

    let denominator = (var_a * var_b).sqrt();
    if denominator == 0.0 || !denominator.is_finite() {
        return Ok(None);
    }
    Ok(Some((cov / denominator).clamp(-1.0, 1.0)))
}

pub fn spearman(a: &[f64], b: &[f64]) -> Result<Option<f64>, &'static str> {
    check_lengths(a, b)?;
    pearson(&average_ranks(a), &average_ranks(b))
}

/// Kendall's tau-b, which corrects for ties in either sample.
pub fn kendall_tau(a: &[f64], b: &[f64]) -> Result<Option<f64>, &'static str> {
    check_lengths(a, b)?;
    let n = a.len();
    if n < 2 {
        return Ok(None);
    }

    let (mut concordant, mut discordant) = (0i64, 0i64);
    let (mut tied_a, mut tied_b) = (0i64, 0i64);
    for i in 0..n {
        for j in (i + 1)..n {
            let da = sign(a[i] - a[j]);
            let db = sign(b[i] - b[j]);
            if da == 0 {
                tied_a += 1;
            }
            if db == 0 {
                tied_b += 1;
            }
            match da * db {
                1 => concordant += 1,
                -1 => discordant += 1,
                _ => {}
            }
        }
    }

    let denominator = tau_b_denominator(n, tied_a, tied_b);
    if denominator == 0.0 {
        return Ok(None);
    }
    Ok(Some((concordant - discordant) as f64 / denominator))
}

fn tau_b_denominator(n: usize, tied_a: i64, tied_b: i64) -> f64 {
    let pairs = n as f64 * (n as f64 - 1.0) / 2.0;
    ((pairs - tied_a as f64) * (pairs - tied_b as f64)).sqrt()
}

fn sign(x: f64) -> i64 {
    if x > 0.0 {
        1
    } else if x < 0.0 {
        -1
    } else {
        0
    }
}

/// 1-based ranks, ties get the mean of the ranks they span.
pub fn average_ranks(values: &[f64]) -> Vec<f64> {
    let mut order = (0..values.len()).collect::<Vec<_>>();
    order.sort_by(|&i, &j| values[i].total_cmp(&values[j]));

    let mut ranks = vec![0.0; values.len()];
    let mut i = 0;
    while i < order.len() {
        let mut j = i;
        while j < order.len() && values[order[j]].total_cmp(&values[order[i]]).is_eq() {
            j += 1;
        }
        // positions i..j hold ranks (i+1)..=j
        let rank = (i + 1 + j) as f64 / 2.0;
        for &index in &order[i..j] {
            ranks[index] = rank;
        }
        i = j;
    }
    ranks
}
