use crate::config::Threshold;
use crate::metrics::MetricsCollector;
use crate::utils::error::{PhxLoadError, Result};
use std::fmt::Write as _;
use std::time::Duration;
use uuid::Uuid;

/// Comparison half of a threshold expression.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Ge,
    Lt,
    Le,
}

impl CmpOp {
    fn holds(&self, actual: f64, bound: f64) -> bool {
        match self {
            CmpOp::Gt => actual > bound,
            CmpOp::Ge => actual >= bound,
            CmpOp::Lt => actual < bound,
            CmpOp::Le => actual <= bound,
        }
    }

}

/// A parsed threshold expression: `rate>0.95`, `p(95)<2000`, `avg<=500`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ThresholdExpr {
    Rate { op: CmpOp, bound: f64 },
    Percentile { p: f64, op: CmpOp, bound: f64 },
    Avg { op: CmpOp, bound: f64 },
}

/// Parse the k6-style expression syntax.
pub fn parse_expr(expr: &str) -> Result<ThresholdExpr> {
    let s: String = expr.chars().filter(|c| !c.is_whitespace()).collect();

    if let Some(rest) = s.strip_prefix("rate") {
        let (op, bound) = parse_cmp(rest, expr)?;
        return Ok(ThresholdExpr::Rate { op, bound });
    }

    if let Some(rest) = s.strip_prefix("p(") {
        let close = rest
            .find(')')
            .ok_or_else(|| bad_expr(expr, "missing ')'"))?;
        let p: f64 = rest[..close]
            .parse()
            .map_err(|_| bad_expr(expr, "percentile must be a number"))?;
        if !(0.0..=100.0).contains(&p) {
            return Err(bad_expr(expr, "percentile must be in 0..=100"));
        }
        let (op, bound) = parse_cmp(&rest[close + 1..], expr)?;
        return Ok(ThresholdExpr::Percentile { p, op, bound });
    }

    if let Some(rest) = s.strip_prefix("avg") {
        let (op, bound) = parse_cmp(rest, expr)?;
        return Ok(ThresholdExpr::Avg { op, bound });
    }

    Err(bad_expr(expr, "expected 'rate', 'p(..)' or 'avg'"))
}

fn parse_cmp(s: &str, original: &str) -> Result<(CmpOp, f64)> {
    let (op, rest) = if let Some(rest) = s.strip_prefix(">=") {
        (CmpOp::Ge, rest)
    } else if let Some(rest) = s.strip_prefix("<=") {
        (CmpOp::Le, rest)
    } else if let Some(rest) = s.strip_prefix('>') {
        (CmpOp::Gt, rest)
    } else if let Some(rest) = s.strip_prefix('<') {
        (CmpOp::Lt, rest)
    } else {
        return Err(bad_expr(original, "expected a comparison operator"));
    };

    let bound: f64 = rest
        .parse()
        .map_err(|_| bad_expr(original, "bound must be a number"))?;
    Ok((op, bound))
}

fn bad_expr(expr: &str, why: &str) -> PhxLoadError {
    PhxLoadError::Config(format!("bad threshold expression '{}': {}", expr, why))
}

/// One threshold's verdict. A threshold over a series with no recorded data
/// passes vacuously; `actual` is `None` in that case.
#[derive(Debug, Clone)]
pub struct ThresholdOutcome {
    pub series: String,
    pub expr: String,
    pub actual: Option<f64>,
    pub passed: bool,
}

/// End-of-run summary: every recorded series plus threshold verdicts.
#[derive(Debug)]
pub struct RunReport {
    pub run_id: Uuid,
    pub elapsed: Duration,
    pub rates: Vec<(String, u64, u64, Option<f64>)>,
    pub trends: Vec<TrendLine>,
    pub outcomes: Vec<ThresholdOutcome>,
}

#[derive(Debug)]
pub struct TrendLine {
    pub series: String,
    pub count: u64,
    pub p50: Option<f64>,
    pub p95: Option<f64>,
    pub p99: Option<f64>,
    pub max: u64,
}

impl RunReport {
    pub fn evaluate(
        metrics: &MetricsCollector,
        thresholds: &[Threshold],
        run_id: Uuid,
        elapsed: Duration,
    ) -> Self {
        let rates = metrics
            .rate_names()
            .into_iter()
            .filter_map(|name| {
                metrics
                    .rate(&name)
                    .map(|s| (name, s.hits, s.total, s.fraction()))
            })
            .collect();

        let trends = metrics
            .trend_names()
            .into_iter()
            .filter_map(|name| {
                metrics.trend(&name).map(|s| TrendLine {
                    series: name,
                    count: s.count(),
                    p50: s.percentile(50.0),
                    p95: s.percentile(95.0),
                    p99: s.percentile(99.0),
                    max: s.max(),
                })
            })
            .collect();

        let outcomes = thresholds
            .iter()
            .map(|t| Self::check(metrics, t))
            .collect();

        Self {
            run_id,
            elapsed,
            rates,
            trends,
            outcomes,
        }
    }

    fn check(metrics: &MetricsCollector, threshold: &Threshold) -> ThresholdOutcome {
        // Validated at config load; an unparseable expression here fails the
        // threshold rather than the process
        let expr = match parse_expr(&threshold.expr) {
            Ok(expr) => expr,
            Err(_) => {
                return ThresholdOutcome {
                    series: threshold.series.clone(),
                    expr: threshold.expr.clone(),
                    actual: None,
                    passed: false,
                }
            }
        };

        let (actual, op, bound) = match expr {
            ThresholdExpr::Rate { op, bound } => (
                metrics.rate(&threshold.series).and_then(|s| s.fraction()),
                op,
                bound,
            ),
            ThresholdExpr::Percentile { p, op, bound } => (
                metrics.trend(&threshold.series).and_then(|s| s.percentile(p)),
                op,
                bound,
            ),
            ThresholdExpr::Avg { op, bound } => {
                (metrics.trend(&threshold.series).and_then(|s| s.mean()), op, bound)
            }
        };

        let passed = match actual {
            Some(actual) => op.holds(actual, bound),
            None => true,
        };

        ThresholdOutcome {
            series: threshold.series.clone(),
            expr: threshold.expr.clone(),
            actual,
            passed,
        }
    }

    pub fn passed(&self) -> bool {
        self.outcomes.iter().all(|o| o.passed)
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "run {} finished in {:.1?}", self.run_id, self.elapsed);

        if !self.rates.is_empty() {
            let _ = writeln!(out, "\nrates:");
            for (name, hits, total, fraction) in &self.rates {
                match fraction {
                    Some(f) => {
                        let _ = writeln!(
                            out,
                            "  {:<24} {:>8}/{:<8} rate={:.4}",
                            name, hits, total, f
                        );
                    }
                    None => {
                        let _ = writeln!(out, "  {:<24} no data", name);
                    }
                }
            }
        }

        if !self.trends.is_empty() {
            let _ = writeln!(out, "\ntrends (ms):");
            for line in &self.trends {
                let _ = writeln!(
                    out,
                    "  {:<24} n={:<8} p50={:<8} p95={:<8} p99={:<8} max={}",
                    line.series,
                    line.count,
                    fmt_opt(line.p50),
                    fmt_opt(line.p95),
                    fmt_opt(line.p99),
                    line.max
                );
            }
        }

        if !self.outcomes.is_empty() {
            let _ = writeln!(out, "\nthresholds:");
            for outcome in &self.outcomes {
                let mark = if outcome.passed { "PASS" } else { "FAIL" };
                let actual = match outcome.actual {
                    Some(a) => format!("{:.4}", a),
                    None => "no data".to_string(),
                };
                let _ = writeln!(
                    out,
                    "  [{}] {} {}  (actual: {})",
                    mark, outcome.series, outcome.expr, actual
                );
            }
        }

        out
    }
}

fn fmt_opt(value: Option<f64>) -> String {
    match value {
        Some(v) => format!("{:.0}", v),
        None => "-".to_string(),
    }
}
