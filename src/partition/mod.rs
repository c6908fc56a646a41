// Module: Partition
// Half-open index ranges [start, end) over the ordered record set. One worker
// owns one partition; ranges never overlap.

use anyhow::{bail, Result};
use std::collections::HashSet;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

use crate::errors::ErrorCode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    pub id: String,
    pub start: usize,
    /// `None` runs to the end of the data set.
    pub end: Option<usize>,
}

impl Partition {
    pub fn new(id: impl Into<String>, start: usize, end: Option<usize>) -> Self {
        Self {
            id: id.into(),
            start,
            end,
        }
    }

    /// The whole data set as a single partition.
    pub fn whole() -> Self {
        Self::new(Self::default_id(0, None), 0, None)
    }

    /// Id used when the operator does not name the partition.
    pub fn default_id(start: usize, end: Option<usize>) -> String {
        match (start, end) {
            (0, None) => "default".to_string(),
            (start, None) => format!("{}_end", start),
            (start, Some(end)) => format!("{}_{}", start, end),
        }
    }

    /// Effective range once the data set size is known.
    pub fn bounded(&self, total: usize) -> Range<usize> {
        let end = self.end.map_or(total, |e| e.min(total));
        self.start.min(end)..end
    }

    /// Splits `[0, total)` into `n` contiguous ranges, `inst1..instN`; the
    /// first ranges take the remainder.
    pub fn split_even(total: usize, n: usize) -> Vec<Partition> {
        let n = n.max(1);
        let base = total / n;
        let extra = total % n;
        let mut start = 0;
        (0..n)
            .map(|i| {
                let len = base + usize::from(i < extra);
                let partition = Partition::new(format!("inst{}", i + 1), start, Some(start + len));
                start += len;
                partition
            })
            .collect()
    }

    /// Checks a partition set against the data set size.
    ///
    /// Every range must be non-empty and inside `[0, total)`, ids unique and
    /// ranges disjoint. With more than one partition the union must also
    /// cover the whole set.
    pub fn validate(partitions: &[Partition], total: usize) -> Result<()> {
        if partitions.is_empty() {
            bail!("[{}] nenhuma partição informada", ErrorCode::INVALID_CONFIG);
        }

        let mut ids = HashSet::new();
        let mut ranges: Vec<(Range<usize>, &str)> = Vec::with_capacity(partitions.len());
        for p in partitions {
            if p.id.trim().is_empty() {
                bail!("[{}] partição sem id", ErrorCode::INVALID_CONFIG);
            }
            if !ids.insert(p.id.as_str()) {
                bail!("[{}] id de partição repetido: {}", ErrorCode::INVALID_CONFIG, p.id);
            }
            let end = p.end.unwrap_or(total);
            if end > total {
                bail!(
                    "[{}] partição {} termina em {} mas há {} registros",
                    ErrorCode::INVALID_CONFIG,
                    p.id,
                    end,
                    total
                );
            }
            if p.start >= end {
                bail!("[{}] partição {} vazia ({}..{})", ErrorCode::INVALID_CONFIG, p.id, p.start, end);
            }
            ranges.push((p.start..end, p.id.as_str()));
        }

        ranges.sort_by_key(|(r, _)| r.start);
        for pair in ranges.windows(2) {
            let (a, a_id) = &pair[0];
            let (b, b_id) = &pair[1];
            if b.start < a.end {
                bail!("[{}] partições {} e {} se sobrepõem", ErrorCode::INVALID_CONFIG, a_id, b_id);
            }
            if b.start > a.end {
                bail!(
                    "[{}] índices {}..{} sem partição",
                    ErrorCode::INVALID_CONFIG,
                    a.end,
                    b.start
                );
            }
        }
        if ranges.len() > 1 {
            let first = ranges.first().map_or(0, |(r, _)| r.start);
            let last = ranges.last().map_or(0, |(r, _)| r.end);
            if first != 0 || last != total {
                bail!(
                    "[{}] partições cobrem {}..{}, esperado 0..{}",
                    ErrorCode::INVALID_CONFIG,
                    first,
                    last,
                    total
                );
            }
        }
        Ok(())
    }
}

/// `id=start:end`, `id=start:` or `start:end`.
impl FromStr for Partition {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (id, range) = match raw.split_once('=') {
            Some((id, range)) => (Some(id.trim()), range),
            None => (None, raw),
        };
        let Some((start, end)) = range.split_once(':') else {
            bail!("[{}] partição inválida '{}', use id=inicio:fim", ErrorCode::INVALID_CONFIG, raw);
        };
        let Ok(start) = start.trim().parse::<usize>() else {
            bail!("[{}] início inválido em '{}'", ErrorCode::INVALID_CONFIG, raw);
        };
        let end = match end.trim() {
            "" => None,
            value => match value.parse::<usize>() {
                Ok(end) => Some(end),
                Err(_) => bail!("[{}] fim inválido em '{}'", ErrorCode::INVALID_CONFIG, raw),
            },
        };
        let id = match id {
            Some(id) if !id.is_empty() => id.to_string(),
            _ => Self::default_id(start, end),
        };
        Ok(Self::new(id, start, end))
    }
}

impl fmt::Display for Partition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.end {
            Some(end) => write!(f, "{}=[{}, {})", self.id, self.start, end),
            None => write!(f, "{}=[{}, fim)", self.id, self.start),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_forms() {
        let p: Partition = "inst2=2000:4000".parse().unwrap();
        assert_eq!(p, Partition::new("inst2", 2000, Some(4000)));

        let p: Partition = "inst4=6000:".parse().unwrap();
        assert_eq!(p.end, None);

        let p: Partition = "10:20".parse().unwrap();
        assert_eq!(p.id, "10_20");

        assert!("inst1=abc:10".parse::<Partition>().is_err());
        assert!("inst1".parse::<Partition>().is_err());
    }

    #[test]
    fn test_bounded_clamps_to_total() {
        assert_eq!(Partition::new("a", 6000, None).bounded(7100), 6000..7100);
        assert_eq!(Partition::new("a", 0, Some(2000)).bounded(500), 0..500);
        assert_eq!(Partition::new("a", 900, Some(2000)).bounded(500), 500..500);
        assert_eq!(Partition::whole().bounded(4), 0..4);
    }

    #[test]
    fn test_split_even_covers_without_overlap() {
        for total in [0usize, 1, 4, 7, 100, 8001] {
            for n in 1..=7 {
                let parts = Partition::split_even(total, n);
                assert_eq!(parts.len(), n);

                let mut seen = vec![0u8; total];
                for p in &parts {
                    for i in p.bounded(total) {
                        seen[i] += 1;
                    }
                }
                assert!(seen.iter().all(|&c| c == 1), "total={} n={}", total, n);
            }
        }
    }

    #[test]
    fn test_split_even_spreads_remainder() {
        let parts = Partition::split_even(10, 3);
        let sizes: Vec<usize> = parts.iter().map(|p| p.bounded(10).len()).collect();
        assert_eq!(sizes, vec![4, 3, 3]);
        assert_eq!(parts[2].id, "inst3");
    }

    #[test]
    fn test_validate_accepts_exact_cover() {
        let parts = vec![
            Partition::new("inst1", 0, Some(2)),
            Partition::new("inst2", 2, Some(4)),
        ];
        assert!(Partition::validate(&parts, 4).is_ok());
        assert!(Partition::validate(&[Partition::new("solo", 1, Some(3))], 4).is_ok());
    }

    #[test]
    fn test_validate_rejects_overlap_gap_and_duplicates() {
        let overlap = vec![Partition::new("a", 0, Some(3)), Partition::new("b", 2, Some(4))];
        assert!(Partition::validate(&overlap, 4).is_err());

        let gap = vec![Partition::new("a", 0, Some(1)), Partition::new("b", 2, Some(4))];
        assert!(Partition::validate(&gap, 4).is_err());

        let short = vec![Partition::new("a", 0, Some(1)), Partition::new("b", 1, Some(3))];
        assert!(Partition::validate(&short, 4).is_err());

        let dup = vec![Partition::new("a", 0, Some(2)), Partition::new("a", 2, Some(4))];
        assert!(Partition::validate(&dup, 4).is_err());

        assert!(Partition::validate(&[Partition::new("a", 0, Some(9))], 4).is_err());
        assert!(Partition::validate(&[], 4).is_err());
    }
}
