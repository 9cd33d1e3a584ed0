//! Parallel row parsing and per-period deduplication.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use nomina_core::{parse_row, Dimension, ParsedRecord, ProcessedBatch, RawRow};
use tokio::task::JoinSet;
use tracing::{debug, error, Span};

pub fn default_parse_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(4)
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParseOutcome {
    /// Successfully parsed rows, in source order.
    pub records: Vec<ParsedRecord>,
    pub failures: usize,
}

/// Fans raw rows out over a fixed number of blocking workers and joins them all.
#[derive(Debug, Clone, Copy)]
pub struct ParseCoordinator {
    workers: usize,
}

impl Default for ParseCoordinator {
    fn default() -> Self {
        Self::new(default_parse_workers())
    }
}

impl ParseCoordinator {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub fn workers(&self) -> usize {
        self.workers
    }

    pub async fn parse_all(&self, rows: Vec<RawRow>) -> Result<ParseOutcome> {
        if rows.is_empty() {
            return Ok(ParseOutcome::default());
        }

        let total = rows.len();
        let chunk_size = total.div_ceil(self.workers);
        let mut workers = JoinSet::new();
        let mut rows = rows.into_iter();
        let mut chunk_index = 0usize;

        loop {
            let chunk: Vec<RawRow> = rows.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            let span = Span::current();
            let index = chunk_index;
            workers.spawn_blocking(move || {
                let _entered = span.enter();
                (index, parse_chunk(chunk))
            });
            chunk_index += 1;
        }

        let mut chunks = Vec::with_capacity(chunk_index);
        while let Some(joined) = workers.join_next().await {
            chunks.push(joined.context("parse worker panicked")?);
        }
        chunks.sort_by_key(|(index, _)| *index);

        let mut outcome = ParseOutcome::default();
        for (_, (records, failures)) in chunks {
            outcome.records.extend(records);
            outcome.failures += failures;
        }
        debug!(
            total,
            parsed = outcome.records.len(),
            failures = outcome.failures,
            workers = chunk_index,
            "parsed period rows"
        );
        Ok(outcome)
    }
}

fn parse_chunk(rows: Vec<RawRow>) -> (Vec<ParsedRecord>, usize) {
    let mut records = Vec::with_capacity(rows.len());
    let mut failures = 0usize;
    for raw in &rows {
        match parse_row(raw) {
            Ok(record) => records.push(record),
            Err(failure) => {
                failures += 1;
                error!(%failure, row = ?raw, "dropping unparsable payroll row");
            }
        }
    }
    (records, failures)
}

/// Folds parsed records into one content-keyed map per dimension kind.
///
/// The first value seen for a natural key is kept; facts are appended in order.
#[derive(Debug, Default)]
pub struct DedupAggregator {
    batch: ProcessedBatch,
}

impl DedupAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn aggregate(records: impl IntoIterator<Item = ParsedRecord>) -> ProcessedBatch {
        let mut aggregator = Self::new();
        for record in records {
            aggregator.push(record);
        }
        aggregator.finish()
    }

    pub fn push(&mut self, record: ParsedRecord) {
        keep_first(&mut self.batch.persons, record.person);
        keep_first(&mut self.batch.levels, record.level);
        keep_first(&mut self.batch.institutions, record.institution);
        keep_first(&mut self.batch.programs, record.program);
        keep_first(&mut self.batch.projects, record.project);
        keep_first(&mut self.batch.units, record.unit);
        keep_first(&mut self.batch.expense_objects, record.expense_object);
        self.batch.events.push(record.event);
    }

    pub fn finish(self) -> ProcessedBatch {
        self.batch
    }
}

fn keep_first<D: Dimension>(set: &mut BTreeMap<D::Key, D>, value: D) {
    set.entry(value.natural_key()).or_insert(value);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::raw_row;

    #[tokio::test]
    async fn bad_rows_are_dropped_without_stopping_the_batch() {
        let mut rows = (0..25)
            .map(|i| raw_row(&format!("{i}"), "F", ""))
            .collect::<Vec<_>>();
        rows[7].monto_presupuestado = "n/a".into();
        rows[19].anio_corte = String::new();

        let outcome = ParseCoordinator::new(4).parse_all(rows).await.expect("parse");
        assert_eq!(outcome.failures, 2);
        assert_eq!(outcome.records.len(), 23);
        assert!(outcome
            .records
            .iter()
            .all(|r| r.person.codigo_persona != "7" && r.person.codigo_persona != "19"));
    }

    #[tokio::test]
    async fn results_keep_source_order_across_workers() {
        let rows = (0..10)
            .map(|i| raw_row(&format!("{i}"), "M", "1"))
            .collect::<Vec<_>>();
        let outcome = ParseCoordinator::new(3).parse_all(rows).await.expect("parse");
        let codes = outcome
            .records
            .iter()
            .map(|r| r.person.codigo_persona.clone())
            .collect::<Vec<_>>();
        assert_eq!(codes, (0..10).map(|i| i.to_string()).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn empty_input_and_oversized_pool_are_fine() {
        let coordinator = ParseCoordinator::new(0);
        assert_eq!(coordinator.workers(), 1);
        let outcome = coordinator.parse_all(Vec::new()).await.expect("parse");
        assert!(outcome.records.is_empty());

        let outcome = ParseCoordinator::new(64)
            .parse_all(vec![raw_row("1", "F", "")])
            .await
            .expect("parse");
        assert_eq!(outcome.records.len(), 1);
    }

    #[tokio::test]
    async fn dimensions_collapse_on_natural_key() {
        let rows = vec![
            raw_row("1", "F", ""),
            raw_row("2", "M", "3"),
            raw_row("1", "F", ""),
        ];
        let outcome = ParseCoordinator::new(2).parse_all(rows).await.expect("parse");
        let parsed = outcome.records.len();
        let batch = DedupAggregator::aggregate(outcome.records);

        assert_eq!(batch.persons.len(), 2);
        assert_eq!(batch.levels.len(), 1);
        assert_eq!(batch.institutions.len(), 1);
        assert_eq!(batch.programs.len(), 1);
        assert_eq!(batch.expense_objects.len(), 1);
        assert_eq!(batch.events.len(), 3);
        assert!(batch.persons.len() <= parsed);
        assert!(batch.units.len() <= parsed);
    }

    #[test]
    fn first_seen_value_wins_for_a_key() {
        let mut first = nomina_core::parse_row(&raw_row("1", "F", "")).unwrap();
        let mut second = first.clone();
        first.level.desc_nivel = "FIRST".into();
        second.level.desc_nivel = "SECOND".into();
        let batch = DedupAggregator::aggregate([first, second]);
        assert_eq!(batch.levels.len(), 1);
        assert_eq!(
            batch.levels.values().next().map(|l| l.desc_nivel.as_str()),
            Some("FIRST")
        );
    }
}
