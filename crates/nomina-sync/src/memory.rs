//! In-process store used for dry runs and pipeline tests.

use std::collections::{BTreeMap, HashMap, HashSet};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use nomina_core::{
    ledger_download_id, ExpenseObject, Institution, LedgerEntry, Level, PayrollEvent, Period,
    Person, ProcessedBatch, Program, Project, ResponsibleUnit,
};
use tokio::sync::Mutex;
use tracing::debug;

use crate::ledger::IngestionLedger;
use crate::writer::{assign_ordinals, ensure_batch_period, event_in_period, BatchWriter, WriteSummary};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredEvent {
    pub orden: i32,
    pub event: PayrollEvent,
}

#[derive(Debug, Clone, Default)]
pub struct MemorySnapshot {
    pub persons: BTreeMap<String, Person>,
    pub levels: BTreeMap<String, Level>,
    pub institutions: BTreeMap<String, Institution>,
    pub programs: BTreeMap<String, Program>,
    pub projects: BTreeMap<String, Project>,
    pub units: BTreeMap<String, ResponsibleUnit>,
    pub expense_objects: BTreeMap<i32, ExpenseObject>,
    pub events: Vec<StoredEvent>,
    pub ledger: Vec<LedgerEntry>,
}

impl MemorySnapshot {
    pub fn events_for(&self, period: Period) -> impl Iterator<Item = &StoredEvent> {
        self.events
            .iter()
            .filter(move |stored| event_in_period(period, &stored.event))
    }
}

/// Mirrors the Postgres upsert, period replace and ledger semantics without a database.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<MemorySnapshot>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn snapshot(&self) -> MemorySnapshot {
        self.state.lock().await.clone()
    }
}

fn upsert_all<K: Ord + Clone, V: Clone>(target: &mut BTreeMap<K, V>, rows: &BTreeMap<K, V>) -> usize {
    for (key, value) in rows {
        target.insert(key.clone(), value.clone());
    }
    rows.len()
}

#[async_trait]
impl BatchWriter for MemoryStore {
    async fn write_period(&self, period: Period, batch: &ProcessedBatch) -> Result<WriteSummary> {
        ensure_batch_period(period, batch)?;
        let mut state = self.state.lock().await;

        let mut dimensions_upserted = 0;
        dimensions_upserted += upsert_all(&mut state.persons, &batch.persons);
        dimensions_upserted += upsert_all(&mut state.levels, &batch.levels);
        dimensions_upserted += upsert_all(&mut state.institutions, &batch.institutions);
        dimensions_upserted += upsert_all(&mut state.programs, &batch.programs);
        dimensions_upserted += upsert_all(&mut state.projects, &batch.projects);
        dimensions_upserted += upsert_all(&mut state.units, &batch.units);
        dimensions_upserted += upsert_all(&mut state.expense_objects, &batch.expense_objects);

        let before = state.events.len();
        state
            .events
            .retain(|stored| !event_in_period(period, &stored.event));
        let facts_deleted = (before - state.events.len()) as u64;

        let mut current_max: HashMap<String, i32> = HashMap::new();
        for stored in &state.events {
            let slot = current_max
                .entry(stored.event.codigo_evento.clone())
                .or_insert(stored.orden);
            *slot = (*slot).max(stored.orden);
        }

        let facts = assign_ordinals(&batch.events, &current_max)
            .into_iter()
            .map(|(orden, event)| StoredEvent {
                orden,
                event: event.clone(),
            })
            .collect::<Vec<_>>();
        let facts_inserted = facts.len();
        state.events.extend(facts);

        debug!(%period, facts_deleted, facts_inserted, "wrote period to memory store");
        Ok(WriteSummary {
            dimensions_upserted,
            facts_deleted,
            facts_inserted,
        })
    }
}

#[async_trait]
impl IngestionLedger for MemoryStore {
    async fn list_completed_sources(&self) -> Result<HashSet<String>> {
        let state = self.state.lock().await;
        Ok(state
            .ledger
            .iter()
            .filter(|entry| entry.was_succeed)
            .map(|entry| entry.resource_url.clone())
            .collect())
    }

    async fn record_completion(
        &self,
        locator: &str,
        checksum: &str,
        row_count: u64,
    ) -> Result<LedgerEntry> {
        let mut state = self.state.lock().await;
        let entry = LedgerEntry {
            download_id: ledger_download_id(state.ledger.len() as u64 + 1),
            resource_url: locator.to_string(),
            check_sum: checksum.to_string(),
            entries: i64::try_from(row_count).context("row count overflows i64")?,
            download_at_utc: Utc::now(),
            was_succeed: true,
        };
        state.ledger.push(entry.clone());
        Ok(entry)
    }
}
