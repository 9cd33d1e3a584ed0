//! Period persistence: dimension upserts followed by a period-scoped fact replace.

use std::collections::HashMap;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use nomina_core::{
    ExpenseObject, Institution, Level, PayrollEvent, Period, Person, ProcessedBatch, Program,
    Project, ResponsibleUnit,
};
use serde::Serialize;
use sqlx::query_builder::Separated;
use sqlx::{PgConnection, PgPool, Postgres, QueryBuilder};
use tracing::{debug, info};

/// Postgres rejects statements with more bind parameters than this.
const BIND_LIMIT: usize = 65_535;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    pub dimensions_upserted: usize,
    pub facts_deleted: u64,
    pub facts_inserted: usize,
}

#[async_trait]
pub trait BatchWriter: Send + Sync {
    /// Persists one period. Either everything lands or nothing does.
    async fn write_period(&self, period: Period, batch: &ProcessedBatch) -> Result<WriteSummary>;
}

pub fn event_in_period(period: Period, event: &PayrollEvent) -> bool {
    event.anio == period.year() && i64::from(event.mes) == i64::from(period.month())
}

/// Facts are replaced by period, so a batch may only carry facts of the period it is written under.
pub fn ensure_batch_period(period: Period, batch: &ProcessedBatch) -> Result<()> {
    if let Some(stray) = batch.events.iter().find(|e| !event_in_period(period, e)) {
        bail!(
            "event {} belongs to {}-{:02}, not {period}",
            stray.codigo_evento,
            stray.anio,
            stray.mes
        );
    }
    Ok(())
}

/// Numbers the facts of a batch per event code, continuing after `current_max`.
///
/// Occurrences of the same code get consecutive ordinals in batch order.
pub fn assign_ordinals<'a>(
    events: &'a [PayrollEvent],
    current_max: &HashMap<String, i32>,
) -> Vec<(i32, &'a PayrollEvent)> {
    let mut next: HashMap<&str, i32> = HashMap::new();
    events
        .iter()
        .map(|event| {
            let slot = next
                .entry(event.codigo_evento.as_str())
                .or_insert_with(|| current_max.get(&event.codigo_evento).copied().unwrap_or(0));
            *slot += 1;
            (*slot, event)
        })
        .collect()
}

/// A dimension table row: the natural key column comes first.
trait UpsertRow: Sync {
    const TABLE: &'static str;
    const COLUMNS: &'static [&'static str];

    fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>);
}

impl UpsertRow for Person {
    const TABLE: &'static str = "personas";
    const COLUMNS: &'static [&'static str] =
        &["codigo_persona", "nombres", "apellidos", "fecha_nacimiento", "sexo"];

    fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.codigo_persona.clone())
            .push_bind(self.nombres.clone())
            .push_bind(self.apellidos.clone())
            .push_bind(self.fecha_nacimiento)
            .push_bind(self.sexo.clone());
    }
}

impl UpsertRow for Level {
    const TABLE: &'static str = "niveles";
    const COLUMNS: &'static [&'static str] = &["nivel_key", "codigo_nivel", "nivel_abr", "desc_nivel"];

    fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.nivel_key.clone())
            .push_bind(self.codigo_nivel.clone())
            .push_bind(self.nivel_abr.clone())
            .push_bind(self.desc_nivel.clone());
    }
}

impl UpsertRow for Institution {
    const TABLE: &'static str = "entidades";
    const COLUMNS: &'static [&'static str] =
        &["entidad_key", "codigo_entidad", "entidad_abr", "desc_entidad"];

    fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.entidad_key.clone())
            .push_bind(self.codigo_entidad.clone())
            .push_bind(self.entidad_abr.clone())
            .push_bind(self.desc_entidad.clone());
    }
}

impl UpsertRow for Program {
    const TABLE: &'static str = "programas";
    const COLUMNS: &'static [&'static str] = &[
        "programa_key",
        "codigo_programa",
        "codigo_sub_programa",
        "programa_abr",
        "sub_programa_abr",
        "desc_programa",
        "desc_sub_programa",
    ];

    fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.programa_key.clone())
            .push_bind(self.codigo_programa.clone())
            .push_bind(self.codigo_sub_programa.clone())
            .push_bind(self.programa_abr.clone())
            .push_bind(self.sub_programa_abr.clone())
            .push_bind(self.desc_programa.clone())
            .push_bind(self.desc_sub_programa.clone());
    }
}

impl UpsertRow for Project {
    const TABLE: &'static str = "proyectos";
    const COLUMNS: &'static [&'static str] =
        &["proyecto_key", "codigo_proyecto", "proyecto_abr", "desc_proyecto"];

    fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.proyecto_key.clone())
            .push_bind(self.codigo_proyecto.clone())
            .push_bind(self.proyecto_abr.clone())
            .push_bind(self.desc_proyecto.clone());
    }
}

impl UpsertRow for ResponsibleUnit {
    const TABLE: &'static str = "unidades_responsables";
    const COLUMNS: &'static [&'static str] = &[
        "unidad_responsable_key",
        "codigo_unidad_responsable",
        "unidad_responsable_abr",
        "desc_unidad_responsable",
    ];

    fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.unidad_responsable_key.clone())
            .push_bind(self.codigo_unidad_responsable.clone())
            .push_bind(self.unidad_responsable_abr.clone())
            .push_bind(self.desc_unidad_responsable.clone());
    }
}

impl UpsertRow for ExpenseObject {
    const TABLE: &'static str = "objetos_gasto";
    const COLUMNS: &'static [&'static str] = &["codigo_objeto_gasto", "concepto_gasto"];

    fn push_binds(&self, row: &mut Separated<'_, '_, Postgres, &'static str>) {
        row.push_bind(self.codigo_objeto_gasto)
            .push_bind(self.concepto_gasto.clone());
    }
}

const FACT_COLUMNS: &[&str] = &[
    "codigo_evento",
    "orden",
    "anio",
    "mes",
    "codigo_persona",
    "discapacidad",
    "nivel_key",
    "entidad_key",
    "programa_key",
    "proyecto_key",
    "unidad_responsable_key",
    "codigo_objeto_gasto",
    "fuente_financiamiento",
    "linea",
    "codigo_categoria",
    "cargo",
    "horas_catedra",
    "fecha_ingreso",
    "tipo_personal",
    "lugar",
    "monto_presupuestado",
    "monto_devengado",
    "anio_corte",
    "mes_corte",
    "fecha_corte",
];

fn upsert_statement_head(table: &str, columns: &[&str]) -> String {
    format!("INSERT INTO {table} ({}) ", columns.join(", "))
}

fn upsert_statement_tail(columns: &[&str]) -> String {
    let updates = columns[1..]
        .iter()
        .map(|c| format!("{c} = EXCLUDED.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(" ON CONFLICT ({}) DO UPDATE SET {updates}", columns[0])
}

async fn upsert_dimension<'a, T, I>(conn: &mut PgConnection, rows: I) -> Result<usize>
where
    T: UpsertRow + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let rows = rows.into_iter().collect::<Vec<_>>();
    for chunk in rows.chunks(BIND_LIMIT / T::COLUMNS.len()) {
        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new(upsert_statement_head(T::TABLE, T::COLUMNS));
        qb.push_values(chunk.iter(), |mut row, item| item.push_binds(&mut row));
        qb.push(upsert_statement_tail(T::COLUMNS));
        qb.build()
            .execute(&mut *conn)
            .await
            .with_context(|| format!("upserting {} rows into {}", chunk.len(), T::TABLE))?;
    }
    debug!(table = T::TABLE, rows = rows.len(), "upserted dimension");
    Ok(rows.len())
}

async fn insert_facts(conn: &mut PgConnection, facts: &[(i32, &PayrollEvent)]) -> Result<()> {
    for chunk in facts.chunks(BIND_LIMIT / FACT_COLUMNS.len()) {
        let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(format!(
            "INSERT INTO eventos_nomina ({}) ",
            FACT_COLUMNS.join(", ")
        ));
        qb.push_values(chunk.iter(), |mut row, (orden, event)| {
            row.push_bind(event.codigo_evento.clone())
                .push_bind(*orden)
                .push_bind(event.anio)
                .push_bind(event.mes)
                .push_bind(event.codigo_persona.clone())
                .push_bind(event.discapacidad)
                .push_bind(event.nivel_key.clone())
                .push_bind(event.entidad_key.clone())
                .push_bind(event.programa_key.clone())
                .push_bind(event.proyecto_key.clone())
                .push_bind(event.unidad_responsable_key.clone())
                .push_bind(event.codigo_objeto_gasto)
                .push_bind(event.fuente_financiamiento.clone())
                .push_bind(event.linea.clone())
                .push_bind(event.codigo_categoria.clone())
                .push_bind(event.cargo.clone())
                .push_bind(event.horas_catedra)
                .push_bind(event.fecha_ingreso)
                .push_bind(event.tipo_personal.clone())
                .push_bind(event.lugar.clone())
                .push_bind(event.monto_presupuestado)
                .push_bind(event.monto_devengado)
                .push_bind(event.anio_corte)
                .push_bind(event.mes_corte)
                .push_bind(event.fecha_corte);
        });
        qb.build()
            .execute(&mut *conn)
            .await
            .with_context(|| format!("inserting {} payroll events", chunk.len()))?;
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub struct PgBatchWriter {
    pool: PgPool,
}

impl PgBatchWriter {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl BatchWriter for PgBatchWriter {
    async fn write_period(&self, period: Period, batch: &ProcessedBatch) -> Result<WriteSummary> {
        ensure_batch_period(period, batch)?;
        let mut tx = self
            .pool
            .begin()
            .await
            .context("opening period transaction")?;

        let mut dimensions_upserted = 0;
        dimensions_upserted += upsert_dimension(&mut tx, batch.persons.values()).await?;
        dimensions_upserted += upsert_dimension(&mut tx, batch.levels.values()).await?;
        dimensions_upserted += upsert_dimension(&mut tx, batch.institutions.values()).await?;
        dimensions_upserted += upsert_dimension(&mut tx, batch.programs.values()).await?;
        dimensions_upserted += upsert_dimension(&mut tx, batch.projects.values()).await?;
        dimensions_upserted += upsert_dimension(&mut tx, batch.units.values()).await?;
        dimensions_upserted += upsert_dimension(&mut tx, batch.expense_objects.values()).await?;

        let facts_deleted = sqlx::query("DELETE FROM eventos_nomina WHERE anio = $1 AND mes = $2")
            .bind(period.year())
            .bind(period.month() as i32)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("clearing payroll events for {period}"))?
            .rows_affected();

        let mut codes = batch
            .events
            .iter()
            .map(|e| e.codigo_evento.clone())
            .collect::<Vec<_>>();
        codes.sort();
        codes.dedup();
        let current_max: HashMap<String, i32> = sqlx::query_as::<_, (String, i32)>(
            r#"
            SELECT codigo_evento, MAX(orden)
              FROM eventos_nomina
             WHERE codigo_evento = ANY($1)
             GROUP BY codigo_evento
            "#,
        )
        .bind(&codes)
        .fetch_all(&mut *tx)
        .await
        .context("reading current event ordinals")?
        .into_iter()
        .collect();

        let facts = assign_ordinals(&batch.events, &current_max);
        insert_facts(&mut tx, &facts).await?;

        tx.commit()
            .await
            .with_context(|| format!("committing payroll period {period}"))?;

        let summary = WriteSummary {
            dimensions_upserted,
            facts_deleted,
            facts_inserted: facts.len(),
        };
        info!(
            %period,
            dimensions = summary.dimensions_upserted,
            deleted = summary.facts_deleted,
            inserted = summary.facts_inserted,
            "persisted payroll period"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::raw_row;
    use nomina_core::parse_row;

    fn event(codigo_persona: &str) -> PayrollEvent {
        parse_row(&raw_row(codigo_persona, "F", "")).unwrap().event
    }

    #[test]
    fn ordinals_are_per_event_code_and_start_after_existing_max() {
        let events = vec![event("1"), event("2"), event("1"), event("1")];
        let mut current_max = HashMap::new();
        current_max.insert("201705-2".to_string(), 4);

        let ordinals = assign_ordinals(&events, &current_max)
            .into_iter()
            .map(|(orden, e)| (e.codigo_evento.clone(), orden))
            .collect::<Vec<_>>();
        assert_eq!(
            ordinals,
            vec![
                ("201705-1".to_string(), 1),
                ("201705-2".to_string(), 5),
                ("201705-1".to_string(), 2),
                ("201705-1".to_string(), 3),
            ]
        );
    }

    #[test]
    fn batches_with_facts_from_another_period_are_refused() {
        let may = Period::new(2017, 5).unwrap();
        let june = Period::new(2017, 6).unwrap();
        let batch = ProcessedBatch {
            events: vec![event("1")],
            ..Default::default()
        };
        assert!(ensure_batch_period(may, &batch).is_ok());
        let err = ensure_batch_period(june, &batch).unwrap_err();
        assert!(err.to_string().contains("201705-1"));
    }

    #[test]
    fn upsert_sql_updates_every_non_key_column() {
        assert_eq!(
            upsert_statement_head(Level::TABLE, Level::COLUMNS),
            "INSERT INTO niveles (nivel_key, codigo_nivel, nivel_abr, desc_nivel) "
        );
        assert_eq!(
            upsert_statement_tail(ExpenseObject::COLUMNS),
            " ON CONFLICT (codigo_objeto_gasto) DO UPDATE SET concepto_gasto = EXCLUDED.concepto_gasto"
        );
        let person_tail = upsert_statement_tail(Person::COLUMNS);
        assert!(person_tail.starts_with(" ON CONFLICT (codigo_persona)"));
        assert!(person_tail.contains("sexo = EXCLUDED.sexo"));
        assert!(!person_tail.contains("codigo_persona = EXCLUDED"));
    }

    #[test]
    fn chunks_stay_under_the_bind_limit() {
        assert!(BIND_LIMIT / FACT_COLUMNS.len() * FACT_COLUMNS.len() <= BIND_LIMIT);
        assert_eq!(FACT_COLUMNS.len(), 25);
    }
}
